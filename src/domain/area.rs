//! Areas and their action/reaction links.

use serde::{Deserialize, Serialize};

use crate::types::{AreaId, LinkId, UserId};

use super::component::ComponentConfig;
use super::job::RetryPolicy;

/// Lifecycle state of an area. Only `Enabled` areas are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaStatus {
    Enabled,
    Disabled,
    Archived,
}

/// Whether a link is the area's trigger or one of its effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    Action,
    Reaction,
}

/// One edge of an area: a component configuration attached with a role and
/// an ordering position among reactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub role: LinkRole,
    pub position: i32,
    pub config: ComponentConfig,
    /// Backoff settings for this reaction. `None` means fail on the first
    /// unsuccessful attempt.
    pub retry: Option<RetryPolicy>,
}

/// A user automation: one action link and one or more reaction links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub user_id: UserId,
    pub name: String,
    pub status: AreaStatus,
    pub links: Vec<Link>,
}

impl Area {
    pub fn is_enabled(&self) -> bool {
        self.status == AreaStatus::Enabled
    }

    /// The action link, if the area is well-formed.
    pub fn action(&self) -> Option<&Link> {
        self.links.iter().find(|l| l.role == LinkRole::Action)
    }

    /// Reaction links sorted by position.
    pub fn reactions(&self) -> Vec<&Link> {
        let mut out: Vec<&Link> = self
            .links
            .iter()
            .filter(|l| l.role == LinkRole::Reaction)
            .collect();
        out.sort_by_key(|l| l.position);
        out
    }

    /// Look up a link by id, regardless of role.
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }
}
