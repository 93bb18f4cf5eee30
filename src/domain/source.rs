//! Activation sources: the per-area records that say *how* an action fires.
//!
//! A source is created when an area is enabled and owns the engine-side
//! state for that activation: the next scheduled run for timers, the cursor
//! for pollers, the secret and path for webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AreaId, ComponentId, JsonMap, LinkId, SourceId, UserId};

use super::component::ComponentConfig;

/// How the action side of an area is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Webhook,
    Polling,
    Schedule,
}

/// Engine-owned activation state for one enabled area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub component_id: ComponentId,
    pub mode: SourceMode,
    /// Opaque per-source state: `next_run` and interval bookkeeping for
    /// timers, watermarks and health fields for pollers.
    #[serde(default)]
    pub cursor: JsonMap,
    /// Shared secret expected from webhook callers. Empty for other modes.
    #[serde(default)]
    pub webhook_secret: String,
    /// URL path suffix the webhook is mounted at. Empty for other modes.
    #[serde(default)]
    pub webhook_path: String,
    /// Inactive sources are skipped by every producer.
    pub active: bool,
}

impl Source {
    pub fn cursor_str(&self, key: &str) -> Option<&str> {
        self.cursor.get(key).and_then(|v| v.as_str())
    }

    /// `next_run` parsed from the cursor, if present and well-formed.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.cursor_str("next_run")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// A schedule source joined with the area context needed to fire it.
#[derive(Debug, Clone)]
pub struct ScheduleBinding {
    pub source: Source,
    pub area_id: AreaId,
    pub area_link_id: LinkId,
    pub user_id: UserId,
    pub config: ComponentConfig,
}

/// A polling source joined with the area context needed to poll it.
#[derive(Debug, Clone)]
pub struct PollingBinding {
    pub source: Source,
    pub area_id: AreaId,
    pub area_link_id: LinkId,
    pub user_id: UserId,
    pub config: ComponentConfig,
}

/// A webhook source resolved from an inbound request path.
#[derive(Debug, Clone)]
pub struct WebhookBinding {
    pub source: Source,
    pub area_id: AreaId,
    pub area_link_id: LinkId,
    pub user_id: UserId,
    pub config: ComponentConfig,
}
