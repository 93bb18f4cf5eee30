//! Catalog types: providers, components, and per-area component
//! configurations.
//!
//! The engine reads these but never writes them; authoring happens in the
//! management plane.

use serde::{Deserialize, Serialize};

use crate::types::{ComponentId, ConfigId, IdentityId, JsonMap, ProviderId};

/// What role a component plays inside an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Action,
    Reaction,
}

/// An external service a component belongs to (e.g. a mail or chat service).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
}

/// A catalog entry describing a single action or reaction.
///
/// `metadata` carries the declarative ingestion/dispatch description (HTTP
/// endpoint templates, item paths, cursor strategy) interpreted by the
/// polling and reaction layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub provider_id: ProviderId,
    pub name: String,
    pub kind: ComponentKind,
    #[serde(default)]
    pub metadata: JsonMap,
    pub provider: Option<Provider>,
}

impl Component {
    /// Provider name if the catalog row was loaded with its provider joined.
    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.name.as_str())
    }
}

/// A configured instance of a component inside one area: the user-supplied
/// parameters plus an optional linked identity for authenticated calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub id: ConfigId,
    pub component_id: ComponentId,
    #[serde(default)]
    pub params: JsonMap,
    pub identity_id: Option<IdentityId>,
    pub component: Option<Component>,
}

impl ComponentConfig {
    /// String parameter lookup, treating non-string values as absent.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}
