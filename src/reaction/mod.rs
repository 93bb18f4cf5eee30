//! Reaction dispatch.
//!
//! A [`ReactionHandler`] knows how to deliver one family of reactions to its
//! target service. The [`CompositeReactionExecutor`] routes each job to the
//! first handler claiming its component, falling back to the generic HTTP
//! handler for components that describe their delivery declaratively.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Component, Link};
use crate::types::JsonMap;

/// What one delivery attempt did, kept for the delivery log whether the
/// attempt succeeded or failed.
#[derive(Debug, Clone, Default)]
pub struct ReactionResult {
    pub endpoint: String,
    pub request: JsonMap,
    pub response: JsonMap,
    pub status_code: Option<u16>,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("no handler for component {0}")]
    Unsupported(String),
    #[error("delivery failed: {message}")]
    Failed {
        message: String,
        result: Box<ReactionResult>,
    },
}

impl ReactionError {
    pub fn failed(message: impl Into<String>, result: ReactionResult) -> Self {
        ReactionError::Failed {
            message: message.into(),
            result: Box::new(result),
        }
    }
}

/// Delivers one reaction. `input` is the job's self-contained execution
/// context (`params`, `event_payload`, area metadata).
#[async_trait]
pub trait ReactionHandler: Send + Sync {
    fn supports(&self, component: Option<&Component>) -> bool;

    async fn deliver(&self, link: &Link, input: &JsonMap) -> Result<ReactionResult, ReactionError>;
}

/// Routes to the first supporting handler, then the fallback.
pub struct CompositeReactionExecutor {
    handlers: Vec<Arc<dyn ReactionHandler>>,
    fallback: Option<Arc<dyn ReactionHandler>>,
}

impl CompositeReactionExecutor {
    pub fn new(
        handlers: Vec<Arc<dyn ReactionHandler>>,
        fallback: Option<Arc<dyn ReactionHandler>>,
    ) -> Self {
        CompositeReactionExecutor { handlers, fallback }
    }

    pub async fn deliver(
        &self,
        link: &Link,
        input: &JsonMap,
    ) -> Result<ReactionResult, ReactionError> {
        let component = link.config.component.as_ref();
        for handler in &self.handlers {
            if handler.supports(component) {
                return handler.deliver(link, input).await;
            }
        }
        if let Some(fallback) = &self.fallback {
            return fallback.deliver(link, input).await;
        }
        let name = component
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "unknown".into());
        Err(ReactionError::Unsupported(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComponentConfig, ComponentKind, LinkRole};
    use crate::types::{ComponentId, ConfigId, LinkId, ProviderId};

    struct NamedHandler {
        name: &'static str,
    }

    #[async_trait]
    impl ReactionHandler for NamedHandler {
        fn supports(&self, component: Option<&Component>) -> bool {
            component.is_some_and(|c| c.name == self.name)
        }

        async fn deliver(
            &self,
            _link: &Link,
            _input: &JsonMap,
        ) -> Result<ReactionResult, ReactionError> {
            Ok(ReactionResult {
                endpoint: self.name.into(),
                ..ReactionResult::default()
            })
        }
    }

    fn link_for(component_name: &str) -> Link {
        Link {
            id: LinkId::new(),
            role: LinkRole::Reaction,
            position: 1,
            config: ComponentConfig {
                id: ConfigId::new(),
                component_id: ComponentId::new(),
                params: JsonMap::new(),
                identity_id: None,
                component: Some(Component {
                    id: ComponentId::new(),
                    provider_id: ProviderId::new(),
                    name: component_name.into(),
                    kind: ComponentKind::Reaction,
                    metadata: JsonMap::new(),
                    provider: None,
                }),
            },
            retry: None,
        }
    }

    #[tokio::test]
    async fn routes_to_supporting_handler() {
        let executor = CompositeReactionExecutor::new(
            vec![
                Arc::new(NamedHandler { name: "alpha" }),
                Arc::new(NamedHandler { name: "beta" }),
            ],
            None,
        );
        let result = executor
            .deliver(&link_for("beta"), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(result.endpoint, "beta");
    }

    #[tokio::test]
    async fn falls_back_when_no_handler_matches() {
        let executor = CompositeReactionExecutor::new(
            vec![Arc::new(NamedHandler { name: "alpha" })],
            Some(Arc::new(NamedHandler { name: "generic" })),
        );
        let result = executor
            .deliver(&link_for("gamma"), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(result.endpoint, "generic");
    }

    #[tokio::test]
    async fn unsupported_without_fallback_is_an_error() {
        let executor =
            CompositeReactionExecutor::new(vec![Arc::new(NamedHandler { name: "alpha" })], None);
        let err = executor
            .deliver(&link_for("gamma"), &JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReactionError::Unsupported(name) if name == "gamma"));
    }
}
