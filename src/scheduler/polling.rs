//! Polling-mode activation.
//!
//! The runner mirrors the timer loop but delegates the actual fetch to a
//! [`PollingHandler`] chosen per component. Handlers return extracted
//! events plus cursor updates; the runner owns cursor persistence and
//! always re-arms `next_run`, even when the handler failed, so one broken
//! endpoint cannot pin the loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::clock::SharedClock;
use crate::domain::{Component, PollingBinding};
use crate::pipeline::{AreaExecutor, ExecutionInput};
use crate::store::SourceRepository;
use crate::types::JsonMap;

const DEFAULT_POLL_SECONDS: i64 = 30;

/// One item pulled out of a polled response.
#[derive(Debug, Clone)]
pub struct PollingEvent {
    pub payload: JsonMap,
    pub fingerprint: String,
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Events plus cursor updates from one poll of one source.
#[derive(Debug, Clone, Default)]
pub struct PollingResult {
    pub cursor: JsonMap,
    pub events: Vec<PollingEvent>,
}

/// Context handed to a handler for one poll.
pub struct PollingRequest {
    pub binding: PollingBinding,
    pub component: Component,
    pub cursor: JsonMap,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("invalid ingestion metadata: {0}")]
    BadMetadata(String),
    #[error("endpoint answered {0}")]
    BadStatus(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

#[async_trait]
pub trait PollingHandler: Send + Sync {
    fn supports(&self, component: &Component) -> bool;

    async fn poll(&self, request: PollingRequest) -> Result<PollingResult, PollError>;
}

pub struct PollingRunner {
    sources: Arc<dyn SourceRepository>,
    executor: Arc<dyn AreaExecutor>,
    handlers: Vec<Arc<dyn PollingHandler>>,
    clock: SharedClock,
    tick_interval: StdDuration,
    batch: usize,
}

impl PollingRunner {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        executor: Arc<dyn AreaExecutor>,
        handlers: Vec<Arc<dyn PollingHandler>>,
        clock: SharedClock,
        tick_interval: StdDuration,
        batch: usize,
    ) -> Self {
        PollingRunner {
            sources,
            executor,
            handlers,
            clock,
            tick_interval,
            batch,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    pub async fn tick(&self) {
        let now = self.clock.now();
        let bindings = match self.sources.list_due_polling_sources(now, self.batch).await {
            Ok(bindings) => bindings,
            Err(e) => {
                error!(error = %e, "listing due polling sources failed");
                return;
            }
        };
        for binding in bindings {
            self.poll_binding(binding, now).await;
        }
    }

    async fn poll_binding(&self, binding: PollingBinding, now: DateTime<Utc>) {
        let Some(component) = binding.config.component.clone() else {
            warn!(source_id = %binding.source.id, "polling source has no component loaded");
            self.bump_cursor(&binding, now, JsonMap::new()).await;
            return;
        };

        let Some(handler) = self.handlers.iter().find(|h| h.supports(&component)) else {
            warn!(
                component = %component.name,
                source_id = %binding.source.id,
                "no polling handler for component"
            );
            self.bump_cursor(&binding, now, JsonMap::new()).await;
            return;
        };

        let request = PollingRequest {
            binding: binding.clone(),
            component: component.clone(),
            cursor: binding.source.cursor.clone(),
            now,
        };
        let result = match handler.poll(request).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    component = %component.name,
                    source_id = %binding.source.id,
                    error = %e,
                    "polling handler failed"
                );
                PollingResult::default()
            }
        };

        self.bump_cursor(&binding, now, result.cursor).await;

        for event in result.events {
            let input = ExecutionInput {
                source_id: binding.source.id,
                user_id: binding.user_id,
                fingerprint: event.fingerprint,
                payload: event.payload,
                occurred_at: event.occurred_at.unwrap_or(now),
            };
            if let Err(e) = self.executor.execute_area(binding.area_id, input).await {
                error!(area_id = %binding.area_id, error = %e, "polling execution failed");
            }
        }
    }

    /// Merge handler updates into the stored cursor and re-arm next_run.
    async fn bump_cursor(&self, binding: &PollingBinding, now: DateTime<Utc>, updates: JsonMap) {
        let mut cursor = binding.source.cursor.clone();
        let interval = interval_from_cursor(&cursor);
        for (key, value) in updates {
            cursor.insert(key, value);
        }
        cursor.insert("interval_seconds".into(), json!(interval));
        cursor.insert("last_run".into(), json!(now.to_rfc3339()));
        let next_run = now + Duration::seconds(interval);
        cursor.insert("next_run".into(), json!(next_run.to_rfc3339()));

        if let Err(e) = self.sources.update_cursor(binding.source.id, cursor).await {
            error!(source_id = %binding.source.id, error = %e, "polling cursor update failed");
        }
    }
}

fn interval_from_cursor(cursor: &JsonMap) -> i64 {
    cursor
        .get("interval_seconds")
        .and_then(|v| v.as_i64())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_POLL_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::domain::{ComponentConfig, ComponentKind, Source, SourceMode};
    use crate::pipeline::PipelineError;
    use crate::store::memory::{MemoryStore, SourceBinding};
    use crate::types::{AreaId, ComponentId, ConfigId, LinkId, ProviderId, SourceId, UserId};
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct RecordingExecutor {
        inputs: Mutex<Vec<ExecutionInput>>,
    }

    #[async_trait]
    impl AreaExecutor for RecordingExecutor {
        async fn execute_area(
            &self,
            _area_id: AreaId,
            input: ExecutionInput,
        ) -> Result<(), PipelineError> {
            self.inputs.lock().unwrap().push(input);
            Ok(())
        }
    }

    struct StubHandler {
        result: Result<PollingResult, &'static str>,
    }

    #[async_trait]
    impl PollingHandler for StubHandler {
        fn supports(&self, component: &Component) -> bool {
            component.name == "watched"
        }

        async fn poll(&self, _request: PollingRequest) -> Result<PollingResult, PollError> {
            match &self.result {
                Ok(result) => Ok(result.clone()),
                Err(msg) => Err(PollError::Request((*msg).to_owned())),
            }
        }
    }

    fn polling_binding(component_name: &str, cursor: JsonMap) -> SourceBinding {
        let component = Component {
            id: ComponentId::new(),
            provider_id: ProviderId::new(),
            name: component_name.into(),
            kind: ComponentKind::Action,
            metadata: JsonMap::new(),
            provider: None,
        };
        SourceBinding {
            source: Source {
                id: SourceId::new(),
                component_id: component.id,
                mode: SourceMode::Polling,
                cursor,
                webhook_secret: String::new(),
                webhook_path: String::new(),
                active: true,
            },
            area_id: AreaId::new(),
            area_link_id: LinkId::new(),
            user_id: UserId::new(),
            config: ComponentConfig {
                id: ConfigId::new(),
                component_id: component.id,
                params: JsonMap::new(),
                identity_id: None,
                component: Some(component),
            },
        }
    }

    fn runner(
        store: Arc<MemoryStore>,
        executor: Arc<RecordingExecutor>,
        handler: StubHandler,
        clock: SharedClock,
    ) -> PollingRunner {
        PollingRunner::new(
            store,
            executor,
            vec![Arc::new(handler)],
            clock,
            StdDuration::from_secs(30),
            50,
        )
    }

    #[tokio::test]
    async fn events_are_forwarded_and_cursor_merged() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let binding = polling_binding("watched", JsonMap::new());
        let source_id = binding.source.id;
        store.insert_binding(binding);

        let executor = Arc::new(RecordingExecutor {
            inputs: Mutex::new(Vec::new()),
        });
        let mut cursor_updates = JsonMap::new();
        cursor_updates.insert("last_seen".into(), json!("2024-05-01T11:59:00Z"));
        let handler = StubHandler {
            result: Ok(PollingResult {
                cursor: cursor_updates,
                events: vec![PollingEvent {
                    payload: JsonMap::new(),
                    fingerprint: "item-1".into(),
                    occurred_at: None,
                }],
            }),
        };

        runner(store.clone(), executor.clone(), handler, FixedClock::at(now))
            .tick()
            .await;

        let inputs = executor.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].fingerprint, "item-1");
        assert_eq!(inputs[0].occurred_at, now);

        let source = store.source(source_id).unwrap();
        assert_eq!(
            source.cursor_str("last_seen"),
            Some("2024-05-01T11:59:00Z")
        );
        assert_eq!(source.next_run(), Some(now + Duration::seconds(30)));
    }

    #[tokio::test]
    async fn handler_failure_still_rearms_next_run() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut cursor = JsonMap::new();
        cursor.insert("interval_seconds".into(), json!(120));
        let binding = polling_binding("watched", cursor);
        let source_id = binding.source.id;
        store.insert_binding(binding);

        let executor = Arc::new(RecordingExecutor {
            inputs: Mutex::new(Vec::new()),
        });
        let handler = StubHandler {
            result: Err("boom"),
        };

        runner(store.clone(), executor.clone(), handler, FixedClock::at(now))
            .tick()
            .await;

        assert!(executor.inputs.lock().unwrap().is_empty());
        let source = store.source(source_id).unwrap();
        assert_eq!(source.next_run(), Some(now + Duration::seconds(120)));
    }

    #[tokio::test]
    async fn unsupported_component_only_bumps_cursor() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let binding = polling_binding("other", JsonMap::new());
        let source_id = binding.source.id;
        store.insert_binding(binding);

        let executor = Arc::new(RecordingExecutor {
            inputs: Mutex::new(Vec::new()),
        });
        let handler = StubHandler {
            result: Ok(PollingResult::default()),
        };

        runner(store.clone(), executor.clone(), handler, FixedClock::at(now))
            .tick()
            .await;

        assert!(executor.inputs.lock().unwrap().is_empty());
        let source = store.source(source_id).unwrap();
        assert_eq!(source.next_run(), Some(now + Duration::seconds(30)));
    }
}
