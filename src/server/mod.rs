//! HTTP surface of the engine.
//!
//! - `POST /hooks/{*path}` - webhook ingestion (202 on acceptance)
//! - `GET /health` - liveness probe

use std::sync::Arc;

pub mod health;
pub mod secret;
pub mod webhook;

pub use health::health_handler;
pub use webhook::webhook_handler;

use crate::clock::SharedClock;
use crate::pipeline::AreaExecutor;
use crate::store::SourceRepository;

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    sources: Arc<dyn SourceRepository>,
    executor: Arc<dyn AreaExecutor>,
    clock: SharedClock,
}

impl AppState {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        executor: Arc<dyn AreaExecutor>,
        clock: SharedClock,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                sources,
                executor,
                clock,
            }),
        }
    }

    pub fn sources(&self) -> &Arc<dyn SourceRepository> {
        &self.inner.sources
    }

    pub fn executor(&self) -> &Arc<dyn AreaExecutor> {
        &self.inner.executor
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/hooks/{*path}", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::clock::test_support::FixedClock;
    use crate::domain::{
        Area, AreaStatus, ComponentConfig, Link, LinkRole, Source, SourceMode,
    };
    use crate::pipeline::{ExecutionService, StorePipeline};
    use crate::queue::memory::MemoryQueue;
    use crate::store::memory::{MemoryStore, SourceBinding};
    use crate::types::{
        AreaId, ComponentId, ConfigId, JsonMap, LinkId, SourceId, UserId,
    };
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: MemoryQueue,
        app: axum::Router,
        source_id: SourceId,
    }

    fn link(role: LinkRole, position: i32) -> Link {
        Link {
            id: LinkId::new(),
            role,
            position,
            config: ComponentConfig {
                id: ConfigId::new(),
                component_id: ComponentId::new(),
                params: JsonMap::new(),
                identity_id: None,
                component: None,
            },
            retry: None,
        }
    }

    /// One enabled area with a webhook source mounted at `github/push`.
    fn fixture(secret: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = MemoryQueue::new();
        let clock: SharedClock = FixedClock::at(Utc::now());

        let area = Area {
            id: AreaId::new(),
            user_id: UserId::new(),
            name: "on push".into(),
            status: AreaStatus::Enabled,
            links: vec![link(LinkRole::Action, 0), link(LinkRole::Reaction, 1)],
        };
        store.insert_area(area.clone());

        let source_id = SourceId::new();
        store.insert_binding(SourceBinding {
            source: Source {
                id: source_id,
                component_id: ComponentId::new(),
                mode: SourceMode::Webhook,
                cursor: JsonMap::new(),
                webhook_secret: secret.to_owned(),
                webhook_path: "github/push".to_owned(),
                active: true,
            },
            area_id: area.id,
            area_link_id: area.links[0].id,
            user_id: area.user_id,
            config: area.links[0].config.clone(),
        });

        let pipeline = Arc::new(StorePipeline::new(
            store.clone(),
            Arc::new(queue.clone()),
            clock.clone(),
        ));
        let executor = Arc::new(ExecutionService::new(store.clone(), pipeline));
        let app = build_router(AppState::new(store.clone(), executor, clock));

        Fixture {
            store,
            queue,
            app,
            source_id,
        }
    }

    fn delivery(path: &str, secret: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header("x-area-event-id", "delivery-1")
            .header("x-area-event-time", "2024-05-01T12:00:00Z");
        if let Some(secret) = secret {
            builder = builder.header("x-area-webhook-secret", secret);
        }
        builder
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn valid_delivery_returns_202_and_records_one_event() {
        let f = fixture("hush");
        let response = f
            .app
            .oneshot(delivery(
                "/hooks/github/push?ref=main",
                Some("hush"),
                json!({"commits": 3}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let events = f.store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fingerprint, "delivery-1");
        assert_eq!(events[0].payload.get("commits"), Some(&json!(3)));
        assert_eq!(
            events[0].payload["query"]["ref"],
            json!("main")
        );
        assert!(events[0].payload["headers"]
            .get("x-area-webhook-secret")
            .is_none());
        assert_eq!(f.queue.pending_len(), 1);

        // Receipt bookkeeping landed on the cursor.
        let source = f.store.source(f.source_id).unwrap();
        assert_eq!(source.cursor_str("last_fingerprint"), Some("delivery-1"));
        assert!(source.cursor_str("last_received").is_some());
    }

    #[tokio::test]
    async fn wrong_secret_returns_403_and_records_nothing() {
        let f = fixture("hush");
        let response = f
            .app
            .oneshot(delivery(
                "/hooks/github/push",
                Some("wrong"),
                json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(f.store.events().is_empty());
        assert_eq!(f.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn missing_secret_returns_401() {
        let f = fixture("hush");
        let response = f
            .app
            .oneshot(delivery("/hooks/github/push", None, json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(f.store.events().is_empty());
    }

    #[tokio::test]
    async fn unknown_path_returns_404() {
        let f = fixture("hush");
        let response = f
            .app
            .oneshot(delivery("/hooks/no/such/hook", Some("hush"), json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_json_returns_400() {
        let f = fixture("hush");
        let request = Request::builder()
            .method("POST")
            .uri("/hooks/github/push")
            .header("content-type", "application/json")
            .header("x-area-webhook-secret", "hush")
            .body(Body::from("{not json"))
            .unwrap();
        let response = f.app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(f.store.events().is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_accepted_but_not_duplicated() {
        let f = fixture("hush");
        let first = f
            .app
            .clone()
            .oneshot(delivery(
                "/hooks/github/push",
                Some("hush"),
                json!({}),
            ))
            .await
            .unwrap();
        let second = f
            .app
            .oneshot(delivery(
                "/hooks/github/push",
                Some("hush"),
                json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(second.status(), StatusCode::ACCEPTED);
        assert_eq!(f.store.events().len(), 1);
        assert_eq!(f.queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn health_returns_200() {
        let f = fixture("hush");
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = f.app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }
}
