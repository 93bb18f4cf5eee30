//! Generic HTTP reaction delivery.
//!
//! Covers any reaction whose link params describe the call directly:
//! `endpoint` (required), `method` (default POST), `headers` (object of
//! string templates), `body` (JSON, string leaves templated; defaults to
//! the event payload). Wired as the composite executor's fallback.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

use crate::clock::SharedClock;
use crate::domain::{Component, Link};
use crate::template::TemplateContext;
use crate::types::JsonMap;

use super::{ReactionError, ReactionHandler, ReactionResult};

pub struct HttpReactionHandler {
    client: reqwest::Client,
    clock: SharedClock,
}

impl HttpReactionHandler {
    pub fn new(client: reqwest::Client, clock: SharedClock) -> Self {
        HttpReactionHandler { client, clock }
    }

    fn context(&self, link: &Link, input: &JsonMap) -> TemplateContext {
        let event = input
            .get("event_payload")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let now = self.clock.now();
        TemplateContext::new()
            .scope("params", &link.config.params)
            .scope("event", &event)
            .literal("now_rfc3339", now.to_rfc3339())
            .literal("now_unix", now.timestamp().to_string())
    }
}

/// Render every string leaf of a JSON value through the context.
fn render_value(ctx: &TemplateContext, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(ctx.render(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(ctx, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(ctx, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[async_trait]
impl ReactionHandler for HttpReactionHandler {
    /// Cannot be inferred from the component alone; this handler is meant
    /// to run as the fallback.
    fn supports(&self, _component: Option<&Component>) -> bool {
        false
    }

    async fn deliver(&self, link: &Link, input: &JsonMap) -> Result<ReactionResult, ReactionError> {
        let ctx = self.context(link, input);

        let endpoint = match link.config.param_str("endpoint") {
            Some(e) => ctx.render(e),
            None => {
                return Err(ReactionError::failed(
                    "reaction link has no endpoint parameter",
                    ReactionResult::default(),
                ))
            }
        };

        let method = link
            .config
            .param_str("method")
            .unwrap_or("POST")
            .to_ascii_uppercase();
        let method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::POST);

        let headers: Vec<(String, String)> = link
            .config
            .params
            .get("headers")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), ctx.render(s))))
                    .collect()
            })
            .unwrap_or_default();

        let body = match link.config.params.get("body") {
            Some(spec) => render_value(&ctx, spec),
            None => input
                .get("event_payload")
                .cloned()
                .unwrap_or(Value::Object(JsonMap::new())),
        };

        let mut request_snapshot = JsonMap::new();
        request_snapshot.insert("method".into(), json!(method.as_str()));
        request_snapshot.insert("body".into(), body.clone());
        if !headers.is_empty() {
            let names: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
            request_snapshot.insert("headers".into(), json!(names));
        }

        let mut builder = self.client.request(method, &endpoint).json(&body);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        let started = Instant::now();
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                let result = ReactionResult {
                    endpoint,
                    request: request_snapshot,
                    response: JsonMap::new(),
                    status_code: None,
                    duration: started.elapsed(),
                };
                return Err(ReactionError::failed(
                    format!("request failed: {e}"),
                    result,
                ));
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let mut response_snapshot = JsonMap::new();
        match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => {
                response_snapshot.insert("body".into(), parsed);
            }
            Err(_) if !text.is_empty() => {
                response_snapshot.insert("body".into(), json!(text));
            }
            Err(_) => {}
        }

        let result = ReactionResult {
            endpoint,
            request: request_snapshot,
            response: response_snapshot,
            status_code: Some(status.as_u16()),
            duration: started.elapsed(),
        };

        if status.is_success() {
            Ok(result)
        } else {
            Err(ReactionError::failed(
                format!("endpoint answered {status}"),
                result,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::domain::{ComponentConfig, LinkRole};
    use crate::types::{ComponentId, ConfigId, LinkId};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn link_with_params(params: JsonMap) -> Link {
        Link {
            id: LinkId::new(),
            role: LinkRole::Reaction,
            position: 1,
            config: ComponentConfig {
                id: ConfigId::new(),
                component_id: ComponentId::new(),
                params,
                identity_id: None,
                component: None,
            },
            retry: None,
        }
    }

    fn handler() -> HttpReactionHandler {
        HttpReactionHandler::new(reqwest::Client::new(), FixedClock::at(Utc::now()))
    }

    #[tokio::test]
    async fn posts_templated_body_and_captures_response() {
        let received: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let sink = received.clone();
        let router = Router::new().route(
            "/notify",
            post(move |Json(body): Json<Value>| async move {
                *sink.lock().await = Some(body);
                Json(json!({"ok": true}))
            }),
        );
        let base = serve(router).await;

        let params = json!({
            "endpoint": format!("{base}/notify"),
            "body": {"text": "hello {{event.subject}}"},
        });
        let link = link_with_params(params.as_object().cloned().unwrap());
        let input = json!({"event_payload": {"subject": "world"}})
            .as_object()
            .cloned()
            .unwrap();

        let result = handler().deliver(&link, &input).await.unwrap();

        assert_eq!(result.status_code, Some(200));
        assert_eq!(
            result.response.get("body"),
            Some(&json!({"ok": true}))
        );
        assert_eq!(
            received.lock().await.take(),
            Some(json!({"text": "hello world"}))
        );
    }

    #[tokio::test]
    async fn non_success_status_fails_with_snapshot() {
        let router = Router::new().route(
            "/notify",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let base = serve(router).await;

        let params = json!({"endpoint": format!("{base}/notify")});
        let link = link_with_params(params.as_object().cloned().unwrap());

        let err = handler()
            .deliver(&link, &JsonMap::new())
            .await
            .unwrap_err();
        match err {
            ReactionError::Failed { result, .. } => {
                assert_eq!(result.status_code, Some(502));
                assert_eq!(result.response.get("body"), Some(&json!("upstream down")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_endpoint_fails_without_calling_out() {
        let link = link_with_params(JsonMap::new());
        let err = handler()
            .deliver(&link, &JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReactionError::Failed { .. }));
    }
}
