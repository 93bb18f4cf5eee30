//! Declarative HTTP polling.
//!
//! A component opts in through its catalog metadata: an `ingestion` object
//! with `mode: polling` describes the endpoint template, query/header
//! specs, where the items live in the response, and how the cursor is
//! derived. The handler renders the request against the stored params and
//! cursor, extracts items, and computes the next cursor; it knows nothing
//! about any particular provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::Component;
use crate::identity::IdentityProvider;
use crate::store::IdentityRepository;
use crate::template::{lookup_path, TemplateContext};
use crate::types::JsonMap;

use super::polling::{PollError, PollingEvent, PollingHandler, PollingRequest, PollingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorSource {
    Item,
    Response,
    Fingerprint,
}

/// One query parameter or header: a template with a default and an
/// emptiness policy.
#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    template: String,
    default: String,
    skip_if_empty: bool,
}

#[derive(Debug, Clone)]
struct IngestionConfig {
    endpoint: String,
    method: Method,
    items_path: Vec<String>,
    fingerprint_path: Vec<String>,
    occurred_at_path: Vec<String>,
    cursor_key: String,
    cursor_source: CursorSource,
    cursor_item_path: Vec<String>,
    cursor_response_path: Vec<String>,
    cursor_initial: String,
    query: Vec<ParamSpec>,
    headers: Vec<ParamSpec>,
    body_template: String,
    oauth: bool,
}

impl IngestionConfig {
    /// `Ok(None)` means "not this handler's component"; `Err` means the
    /// component claims HTTP polling but its metadata is broken.
    fn parse(component: &Component) -> Result<Option<Self>, String> {
        let Some(ingestion) = component.metadata.get("ingestion").and_then(|v| v.as_object())
        else {
            return Ok(None);
        };

        let mode = str_or(ingestion, "mode", "");
        if !mode.trim().eq_ignore_ascii_case("polling") {
            return Ok(None);
        }
        let handler = str_or(ingestion, "handler", "");
        let handler = handler.trim().to_ascii_lowercase();
        if !handler.is_empty() && handler != "http" {
            return Ok(None);
        }

        // HTTP specifics may be nested under `http` or inlined.
        let config = ingestion
            .get("http")
            .and_then(|v| v.as_object())
            .unwrap_or(ingestion);

        let endpoint = str_or(config, "endpoint", "");
        if endpoint.trim().is_empty() {
            return Err("ingestion.endpoint missing".into());
        }

        let method = str_or(config, "method", "GET").trim().to_ascii_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| format!("unsupported method {method:?}"))?;

        let mut cursor_key = default_cursor_key(component);
        let mut cursor_source = CursorSource::Item;
        let mut cursor_item_path = split_path(&str_or(config, "cursorField", ""));
        let mut cursor_response_path = Vec::new();
        let mut cursor_initial = str_or(config, "initialCursor", "");

        for holder in [ingestion, config] {
            let Some(cursor) = holder.get("cursor").and_then(|v| v.as_object()) else {
                continue;
            };
            if let Some(key) = cursor.get("key").and_then(|v| v.as_str()) {
                if !key.trim().is_empty() {
                    cursor_key = key.trim().to_owned();
                }
            }
            if let Some(initial) = cursor.get("initial").and_then(|v| v.as_str()) {
                cursor_initial = initial.trim().to_owned();
            }
            if let Some(source) = cursor.get("source").and_then(|v| v.as_str()) {
                cursor_source = match source.trim().to_ascii_lowercase().as_str() {
                    "item" | "" => CursorSource::Item,
                    "response" => CursorSource::Response,
                    "fingerprint" => CursorSource::Fingerprint,
                    other => return Err(format!("unsupported cursor source {other:?}")),
                };
            }
            for key in ["path", "itemPath"] {
                if let Some(path) = cursor.get(key).and_then(|v| v.as_str()) {
                    cursor_item_path = split_path(path);
                }
            }
            if let Some(path) = cursor.get("responsePath").and_then(|v| v.as_str()) {
                cursor_response_path = split_path(path);
            }
        }

        let fingerprint_path = split_path(&str_or(config, "fingerprintField", ""));
        if cursor_source == CursorSource::Item
            && cursor_item_path.is_empty()
            && fingerprint_path.is_empty()
        {
            return Err("cursor item path missing and no fingerprintField provided".into());
        }
        if cursor_source == CursorSource::Response && cursor_response_path.is_empty() {
            return Err("cursor response path missing".into());
        }

        Ok(Some(IngestionConfig {
            endpoint,
            method,
            items_path: split_path(&str_or(config, "itemsPath", "")),
            fingerprint_path,
            occurred_at_path: split_path(&str_or(config, "occurredAtField", "")),
            cursor_key,
            cursor_source,
            cursor_item_path,
            cursor_response_path,
            cursor_initial,
            query: parse_param_specs(config.get("query"))?,
            headers: parse_param_specs(config.get("headers"))?,
            body_template: str_or(config, "bodyTemplate", ""),
            oauth: str_or(ingestion, "auth", "").trim().eq_ignore_ascii_case("oauth"),
        }))
    }
}

fn str_or(map: &JsonMap, key: &str, fallback: &str) -> String {
    map.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(fallback)
        .to_owned()
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn default_cursor_key(component: &Component) -> String {
    let provider = component.provider_name().unwrap_or("");
    let joined = format!("{provider}_{}_cursor", component.name).to_ascii_lowercase();
    let cleaned: String = joined
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "cursor".into()
    } else {
        // collapse runs of underscores from the replacement above
        let mut out = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            if c == '_' && out.ends_with('_') {
                continue;
            }
            out.push(c);
        }
        out
    }
}

/// Query/header specs accept `template`, literal `value`, or the `param` /
/// `cursor` shortcuts that expand to the matching placeholder.
fn parse_param_specs(raw: Option<&Value>) -> Result<Vec<ParamSpec>, String> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let items = raw.as_array().ok_or("spec list is not an array")?;
    let mut specs = Vec::with_capacity(items.len());
    for item in items {
        let entry = item.as_object().ok_or("spec entry is not an object")?;
        let name = str_or(entry, "name", "");
        let name = name.trim();
        if name.is_empty() {
            return Err("spec name missing".into());
        }
        let mut template = str_or(entry, "template", "");
        if template.is_empty() {
            template = str_or(entry, "value", "");
        }
        if template.is_empty() {
            let param = str_or(entry, "param", "");
            if !param.is_empty() {
                template = format!("{{{{params.{param}}}}}");
            }
        }
        if template.is_empty() {
            let cursor = str_or(entry, "cursor", "");
            if !cursor.is_empty() {
                template = format!("{{{{cursor.{cursor}}}}}");
            }
        }
        specs.push(ParamSpec {
            name: name.to_owned(),
            template,
            default: str_or(entry, "default", "").trim().to_owned(),
            skip_if_empty: entry
                .get("skipIfEmpty")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        });
    }
    Ok(specs)
}

pub struct HttpPollingHandler {
    client: reqwest::Client,
    identities: Arc<dyn IdentityRepository>,
    providers: Vec<Arc<dyn IdentityProvider>>,
}

impl HttpPollingHandler {
    pub fn new(
        client: reqwest::Client,
        identities: Arc<dyn IdentityRepository>,
        providers: Vec<Arc<dyn IdentityProvider>>,
    ) -> Self {
        HttpPollingHandler {
            client,
            identities,
            providers,
        }
    }

    /// Resolve the access token for an OAuth-backed component, refreshing
    /// and persisting it when expired.
    async fn access_token(&self, request: &PollingRequest) -> Result<String, PollError> {
        let identity_id = request
            .binding
            .config
            .identity_id
            .ok_or_else(|| PollError::Auth("component requires oauth but no identity linked".into()))?;
        let identity = self
            .identities
            .find_identity(identity_id)
            .await
            .map_err(|e| PollError::Auth(format!("load identity: {e}")))?;

        if !identity.needs_refresh(request.now) {
            return Ok(identity.access_token);
        }

        let provider = self
            .providers
            .iter()
            .find(|p| p.name() == identity.provider)
            .ok_or_else(|| PollError::Auth(format!("no provider for {:?}", identity.provider)))?;
        let exchange = provider
            .refresh(&identity)
            .await
            .map_err(|e| PollError::Auth(e.to_string()))?;
        self.identities
            .update_identity_tokens(identity_id, &exchange)
            .await
            .map_err(|e| PollError::Auth(format!("persist tokens: {e}")))?;
        debug!(identity_id = %identity_id, "refreshed access token");
        Ok(exchange.access_token)
    }

    fn render_spec(spec: &ParamSpec, ctx: &TemplateContext) -> Option<String> {
        let mut value = ctx.render(&spec.template);
        if value.trim().is_empty() && !spec.default.is_empty() {
            value = ctx.render(&spec.default);
        }
        if value.trim().is_empty() && spec.skip_if_empty {
            return None;
        }
        Some(value)
    }
}

#[async_trait]
impl PollingHandler for HttpPollingHandler {
    fn supports(&self, component: &Component) -> bool {
        matches!(IngestionConfig::parse(component), Ok(Some(_)))
    }

    async fn poll(&self, request: PollingRequest) -> Result<PollingResult, PollError> {
        let config = IngestionConfig::parse(&request.component)
            .map_err(PollError::BadMetadata)?
            .ok_or_else(|| {
                PollError::BadMetadata(format!(
                    "component {:?} has no http polling ingestion",
                    request.component.name
                ))
            })?;

        let mut ctx = TemplateContext::new()
            .scope("params", &request.binding.config.params)
            .scope("cursor", &request.cursor)
            .literal("now_rfc3339", request.now.to_rfc3339())
            .literal("now_unix", request.now.timestamp().to_string());
        if config.oauth {
            let token = self.access_token(&request).await?;
            let mut auth = JsonMap::new();
            auth.insert("access_token".into(), json!(token));
            ctx = ctx.scope("auth", &auth);
        }

        let endpoint = ctx.render(&config.endpoint);
        if endpoint.trim().is_empty() {
            return Err(PollError::BadMetadata("endpoint empty after rendering".into()));
        }
        let mut url = Url::parse(&endpoint)
            .map_err(|e| PollError::BadMetadata(format!("endpoint invalid: {e}")))?;
        for spec in &config.query {
            if let Some(value) = Self::render_spec(spec, &ctx) {
                url.query_pairs_mut().append_pair(&spec.name, &value);
            }
        }

        let mut builder = self
            .client
            .request(config.method.clone(), url)
            .header("Accept", "application/json");
        for spec in &config.headers {
            if let Some(value) = Self::render_spec(spec, &ctx) {
                builder = builder.header(&spec.name, value);
            }
        }
        if !config.body_template.is_empty() {
            builder = builder.body(ctx.render(&config.body_template));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PollError::Request(e.to_string()))?;
        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(PollError::BadStatus(status.as_u16()));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PollError::Request(format!("decode response: {e}")))?;

        // An empty items path means the response body itself is the array.
        let items_value = if config.items_path.is_empty() {
            Some(&payload)
        } else {
            lookup_value(&payload, &config.items_path)
        };
        let items = match items_value {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(PollError::BadMetadata("items path is not an array".into())),
            None => return Err(PollError::BadMetadata("items path missing in response".into())),
        };

        let mut events = Vec::with_capacity(items.len());
        let mut last_cursor_value = String::new();
        for item in items {
            let Some(item_map) = item.as_object() else {
                warn!(component = %request.component.name, "skipping non-object item");
                continue;
            };

            let mut fingerprint = lookup_value(&item, &config.fingerprint_path)
                .map(stringify)
                .unwrap_or_default();
            if fingerprint.is_empty() {
                fingerprint = content_hash(item_map);
            }

            let occurred_at = lookup_value(&item, &config.occurred_at_path).and_then(parse_time);

            match config.cursor_source {
                CursorSource::Item => {
                    if let Some(value) = lookup_value(&item, &config.cursor_item_path) {
                        last_cursor_value = stringify(value);
                    }
                }
                CursorSource::Fingerprint => {
                    if !fingerprint.is_empty() {
                        last_cursor_value = fingerprint.clone();
                    }
                }
                CursorSource::Response => {}
            }

            events.push(PollingEvent {
                payload: item_map.clone(),
                fingerprint,
                occurred_at,
            });
        }

        if config.cursor_source == CursorSource::Response {
            if let Some(value) = lookup_value(&payload, &config.cursor_response_path) {
                last_cursor_value = stringify(value);
            }
        }

        let mut cursor = JsonMap::new();
        if !last_cursor_value.is_empty() {
            cursor.insert(config.cursor_key.clone(), json!(last_cursor_value));
        } else if !request.cursor.contains_key(&config.cursor_key)
            && !config.cursor_initial.is_empty()
        {
            cursor.insert(config.cursor_key.clone(), json!(config.cursor_initial));
        }
        cursor.insert("last_polled_at".into(), json!(request.now.to_rfc3339()));

        Ok(PollingResult { cursor, events })
    }
}

/// `lookup_path` over a pre-split path. An empty path is an unconfigured
/// spec (fingerprint, occurred-at, cursor) and resolves to None.
fn lookup_value<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    lookup_path(value, &path.join("."))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Content-addressed fallback fingerprint for items without an id field.
fn content_hash(item: &JsonMap) -> String {
    let bytes = serde_json::to_vec(item).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
            if let Ok(t) = DateTime::parse_from_rfc2822(s) {
                return Some(t.with_timezone(&Utc));
            }
            if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&t));
            }
            None
        }
        Value::Number(n) => {
            let seconds = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_opt(seconds, 0).single()
        }
        _ => None,
    }
}
