//! Placeholder rendering for declarative HTTP descriptions.
//!
//! Catalog metadata and reaction parameters embed `{{scope.key}}`
//! placeholders (`{{params.channel}}`, `{{cursor.last_seen}}`,
//! `{{auth.access_token}}`) plus the bare tokens `{{now_rfc3339}}` and
//! `{{now_unix}}`. Rendering substitutes from the scopes registered on a
//! [`TemplateContext`]; an unresolved placeholder renders as empty.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::types::JsonMap;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap())
}

#[derive(Default)]
pub struct TemplateContext {
    scopes: HashMap<String, JsonMap>,
    literals: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named scope resolved by `{{name.key}}` placeholders.
    pub fn scope(mut self, name: &str, map: &JsonMap) -> Self {
        self.scopes.insert(name.to_owned(), map.clone());
        self
    }

    /// Register a bare `{{name}}` token.
    pub fn literal(mut self, name: &str, value: impl Into<String>) -> Self {
        self.literals.insert(name.to_owned(), value.into());
        self
    }

    pub fn render(&self, template: &str) -> String {
        placeholder_re()
            .replace_all(template, |caps: &regex::Captures<'_>| {
                self.resolve(&caps[1]).unwrap_or_default()
            })
            .into_owned()
    }

    fn resolve(&self, key: &str) -> Option<String> {
        if let Some(literal) = self.literals.get(key) {
            return Some(literal.clone());
        }
        let (scope, path) = key.split_once('.')?;
        let map = self.scopes.get(scope)?;
        let mut current: &Value = map.get(path.split('.').next()?)?;
        for segment in path.split('.').skip(1) {
            current = current.get(segment)?;
        }
        Some(value_to_string(current))
    }
}

/// Strings render bare; everything else renders as JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk a dotted path into a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn renders_scoped_placeholders() {
        let params = map(json!({"channel": "general", "limit": 10}));
        let ctx = TemplateContext::new().scope("params", &params);
        assert_eq!(
            ctx.render("/channels/{{params.channel}}?limit={{params.limit}}"),
            "/channels/general?limit=10"
        );
    }

    #[test]
    fn renders_nested_keys_and_literals() {
        let cursor = map(json!({"page": {"token": "abc"}}));
        let ctx = TemplateContext::new()
            .scope("cursor", &cursor)
            .literal("now_unix", "1714564800");
        assert_eq!(
            ctx.render("token={{cursor.page.token}}&t={{ now_unix }}"),
            "token=abc&t=1714564800"
        );
    }

    #[test]
    fn unresolved_placeholder_renders_empty() {
        let ctx = TemplateContext::new();
        assert_eq!(ctx.render("x={{params.missing}}!"), "x=!");
    }

    #[test]
    fn lookup_path_walks_objects() {
        let value = json!({"a": {"b": {"c": 3}}});
        assert_eq!(lookup_path(&value, "a.b.c"), Some(&json!(3)));
        assert_eq!(lookup_path(&value, "a.x"), None);
    }
}
