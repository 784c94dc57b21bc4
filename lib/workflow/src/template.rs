//! `{{path}}` substitution over JSON values.
//!
//! A string that is exactly one placeholder becomes the referenced value
//! with its type preserved (or null when the path does not resolve).
//! Placeholders embedded in longer strings are interpolated as text.
//! Resolution is pure and never fails.

use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("Invalid regex"));

/// Resolves every placeholder in `value` against `context`.
#[must_use]
pub fn resolve(value: &JsonValue, context: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(text) => resolve_str(text, context),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| resolve(item, context)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve(item, context)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

fn resolve_str(text: &str, context: &JsonValue) -> JsonValue {
    if let Some(captures) = PLACEHOLDER.captures(text)
        && let Some(whole) = captures.get(0)
        && whole.start() == 0
        && whole.end() == text.len()
    {
        let path = captures.get(1).map_or("", |m| m.as_str());
        return lookup(context, path).cloned().unwrap_or(JsonValue::Null);
    }

    if !PLACEHOLDER.is_match(text) {
        return JsonValue::String(text.to_string());
    }

    let rendered = PLACEHOLDER.replace_all(text, |captures: &regex::Captures<'_>| {
        let path = captures.get(1).map_or("", |m| m.as_str());
        match lookup(context, path) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    JsonValue::String(rendered.into_owned())
}

/// Follows a dotted path through objects and array indices.
#[must_use]
pub fn lookup<'a>(context: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(context, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Whether `value` still contains a placeholder anywhere.
#[must_use]
pub fn has_placeholders(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(text) => PLACEHOLDER.is_match(text),
        JsonValue::Array(items) => items.iter().any(has_placeholders),
        JsonValue::Object(map) => map.values().any(has_placeholders),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> JsonValue {
        json!({
            "input": {"name": "Ada", "age": 36, "tags": ["a", "b"]},
            "steps": {"validate": {"result": {"valid": true}}},
            "variables": {"greeting": "Hello"},
        })
    }

    #[test]
    fn exact_placeholder_keeps_type() {
        let ctx = context();
        assert_eq!(resolve(&json!("{{input.age}}"), &ctx), json!(36));
        assert_eq!(
            resolve(&json!("{{ steps.validate.result }}"), &ctx),
            json!({"valid": true})
        );
        assert_eq!(resolve(&json!("{{input.tags.1}}"), &ctx), json!("b"));
    }

    #[test]
    fn missing_path_is_null() {
        let ctx = context();
        assert_eq!(resolve(&json!("{{input.missing}}"), &ctx), JsonValue::Null);
        assert_eq!(resolve(&json!("{{input.name.deeper}}"), &ctx), JsonValue::Null);
    }

    #[test]
    fn embedded_placeholders_are_interpolated() {
        let ctx = context();
        assert_eq!(
            resolve(&json!("{{variables.greeting}}, {{input.name}} ({{input.age}}){{input.nope}}"), &ctx),
            json!("Hello, Ada (36)")
        );
    }

    #[test]
    fn nested_structures_resolve_recursively() {
        let ctx = context();
        let params = json!({
            "to": "{{input.name}}",
            "list": ["{{input.age}}", 5, null],
            "flag": true,
        });
        assert_eq!(
            resolve(&params, &ctx),
            json!({"to": "Ada", "list": [36, 5, null], "flag": true})
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let ctx = context();
        let params = json!({"a": "{{input.name}}", "b": "{{steps.validate.result}}", "c": "x {{input.age}}"});
        let once = resolve(&params, &ctx);
        let twice = resolve(&once, &ctx);
        assert_eq!(once, twice);
        assert!(!has_placeholders(&once));
    }

    #[test]
    fn plain_strings_pass_through() {
        let ctx = context();
        assert_eq!(resolve(&json!("no templates {here}"), &ctx), json!("no templates {here}"));
        assert_eq!(resolve(&json!(42), &ctx), json!(42));
    }
}
