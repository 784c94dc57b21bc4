//! `transform_data`: ordered, infallible reshaping of a record or a list.

use super::{ActionHandler, ActionInput};
use crate::condition;
use crate::definition::Condition;
use crate::error::ActionError;
use crate::template::lookup;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};
use std::sync::LazyLock;
use tracing::debug;

static FIELD_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}").expect("Invalid regex"));

/// Params: `data` and a list of `transformations`, applied in order.
/// Returns `{data}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformDataHandler;

#[async_trait]
impl ActionHandler for TransformDataHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let data = input.param("data").cloned().unwrap_or_else(|| json!({}));
        let steps = input
            .param("transformations")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let data = steps.iter().fold(data, |data, spec| apply(data, spec));
        Ok(json!({ "data": data }))
    }
}

fn apply(data: JsonValue, spec: &JsonValue) -> JsonValue {
    match spec.get("type").and_then(JsonValue::as_str) {
        Some("map") => per_item(data, |item| map_fields(item, spec.get("mapping"))),
        Some("filter") => filter(data, spec),
        Some("format") => per_item(data, |item| format_field(item, spec)),
        Some("pick") => per_item(data, |item| pick(item, spec.get("fields"))),
        other => {
            debug!(transformation = ?other, "Skipping unknown transformation");
            data
        }
    }
}

fn per_item(data: JsonValue, f: impl Fn(JsonValue) -> JsonValue) -> JsonValue {
    match data {
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(f).collect()),
        other => f(other),
    }
}

fn map_fields(item: JsonValue, mapping: Option<&JsonValue>) -> JsonValue {
    let Some(mapping) = mapping.and_then(JsonValue::as_object) else {
        return item;
    };
    let mapped: Map<String, JsonValue> = mapping
        .iter()
        .map(|(target, source)| {
            let value = source
                .as_str()
                .and_then(|path| lookup(&item, path))
                .cloned()
                .unwrap_or(JsonValue::Null);
            (target.clone(), value)
        })
        .collect();
    JsonValue::Object(mapped)
}

fn filter(data: JsonValue, spec: &JsonValue) -> JsonValue {
    let source = spec.get("condition").unwrap_or(spec);
    let Ok(condition) = serde_json::from_value::<Condition>(source.clone()) else {
        return data;
    };
    match data {
        JsonValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .filter(|item| condition::evaluate(&condition, item))
                .collect(),
        ),
        JsonValue::Null => JsonValue::Null,
        other if condition::evaluate(&condition, &other) => other,
        _ => JsonValue::Null,
    }
}

fn format_field(mut item: JsonValue, spec: &JsonValue) -> JsonValue {
    let (Some(field), Some(template)) = (
        spec.get("field").and_then(JsonValue::as_str),
        spec.get("template").and_then(JsonValue::as_str),
    ) else {
        return item;
    };
    let rendered = FIELD_PLACEHOLDER.replace_all(template, |captures: &regex::Captures<'_>| {
        let path = captures.get(1).map_or("", |m| m.as_str());
        match lookup(&item, path) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    let rendered = JsonValue::String(rendered.into_owned());
    if let Some(map) = item.as_object_mut() {
        map.insert(field.to_string(), rendered);
    }
    item
}

fn pick(item: JsonValue, fields: Option<&JsonValue>) -> JsonValue {
    let (JsonValue::Object(map), Some(fields)) = (&item, fields.and_then(JsonValue::as_array)) else {
        return item;
    };
    let picked: Map<String, JsonValue> = fields
        .iter()
        .filter_map(JsonValue::as_str)
        .filter_map(|name| map.get(name).map(|v| (name.to_string(), v.clone())))
        .collect();
    JsonValue::Object(picked)
}
