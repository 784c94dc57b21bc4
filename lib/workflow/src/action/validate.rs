//! `validate_data`: checks a record against a small declarative schema.

use super::{ActionHandler, ActionInput};
use crate::error::ActionError;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Named schemas that steps reference through `schema_ref`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Arc<HashMap<String, JsonValue>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_schema(mut self, name: impl Into<String>, schema: JsonValue) -> Self {
        Arc::make_mut(&mut self.schemas).insert(name.into(), schema);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.schemas.get(name)
    }
}

/// Params: `data` plus either `schema` or `schema_ref`.
/// Returns `{valid, data, errors}`.
#[derive(Debug, Clone, Default)]
pub struct ValidateDataHandler {
    schemas: SchemaRegistry,
}

impl ValidateDataHandler {
    #[must_use]
    pub fn new(schemas: SchemaRegistry) -> Self {
        Self { schemas }
    }

    fn schema<'a>(&'a self, input: &ActionInput<'a>) -> Result<&'a JsonValue, ActionError> {
        if let Some(schema) = input.param("schema") {
            return Ok(schema);
        }
        let name = input
            .param_str("schema_ref")
            .ok_or_else(|| ActionError::invalid("either 'schema' or 'schema_ref' is required"))?;
        self.schemas
            .get(name)
            .ok_or_else(|| ActionError::invalid(format!("unknown schema '{name}'")))
    }
}

#[async_trait]
impl ActionHandler for ValidateDataHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let schema = self
            .schema(&input)?
            .as_object()
            .ok_or_else(|| ActionError::invalid("schema must be an object"))?;
        let data = input.param("data").cloned().unwrap_or_else(|| json!({}));
        let record = data
            .as_object()
            .ok_or_else(|| ActionError::invalid("'data' must be an object"))?;

        let errors = validate_record(record, schema)?;
        Ok(json!({
            "valid": errors.is_empty(),
            "data": data,
            "errors": errors,
        }))
    }
}

fn validate_record(
    record: &Map<String, JsonValue>,
    schema: &Map<String, JsonValue>,
) -> Result<Vec<JsonValue>, ActionError> {
    let mut errors = Vec::new();

    if let Some(required) = schema.get("required").and_then(JsonValue::as_array) {
        for field in required.iter().filter_map(JsonValue::as_str) {
            if record.get(field).is_none_or(JsonValue::is_null) {
                errors.push(field_error(field, "is required"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(JsonValue::as_object) {
        for (field, rules) in properties {
            let Some(value) = record.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let rules = rules
                .as_object()
                .ok_or_else(|| ActionError::invalid(format!("rules for '{field}' must be an object")))?;
            check_value(field, value, rules, &mut errors)?;
        }
    }

    Ok(errors)
}

fn check_value(
    field: &str,
    value: &JsonValue,
    rules: &Map<String, JsonValue>,
    errors: &mut Vec<JsonValue>,
) -> Result<(), ActionError> {
    if let Some(expected) = rules.get("type").and_then(JsonValue::as_str) {
        if !has_type(value, expected) {
            errors.push(field_error(field, &format!("must be of type {expected}")));
            return Ok(());
        }
    }

    let length = match value {
        JsonValue::String(s) => Some(s.chars().count()),
        JsonValue::Array(items) => Some(items.len()),
        _ => None,
    };
    if let Some(length) = length {
        if let Some(min) = rules.get("min_length").and_then(JsonValue::as_u64)
            && (length as u64) < min
        {
            errors.push(field_error(field, &format!("must have length at least {min}")));
        }
        if let Some(max) = rules.get("max_length").and_then(JsonValue::as_u64)
            && (length as u64) > max
        {
            errors.push(field_error(field, &format!("must have length at most {max}")));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = rules.get("minimum").and_then(JsonValue::as_f64)
            && number < min
        {
            errors.push(field_error(field, &format!("must be at least {min}")));
        }
        if let Some(max) = rules.get("maximum").and_then(JsonValue::as_f64)
            && number > max
        {
            errors.push(field_error(field, &format!("must be at most {max}")));
        }
    }

    if let (Some(text), Some(pattern)) = (
        value.as_str(),
        rules.get("pattern").and_then(JsonValue::as_str),
    ) {
        let regex = Regex::new(pattern)
            .map_err(|e| ActionError::invalid(format!("invalid pattern for '{field}': {e}")))?;
        if !regex.is_match(text) {
            errors.push(field_error(field, &format!("must match pattern {pattern}")));
        }
    }

    if let Some(allowed) = rules.get("enum").and_then(JsonValue::as_array)
        && !allowed.contains(value)
    {
        errors.push(field_error(field, "is not one of the allowed values"));
    }

    Ok(())
}

fn has_type(value: &JsonValue, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn field_error(field: &str, message: &str) -> JsonValue {
    json!({ "field": field, "message": format!("{field} {message}") })
}
