//! `custom_code`: a user script in a bounded Rhai sandbox.
//!
//! The script sees `context`, `params`, and a mutable `result`. The step
//! result is `result` when the script assigns it, otherwise the value of
//! the last expression. Modules and `eval` are unavailable.

use super::{ActionHandler, ActionInput};
use crate::error::ActionError;
use crate::settings::CustomCodeLimits;
use async_trait::async_trait;
use rhai::{Dynamic, Engine, Scope};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

/// Params: `script` (or `code`) plus anything the script reads from `params`.
#[derive(Debug, Clone, Default)]
pub struct CustomCodeHandler {
    limits: CustomCodeLimits,
}

impl CustomCodeHandler {
    #[must_use]
    pub fn new(limits: CustomCodeLimits) -> Self {
        Self { limits }
    }
}

fn sandbox(limits: &CustomCodeLimits) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_collection_size);
    engine.set_max_map_size(limits.max_collection_size);
    engine.set_max_modules(0);
    engine.disable_symbol("eval");
    engine.on_print(|text| info!(target: "autoflow::custom_code", "{text}"));
    engine.on_debug(|text, source, position| {
        debug!(target: "autoflow::custom_code", source = ?source, position = %position, "{text}");
    });
    engine
}

fn failed(reason: impl ToString) -> ActionError {
    ActionError::CustomCode {
        reason: reason.to_string(),
    }
}

fn run_script(
    limits: &CustomCodeLimits,
    script: &str,
    context: &JsonValue,
    params: &JsonValue,
) -> Result<JsonValue, ActionError> {
    let engine = sandbox(limits);
    let mut scope = Scope::new();
    scope.push_dynamic("context", rhai::serde::to_dynamic(context).map_err(failed)?);
    scope.push_dynamic("params", rhai::serde::to_dynamic(params).map_err(failed)?);
    scope.push_dynamic("result", Dynamic::UNIT);

    let last = engine
        .eval_with_scope::<Dynamic>(&mut scope, script)
        .map_err(failed)?;
    let assigned = scope
        .get_value::<Dynamic>("result")
        .filter(|value| !value.is_unit());
    let value = assigned.unwrap_or(last);
    if value.is_unit() {
        return Ok(JsonValue::Null);
    }
    rhai::serde::from_dynamic::<JsonValue>(&value).map_err(failed)
}

#[async_trait]
impl ActionHandler for CustomCodeHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let script = input
            .param_str("script")
            .or_else(|| input.param_str("code"))
            .ok_or_else(|| ActionError::invalid("'script' is required"))?
            .to_string();
        let limits = self.limits.clone();
        let context = input.context.clone();
        let params = input.params.clone();

        let result = tokio::task::spawn_blocking(move || {
            run_script(&limits, &script, &context, &params)
        })
        .await
        .map_err(|e| failed(format!("script task failed: {e}")))??;

        Ok(json!({ "result": result }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn run(handler: &CustomCodeHandler, params: JsonValue, ctx: JsonValue) -> Result<JsonValue, ActionError> {
        handler
            .execute(ActionInput {
                params: &params,
                integration: None,
                context: &ctx,
            })
            .await
    }

    #[tokio::test]
    async fn last_expression_is_the_result() {
        let out = run(
            &CustomCodeHandler::default(),
            json!({"script": "context.input.amount * 2"}),
            json!({"input": {"amount": 21}}),
        )
        .await
        .expect("script");
        assert_eq!(out["result"], json!(42));
    }

    #[tokio::test]
    async fn assigned_result_wins() {
        let out = run(
            &CustomCodeHandler::default(),
            json!({"code": "result = #{ total: params.a + params.b }; 0", "a": 1, "b": 2}),
            json!({}),
        )
        .await
        .expect("script");
        assert_eq!(out["result"], json!({"total": 3}));
    }

    #[tokio::test]
    async fn runaway_scripts_hit_the_operation_limit() {
        let handler = CustomCodeHandler::new(CustomCodeLimits {
            max_operations: 1_000,
            ..CustomCodeLimits::default()
        });
        let err = run(&handler, json!({"script": "loop { }"}), json!({}))
            .await
            .expect_err("limit");
        assert_eq!(err.kind(), ErrorKind::CustomCodeFailed);
    }

    #[tokio::test]
    async fn eval_is_disabled() {
        let err = run(
            &CustomCodeHandler::default(),
            json!({"script": "eval(\"1 + 1\")"}),
            json!({}),
        )
        .await
        .expect_err("eval");
        assert_eq!(err.kind(), ErrorKind::CustomCodeFailed);
    }

    #[tokio::test]
    async fn syntax_errors_fail_the_step() {
        let err = run(&CustomCodeHandler::default(), json!({"script": "let x = ;"}), json!({}))
            .await
            .expect_err("syntax");
        assert!(err.to_string().contains("custom code failed"));
    }

    #[tokio::test]
    async fn script_is_required() {
        let err = run(&CustomCodeHandler::default(), json!({}), json!({}))
            .await
            .expect_err("no script");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
