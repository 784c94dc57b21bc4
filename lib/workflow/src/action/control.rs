//! Control-flow actions: `conditional`, `loop`, and `wait`.

use super::{ActionHandler, ActionInput, ActionType, HandlerTable};
use crate::condition;
use crate::definition::Condition;
use crate::error::ActionError;
use crate::template;
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Params: `condition`, `if_true`, `if_false`.
///
/// Returns `{result, branch, next_step}`. The step runner jumps when
/// `next_step` names a later step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionalHandler;

#[async_trait]
impl ActionHandler for ConditionalHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let raw = input
            .param("condition")
            .ok_or_else(|| ActionError::invalid("'condition' is required"))?;
        let condition: Condition = serde_json::from_value(raw.clone())
            .map_err(|e| ActionError::invalid(format!("malformed condition: {e}")))?;
        let result = condition::evaluate(&condition, input.context);
        let branch = if result { "if_true" } else { "if_false" };
        let next_step = input.param(branch).cloned().unwrap_or(JsonValue::Null);
        Ok(json!({
            "result": result,
            "branch": branch,
            "next_step": next_step,
        }))
    }
}

/// Params: `items` (list), `action` (tag), `params` (per-item template with
/// `item` and `index` in scope), `stop_on_error` (default false).
///
/// Returns `{results, count, succeeded, failed, truncated}`.
pub struct LoopHandler {
    handlers: Arc<HandlerTable>,
    max_items: usize,
}

impl LoopHandler {
    #[must_use]
    pub(crate) fn new(handlers: Arc<HandlerTable>, max_items: usize) -> Self {
        Self { handlers, max_items }
    }
}

#[async_trait]
impl ActionHandler for LoopHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let items = match input.param("items") {
            None => &[][..],
            Some(JsonValue::Array(items)) => items.as_slice(),
            Some(_) => return Err(ActionError::invalid("'items' must be a list")),
        };
        let tag = input
            .param_str("action")
            .ok_or_else(|| ActionError::invalid("'action' is required"))?;
        let action = ActionType::from_tag(tag).ok_or_else(|| ActionError::UnknownActionType {
            action_type: tag.to_string(),
        })?;
        if action == ActionType::Loop {
            return Err(ActionError::invalid("nested loops are not supported"));
        }
        let handler = self
            .handlers
            .get(&action)
            .ok_or_else(|| ActionError::UnknownActionType {
                action_type: tag.to_string(),
            })?;
        let stop_on_error = input
            .param("stop_on_error")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let template_params = input.param("params").cloned().unwrap_or_else(|| json!({}));

        let truncated = items.len() > self.max_items;
        if truncated {
            warn!(
                items = items.len(),
                max_items = self.max_items,
                "Loop items truncated"
            );
        }

        let mut results = Vec::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for (index, item) in items.iter().take(self.max_items).enumerate() {
            let mut scope = input.context.clone();
            if let Some(map) = scope.as_object_mut() {
                map.insert("item".to_string(), item.clone());
                map.insert("index".to_string(), json!(index));
            }
            let params = template::resolve(&template_params, &scope);
            let outcome = handler
                .execute(ActionInput {
                    params: &params,
                    integration: input.integration,
                    context: &scope,
                })
                .await;
            match outcome {
                Ok(result) => {
                    succeeded += 1;
                    results.push(json!({"index": index, "success": true, "result": result}));
                }
                Err(e) if stop_on_error => return Err(e),
                Err(e) => {
                    debug!(index, error = %e, "Loop item failed");
                    failed += 1;
                    results.push(json!({
                        "index": index,
                        "success": false,
                        "error": e.to_string(),
                        "error_type": e.kind().as_str(),
                    }));
                }
            }
        }

        Ok(json!({
            "results": results,
            "count": results.len(),
            "succeeded": succeeded,
            "failed": failed,
            "truncated": truncated,
        }))
    }
}

/// Params: `seconds`, capped at the configured maximum. Suspends only the
/// task running this execution.
#[derive(Debug, Clone, Copy)]
pub struct WaitHandler {
    max_wait: Duration,
}

impl WaitHandler {
    #[must_use]
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }
}

#[async_trait]
impl ActionHandler for WaitHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let requested = match input.param("seconds") {
            None => 0.0,
            Some(value) => value
                .as_f64()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .ok_or_else(|| ActionError::invalid("'seconds' must be a non-negative number"))?,
        };
        let wait = Duration::from_secs_f64(requested.min(self.max_wait.as_secs_f64()));
        tokio::time::sleep(wait).await;
        Ok(json!({
            "waited_seconds": wait.as_secs_f64(),
            "capped": wait.as_secs_f64() < requested,
        }))
    }
}
