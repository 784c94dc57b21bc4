//! `integration_call`: one call through the integration client.

use super::{ActionHandler, ActionInput, ActionType};
use crate::error::ActionError;
use async_trait::async_trait;
use autoflow_integration::IntegrationClient;
use serde_json::Value as JsonValue;
use std::sync::Arc;

#[derive(Clone)]
pub struct IntegrationCallHandler {
    client: Arc<IntegrationClient>,
}

impl IntegrationCallHandler {
    #[must_use]
    pub fn new(client: Arc<IntegrationClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for IntegrationCallHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let integration = input.integration.ok_or_else(|| ActionError::MissingIntegration {
            action_type: ActionType::IntegrationCall.to_string(),
        })?;
        let response = self
            .client
            .execute(integration, input.params, input.context)
            .await?;
        Ok(response.to_json())
    }
}
