//! `send_email`: through a bound email integration, or the default mailer.

use super::{ActionHandler, ActionInput};
use crate::error::ActionError;
use async_trait::async_trait;
use autoflow_integration::connector::recipients;
use autoflow_integration::{IntegrationClient, IntegrationType};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A message for the default mail transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    /// `None` uses the transport's configured sender.
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html: Option<String>,
}

/// A mail transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailError {
    pub reason: String,
}

impl MailError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mail transport failed: {}", self.reason)
    }
}

impl std::error::Error for MailError {}

/// The default outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Short transport name recorded in the step result.
    fn name(&self) -> &'static str;

    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

/// Used when no mail transport is configured; every send fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn send(&self, _message: &EmailMessage) -> Result<(), MailError> {
        Err(MailError::new("no mail transport is configured"))
    }
}

/// Records messages instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMailer {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
}

impl InMemoryMailer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for InMemoryMailer {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

/// Params: `to` (required), `cc`, `from`, `subject`, `body`, `html`.
#[derive(Clone)]
pub struct SendEmailHandler {
    client: Arc<IntegrationClient>,
    mailer: Arc<dyn Mailer>,
}

impl SendEmailHandler {
    #[must_use]
    pub fn new(client: Arc<IntegrationClient>, mailer: Arc<dyn Mailer>) -> Self {
        Self { client, mailer }
    }
}

#[async_trait]
impl ActionHandler for SendEmailHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let to = recipients(input.param("to"));
        if to.is_empty() {
            return Err(ActionError::MissingRecipient);
        }
        let subject = input.param_str("subject").unwrap_or_default().to_string();

        if let Some(integration) = input
            .integration
            .filter(|i| i.integration_type == IntegrationType::Email)
        {
            let response = self
                .client
                .execute(integration, input.params, input.context)
                .await?;
            return Ok(json!({
                "sent": true,
                "via": "integration",
                "to": to,
                "subject": subject,
                "status": response.status,
                "response": response.body,
            }));
        }

        let message = EmailMessage {
            from: input.param_str("from").map(str::to_string),
            to,
            cc: recipients(input.param("cc")),
            subject,
            body: input.param_str("body").unwrap_or_default().to_string(),
            html: input.param_str("html").map(str::to_string),
        };
        self.mailer
            .send(&message)
            .await
            .map_err(|e| ActionError::Email { reason: e.reason })?;
        Ok(json!({
            "sent": true,
            "via": self.mailer.name(),
            "to": message.to,
            "subject": message.subject,
        }))
    }
}
