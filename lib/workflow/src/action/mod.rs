//! Action routing.
//!
//! A step's `action_type` tag is resolved once into [`ActionType`] and
//! routed through a handler table built at startup. Unknown tags are
//! rejected before any handler runs.

mod control;
mod custom_code;
mod database;
mod email;
mod integration_call;
mod transform;
mod validate;
mod webhook;

pub use control::{ConditionalHandler, LoopHandler, WaitHandler};
pub use custom_code::CustomCodeHandler;
pub use database::{
    DataStore, DatabaseQueryHandler, DatabaseSaveHandler, InMemoryDataStore, NamedQueries,
    QueryOutput, SqlQuery, is_valid_identifier,
};
pub use email::{DisabledMailer, EmailMessage, InMemoryMailer, MailError, Mailer, SendEmailHandler};
pub use integration_call::IntegrationCallHandler;
pub use transform::TransformDataHandler;
pub use validate::{SchemaRegistry, ValidateDataHandler};
pub use webhook::SendWebhookHandler;

use crate::error::ActionError;
use crate::settings::EngineSettings;
use async_trait::async_trait;
use autoflow_integration::{HttpTransport, Integration, IntegrationClient};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Every action the dispatcher knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    ValidateData,
    DatabaseSave,
    DatabaseQuery,
    IntegrationCall,
    SendEmail,
    SendWebhook,
    TransformData,
    Conditional,
    Loop,
    Wait,
    CustomCode,
}

impl ActionType {
    pub const ALL: [Self; 11] = [
        Self::ValidateData,
        Self::DatabaseSave,
        Self::DatabaseQuery,
        Self::IntegrationCall,
        Self::SendEmail,
        Self::SendWebhook,
        Self::TransformData,
        Self::Conditional,
        Self::Loop,
        Self::Wait,
        Self::CustomCode,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidateData => "validate_data",
            Self::DatabaseSave => "database_save",
            Self::DatabaseQuery => "database_query",
            Self::IntegrationCall => "integration_call",
            Self::SendEmail => "send_email",
            Self::SendWebhook => "send_webhook",
            Self::TransformData => "transform_data",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
            Self::Wait => "wait",
            Self::CustomCode => "custom_code",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to one handler invocation. `params` are already template-resolved.
#[derive(Debug, Clone, Copy)]
pub struct ActionInput<'a> {
    pub params: &'a JsonValue,
    pub integration: Option<&'a Integration>,
    pub context: &'a JsonValue,
}

impl<'a> ActionInput<'a> {
    pub(crate) fn param(&self, key: &str) -> Option<&'a JsonValue> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    pub(crate) fn param_str(&self, key: &str) -> Option<&'a str> {
        self.param(key).and_then(JsonValue::as_str)
    }
}

/// One action implementation.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError>;
}

type HandlerTable = HashMap<ActionType, Arc<dyn ActionHandler>>;

/// Routes action tags to handlers.
#[derive(Clone)]
pub struct ActionDispatcher {
    handlers: Arc<HandlerTable>,
}

impl ActionDispatcher {
    #[must_use]
    pub fn builder() -> ActionDispatcherBuilder {
        ActionDispatcherBuilder::default()
    }

    /// Whether a handler is registered for `tag`.
    #[must_use]
    pub fn supports(&self, tag: &str) -> bool {
        ActionType::from_tag(tag).is_some_and(|t| self.handlers.contains_key(&t))
    }

    /// Runs the handler for `action_type`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownActionType` for unregistered tags, otherwise whatever
    /// the handler returns.
    #[instrument(skip(self, params, integration, context))]
    pub async fn execute_action(
        &self,
        action_type: &str,
        params: &JsonValue,
        integration: Option<&Integration>,
        context: &JsonValue,
    ) -> Result<JsonValue, ActionError> {
        let handler = ActionType::from_tag(action_type)
            .and_then(|t| self.handlers.get(&t))
            .ok_or_else(|| ActionError::UnknownActionType {
                action_type: action_type.to_string(),
            })?;
        debug!("Dispatching action");
        handler
            .execute(ActionInput {
                params,
                integration,
                context,
            })
            .await
    }
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered: Vec<&str> = self.handlers.keys().map(ActionType::as_str).collect();
        registered.sort_unstable();
        f.debug_struct("ActionDispatcher")
            .field("handlers", &registered)
            .finish()
    }
}

/// Shared services the built-in handlers need.
#[derive(Clone)]
pub struct BuiltinServices {
    pub integrations: Arc<IntegrationClient>,
    pub data_store: Arc<dyn DataStore>,
    pub mailer: Arc<dyn Mailer>,
    pub transport: HttpTransport,
    pub schemas: SchemaRegistry,
    pub queries: NamedQueries,
    pub settings: EngineSettings,
}

impl BuiltinServices {
    #[must_use]
    pub fn new(
        integrations: Arc<IntegrationClient>,
        data_store: Arc<dyn DataStore>,
        mailer: Arc<dyn Mailer>,
        transport: HttpTransport,
    ) -> Self {
        Self {
            integrations,
            data_store,
            mailer,
            transport,
            schemas: SchemaRegistry::default(),
            queries: NamedQueries::default(),
            settings: EngineSettings::default(),
        }
    }

    #[must_use]
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    #[must_use]
    pub fn with_queries(mut self, queries: NamedQueries) -> Self {
        self.queries = queries;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Builds the handler table.
#[derive(Default)]
pub struct ActionDispatcherBuilder {
    handlers: HandlerTable,
    max_loop_items: Option<usize>,
}

impl ActionDispatcherBuilder {
    /// Registers (or replaces) a handler.
    #[must_use]
    pub fn register(mut self, action_type: ActionType, handler: impl ActionHandler + 'static) -> Self {
        self.handlers.insert(action_type, Arc::new(handler));
        self
    }

    /// Registers every built-in handler except `loop`, which `build` adds.
    #[must_use]
    pub fn with_builtin_handlers(self, services: BuiltinServices) -> Self {
        let BuiltinServices {
            integrations,
            data_store,
            mailer,
            transport,
            schemas,
            queries,
            settings,
        } = services;
        let mut builder = self
            .register(ActionType::ValidateData, ValidateDataHandler::new(schemas))
            .register(
                ActionType::DatabaseSave,
                DatabaseSaveHandler::new(data_store.clone()),
            )
            .register(
                ActionType::DatabaseQuery,
                DatabaseQueryHandler::new(data_store, queries),
            )
            .register(
                ActionType::IntegrationCall,
                IntegrationCallHandler::new(integrations.clone()),
            )
            .register(ActionType::SendEmail, SendEmailHandler::new(integrations, mailer))
            .register(
                ActionType::SendWebhook,
                SendWebhookHandler::new(transport, settings.webhook_timeout()),
            )
            .register(ActionType::TransformData, TransformDataHandler)
            .register(ActionType::Conditional, ConditionalHandler)
            .register(ActionType::Wait, WaitHandler::new(settings.max_wait()))
            .register(
                ActionType::CustomCode,
                CustomCodeHandler::new(settings.custom_code.clone()),
            );
        builder.max_loop_items = Some(settings.max_loop_items);
        builder
    }

    /// Caps the items a `loop` step processes.
    #[must_use]
    pub fn max_loop_items(mut self, max: usize) -> Self {
        self.max_loop_items = Some(max);
        self
    }

    /// Finishes the table. Unless a `loop` handler was registered explicitly,
    /// one is added over every other registered handler, so loops cannot nest.
    #[must_use]
    pub fn build(mut self) -> ActionDispatcher {
        if !self.handlers.contains_key(&ActionType::Loop) {
            let leaves = Arc::new(self.handlers.clone());
            let max_items = self
                .max_loop_items
                .unwrap_or_else(|| EngineSettings::default().max_loop_items);
            self.handlers.insert(
                ActionType::Loop,
                Arc::new(LoopHandler::new(leaves, max_items)),
            );
        }
        ActionDispatcher {
            handlers: Arc::new(self.handlers),
        }
    }
}
