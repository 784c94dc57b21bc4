//! The integration client: rate limit, credentials, adapter, statistics.

use crate::connector::{
    ChatAdapter, EmailAdapter, PaymentAdapter, ProviderAdapter, ProviderCall, RestAdapter,
    WebhookAdapter,
};
use crate::credential::CredentialVault;
use crate::error::IntegrationError;
use crate::http::{HttpResponse, HttpTransport};
use crate::integration::{Integration, IntegrationStore, IntegrationType};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Executes logical calls against configured integrations.
#[derive(Clone)]
pub struct IntegrationClient {
    adapters: HashMap<IntegrationType, Arc<dyn ProviderAdapter>>,
    vault: Arc<CredentialVault>,
    limiter: RateLimiter,
    store: Arc<dyn IntegrationStore>,
}

impl IntegrationClient {
    /// A client with no adapters registered.
    #[must_use]
    pub fn new(
        vault: Arc<CredentialVault>,
        limiter: RateLimiter,
        store: Arc<dyn IntegrationStore>,
    ) -> Self {
        Self {
            adapters: HashMap::new(),
            vault,
            limiter,
            store,
        }
    }

    /// A client with the HTTP adapters for every built-in integration type
    /// except `custom`.
    #[must_use]
    pub fn with_default_adapters(
        vault: Arc<CredentialVault>,
        limiter: RateLimiter,
        store: Arc<dyn IntegrationStore>,
        transport: &HttpTransport,
    ) -> Self {
        Self::new(vault, limiter, store)
            .with_adapter(IntegrationType::Email, EmailAdapter::new(transport.clone()))
            .with_adapter(IntegrationType::Payment, PaymentAdapter::new(transport.clone()))
            .with_adapter(IntegrationType::Webhook, WebhookAdapter::new(transport.clone()))
            .with_adapter(IntegrationType::Chat, ChatAdapter::new(transport.clone()))
            .with_adapter(IntegrationType::GenericApi, RestAdapter::new(transport.clone()))
    }

    /// Registers (or replaces) the adapter for an integration type.
    #[must_use]
    pub fn with_adapter(
        mut self,
        integration_type: IntegrationType,
        adapter: impl ProviderAdapter + 'static,
    ) -> Self {
        self.adapters.insert(integration_type, Arc::new(adapter));
        self
    }

    /// The integration store backing the statistics.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn IntegrationStore> {
        &self.store
    }

    /// Performs one call against `integration`.
    ///
    /// A rate-limit rejection happens before the adapter is invoked and is
    /// not counted in the statistics. Every invoked call is counted as a
    /// success or a failure.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded`, `Inactive`, `UnsupportedType`, or
    /// `CallFailed` (with the provider's status and body when it answered).
    #[instrument(
        skip_all,
        fields(integration_id = %integration.id, integration_type = %integration.integration_type)
    )]
    pub async fn execute(
        &self,
        integration: &Integration,
        params: &JsonValue,
        context: &JsonValue,
    ) -> Result<HttpResponse, IntegrationError> {
        if !integration.is_active() {
            return Err(IntegrationError::Inactive {
                integration_id: integration.id,
            });
        }

        let adapter = self
            .adapters
            .get(&integration.integration_type)
            .ok_or_else(|| IntegrationError::UnsupportedType {
                integration_id: integration.id,
                integration_type: integration.integration_type.to_string(),
            })?;

        let now = Utc::now();
        match self.limiter.check_and_record(integration, now).await {
            Ok(RateLimitResult::Allowed { remaining, .. }) => {
                debug!(remaining, "Rate limit check passed");
            }
            Ok(RateLimitResult::Exceeded { retry_after, .. }) => {
                let retry_after_secs = u64::try_from(retry_after.num_seconds()).unwrap_or(0);
                warn!(retry_after_secs, "Integration rate limit exceeded");
                return Err(IntegrationError::RateLimitExceeded {
                    integration_id: integration.id,
                    limit: integration.rate_limit.unwrap_or_default(),
                    retry_after_secs,
                });
            }
            Err(e) => {
                warn!(error = %e, "Rate limit store unavailable");
                return Err(IntegrationError::CallFailed {
                    integration_id: integration.id,
                    status: None,
                    response: None,
                    reason: format!("rate limit check failed: {e}"),
                });
            }
        }

        let credentials = self.vault.get(integration.id).await;
        if credentials.is_empty() {
            debug!("No credentials available, calling unauthenticated");
        }

        let outcome = adapter
            .call(ProviderCall {
                integration,
                params,
                context,
                credentials: &credentials,
            })
            .await;

        self.record(integration, outcome.is_ok()).await;

        match outcome {
            Ok(response) => {
                info!(status = response.status, adapter = adapter.name(), "Integration call succeeded");
                Ok(response)
            }
            Err(e) => {
                warn!(error = %e, adapter = adapter.name(), "Integration call failed");
                Err(IntegrationError::call_failed(integration.id, &e))
            }
        }
    }

    async fn record(&self, integration: &Integration, succeeded: bool) {
        if let Err(e) = self
            .store
            .record_call(integration.id, succeeded, Utc::now())
            .await
        {
            warn!(error = %e, "Failed to update integration call statistics");
        }
    }
}

impl std::fmt::Debug for IntegrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.adapters.keys().map(IntegrationType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("IntegrationClient")
            .field("adapters", &types)
            .finish_non_exhaustive()
    }
}
