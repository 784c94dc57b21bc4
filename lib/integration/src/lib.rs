//! Integration layer for the autoflow workflow engine.
//!
//! This crate provides:
//!
//! - **Credential vault**: AES-256-GCM sealed secrets per integration
//! - **Rate limiter**: trailing-hour caps over a shared counter store
//! - **Provider adapters**: email, payment, webhook, chat, and generic REST
//! - **Integration client**: one call with limits, credentials, and statistics

pub mod client;
pub mod connector;
pub mod credential;
pub mod error;
pub mod http;
pub mod integration;
pub mod rate_limit;

pub use client::IntegrationClient;
pub use connector::{ProviderAdapter, ProviderCall};
pub use credential::{
    CredentialCipher, CredentialSet, CredentialStore, CredentialType, CredentialVault,
    InMemoryCredentialStore, StoredCredential,
};
pub use error::{ConnectorError, CredentialError, IntegrationError, StoreError};
pub use http::{HttpRequest, HttpResponse, HttpTransport};
pub use integration::{
    CallStats, InMemoryIntegrationStore, Integration, IntegrationStatus, IntegrationStore,
    IntegrationType,
};
pub use rate_limit::{InMemoryRateLimitStore, RateLimitResult, RateLimitStore, RateLimiter};
