//! Error types for the integration crate.
//!
//! - `ConnectorError`: a provider adapter or the HTTP transport failed
//! - `CredentialError`: sealing, opening, or storing a credential failed
//! - `StoreError`: an integration, credential, or rate-limit store failed
//! - `IntegrationError`: what an `IntegrationClient::execute` caller sees

use autoflow_core::{CredentialId, IntegrationId};
use serde_json::Value as JsonValue;
use std::fmt;

/// Errors from provider adapters and the HTTP transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorError {
    /// The request never produced a response.
    ConnectionFailed { reason: String },
    /// No response within the allotted time.
    Timeout { timeout_secs: u64 },
    /// The provider answered with a non-2xx status.
    HttpStatus { status: u16, body: JsonValue },
    /// The adapter does not implement the requested operation.
    OperationNotSupported { operation: String },
    /// Params or integration config are missing something the adapter needs.
    InvalidParameters { operation: String, reason: String },
    /// The request could not be built or the response could not be read.
    ProtocolError { reason: String },
}

impl ConnectorError {
    /// HTTP status carried by the failure, if the provider answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body carried by the failure, if the provider answered.
    #[must_use]
    pub fn response(&self) -> Option<&JsonValue> {
        match self {
            Self::HttpStatus { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => write!(f, "connection failed: {reason}"),
            Self::Timeout { timeout_secs } => {
                write!(f, "request timed out after {timeout_secs}s")
            }
            Self::HttpStatus { status, .. } => {
                write!(f, "provider responded with status {status}")
            }
            Self::OperationNotSupported { operation } => {
                write!(f, "operation not supported: {operation}")
            }
            Self::InvalidParameters { operation, reason } => {
                write!(f, "invalid parameters for '{operation}': {reason}")
            }
            Self::ProtocolError { reason } => write!(f, "protocol error: {reason}"),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Errors from credential operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The configured encryption key is missing or malformed.
    InvalidKey { reason: String },
    /// Credential not found.
    NotFound { id: CredentialId },
    /// Encryption failed.
    EncryptionFailed { reason: String },
    /// Decryption failed.
    DecryptionFailed { reason: String },
    /// The decrypted payload is not a JSON object.
    InvalidFormat { reason: String },
    /// Storage operation failed.
    StorageFailed { reason: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey { reason } => write!(f, "invalid credential key: {reason}"),
            Self::NotFound { id } => write!(f, "credential not found: {id}"),
            Self::EncryptionFailed { reason } => write!(f, "encryption failed: {reason}"),
            Self::DecryptionFailed { reason } => write!(f, "decryption failed: {reason}"),
            Self::InvalidFormat { reason } => {
                write!(f, "invalid credential format: {reason}")
            }
            Self::StorageFailed { reason } => {
                write!(f, "credential storage failed: {reason}")
            }
        }
    }
}

impl std::error::Error for CredentialError {}

/// Errors from the integration, credential, and rate-limit stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record with the given id.
    NotFound { entity: &'static str, id: String },
    /// The backing store rejected or failed the operation.
    StorageFailed { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::StorageFailed { reason } => write!(f, "storage failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<CredentialError> for StoreError {
    fn from(err: CredentialError) -> Self {
        Self::StorageFailed {
            reason: err.to_string(),
        }
    }
}

/// Errors surfaced by `IntegrationClient::execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrationError {
    /// The trailing-hour call cap is used up; the provider was not called.
    RateLimitExceeded {
        integration_id: IntegrationId,
        limit: u32,
        retry_after_secs: u64,
    },
    /// The provider call failed at the transport or with a non-2xx status.
    CallFailed {
        integration_id: IntegrationId,
        status: Option<u16>,
        response: Option<JsonValue>,
        reason: String,
    },
    /// The integration is not active.
    Inactive { integration_id: IntegrationId },
    /// No adapter is registered for the integration's type.
    UnsupportedType {
        integration_id: IntegrationId,
        integration_type: String,
    },
}

impl IntegrationError {
    /// Builds a `CallFailed` from an adapter failure.
    #[must_use]
    pub fn call_failed(integration_id: IntegrationId, err: &ConnectorError) -> Self {
        Self::CallFailed {
            integration_id,
            status: err.status(),
            response: err.response().cloned(),
            reason: err.to_string(),
        }
    }

    /// Whether this is a rate-limit rejection.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitExceeded {
                integration_id,
                limit,
                retry_after_secs,
            } => write!(
                f,
                "rate limit of {limit} calls/hour exceeded for integration {integration_id}, retry after {retry_after_secs}s"
            ),
            Self::CallFailed {
                integration_id,
                reason,
                ..
            } => write!(f, "integration {integration_id} call failed: {reason}"),
            Self::Inactive { integration_id } => {
                write!(f, "integration {integration_id} is not active")
            }
            Self::UnsupportedType {
                integration_id,
                integration_type,
            } => write!(
                f,
                "no adapter registered for integration type '{integration_type}' ({integration_id})"
            ),
        }
    }
}

impl std::error::Error for IntegrationError {}
