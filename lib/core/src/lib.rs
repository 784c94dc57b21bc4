//! Shared identifiers and error plumbing for the autoflow workflow engine.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    CredentialId, ExecutionId, ExecutionLogId, IntegrationId, OrganizationId, ParseIdError,
    TriggerId, UserId, WorkflowId,
};
