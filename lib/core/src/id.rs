//! Typed identifiers for engine entities.
//!
//! Every identifier wraps a ULID and displays with a short prefix
//! (`wf_01H...`, `exec_01H...`). Parsing accepts the prefixed or bare form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Failure to parse an identifier from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// Name of the identifier type being parsed.
    pub id_type: &'static str,
    /// Underlying ULID parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Declares a ULID-backed identifier with a display prefix.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Wraps an existing ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Display prefix, without the trailing underscore.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ulid::from_str(raw)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifies an organization that owns workflows and integrations.
    OrganizationId,
    "org"
);

define_id!(
    /// Identifies the user who triggered an execution.
    UserId,
    "usr"
);

define_id!(
    /// Identifies a workflow definition.
    WorkflowId,
    "wf"
);

define_id!(
    /// Identifies one execution of a workflow.
    ExecutionId,
    "exec"
);

define_id!(
    /// Identifies a single execution log entry.
    ExecutionLogId,
    "log"
);

define_id!(
    /// Identifies a trigger attached to a workflow.
    TriggerId,
    "trg"
);

define_id!(
    /// Identifies a configured integration.
    IntegrationId,
    "int"
);

define_id!(
    /// Identifies a stored credential.
    CredentialId,
    "cred"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_display_format() {
        let id = ExecutionId::new();
        assert!(id.to_string().starts_with("exec_"));
    }

    #[test]
    fn integration_id_display_format() {
        let id = IntegrationId::new();
        assert!(id.to_string().starts_with("int_"));
    }

    #[test]
    fn prefix_matches_display() {
        let id = CredentialId::new();
        let display = id.to_string();
        assert!(display.starts_with(CredentialId::prefix()));
    }

    #[test]
    fn parse_with_prefix() {
        let id = WorkflowId::new();
        let display = id.to_string();
        let parsed: WorkflowId = display.parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_without_prefix() {
        let ulid = Ulid::new();
        let id: WorkflowId = ulid.to_string().parse().expect("should parse");
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn parse_invalid_ulid() {
        let result: Result<WorkflowId, _> = "not_a_ulid".parse();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.id_type, "WorkflowId");
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let id = WorkflowId::new();
        let result: Result<ExecutionId, _> = id.to_string().parse();
        assert!(result.is_err());
    }

    #[test]
    fn ulid_conversion_roundtrip() {
        let ulid = Ulid::new();
        let id = OrganizationId::from(ulid);
        assert_eq!(Ulid::from(id), ulid);
    }

    #[test]
    fn id_hash() {
        use std::collections::HashSet;

        let id1 = TriggerId::new();
        let id2 = TriggerId::new();

        let mut set = HashSet::new();
        set.insert(id1);
        set.insert(id2);
        set.insert(id1); // duplicate

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn id_serde_roundtrip() {
        let id = ExecutionId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        let parsed: ExecutionId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }
}
