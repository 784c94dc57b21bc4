//! Versioned envelope for data that leaves the process.
//!
//! Lifecycle events and queued run requests are wrapped so consumers can
//! check the version before trusting the payload shape.

use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned envelope around a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps `payload` at the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl<T: Serialize> Envelope<T> {
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// # Errors
    ///
    /// Returns an error if the bytes are not an envelope of `T`.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// An envelope whose payload is still untyped JSON.
///
/// Consumers read the version first and only then commit to a payload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub version: u32,
    pub payload: serde_json::Value,
}

impl RawEnvelope {
    /// # Errors
    ///
    /// Returns an error if the payload cannot be deserialized into `T`.
    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(
        self,
    ) -> Result<Envelope<T>, serde_json::Error> {
        let payload: T = serde_json::from_value(self.payload)?;
        Ok(Envelope {
            version: self.version,
            payload,
        })
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// # Errors
    ///
    /// Returns an error if the bytes are not an envelope.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::RunRequest;
    use autoflow_core::WorkflowId;
    use serde_json::json;

    #[test]
    fn run_request_survives_the_wire() {
        let request = RunRequest::new(WorkflowId::new(), json!({"order_id": 17}));
        let bytes = Envelope::new(request.clone()).to_json_bytes().expect("serialize");

        let raw = RawEnvelope::from_json_bytes(&bytes).expect("raw");
        assert_eq!(raw.version(), CURRENT_VERSION);

        let typed: Envelope<RunRequest> = raw.deserialize_payload().expect("payload");
        assert!(typed.is_current_version());
        assert_eq!(typed.into_payload(), request);
    }

    #[test]
    fn version_sits_beside_payload() {
        let value = serde_json::to_value(Envelope::new(json!({"a": 1}))).expect("to_value");
        assert_eq!(value["version"], json!(CURRENT_VERSION));
        assert_eq!(value["payload"]["a"], json!(1));
    }

    #[test]
    fn future_versions_are_detectable_before_parsing_payload() {
        let bytes = br#"{"version": 7, "payload": {"unexpected": true}}"#;
        let raw = RawEnvelope::from_json_bytes(bytes).expect("raw");
        assert_ne!(raw.version(), CURRENT_VERSION);
        assert!(raw.deserialize_payload::<RunRequest>().is_err());
    }
}
