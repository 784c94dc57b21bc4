//! Credential vault for integration secrets.
//!
//! Payloads are JSON objects sealed with AES-256-GCM before they reach a
//! `CredentialStore`. The key comes from configuration; there is no
//! fallback key. Reads never fail: an expired, inactive, missing, or
//! undecryptable credential comes back as an empty `CredentialSet`.

use crate::error::{CredentialError, StoreError};
use aes_gcm::aead::{Aead, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use async_trait::async_trait;
use autoflow_core::{CredentialId, IntegrationId};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// The type of credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// OAuth 2.0 tokens.
    Oauth2,
    /// API key.
    ApiKey,
    /// Username and password.
    BasicAuth,
    /// Bearer token.
    BearerToken,
    /// Provider-specific fields.
    Custom,
}

impl CredentialType {
    /// Storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oauth2 => "oauth2",
            Self::ApiKey => "api_key",
            Self::BasicAuth => "basic_auth",
            Self::BearerToken => "bearer_token",
            Self::Custom => "custom",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "oauth2" => Some(Self::Oauth2),
            "api_key" => Some(Self::ApiKey),
            "basic_auth" => Some(Self::BasicAuth),
            "bearer_token" => Some(Self::BearerToken),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// A credential as persisted: metadata plus the sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub id: CredentialId,
    pub integration_id: IntegrationId,
    pub credential_type: CredentialType,
    /// Base64 of nonce followed by ciphertext.
    pub ciphertext: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredCredential {
    /// Active and not past its expiry at `now`.
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|expires| expires > now)
    }
}

/// A decrypted credential payload.
///
/// `Debug` prints field names only.
#[derive(Clone, Default, PartialEq)]
pub struct CredentialSet(Map<String, JsonValue>);

impl CredentialSet {
    /// The empty set, used whenever no usable credential exists.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }

    /// The header that authenticates a request with these credentials.
    ///
    /// Bearer-style tokens win over API keys, which win over basic auth.
    /// An API key goes in `header_name` when the payload names one and in
    /// `Authorization: Bearer` otherwise.
    #[must_use]
    pub fn auth_header(&self) -> Option<(String, String)> {
        if let Some(token) = self.get_str("access_token").or_else(|| self.get_str("token")) {
            return Some(("Authorization".to_string(), format!("Bearer {token}")));
        }
        if let Some(key) = self.get_str("api_key") {
            return Some(match self.get_str("header_name") {
                Some(header) => (header.to_string(), key.to_string()),
                None => ("Authorization".to_string(), format!("Bearer {key}")),
            });
        }
        if let (Some(user), Some(password)) = (self.get_str("username"), self.get_str("password"))
        {
            let encoded = BASE64.encode(format!("{user}:{password}"));
            return Some(("Authorization".to_string(), format!("Basic {encoded}")));
        }
        None
    }
}

impl From<Map<String, JsonValue>> for CredentialSet {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// AES-256-GCM sealing for credential payloads.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Builds a cipher from raw key bytes, which must be exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::InvalidKey` for any other length.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CredentialError> {
        if key.len() != KEY_LEN {
            return Err(CredentialError::InvalidKey {
                reason: format!("expected {KEY_LEN} bytes, got {}", key.len()),
            });
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Builds a cipher from a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::InvalidKey` if the key is empty, not
    /// base64, or the wrong length.
    pub fn from_base64_key(encoded: &str) -> Result<Self, CredentialError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(CredentialError::InvalidKey {
                reason: "key is empty".to_string(),
            });
        }
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CredentialError::InvalidKey {
                reason: e.to_string(),
            })?;
        Self::from_key_bytes(&bytes)
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::EncryptionFailed` if the AEAD rejects the input.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CredentialError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext =
            self.cipher
                .encrypt(nonce, plaintext)
                .map_err(|e| CredentialError::EncryptionFailed {
                    reason: e.to_string(),
                })?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Decrypts a value produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::DecryptionFailed` for malformed input,
    /// a wrong key, or tampered ciphertext.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CredentialError> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| CredentialError::DecryptionFailed {
                reason: format!("base64 decode failed: {e}"),
            })?;
        if bytes.len() < NONCE_LEN {
            return Err(CredentialError::DecryptionFailed {
                reason: "sealed value shorter than nonce".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CredentialError::DecryptionFailed {
                reason: e.to_string(),
            })
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

/// Persistence for sealed credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Persists a new credential.
    async fn insert(&self, credential: &StoredCredential) -> Result<(), StoreError>;

    /// All credentials of an integration, newest first.
    async fn list_for_integration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Vec<StoredCredential>, StoreError>;

    /// Flips the active flag.
    async fn set_active(&self, id: CredentialId, active: bool) -> Result<(), StoreError>;
}

/// Process-local credential store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    credentials: Arc<RwLock<HashMap<CredentialId, StoredCredential>>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert(&self, credential: &StoredCredential) -> Result<(), StoreError> {
        self.credentials
            .write()
            .await
            .insert(credential.id, credential.clone());
        Ok(())
    }

    async fn list_for_integration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Vec<StoredCredential>, StoreError> {
        let mut found: Vec<StoredCredential> = self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.integration_id == integration_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_ulid().cmp(&a.id.as_ulid()))
        });
        Ok(found)
    }

    async fn set_active(&self, id: CredentialId, active: bool) -> Result<(), StoreError> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "credential",
            id: id.to_string(),
        })?;
        credential.is_active = active;
        Ok(())
    }
}

/// Seals credentials on write and opens them on read.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: CredentialCipher,
    store: Arc<dyn CredentialStore>,
}

impl CredentialVault {
    #[must_use]
    pub fn new(cipher: CredentialCipher, store: Arc<dyn CredentialStore>) -> Self {
        Self { cipher, store }
    }

    /// Encrypts and stores a credential payload for an integration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, encryption, or storage fails.
    pub async fn put(
        &self,
        integration_id: IntegrationId,
        credential_type: CredentialType,
        payload: &Map<String, JsonValue>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CredentialId, CredentialError> {
        let plaintext =
            serde_json::to_vec(payload).map_err(|e| CredentialError::InvalidFormat {
                reason: e.to_string(),
            })?;
        let credential = StoredCredential {
            id: CredentialId::new(),
            integration_id,
            credential_type,
            ciphertext: self.cipher.seal(&plaintext)?,
            is_active: true,
            expires_at,
            created_at: Utc::now(),
        };
        self.store
            .insert(&credential)
            .await
            .map_err(|e| CredentialError::StorageFailed {
                reason: e.to_string(),
            })?;
        debug!(
            integration_id = %integration_id,
            credential_id = %credential.id,
            credential_type = credential_type.as_str(),
            "Stored credential"
        );
        Ok(credential.id)
    }

    /// The current usable credential for an integration, or an empty set.
    pub async fn get(&self, integration_id: IntegrationId) -> CredentialSet {
        self.get_at(integration_id, Utc::now()).await
    }

    /// Like [`get`](Self::get), evaluating expiry against `now`.
    pub async fn get_at(&self, integration_id: IntegrationId, now: DateTime<Utc>) -> CredentialSet {
        let candidates = match self.store.list_for_integration(integration_id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(integration_id = %integration_id, error = %e, "Credential lookup failed");
                return CredentialSet::empty();
            }
        };

        let Some(credential) = candidates.into_iter().find(|c| c.is_usable_at(now)) else {
            debug!(integration_id = %integration_id, "No usable credential");
            return CredentialSet::empty();
        };

        match self.open(&credential) {
            Ok(set) => set,
            Err(e) => {
                error!(
                    integration_id = %integration_id,
                    credential_id = %credential.id,
                    error = %e,
                    "Failed to open credential"
                );
                CredentialSet::empty()
            }
        }
    }

    /// Marks a credential inactive so reads skip it.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential does not exist or storage fails.
    pub async fn deactivate(&self, id: CredentialId) -> Result<(), CredentialError> {
        self.store.set_active(id, false).await.map_err(|e| match e {
            StoreError::NotFound { .. } => CredentialError::NotFound { id },
            StoreError::StorageFailed { reason } => CredentialError::StorageFailed { reason },
        })
    }

    fn open(&self, credential: &StoredCredential) -> Result<CredentialSet, CredentialError> {
        let plaintext = self.cipher.open(&credential.ciphertext)?;
        match serde_json::from_slice::<JsonValue>(&plaintext) {
            Ok(JsonValue::Object(map)) => Ok(CredentialSet(map)),
            Ok(_) => Err(CredentialError::InvalidFormat {
                reason: "payload is not an object".to_string(),
            }),
            Err(e) => Err(CredentialError::InvalidFormat {
                reason: e.to_string(),
            }),
        }
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn test_key() -> String {
        BASE64.encode([7u8; KEY_LEN])
    }

    fn vault() -> (CredentialVault, Arc<InMemoryCredentialStore>) {
        let store = Arc::new(InMemoryCredentialStore::new());
        let cipher = CredentialCipher::from_base64_key(&test_key()).expect("valid key");
        (CredentialVault::new(cipher, store.clone()), store)
    }

    fn payload(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn missing_key_fails_fast() {
        assert!(matches!(
            CredentialCipher::from_base64_key("  "),
            Err(CredentialError::InvalidKey { .. })
        ));
        assert!(matches!(
            CredentialCipher::from_base64_key(&BASE64.encode([1u8; 16])),
            Err(CredentialError::InvalidKey { .. })
        ));
    }

    #[test]
    fn seal_uses_fresh_nonces() {
        let cipher = CredentialCipher::from_base64_key(&test_key()).expect("valid key");
        let a = cipher.seal(b"secret").expect("seal");
        let b = cipher.seal(b"secret").expect("seal");
        assert_ne!(a, b);
        assert_eq!(cipher.open(&a).expect("open"), b"secret");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = CredentialCipher::from_base64_key(&test_key()).expect("valid key");
        let sealed = cipher.seal(b"secret").expect("seal");
        let mut bytes = BASE64.decode(&sealed).expect("base64");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = cipher.open(&BASE64.encode(bytes)).expect_err("tampered");
        assert!(matches!(err, CredentialError::DecryptionFailed { .. }));
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let (vault, _) = vault();
        let integration_id = IntegrationId::new();
        vault
            .put(
                integration_id,
                CredentialType::Custom,
                &payload(json!({"k": "v"})),
                None,
            )
            .await
            .expect("put");

        let set = vault.get(integration_id).await;
        assert_eq!(set.into_value(), json!({"k": "v"}));
    }

    #[tokio::test]
    async fn expired_credential_reads_empty() {
        let (vault, _) = vault();
        let integration_id = IntegrationId::new();
        let expires = Utc::now() + Duration::minutes(10);
        vault
            .put(
                integration_id,
                CredentialType::ApiKey,
                &payload(json!({"api_key": "abc"})),
                Some(expires),
            )
            .await
            .expect("put");

        assert!(!vault.get_at(integration_id, Utc::now()).await.is_empty());
        let later = expires + Duration::seconds(1);
        assert!(vault.get_at(integration_id, later).await.is_empty());
    }

    #[tokio::test]
    async fn inactive_credential_reads_empty() {
        let (vault, _) = vault();
        let integration_id = IntegrationId::new();
        let id = vault
            .put(
                integration_id,
                CredentialType::BearerToken,
                &payload(json!({"token": "t"})),
                None,
            )
            .await
            .expect("put");
        vault.deactivate(id).await.expect("deactivate");

        assert!(vault.get(integration_id).await.is_empty());
    }

    #[tokio::test]
    async fn wrong_key_reads_empty() {
        let (vault, store) = vault();
        let integration_id = IntegrationId::new();
        vault
            .put(
                integration_id,
                CredentialType::Custom,
                &payload(json!({"k": "v"})),
                None,
            )
            .await
            .expect("put");

        let other = CredentialCipher::from_key_bytes(&[9u8; KEY_LEN]).expect("valid key");
        let other_vault = CredentialVault::new(other, store);
        assert!(other_vault.get(integration_id).await.is_empty());
    }

    #[tokio::test]
    async fn newest_usable_credential_wins() {
        let (vault, _) = vault();
        let integration_id = IntegrationId::new();
        vault
            .put(
                integration_id,
                CredentialType::ApiKey,
                &payload(json!({"api_key": "old"})),
                None,
            )
            .await
            .expect("put old");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        vault
            .put(
                integration_id,
                CredentialType::ApiKey,
                &payload(json!({"api_key": "new"})),
                None,
            )
            .await
            .expect("put new");

        assert_eq!(vault.get(integration_id).await.get_str("api_key"), Some("new"));
    }

    #[test]
    fn auth_header_preference() {
        let bearer = CredentialSet::from(payload(json!({"token": "t", "api_key": "k"})));
        assert_eq!(
            bearer.auth_header(),
            Some(("Authorization".to_string(), "Bearer t".to_string()))
        );

        let keyed = CredentialSet::from(payload(json!({"api_key": "k", "header_name": "X-Api-Key"})));
        assert_eq!(
            keyed.auth_header(),
            Some(("X-Api-Key".to_string(), "k".to_string()))
        );

        let basic = CredentialSet::from(payload(json!({"username": "u", "password": "p"})));
        assert_eq!(
            basic.auth_header(),
            Some(("Authorization".to_string(), "Basic dTpw".to_string()))
        );

        assert_eq!(CredentialSet::empty().auth_header(), None);
    }

    #[test]
    fn debug_hides_values() {
        let set = CredentialSet::from(payload(json!({"password": "hunter2"})));
        let rendered = format!("{set:?}");
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("hunter2"));
    }
}
