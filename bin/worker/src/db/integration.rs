//! Integrations and sealed credentials in PostgreSQL.

use super::{parse_enum, parse_id, to_i64, to_u64};
use async_trait::async_trait;
use autoflow_core::{CredentialId, IntegrationId};
use autoflow_integration::{
    CallStats, CredentialStore, CredentialType, Integration, IntegrationStatus, IntegrationStore,
    IntegrationType, StoreError, StoredCredential,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

fn storage(err: sqlx::Error) -> StoreError {
    StoreError::StorageFailed {
        reason: err.to_string(),
    }
}

fn integration_not_found(id: IntegrationId) -> StoreError {
    StoreError::NotFound {
        entity: "integration",
        id: id.to_string(),
    }
}

/// Row type for integration queries.
#[derive(FromRow)]
struct IntegrationRow {
    id: String,
    organization_id: String,
    name: String,
    integration_type: String,
    config: Json<Map<String, JsonValue>>,
    status: String,
    rate_limit: Option<i32>,
    total_calls: i64,
    success_calls: i64,
    failed_calls: i64,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IntegrationRow {
    fn try_into_record(self) -> Result<Integration, sqlx::Error> {
        Ok(Integration {
            id: parse_id(&self.id, "integration")?,
            organization_id: parse_id(&self.organization_id, "organization")?,
            name: self.name,
            integration_type: parse_enum(
                &self.integration_type,
                "integration type",
                IntegrationType::from_str_value,
            )?,
            config: self.config.0,
            status: parse_enum(&self.status, "integration status", IntegrationStatus::from_str_value)?,
            rate_limit: self.rate_limit.and_then(|limit| u32::try_from(limit).ok()),
            stats: CallStats {
                total_calls: to_u64(self.total_calls),
                success_calls: to_u64(self.success_calls),
                failed_calls: to_u64(self.failed_calls),
                last_used_at: self.last_used_at,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Integrations and their call statistics.
#[derive(Clone)]
pub struct PgIntegrationStore {
    pool: PgPool,
}

impl PgIntegrationStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IntegrationStore for PgIntegrationStore {
    async fn fetch(&self, id: IntegrationId) -> Result<Integration, StoreError> {
        let row: Option<IntegrationRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, name, integration_type, config, status, rate_limit,
                   total_calls, success_calls, failed_calls, last_used_at, created_at, updated_at
            FROM integrations
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.ok_or_else(|| integration_not_found(id))?
            .try_into_record()
            .map_err(storage)
    }

    async fn save(&self, integration: &Integration) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            r#"
            INSERT INTO integrations (id, organization_id, name, integration_type, config, status,
                                      rate_limit, total_calls, success_calls, failed_calls,
                                      last_used_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                integration_type = EXCLUDED.integration_type,
                config = EXCLUDED.config,
                status = EXCLUDED.status,
                rate_limit = EXCLUDED.rate_limit,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0)
            "#,
        )
        .bind(integration.id.to_string())
        .bind(integration.organization_id.to_string())
        .bind(&integration.name)
        .bind(integration.integration_type.as_str())
        .bind(Json(&integration.config))
        .bind(integration.status.as_str())
        .bind(integration.rate_limit.map(|limit| i32::try_from(limit).unwrap_or(i32::MAX)))
        .bind(to_i64(integration.stats.total_calls))
        .bind(to_i64(integration.stats.success_calls))
        .bind(to_i64(integration.stats.failed_calls))
        .bind(integration.stats.last_used_at)
        .bind(integration.created_at)
        .bind(integration.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }

    async fn record_call(
        &self,
        id: IntegrationId,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> Result<CallStats, StoreError> {
        let row: Option<(i64, i64, i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            UPDATE integrations SET
                total_calls = total_calls + 1,
                success_calls = success_calls + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_calls = failed_calls + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_used_at = CASE WHEN $2 THEN $3 ELSE last_used_at END
            WHERE id = $1
            RETURNING total_calls, success_calls, failed_calls, last_used_at
            "#,
        )
        .bind(id.to_string())
        .bind(succeeded)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        let (total_calls, success_calls, failed_calls, last_used_at) =
            row.ok_or_else(|| integration_not_found(id))?;
        Ok(CallStats {
            total_calls: to_u64(total_calls),
            success_calls: to_u64(success_calls),
            failed_calls: to_u64(failed_calls),
            last_used_at,
        })
    }
}

/// Row type for credential queries.
#[derive(FromRow)]
struct CredentialRow {
    id: String,
    integration_id: String,
    credential_type: String,
    ciphertext: String,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl CredentialRow {
    fn try_into_record(self) -> Result<StoredCredential, sqlx::Error> {
        Ok(StoredCredential {
            id: parse_id(&self.id, "credential")?,
            integration_id: parse_id(&self.integration_id, "integration")?,
            credential_type: parse_enum(
                &self.credential_type,
                "credential type",
                CredentialType::from_str_value,
            )?,
            ciphertext: self.ciphertext,
            is_active: self.is_active,
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

/// Sealed credentials. Plaintext never reaches this store.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn insert(&self, credential: &StoredCredential) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO integration_credentials (id, integration_id, credential_type, ciphertext,
                                                 is_active, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(credential.id.to_string())
        .bind(credential.integration_id.to_string())
        .bind(credential.credential_type.as_str())
        .bind(&credential.ciphertext)
        .bind(credential.is_active)
        .bind(credential.expires_at)
        .bind(credential.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn list_for_integration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Vec<StoredCredential>, StoreError> {
        let rows: Vec<CredentialRow> = sqlx::query_as(
            r#"
            SELECT id, integration_id, credential_type, ciphertext, is_active, expires_at, created_at
            FROM integration_credentials
            WHERE integration_id = $1
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(integration_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter()
            .map(CredentialRow::try_into_record)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }

    async fn set_active(&self, id: CredentialId, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE integration_credentials SET is_active = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "credential",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
