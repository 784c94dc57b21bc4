//! Application tables behind the `database_save` and `database_query` actions.
//!
//! Values are always bound. Table and column names are quoted only after
//! passing `is_valid_identifier`. Rows come back as JSON via `to_jsonb`.

use async_trait::async_trait;
use autoflow_workflow::action::{DataStore, QueryOutput, SqlQuery, is_valid_identifier};
use autoflow_workflow::StorageError;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgArguments;
use sqlx::types::Json;
use sqlx::{Arguments, PgPool};

/// Rows returned by one `select`.
const MAX_SELECT_ROWS: i64 = 1000;

fn query_failed(err: impl std::fmt::Display) -> StorageError {
    StorageError::QueryFailed {
        reason: err.to_string(),
    }
}

fn quoted(name: &str) -> Result<String, StorageError> {
    if is_valid_identifier(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(StorageError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

/// Binds JSON parameters with their closest PostgreSQL types.
fn arguments(params: &[JsonValue]) -> Result<PgArguments, StorageError> {
    let mut args = PgArguments::default();
    for param in params {
        let added = match param {
            JsonValue::Null => args.add(None::<String>),
            JsonValue::Bool(b) => args.add(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => args.add(i),
                None => args.add(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => args.add(s.clone()),
            other => args.add(Json(other.clone())),
        };
        added.map_err(query_failed)?;
    }
    Ok(args)
}

/// The statement without surrounding whitespace or trailing semicolons.
fn statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Whether a statement returns rows: a query, or a write with `RETURNING`.
fn returns_rows(sql: &str) -> bool {
    let mut words = sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty());
    let Some(keyword) = words.next() else {
        return false;
    };
    matches!(
        keyword.to_ascii_lowercase().as_str(),
        "select" | "with" | "values" | "table"
    ) || words.any(|word| word.eq_ignore_ascii_case("returning"))
}

/// Wraps a row-returning statement so each row comes back as one JSON object.
/// A CTE accepts both queries and `RETURNING` writes.
fn rows_sql(sql: &str) -> String {
    format!("WITH q AS ({sql}) SELECT to_jsonb(q.*) FROM q")
}

fn insert_sql(table: &str, columns: &[&String]) -> Result<String, StorageError> {
    let table = quoted(table)?;
    if columns.is_empty() {
        return Ok(format!("INSERT INTO {table} DEFAULT VALUES RETURNING to_jsonb({table}.*)"));
    }
    let columns = columns
        .iter()
        .map(|column| quoted(column))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    Ok(format!(
        "INSERT INTO {table} ({columns}) \
         SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
         RETURNING to_jsonb({table}.*)"
    ))
}

fn select_sql(table: &str) -> Result<String, StorageError> {
    let table = quoted(table)?;
    Ok(format!(
        "SELECT to_jsonb(t.*) FROM {table} t WHERE to_jsonb(t.*) @> $1 LIMIT {MAX_SELECT_ROWS}"
    ))
}

#[derive(Clone)]
pub struct PgDataStore {
    pool: PgPool,
}

impl PgDataStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataStore for PgDataStore {
    async fn insert(&self, table: &str, row: &Map<String, JsonValue>) -> Result<JsonValue, StorageError> {
        let columns: Vec<&String> = row.keys().collect();
        let sql = insert_sql(table, &columns)?;
        let query = sqlx::query_scalar(&sql);
        let query = if columns.is_empty() {
            query
        } else {
            query.bind(Json(row))
        };
        query
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed)
    }

    async fn select(
        &self,
        table: &str,
        filter: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>, StorageError> {
        for column in filter.keys() {
            quoted(column)?;
        }
        let sql = select_sql(table)?;
        sqlx::query_scalar(&sql)
            .bind(Json(filter))
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)
    }

    async fn execute(&self, query: &SqlQuery) -> Result<QueryOutput, StorageError> {
        let args = arguments(&query.params)?;
        let sql = statement(&query.sql);
        if returns_rows(sql) {
            let rows = sqlx::query_scalar_with(&rows_sql(sql), args)
                .fetch_all(&self.pool)
                .await
                .map_err(query_failed)?;
            Ok(QueryOutput::Rows(rows))
        } else {
            let result = sqlx::query_with(sql, args)
                .execute(&self.pool)
                .await
                .map_err(query_failed)?;
            Ok(QueryOutput::Affected(result.rows_affected()))
        }
    }
}
