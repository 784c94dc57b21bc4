//! `database_save` and `database_query` over a pluggable [`DataStore`].
//!
//! Values always travel as bind parameters. Table and column names cannot be
//! bound, so they must pass [`is_valid_identifier`] first.

use super::{ActionHandler, ActionInput};
use crate::error::{ActionError, StorageError};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex"));

/// Whether `name` is safe to splice into SQL as a table or column name.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    name.len() <= 63 && IDENTIFIER.is_match(name)
}

fn check_identifier(name: &str) -> Result<(), StorageError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

/// A parameterized statement; `$1..$n` refer to `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<JsonValue>,
}

/// Rows for reads, a count for writes.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows(Vec<JsonValue>),
    Affected(u64),
}

/// Application data storage used by the database actions.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Inserts one row and returns the stored record.
    async fn insert(&self, table: &str, row: &Map<String, JsonValue>) -> Result<JsonValue, StorageError>;

    /// Rows whose columns equal every entry of `filter`.
    async fn select(
        &self,
        table: &str,
        filter: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>, StorageError>;

    /// Runs a raw parameterized statement.
    async fn execute(&self, query: &SqlQuery) -> Result<QueryOutput, StorageError>;
}

/// Table-per-vector store for tests and local runs. Raw SQL is unsupported.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataStore {
    tables: Arc<RwLock<HashMap<String, Vec<Map<String, JsonValue>>>>>,
}

impl InMemoryDataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row of `table`.
    pub async fn rows(&self, table: &str) -> Vec<Map<String, JsonValue>> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn insert(&self, table: &str, row: &Map<String, JsonValue>) -> Result<JsonValue, StorageError> {
        check_identifier(table)?;
        for column in row.keys() {
            check_identifier(column)?;
        }
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(JsonValue::Object(row.clone()))
    }

    async fn select(
        &self,
        table: &str,
        filter: &Map<String, JsonValue>,
    ) -> Result<Vec<JsonValue>, StorageError> {
        check_identifier(table)?;
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.iter().all(|(k, v)| row.get(k) == Some(v)))
                    .map(|row| JsonValue::Object(row.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn execute(&self, _query: &SqlQuery) -> Result<QueryOutput, StorageError> {
        Err(StorageError::Unsupported {
            operation: "raw sql".to_string(),
        })
    }
}

/// Pre-registered statements that steps reference by name.
#[derive(Debug, Clone, Default)]
pub struct NamedQueries {
    queries: Arc<HashMap<String, String>>,
}

impl NamedQueries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.queries).insert(name.into(), sql.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.queries.get(name).map(String::as_str)
    }
}

/// Params: `table`, `data` (object). Returns `{saved, table, record}`.
#[derive(Clone)]
pub struct DatabaseSaveHandler {
    store: Arc<dyn DataStore>,
}

impl DatabaseSaveHandler {
    #[must_use]
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActionHandler for DatabaseSaveHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let table = input
            .param_str("table")
            .ok_or_else(|| ActionError::invalid("'table' is required"))?;
        let data = input
            .param("data")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| ActionError::invalid("'data' must be an object"))?;
        check_identifier(table)?;
        for column in data.keys() {
            check_identifier(column)?;
        }
        let record = self.store.insert(table, data).await?;
        Ok(json!({ "saved": true, "table": table, "record": record }))
    }
}

/// Params: `query` (named), or `sql` + `params`, or `table` + `where`.
/// Reads return `{rows, count}`, writes `{affected_rows}`.
#[derive(Clone)]
pub struct DatabaseQueryHandler {
    store: Arc<dyn DataStore>,
    queries: NamedQueries,
}

impl DatabaseQueryHandler {
    #[must_use]
    pub fn new(store: Arc<dyn DataStore>, queries: NamedQueries) -> Self {
        Self { store, queries }
    }

    fn bind_params(input: &ActionInput<'_>) -> Result<Vec<JsonValue>, ActionError> {
        match input.param("params") {
            None => Ok(Vec::new()),
            Some(JsonValue::Array(items)) => Ok(items.clone()),
            Some(_) => Err(ActionError::invalid("'params' must be a list")),
        }
    }
}

#[async_trait]
impl ActionHandler for DatabaseQueryHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let output = if let Some(name) = input.param_str("query") {
            let sql = self.queries.get(name).ok_or_else(|| StorageError::UnknownQuery {
                name: name.to_string(),
            })?;
            let query = SqlQuery {
                sql: sql.to_string(),
                params: Self::bind_params(&input)?,
            };
            self.store.execute(&query).await?
        } else if let Some(sql) = input.param_str("sql") {
            let query = SqlQuery {
                sql: sql.to_string(),
                params: Self::bind_params(&input)?,
            };
            self.store.execute(&query).await?
        } else if let Some(table) = input.param_str("table") {
            let empty = Map::new();
            let filter = match input.param("where") {
                None => &empty,
                Some(JsonValue::Object(filter)) => filter,
                Some(_) => return Err(ActionError::invalid("'where' must be an object")),
            };
            check_identifier(table)?;
            for column in filter.keys() {
                check_identifier(column)?;
            }
            QueryOutput::Rows(self.store.select(table, filter).await?)
        } else {
            return Err(ActionError::invalid("one of 'query', 'sql' or 'table' is required"));
        };

        Ok(match output {
            QueryOutput::Rows(rows) => json!({ "count": rows.len(), "rows": rows }),
            QueryOutput::Affected(count) => json!({ "affected_rows": count }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn run(handler: &dyn ActionHandler, params: JsonValue) -> Result<JsonValue, ActionError> {
        handler
            .execute(ActionInput {
                params: &params,
                integration: None,
                context: &json!({}),
            })
            .await
    }

    #[test]
    fn identifier_rules() {
        assert!(is_valid_identifier("leads"));
        assert!(is_valid_identifier("_tmp_2"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("users; drop table users"));
        assert!(!is_valid_identifier(""));
    }

    #[tokio::test]
    async fn save_then_select() {
        let store = Arc::new(InMemoryDataStore::new());
        let save = DatabaseSaveHandler::new(store.clone());
        let result = run(&save, json!({"table": "leads", "data": {"name": "x", "score": 3}}))
            .await
            .expect("save");
        assert_eq!(result["saved"], json!(true));
        assert_eq!(result["record"]["name"], json!("x"));

        let query = DatabaseQueryHandler::new(store.clone(), NamedQueries::new());
        let found = run(&query, json!({"table": "leads", "where": {"name": "x"}}))
            .await
            .expect("select");
        assert_eq!(found["count"], json!(1));
        assert_eq!(found["rows"][0]["score"], json!(3));

        let none = run(&query, json!({"table": "leads", "where": {"name": "y"}}))
            .await
            .expect("select");
        assert_eq!(none["count"], json!(0));
    }

    #[tokio::test]
    async fn unsafe_identifiers_are_storage_errors() {
        let store = Arc::new(InMemoryDataStore::new());
        let save = DatabaseSaveHandler::new(store.clone());
        let err = run(&save, json!({"table": "leads;--", "data": {"a": 1}}))
            .await
            .expect_err("bad table");
        assert_eq!(err.kind(), ErrorKind::StorageError);

        let err = run(&save, json!({"table": "leads", "data": {"a b": 1}}))
            .await
            .expect_err("bad column");
        assert_eq!(err.kind(), ErrorKind::StorageError);
        assert!(store.rows("leads").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_named_query_fails() {
        let query = DatabaseQueryHandler::new(Arc::new(InMemoryDataStore::new()), NamedQueries::new());
        let err = run(&query, json!({"query": "top_leads"})).await.expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::StorageError);
    }

    #[tokio::test]
    async fn raw_sql_on_memory_store_is_unsupported() {
        let query = DatabaseQueryHandler::new(Arc::new(InMemoryDataStore::new()), NamedQueries::new());
        let err = run(&query, json!({"sql": "SELECT 1", "params": []}))
            .await
            .expect_err("unsupported");
        assert!(matches!(err, ActionError::Storage(StorageError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn missing_params_are_validation_failures() {
        let save = DatabaseSaveHandler::new(Arc::new(InMemoryDataStore::new()));
        let err = run(&save, json!({"table": "leads"})).await.expect_err("no data");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
