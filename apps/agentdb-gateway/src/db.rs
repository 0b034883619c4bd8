use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

mod postgres;
mod sqlite;

pub use postgres::PostgresExecutor;
pub use sqlite::SqliteExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Positional bind marker for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::Sqlite => format!("?{index}"),
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Scalar JSON maps directly; arrays and objects are stored as canonical JSON text.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => Self::Integer(integer),
                None => Self::Real(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => Self::Text(text.clone()),
            Value::Array(_) | Value::Object(_) => Self::Text(wallet_auth::canonical_json(value)?),
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Integer(integer) => Value::from(*integer),
            Self::Real(real) => Value::from(*real),
            Self::Text(text) => Value::String(text.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(integer) => Some(*integer),
            Self::Bool(flag) => Some(i64::from(*flag)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn text(&self, column: &str) -> Result<String, DbError> {
        self.get(column)
            .and_then(SqlValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| DbError::Decode(format!("column {column} is not text")))
    }

    pub fn optional_text(&self, column: &str) -> Result<Option<String>, DbError> {
        match self.get(column) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(SqlValue::Text(text)) => Ok(Some(text.clone())),
            Some(_) => Err(DbError::Decode(format!("column {column} is not text"))),
        }
    }

    pub fn integer(&self, column: &str) -> Result<i64, DbError> {
        self.get(column)
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| DbError::Decode(format!("column {column} is not an integer")))
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for (name, value) in &self.columns {
            object.insert(name.clone(), value.to_json());
        }
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub mode: AccessMode,
    pub sql: String,
    pub values: Vec<SqlValue>,
}

impl Statement {
    pub fn read(sql: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Self {
            mode: AccessMode::Read,
            sql: sql.into(),
            values,
        }
    }

    pub fn write(sql: impl Into<String>, values: Vec<SqlValue>) -> Self {
        Self {
            mode: AccessMode::Write,
            sql: sql.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub rows: Vec<SqlRow>,
    pub rows_affected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connect(String),
    /// The database could not serve the statement (connection lost, busy, I/O).
    #[error("database unavailable: {0}")]
    Unavailable(String),
    /// The database rejected the statement itself.
    #[error("query failed: {message}")]
    Query {
        statement: Option<usize>,
        message: String,
    },
    #[error("constraint violated: {message}")]
    Constraint {
        statement: Option<usize>,
        message: String,
    },
    #[error("unsupported database dialect: {0}")]
    UnsupportedDialect(String),
    #[error("unsupported column type {type_name} for column {column}")]
    UnsupportedColumnType { column: String, type_name: String },
    #[error("failed to decode row: {0}")]
    Decode(String),
}

impl DbError {
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            statement: None,
            message: message.into(),
        }
    }

    /// Tags a batch failure with the zero-based index of the failing statement.
    pub fn at_statement(self, index: usize) -> Self {
        match self {
            Self::Query { message, .. } => Self::Query {
                statement: Some(index),
                message,
            },
            Self::Constraint { message, .. } => Self::Constraint {
                statement: Some(index),
                message,
            },
            other => other,
        }
    }

    pub fn failed_statement(&self) -> Option<usize> {
        match self {
            Self::Query { statement, .. } | Self::Constraint { statement, .. } => *statement,
            _ => None,
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }

    /// Retryable failures of the store rather than of the statement.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Unavailable(_) | Self::UnsupportedDialect(_)
        )
    }

    pub fn is_rejected_statement(&self) -> bool {
        matches!(self, Self::Query { .. })
    }
}

/// Executes parameterized statements against one database.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    async fn execute(&self, statement: Statement) -> Result<QueryOutcome, DbError>;

    /// Runs every statement in one transaction; any failure rolls back all of them.
    async fn run_in_transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<QueryOutcome>, DbError>;
}

/// Opens an executor for `url`.
///
/// `postgres://` and `postgresql://` select Postgres; `sqlite:` URLs, `:memory:`
/// and bare filesystem paths select SQLite.
pub async fn connect(url: &str) -> Result<Arc<dyn SqlExecutor>, DbError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(DbError::UnsupportedDialect("empty database url".to_string()));
    }
    if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
        let executor = PostgresExecutor::connect(trimmed).await?;
        return Ok(Arc::new(executor));
    }
    if let Some(rest) = trimmed.strip_prefix("sqlite:") {
        let path = rest.trim_start_matches("//");
        let executor = if path.is_empty() || path == ":memory:" {
            SqliteExecutor::open_in_memory()?
        } else {
            SqliteExecutor::open(path)?
        };
        return Ok(Arc::new(executor));
    }
    if trimmed == ":memory:" {
        return Ok(Arc::new(SqliteExecutor::open_in_memory()?));
    }
    if let Some((scheme, _)) = trimmed.split_once("://") {
        return Err(DbError::UnsupportedDialect(scheme.to_string()));
    }
    Ok(Arc::new(SqliteExecutor::open(trimmed)?))
}

/// Scheme-only rendering of a connection string for logs and errors.
pub fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, _)) => format!("{scheme}://***"),
        None => "<path>".to_string(),
    }
}

/// Double-quoted identifier. Callers validate identifiers before they reach SQL.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DbError, SqlDialect, SqlExecutor, SqlValue, Statement, connect, quote_ident};

    #[test]
    fn placeholders_follow_dialect() {
        assert_eq!(SqlDialect::Postgres.placeholder(3), "$3");
        assert_eq!(SqlDialect::Sqlite.placeholder(3), "?3");
        assert_eq!(SqlDialect::parse("PostgreSQL"), Some(SqlDialect::Postgres));
        assert_eq!(SqlDialect::parse("mysql"), None);
    }

    #[test]
    fn json_values_map_to_sql_values() {
        assert_eq!(SqlValue::from_json(&json!(7)).expect("int"), SqlValue::Integer(7));
        assert_eq!(SqlValue::from_json(&json!(1.5)).expect("real"), SqlValue::Real(1.5));
        assert_eq!(SqlValue::from_json(&json!(null)).expect("null"), SqlValue::Null);
        assert_eq!(
            SqlValue::from_json(&json!({"b": 1, "a": [true]})).expect("object"),
            SqlValue::Text(r#"{"a":[true],"b":1}"#.to_string())
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("notes"), "\"notes\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn batch_errors_carry_statement_index() {
        let error = DbError::query("boom").at_statement(2);
        assert_eq!(error.failed_statement(), Some(2));
        assert!(error.is_rejected_statement());
        assert!(!error.is_unavailable());
        assert!(DbError::Unavailable("database is locked".to_string()).is_unavailable());
        assert!(!DbError::Unavailable("gone".to_string()).at_statement(1).is_rejected_statement());
    }

    #[tokio::test]
    async fn connect_selects_dialect_from_url() -> anyhow::Result<()> {
        let executor = connect("sqlite::memory:").await?;
        assert_eq!(executor.dialect(), SqlDialect::Sqlite);
        executor
            .execute(Statement::write("CREATE TABLE t (id INTEGER)", Vec::new()))
            .await?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gateway.db");
        let file_backed = connect(path.to_string_lossy().as_ref()).await?;
        assert_eq!(file_backed.dialect(), SqlDialect::Sqlite);
        assert!(path.exists());

        assert!(matches!(
            connect("mysql://localhost/db").await.err(),
            Some(DbError::UnsupportedDialect(scheme)) if scheme == "mysql"
        ));
        Ok(())
    }
}
