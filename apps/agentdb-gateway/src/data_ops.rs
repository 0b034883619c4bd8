use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use wallet_auth::MutationAuth;

use crate::db::{DbError, QueryOutcome, SqlDialect, SqlExecutor, SqlValue, Statement, quote_ident};
use crate::migration::{MigrationError, MigrationRunner, physical_table_name};
use crate::policy::{
    ActionAuthorizer, AuthorizationError, AuthorizationRequest, GrantOperation, PolicyDecision,
    ScopeType, is_valid_identifier, validate_tenant_id,
};

pub const DEFAULT_SELECT_LIMIT: u32 = 100;
pub const MAX_SELECT_LIMIT: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataOperation {
    Read,
    Insert,
    Update,
    Delete,
}

impl DataOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn grant_operation(self) -> GrantOperation {
        match self {
            Self::Read => GrantOperation::Read,
            Self::Insert => GrantOperation::Insert,
            Self::Update => GrantOperation::Update,
            Self::Delete => GrantOperation::Delete,
        }
    }

    /// Signed action name, e.g. `data.insert`.
    pub fn action(self) -> String {
        format!("data.{}", self.as_str())
    }
}

impl fmt::Display for DataOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOperationRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub actor_wallet: String,
    #[serde(default)]
    pub auth: Option<MutationAuth>,
    pub operation: DataOperation,
    pub table: String,
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl DataOperationRequest {
    pub fn signing_payload(&self) -> Value {
        json!({
            "table": self.table,
            "values": self.values,
            "filters": self.filters,
            "limit": self.limit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataOperationResult {
    pub operation: DataOperation,
    pub table: String,
    pub rows: Vec<Value>,
    pub rows_affected: u64,
    pub actor_wallet: String,
    pub signature_hash: String,
    pub decision: PolicyDecision,
}

#[derive(Debug, Error)]
pub enum DataOperationError {
    #[error("invalid data operation: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("table {table} is not managed for this tenant")]
    TableNotFound { table: String },
    #[error(transparent)]
    Registry(#[from] MigrationError),
    #[error("data operation failed: {0}")]
    Execution(#[from] DbError),
}

impl DataOperationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_DATA_OPERATION",
            Self::Authorization(error) => error.code(),
            Self::TableNotFound { .. } => "TABLE_NOT_FOUND",
            Self::Registry(error) => error.code(),
            Self::Execution(error) if error.is_constraint_violation() => "CONSTRAINT_VIOLATION",
            Self::Execution(error) if error.is_rejected_statement() => "STATEMENT_REJECTED",
            Self::Execution(error) if error.is_unavailable() => "DATA_STORE_UNAVAILABLE",
            Self::Execution(_) => "DATA_DECODE_FAILED",
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Authorization(error) => error.status(),
            Self::TableNotFound { .. } => 404,
            Self::Registry(error) => error.status(),
            Self::Execution(error) if error.is_constraint_violation() => 409,
            Self::Execution(error) if error.is_rejected_statement() => 400,
            Self::Execution(error) if error.is_unavailable() => 503,
            Self::Execution(_) => 500,
        }
    }
}

/// Builds the parameterized statement for one table operation. Columns are
/// bound in key order so identical requests always yield identical SQL.
pub fn build_data_statement(
    dialect: SqlDialect,
    operation: DataOperation,
    table: &str,
    values: &Map<String, Value>,
    filters: &Map<String, Value>,
    limit: Option<u32>,
) -> Result<Statement, DataOperationError> {
    let invalid = |message: &str| DataOperationError::InvalidRequest(message.to_string());
    if !is_valid_identifier(table) {
        return Err(DataOperationError::InvalidRequest(format!(
            "table {table} is not a valid identifier"
        )));
    }
    let values = sorted_columns(values, "values")?;
    let filters = sorted_columns(filters, "filters")?;

    let mut bound = Vec::new();
    let table = quote_ident(table);
    match operation {
        DataOperation::Read => {
            if !values.is_empty() {
                return Err(invalid("read does not accept values"));
            }
            let limit = limit
                .unwrap_or(DEFAULT_SELECT_LIMIT)
                .clamp(1, MAX_SELECT_LIMIT);
            let predicate = where_clause(dialect, &filters, &mut bound);
            Ok(Statement::read(
                format!("SELECT * FROM {table}{predicate} LIMIT {limit}"),
                bound,
            ))
        }
        DataOperation::Insert => {
            if values.is_empty() {
                return Err(invalid("insert requires values"));
            }
            if !filters.is_empty() {
                return Err(invalid("insert does not accept filters"));
            }
            let columns = values
                .iter()
                .map(|(column, _)| quote_ident(column))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = values
                .into_iter()
                .map(|(_, value)| bind(dialect, value, &mut bound))
                .collect::<Vec<_>>()
                .join(", ");
            Ok(Statement::write(
                format!("INSERT INTO {table} ({columns}) VALUES ({placeholders})"),
                bound,
            ))
        }
        DataOperation::Update => {
            if values.is_empty() {
                return Err(invalid("update requires values"));
            }
            if filters.is_empty() {
                return Err(invalid("update requires filters"));
            }
            let assignments = values
                .into_iter()
                .map(|(column, value)| {
                    format!("{} = {}", quote_ident(column), bind(dialect, value, &mut bound))
                })
                .collect::<Vec<_>>()
                .join(", ");
            let predicate = where_clause(dialect, &filters, &mut bound);
            Ok(Statement::write(
                format!("UPDATE {table} SET {assignments}{predicate}"),
                bound,
            ))
        }
        DataOperation::Delete => {
            if !values.is_empty() {
                return Err(invalid("delete does not accept values"));
            }
            if filters.is_empty() {
                return Err(invalid("delete requires filters"));
            }
            let predicate = where_clause(dialect, &filters, &mut bound);
            Ok(Statement::write(format!("DELETE FROM {table}{predicate}"), bound))
        }
    }
}

fn sorted_columns<'a>(
    columns: &'a Map<String, Value>,
    field: &str,
) -> Result<Vec<(&'a str, SqlValue)>, DataOperationError> {
    let mut sorted = Vec::with_capacity(columns.len());
    for (column, value) in columns {
        if !is_valid_identifier(column) {
            return Err(DataOperationError::InvalidRequest(format!(
                "{field}.{column} is not a valid column name"
            )));
        }
        let value = SqlValue::from_json(value).map_err(|error| {
            DataOperationError::InvalidRequest(format!("{field}.{column}: {error}"))
        })?;
        sorted.push((column.as_str(), value));
    }
    sorted.sort_by(|left, right| left.0.cmp(right.0));
    Ok(sorted)
}

fn bind(dialect: SqlDialect, value: SqlValue, bound: &mut Vec<SqlValue>) -> String {
    bound.push(value);
    dialect.placeholder(bound.len())
}

// Null filters compare with IS NULL; everything else binds a parameter.
fn where_clause(
    dialect: SqlDialect,
    filters: &[(&str, SqlValue)],
    bound: &mut Vec<SqlValue>,
) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let predicates = filters
        .iter()
        .map(|(column, value)| {
            if value.is_null() {
                format!("{} IS NULL", quote_ident(column))
            } else {
                format!(
                    "{} = {}",
                    quote_ident(column),
                    bind(dialect, value.clone(), bound)
                )
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(" WHERE {predicates}")
}

/// Authorized, table-scoped reads and writes against managed tables.
pub struct DataOperationService {
    authorizer: Arc<ActionAuthorizer>,
    runner: Arc<MigrationRunner>,
    db: Arc<dyn SqlExecutor>,
}

impl DataOperationService {
    pub fn new(
        authorizer: Arc<ActionAuthorizer>,
        runner: Arc<MigrationRunner>,
        db: Arc<dyn SqlExecutor>,
    ) -> Self {
        Self {
            authorizer,
            runner,
            db,
        }
    }

    pub async fn execute(
        &self,
        request: DataOperationRequest,
    ) -> Result<DataOperationResult, DataOperationError> {
        let tenant_id = validate_tenant_id(&request.tenant_id).map_err(AuthorizationError::from)?;
        let table = request.table.trim().to_ascii_lowercase();
        if !is_valid_identifier(&table) {
            return Err(DataOperationError::InvalidRequest(format!(
                "table {table} is not a valid identifier"
            )));
        }
        let statement = build_data_statement(
            self.db.dialect(),
            request.operation,
            &physical_table_name(&tenant_id, &table),
            &request.values,
            &request.filters,
            request.limit,
        )?;

        let action_payload = request.signing_payload();
        let authorized = self
            .authorizer
            .authorize(AuthorizationRequest {
                request_id: request.request_id.clone(),
                tenant_id: request.tenant_id.clone(),
                actor_wallet: request.actor_wallet,
                auth: request.auth,
                action: request.operation.action(),
                action_payload,
                scope_type: ScopeType::Table,
                scope_id: table.clone(),
                operation: request.operation.grant_operation(),
            })
            .await?;

        if !self.runner.is_managed_table(&tenant_id, &table).await? {
            tracing::warn!(
                request_id = %request.request_id,
                tenant_id = %tenant_id,
                table = %table,
                code = "TABLE_NOT_FOUND",
                "data operation on unmanaged table"
            );
            return Err(DataOperationError::TableNotFound { table });
        }

        let QueryOutcome {
            rows,
            rows_affected,
        } = self.db.execute(statement).await?;
        tracing::info!(
            request_id = %request.request_id,
            tenant_id = %tenant_id,
            actor_wallet = %authorized.actor_wallet,
            operation = %request.operation,
            table = %table,
            rows = rows.len(),
            rows_affected,
            "data operation executed"
        );
        Ok(DataOperationResult {
            operation: request.operation,
            table,
            rows: rows.iter().map(|row| row.to_json()).collect(),
            rows_affected,
            actor_wallet: authorized.actor_wallet,
            signature_hash: authorized.signature_hash,
            decision: authorized.decision,
        })
    }
}
