use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use wallet_auth::Clock;

use crate::db::{DbError, SqlExecutor, SqlValue, Statement};
use crate::policy::store::{format_timestamp, parse_timestamp};
use crate::policy::{PolicyError, is_valid_identifier, validate_tenant_id};
use crate::schema::compile::{
    MIGRATION_PLAN_SCHEMA_VERSION, MigrationPlan, StepAction, create_table_sql,
};
use crate::schema::dsl::{FieldSpec, RESERVED_WORDS};

pub const MIGRATION_STATUS_APPLIED: &str = "applied";

const MAX_PHYSICAL_NAME_LEN: usize = 63;
const TENANT_DIGEST_LEN: usize = 12;
const TABLE_DIGEST_LEN: usize = 8;

const METADATA_SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS schema_migration_history (
        migration_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        request_id TEXT NOT NULL,
        plan_hash TEXT NOT NULL,
        step_count BIGINT NOT NULL,
        status TEXT NOT NULL,
        applied_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS managed_tables (
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        definition_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        migration_id TEXT,
        PRIMARY KEY (tenant_id, table_name)
    )
    "#,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyMigrationRequest {
    pub tenant_id: String,
    pub request_id: String,
    pub migration_plan: MigrationPlan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
    pub plan_hash: String,
    pub step_count: usize,
    pub managed_tables: Vec<String>,
    /// Tables this migration created; the rest were already registered
    /// with an identical definition.
    pub created_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedTable {
    pub table_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    InvalidRequest(#[from] PolicyError),
    #[error("invalid migration plan: {0}")]
    InvalidPlan(String),
    #[error("plan targets {plan} but the connected database is {connected}")]
    UnsupportedEngine { plan: String, connected: String },
    #[error("migration plan hash does not match its contents")]
    PlanHashMismatch,
    #[error("table {table} is already managed with a different definition")]
    TableConflict { table: String },
    #[error("migration step {step_id} failed: {message}")]
    StepFailed { step_id: String, message: String },
    #[error("migration storage unavailable: {0}")]
    Db(#[from] DbError),
}

impl MigrationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(error) => error.code(),
            Self::InvalidPlan(_) => "INVALID_MIGRATION_PLAN",
            Self::UnsupportedEngine { .. } => "UNSUPPORTED_ENGINE",
            Self::PlanHashMismatch => "PLAN_HASH_MISMATCH",
            Self::TableConflict { .. } => "MANAGED_TABLE_CONFLICT",
            Self::StepFailed { .. } => "MIGRATION_STEP_FAILED",
            Self::Db(_) => "MIGRATION_STORE_UNAVAILABLE",
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::InvalidPlan(_) => 400,
            Self::PlanHashMismatch | Self::TableConflict { .. } => 409,
            Self::StepFailed { .. } => 500,
            Self::UnsupportedEngine { .. } | Self::Db(_) => 503,
        }
    }
}

/// Applies compiled plans all-or-nothing and records their provenance.
pub struct MigrationRunner {
    db: Arc<dyn SqlExecutor>,
    clock: Arc<dyn Clock>,
}

impl MigrationRunner {
    pub fn new(db: Arc<dyn SqlExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Creates the history and registry tables outside of any migration.
    pub async fn ensure_schema(&self) -> Result<(), MigrationError> {
        self.db.run_in_transaction(metadata_statements()).await?;
        Ok(())
    }

    pub async fn apply_migration_plan(
        &self,
        request: ApplyMigrationRequest,
    ) -> Result<AppliedMigration, MigrationError> {
        let tenant_id = validate_tenant_id(&request.tenant_id)?;
        let request_id = request.request_id.trim();
        if request_id.is_empty() {
            return Err(MigrationError::InvalidPlan("requestId is required".to_string()));
        }
        let plan = &request.migration_plan;
        let tables = check_plan(plan)?;
        let connected = self.db.dialect();
        if plan.engine != connected {
            return Err(MigrationError::UnsupportedEngine {
                plan: plan.engine.to_string(),
                connected: connected.to_string(),
            });
        }
        if !plan.verify_hash() {
            tracing::warn!(
                tenant_id = %tenant_id,
                request_id = %request_id,
                plan_hash = %plan.plan_hash,
                code = "PLAN_HASH_MISMATCH",
                "rejected migration plan with stale hash"
            );
            return Err(MigrationError::PlanHashMismatch);
        }
        // A resealed hash proves nothing about the SQL; only DDL rebuilt from
        // the step's own column metadata is ever executed.
        for table in &tables {
            if table.step_sql != create_table_sql(plan.engine, &table.name, &table.columns) {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    request_id = %request_id,
                    step_id = %table.step_id,
                    code = "INVALID_MIGRATION_PLAN",
                    "rejected migration step whose sql does not match its columns"
                );
                return Err(MigrationError::InvalidPlan(format!(
                    "{} sql does not match its column metadata",
                    table.step_id
                )));
            }
        }

        self.ensure_schema().await?;
        let registered = self.registered_definitions(&tenant_id).await?;

        let migration_id = Uuid::now_v7().to_string();
        let applied_at = self.clock.now();
        let applied_at_text = format_timestamp(applied_at);
        let dialect = connected;
        let register_sql = format!(
            "INSERT INTO managed_tables \
             (tenant_id, table_name, definition_hash, created_at, migration_id) \
             VALUES ({}, {}, {}, {}, {})",
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            dialect.placeholder(4),
            dialect.placeholder(5)
        );

        let mut statements = Vec::new();
        let mut step_ids = Vec::new();
        let mut registrations = Vec::new();
        let mut created_tables = Vec::new();
        for table in &tables {
            let definition_hash = wallet_auth::sha256_hex(&table.step_sql);
            match registered.get(&table.name) {
                Some(existing) if *existing == definition_hash => continue,
                Some(_) => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        request_id = %request_id,
                        table = %table.name,
                        code = "MANAGED_TABLE_CONFLICT",
                        "rejected migration redefining a managed table"
                    );
                    return Err(MigrationError::TableConflict {
                        table: table.name.clone(),
                    });
                }
                None => {}
            }
            let physical = physical_table_name(&tenant_id, &table.name);
            statements.push(Statement::write(
                create_table_sql(dialect, &physical, &table.columns),
                Vec::new(),
            ));
            step_ids.push(table.step_id.clone());
            registrations.push(Statement::write(
                register_sql.clone(),
                vec![
                    SqlValue::from(tenant_id.as_str()),
                    SqlValue::from(table.name.as_str()),
                    SqlValue::from(definition_hash),
                    SqlValue::from(applied_at_text.as_str()),
                    SqlValue::from(migration_id.as_str()),
                ],
            ));
            created_tables.push(table.name.clone());
        }
        statements.extend(registrations);
        let step_count = i64::try_from(plan.steps.len()).unwrap_or(i64::MAX);
        statements.push(Statement::write(
            format!(
                "INSERT INTO schema_migration_history \
                 (migration_id, tenant_id, request_id, plan_hash, step_count, status, applied_at) \
                 VALUES ({}, {}, {}, {}, {}, {}, {})",
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3),
                dialect.placeholder(4),
                dialect.placeholder(5),
                dialect.placeholder(6),
                dialect.placeholder(7)
            ),
            vec![
                SqlValue::from(migration_id.as_str()),
                SqlValue::from(tenant_id.as_str()),
                SqlValue::from(request_id),
                SqlValue::from(plan.plan_hash.as_str()),
                SqlValue::Integer(step_count),
                SqlValue::from(MIGRATION_STATUS_APPLIED),
                SqlValue::from(applied_at_text.as_str()),
            ],
        ));

        if let Err(error) = self.db.run_in_transaction(statements).await {
            let failed_step = error.failed_statement().and_then(|index| step_ids.get(index));
            tracing::warn!(
                tenant_id = %tenant_id,
                request_id = %request_id,
                plan_hash = %plan.plan_hash,
                step_id = failed_step.map(String::as_str),
                error = %error,
                "migration rolled back"
            );
            return Err(match failed_step {
                Some(step_id) => MigrationError::StepFailed {
                    step_id: step_id.clone(),
                    message: error.to_string(),
                },
                None => MigrationError::Db(error),
            });
        }

        tracing::info!(
            tenant_id = %tenant_id,
            request_id = %request_id,
            migration_id = %migration_id,
            plan_hash = %plan.plan_hash,
            tables = tables.len(),
            created = created_tables.len(),
            "migration applied"
        );
        Ok(AppliedMigration {
            migration_id,
            applied_at,
            plan_hash: plan.plan_hash.clone(),
            step_count: plan.steps.len(),
            managed_tables: tables.into_iter().map(|table| table.name).collect(),
            created_tables,
        })
    }

    pub async fn list_managed_tables(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<ManagedTable>, MigrationError> {
        let tenant_id = validate_tenant_id(tenant_id)?;
        let sql = format!(
            "SELECT table_name, created_at FROM managed_tables WHERE tenant_id = {} \
             ORDER BY table_name",
            self.db.dialect().placeholder(1)
        );
        let outcome = self
            .db
            .execute(Statement::read(sql, vec![SqlValue::from(tenant_id)]))
            .await?;
        outcome
            .rows
            .iter()
            .map(|row| {
                Ok(ManagedTable {
                    table_name: row.text("table_name")?,
                    created_at: parse_timestamp(&row.text("created_at")?)?,
                })
            })
            .collect()
    }

    pub async fn is_managed_table(
        &self,
        tenant_id: &str,
        table_name: &str,
    ) -> Result<bool, MigrationError> {
        let tenant_id = validate_tenant_id(tenant_id)?;
        let dialect = self.db.dialect();
        let sql = format!(
            "SELECT 1 AS managed FROM managed_tables WHERE tenant_id = {} AND table_name = {}",
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let outcome = self
            .db
            .execute(Statement::read(
                sql,
                vec![SqlValue::from(tenant_id), SqlValue::from(table_name)],
            ))
            .await?;
        Ok(!outcome.rows.is_empty())
    }

    async fn registered_definitions(
        &self,
        tenant_id: &str,
    ) -> Result<HashMap<String, String>, MigrationError> {
        let sql = format!(
            "SELECT table_name, definition_hash FROM managed_tables WHERE tenant_id = {}",
            self.db.dialect().placeholder(1)
        );
        let outcome = self
            .db
            .execute(Statement::read(sql, vec![SqlValue::from(tenant_id)]))
            .await?;
        outcome
            .rows
            .iter()
            .map(|row| Ok((row.text("table_name")?, row.text("definition_hash")?)))
            .collect()
    }
}

/// Storage name of a tenant's managed table: `t_<tenant digest>_<table>`.
/// Names past the identifier limit keep a prefix of the table name plus a
/// digest of the whole name.
pub fn physical_table_name(tenant_id: &str, table: &str) -> String {
    let tenant_digest = wallet_auth::sha256_hex(tenant_id);
    let tenant_part = tenant_digest.get(..TENANT_DIGEST_LEN).unwrap_or(&tenant_digest);
    let physical = format!("t_{tenant_part}_{table}");
    if physical.len() <= MAX_PHYSICAL_NAME_LEN {
        return physical;
    }
    let table_digest = wallet_auth::sha256_hex(table);
    let table_part = table_digest.get(..TABLE_DIGEST_LEN).unwrap_or(&table_digest);
    let keep = MAX_PHYSICAL_NAME_LEN - (tenant_part.len() + table_part.len() + 4);
    let head: String = table.chars().take(keep).collect();
    format!("t_{tenant_part}_{head}_{table_part}")
}

fn metadata_statements() -> Vec<Statement> {
    METADATA_SCHEMA
        .iter()
        .map(|sql| Statement::write(*sql, Vec::new()))
        .collect()
}

struct PlannedTable {
    step_id: String,
    name: String,
    columns: Vec<FieldSpec>,
    step_sql: String,
}

// Plans arrive from outside the compiler, so their shape is re-checked here.
fn check_plan(plan: &MigrationPlan) -> Result<Vec<PlannedTable>, MigrationError> {
    let invalid = |reason: String| MigrationError::InvalidPlan(reason);
    if plan.schema_version != MIGRATION_PLAN_SCHEMA_VERSION {
        return Err(invalid(format!(
            "unsupported schemaVersion {}",
            plan.schema_version
        )));
    }
    if plan.steps.is_empty() {
        return Err(invalid("plan has no steps".to_string()));
    }
    if plan.plan_hash.trim().is_empty() {
        return Err(invalid("planHash is required".to_string()));
    }

    let mut step_ids = HashSet::new();
    let mut tables: Vec<PlannedTable> = Vec::new();
    for (index, step) in plan.steps.iter().enumerate() {
        if step.step_id.trim().is_empty() || !step_ids.insert(step.step_id.as_str()) {
            return Err(invalid(format!("steps[{index}] has a missing or duplicate stepId")));
        }
        match step.action {
            StepAction::EnsureDatabase => {
                let named = step
                    .metadata
                    .get("databaseName")
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(is_valid_identifier);
                if !named || step.sql.is_some() {
                    return Err(invalid(format!(
                        "steps[{index}] ensure_database needs a databaseName and no sql"
                    )));
                }
            }
            StepAction::CreateTable => {
                let table = step
                    .table_name()
                    .filter(|table| is_managed_identifier(table))
                    .ok_or_else(|| {
                        invalid(format!("steps[{index}] create_table needs a valid tableName"))
                    })?;
                let step_sql = step
                    .sql
                    .as_deref()
                    .filter(|sql| !sql.trim().is_empty())
                    .ok_or_else(|| invalid(format!("steps[{index}] create_table needs sql")))?;
                if tables.iter().any(|seen| seen.name == table) {
                    return Err(invalid(format!("table {table} is created twice")));
                }
                let columns = step.columns().map_err(|error| {
                    invalid(format!("steps[{index}] has unreadable columns: {error}"))
                })?;
                check_columns(&columns)
                    .map_err(|reason| invalid(format!("steps[{index}] {reason}")))?;
                tables.push(PlannedTable {
                    step_id: step.step_id.clone(),
                    name: table.to_string(),
                    columns,
                    step_sql: step_sql.to_string(),
                });
            }
        }
    }
    if tables.is_empty() {
        return Err(invalid("plan creates no tables".to_string()));
    }
    Ok(tables)
}

fn check_columns(columns: &[FieldSpec]) -> Result<(), String> {
    if columns.is_empty() {
        return Err("declares no columns".to_string());
    }
    let mut names = HashSet::new();
    let mut primary_keys = 0;
    for column in columns {
        if !is_managed_identifier(&column.name) {
            return Err(format!("column {} is not a valid identifier", column.name));
        }
        if !names.insert(column.name.as_str()) {
            return Err(format!("column {} is declared twice", column.name));
        }
        if column.primary_key {
            primary_keys += 1;
            if column.nullable {
                return Err(format!("primary key {} cannot be nullable", column.name));
            }
        }
    }
    if primary_keys > 1 {
        return Err("declares more than one primary key".to_string());
    }
    Ok(())
}

fn is_managed_identifier(candidate: &str) -> bool {
    is_valid_identifier(candidate) && !RESERVED_WORDS.contains(&candidate)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use wallet_auth::FixedClock;

    use super::{ApplyMigrationRequest, MigrationError, MigrationRunner, physical_table_name};
    use crate::db::{SqlExecutor, SqlValue, SqliteExecutor, Statement};
    use crate::schema::compile::{
        MigrationPlan, compile_migration_plan, compute_plan_hash, create_table_sql,
    };
    use crate::schema::dsl::validate_schema_dsl;

    fn plan_with(engine: &str, notes_fields: serde_json::Value) -> MigrationPlan {
        let dsl = validate_schema_dsl(&json!({
            "requestId": "req-migrate",
            "creator": {"walletAddress": "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"},
            "database": {"name": "agent_notes", "engine": engine},
            "tables": [
                {"name": "notes", "fields": notes_fields},
                {"name": "authors", "fields": [
                    {"name": "id", "type": "integer", "primaryKey": true}
                ]}
            ]
        }))
        .expect("dsl");
        compile_migration_plan(&dsl).expect("plan")
    }

    fn plan(engine: &str) -> MigrationPlan {
        plan_with(
            engine,
            json!([
                {"name": "id", "type": "text", "primaryKey": true},
                {"name": "body", "type": "text"}
            ]),
        )
    }

    fn runner() -> anyhow::Result<(MigrationRunner, Arc<dyn SqlExecutor>)> {
        let db: Arc<dyn SqlExecutor> = Arc::new(SqliteExecutor::open_in_memory()?);
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().expect("time"),
        ));
        Ok((MigrationRunner::new(Arc::clone(&db), clock), db))
    }

    fn request_for(
        tenant_id: &str,
        request_id: &str,
        migration_plan: MigrationPlan,
    ) -> ApplyMigrationRequest {
        ApplyMigrationRequest {
            tenant_id: tenant_id.to_string(),
            request_id: request_id.to_string(),
            migration_plan,
        }
    }

    fn request(request_id: &str, migration_plan: MigrationPlan) -> ApplyMigrationRequest {
        request_for("tenant-a", request_id, migration_plan)
    }

    async fn table_exists(db: &Arc<dyn SqlExecutor>, name: &str) -> anyhow::Result<bool> {
        let outcome = db
            .execute(Statement::read(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                vec![SqlValue::from(name)],
            ))
            .await?;
        Ok(!outcome.rows.is_empty())
    }

    async fn user_tables(db: &Arc<dyn SqlExecutor>) -> anyhow::Result<Vec<String>> {
        let mut present = Vec::new();
        for table in ["authors", "notes"] {
            let physical = physical_table_name("tenant-a", table);
            if table_exists(db, &physical).await? {
                present.push(table.to_string());
            }
        }
        Ok(present)
    }

    async fn history_count(db: &Arc<dyn SqlExecutor>) -> anyhow::Result<i64> {
        let outcome = db
            .execute(Statement::read(
                "SELECT COUNT(*) AS applied FROM schema_migration_history",
                Vec::new(),
            ))
            .await?;
        Ok(outcome.rows[0].integer("applied")?)
    }

    #[test]
    fn physical_names_are_scoped_and_bounded() {
        let notes_a = physical_table_name("tenant-a", "notes");
        let notes_b = physical_table_name("tenant-b", "notes");
        assert_ne!(notes_a, notes_b);
        assert!(notes_a.starts_with("t_") && notes_a.ends_with("_notes"));
        assert_eq!(notes_a, physical_table_name("tenant-a", "notes"));

        let long_a = format!("a{}", "b".repeat(62));
        let long_b = format!("a{}c", "b".repeat(61));
        let physical_a = physical_table_name("tenant-a", &long_a);
        let physical_b = physical_table_name("tenant-a", &long_b);
        assert_eq!(physical_a.len(), 63);
        assert_eq!(physical_b.len(), 63);
        assert_ne!(physical_a, physical_b);
    }

    #[tokio::test]
    async fn applies_plan_and_records_provenance() -> anyhow::Result<()> {
        let (runner, db) = runner()?;
        let applied = runner
            .apply_migration_plan(request("req-1", plan("sqlite")))
            .await?;
        assert_eq!(applied.managed_tables, ["authors", "notes"]);
        assert_eq!(applied.created_tables, ["authors", "notes"]);
        assert_eq!(applied.step_count, 3);
        assert_eq!(user_tables(&db).await?, ["authors", "notes"]);
        assert!(!table_exists(&db, "notes").await?);

        let history = db
            .execute(Statement::read(
                "SELECT request_id, plan_hash, step_count, status FROM schema_migration_history",
                Vec::new(),
            ))
            .await?;
        assert_eq!(history.rows.len(), 1);
        assert_eq!(history.rows[0].text("plan_hash")?, applied.plan_hash);
        assert_eq!(history.rows[0].integer("step_count")?, 3);
        assert_eq!(history.rows[0].text("status")?, "applied");

        assert!(runner.is_managed_table("tenant-a", "notes").await?);
        assert!(runner.is_managed_table(" tenant-a ", "notes").await?);
        assert!(!runner.is_managed_table("tenant-b", "notes").await?);
        let managed = runner.list_managed_tables("tenant-a").await?;
        assert_eq!(managed.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn reapplying_the_same_plan_is_idempotent() -> anyhow::Result<()> {
        let (runner, db) = runner()?;
        runner
            .apply_migration_plan(request("req-1", plan("sqlite")))
            .await?;
        let again = runner
            .apply_migration_plan(request("req-2", plan("sqlite")))
            .await?;
        assert_eq!(again.managed_tables, ["authors", "notes"]);
        assert!(again.created_tables.is_empty());
        assert_eq!(runner.list_managed_tables("tenant-a").await?.len(), 2);
        assert_eq!(history_count(&db).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn redefining_a_managed_table_conflicts() -> anyhow::Result<()> {
        let (runner, db) = runner()?;
        runner
            .apply_migration_plan(request("req-1", plan("sqlite")))
            .await?;
        let reshaped = plan_with(
            "sqlite",
            json!([
                {"name": "id", "type": "integer", "primaryKey": true},
                {"name": "title", "type": "text"}
            ]),
        );
        let error = runner
            .apply_migration_plan(request("req-2", reshaped))
            .await
            .expect_err("conflict");
        assert!(
            matches!(&error, MigrationError::TableConflict { table } if table == "notes"),
            "{error:?}"
        );
        assert_eq!(error.code(), "MANAGED_TABLE_CONFLICT");
        assert_eq!(error.status(), 409);
        assert_eq!(history_count(&db).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn tenants_keep_separate_tables_of_the_same_name() -> anyhow::Result<()> {
        let (runner, db) = runner()?;
        runner
            .apply_migration_plan(request("req-1", plan("sqlite")))
            .await?;
        let other_shape = plan_with(
            "sqlite",
            json!([
                {"name": "id", "type": "integer", "primaryKey": true},
                {"name": "secret", "type": "text"}
            ]),
        );
        let applied = runner
            .apply_migration_plan(request_for("tenant-b", "req-b", other_shape))
            .await?;
        assert_eq!(applied.created_tables, ["authors", "notes"]);

        let tenant_b_notes = physical_table_name("tenant-b", "notes");
        assert!(table_exists(&db, &tenant_b_notes).await?);
        db.execute(Statement::write(
            format!("INSERT INTO \"{tenant_b_notes}\" (id, secret) VALUES (1, 'b-only')"),
            Vec::new(),
        ))
        .await?;
        let tenant_a_rows = db
            .execute(Statement::read(
                format!(
                    "SELECT * FROM \"{}\"",
                    physical_table_name("tenant-a", "notes")
                ),
                Vec::new(),
            ))
            .await?;
        assert!(tenant_a_rows.rows.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failing_step_leaves_no_trace() -> anyhow::Result<()> {
        let (runner, db) = runner()?;
        db.execute(Statement::write(
            format!(
                "CREATE TABLE \"{}\" (stray TEXT)",
                physical_table_name("tenant-a", "notes")
            ),
            Vec::new(),
        ))
        .await?;

        let error = runner
            .apply_migration_plan(request("req-broken", plan("sqlite")))
            .await
            .expect_err("existing table");
        assert!(
            matches!(&error, MigrationError::StepFailed { step_id, .. } if step_id == "step_003"),
            "{error:?}"
        );
        assert_eq!(error.code(), "MIGRATION_STEP_FAILED");
        assert_eq!(user_tables(&db).await?, ["notes"]);
        assert_eq!(history_count(&db).await?, 0);
        assert!(runner.list_managed_tables("tenant-a").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn resealed_plans_only_run_rebuilt_sql() -> anyhow::Result<()> {
        let (runner, db) = runner()?;
        db.execute(Statement::write(
            "CREATE TABLE policy_grants (grant_id TEXT PRIMARY KEY)",
            Vec::new(),
        ))
        .await?;

        let mut dropper = plan("sqlite");
        dropper.steps[1].sql = Some("DROP TABLE policy_grants".to_string());
        dropper.plan_hash = compute_plan_hash(&dropper)?;
        assert!(dropper.verify_hash());
        let error = runner
            .apply_migration_plan(request("req-drop", dropper))
            .await
            .expect_err("rebuilt sql differs");
        assert_eq!(error.code(), "INVALID_MIGRATION_PLAN");
        assert_eq!(error.status(), 400);
        assert!(table_exists(&db, "policy_grants").await?);

        let mut reserved = plan("sqlite");
        reserved.steps[1].metadata["columns"][0]["name"] = json!("select");
        let columns = reserved.steps[1].columns()?;
        reserved.steps[1].sql = Some(create_table_sql(reserved.engine, "authors", &columns));
        reserved.plan_hash = compute_plan_hash(&reserved)?;
        let error = runner
            .apply_migration_plan(request("req-reserved", reserved))
            .await
            .expect_err("reserved column");
        assert_eq!(error.code(), "INVALID_MIGRATION_PLAN");

        assert!(user_tables(&db).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn tampered_or_foreign_plans_are_rejected() -> anyhow::Result<()> {
        let (runner, db) = runner()?;
        let mut tampered = plan("sqlite");
        tampered.steps[1].sql = Some("CREATE TABLE \"other\" (\"id\" TEXT)".to_string());
        let error = runner
            .apply_migration_plan(request("req-1", tampered))
            .await
            .expect_err("hash");
        assert_eq!(error.code(), "PLAN_HASH_MISMATCH");
        assert_eq!(error.status(), 409);

        let error = runner
            .apply_migration_plan(request("req-2", plan("postgres")))
            .await
            .expect_err("engine");
        assert_eq!(error.code(), "UNSUPPORTED_ENGINE");
        assert_eq!(error.status(), 503);

        let mut empty = plan("sqlite");
        empty.steps.clear();
        let error = runner
            .apply_migration_plan(request("req-3", empty))
            .await
            .expect_err("empty");
        assert_eq!(error.code(), "INVALID_MIGRATION_PLAN");
        assert!(user_tables(&db).await?.is_empty());
        Ok(())
    }
}
