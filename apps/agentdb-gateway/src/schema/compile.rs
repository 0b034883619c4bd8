use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use super::dsl::{FieldSpec, SchemaDsl, TableSpec};
use crate::db::{SqlDialect, quote_ident};

pub const MIGRATION_PLAN_SCHEMA_VERSION: &str = "agentdb.migration_plan.v1";
pub const DETERMINISTIC_ORDER: &str = "tables_by_name_then_fields_by_position";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    EnsureDatabase,
    CreateTable,
}

impl StepAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnsureDatabase => "ensure_database",
            Self::CreateTable => "create_table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    pub step_id: String,
    pub action: StepAction,
    pub description: String,
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

impl MigrationStep {
    /// Table a `create_table` step creates, read from its metadata.
    pub fn table_name(&self) -> Option<&str> {
        self.metadata.get("tableName").and_then(Value::as_str)
    }

    /// Column definitions of a `create_table` step in plan order.
    pub fn columns(&self) -> Result<Vec<FieldSpec>, serde_json::Error> {
        let raw = self.metadata.get("columns").cloned().unwrap_or(Value::Null);
        let mut columns: Vec<FieldSpec> = serde_json::from_value(raw)?;
        sort_fields(&mut columns);
        Ok(columns)
    }
}

/// Compiled, content-addressed migration plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub schema_version: String,
    pub engine: SqlDialect,
    pub database_name: String,
    pub deterministic_order: String,
    pub steps: Vec<MigrationStep>,
    pub plan_hash: String,
}

impl MigrationPlan {
    pub fn verify_hash(&self) -> bool {
        compute_plan_hash(self).is_ok_and(|hash| hash == self.plan_hash)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|step| step.action == StepAction::CreateTable)
            .filter_map(MigrationStep::table_name)
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to canonicalize migration plan: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// SHA-256 over the canonical JSON of the plan with `planHash` removed.
pub fn compute_plan_hash(plan: &MigrationPlan) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(plan)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("planHash");
    }
    Ok(wallet_auth::sha256_hex(wallet_auth::canonical_json(&value)?))
}

pub fn compile_migration_plan(dsl: &SchemaDsl) -> Result<MigrationPlan, CompileError> {
    let engine = dsl.database.engine;
    let mut tables: Vec<&TableSpec> = dsl.tables.iter().collect();
    tables.sort_by(|left, right| left.name.cmp(&right.name));

    let mut steps = Vec::with_capacity(tables.len() + 1);
    steps.push(MigrationStep {
        step_id: step_id(1),
        action: StepAction::EnsureDatabase,
        description: format!("ensure database {} ({engine})", dsl.database.name),
        metadata: json!({
            "databaseName": dsl.database.name,
            "engine": engine,
            "description": dsl.database.description,
        }),
        sql: None,
    });

    for table in tables {
        let mut fields = table.fields.clone();
        sort_fields(&mut fields);
        let columns: Vec<Value> = fields
            .iter()
            .map(|field| {
                json!({
                    "name": field.name,
                    "type": field.field_type,
                    "sqlType": field.field_type.sql_type(engine),
                    "nullable": field.nullable,
                    "primaryKey": field.primary_key,
                    "position": field.position,
                })
            })
            .collect();
        steps.push(MigrationStep {
            step_id: step_id(steps.len() + 1),
            action: StepAction::CreateTable,
            description: format!("create table {}", table.name),
            metadata: json!({
                "tableName": table.name,
                "columns": columns,
            }),
            sql: Some(create_table_sql(engine, &table.name, &fields)),
        });
    }

    let mut plan = MigrationPlan {
        schema_version: MIGRATION_PLAN_SCHEMA_VERSION.to_string(),
        engine,
        database_name: dsl.database.name.clone(),
        deterministic_order: DETERMINISTIC_ORDER.to_string(),
        steps,
        plan_hash: String::new(),
    };
    plan.plan_hash = compute_plan_hash(&plan)?;
    Ok(plan)
}

fn step_id(ordinal: usize) -> String {
    format!("step_{ordinal:03}")
}

fn sort_fields(fields: &mut [FieldSpec]) {
    fields.sort_by(|left, right| {
        left.position
            .cmp(&right.position)
            .then_with(|| left.name.cmp(&right.name))
    });
}

/// DDL for one managed table. Plain `CREATE TABLE` so an existing table fails
/// the step instead of being silently kept.
pub fn create_table_sql(engine: SqlDialect, table: &str, fields: &[FieldSpec]) -> String {
    let columns = fields
        .iter()
        .map(|field| {
            let mut column = format!(
                "{} {}",
                quote_ident(&field.name),
                field.field_type.sql_type(engine)
            );
            if field.primary_key {
                column.push_str(" PRIMARY KEY");
            }
            if !field.nullable {
                column.push_str(" NOT NULL");
            }
            column
        })
        .collect::<Vec<_>>()
        .join(",\n  ");
    format!(
        "CREATE TABLE {} (\n  {columns}\n)",
        quote_ident(table)
    )
}
