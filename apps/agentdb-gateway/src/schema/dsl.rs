use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::SqlDialect;
use crate::policy::is_valid_identifier;

/// Identifiers no table or field may take: SQL keywords plus the gateway's
/// own metadata tables.
pub const RESERVED_WORDS: &[&str] = &[
    "all",
    "alter",
    "and",
    "any",
    "as",
    "asc",
    "between",
    "by",
    "case",
    "check",
    "column",
    "constraint",
    "create",
    "cross",
    "current_date",
    "current_time",
    "current_timestamp",
    "current_user",
    "default",
    "delete",
    "desc",
    "distinct",
    "drop",
    "else",
    "end",
    "except",
    "exists",
    "false",
    "fetch",
    "for",
    "foreign",
    "from",
    "full",
    "grant",
    "group",
    "having",
    "in",
    "index",
    "inner",
    "insert",
    "intersect",
    "into",
    "is",
    "join",
    "key",
    "left",
    "like",
    "limit",
    "not",
    "null",
    "offset",
    "on",
    "or",
    "order",
    "outer",
    "primary",
    "references",
    "returning",
    "revoke",
    "right",
    "select",
    "session_user",
    "set",
    "table",
    "then",
    "to",
    "true",
    "union",
    "unique",
    "update",
    "user",
    "using",
    "values",
    "view",
    "when",
    "where",
    "with",
    "managed_tables",
    "policy_grants",
    "schema_migration_history",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Numeric,
    Boolean,
    Timestamp,
    Jsonb,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Numeric => "numeric",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Jsonb => "jsonb",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "integer" => Some(Self::Integer),
            "numeric" => Some(Self::Numeric),
            "boolean" => Some(Self::Boolean),
            "timestamp" => Some(Self::Timestamp),
            "jsonb" => Some(Self::Jsonb),
            _ => None,
        }
    }

    pub fn sql_type(self, dialect: SqlDialect) -> &'static str {
        match (dialect, self) {
            (_, Self::Text) => "TEXT",
            (SqlDialect::Postgres, Self::Integer) => "BIGINT",
            (SqlDialect::Sqlite, Self::Integer | Self::Boolean) => "INTEGER",
            (_, Self::Numeric) => "NUMERIC",
            (SqlDialect::Postgres, Self::Boolean) => "BOOLEAN",
            (SqlDialect::Postgres, Self::Timestamp) => "TIMESTAMPTZ",
            (SqlDialect::Sqlite, Self::Timestamp | Self::Jsonb) => "TEXT",
            (SqlDialect::Postgres, Self::Jsonb) => "JSONB",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, normalized schema document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDsl {
    pub request_id: String,
    pub creator: Creator,
    pub database: DatabaseSpec,
    pub tables: Vec<TableSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub wallet_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    pub name: String,
    pub engine: SqlDialect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub nullable: bool,
    pub primary_key: bool,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code,
            message: message.into(),
        }
    }
}

/// Validates a raw schema document, collecting every issue instead of stopping
/// at the first one.
pub fn validate_schema_dsl(payload: &Value) -> Result<SchemaDsl, Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    let Some(root) = payload.as_object() else {
        return Err(vec![ValidationIssue::new(
            "$",
            "INVALID_PAYLOAD",
            "schema document must be a JSON object",
        )]);
    };

    let request_id = match root.get("requestId").and_then(Value::as_str).map(str::trim) {
        Some(request_id) if !request_id.is_empty() => request_id.to_string(),
        _ => {
            issues.push(ValidationIssue::new(
                "requestId",
                "REQUIRED",
                "requestId must be a non-empty string",
            ));
            String::new()
        }
    };

    let creator = validate_creator(root.get("creator"), &mut issues);
    let database = validate_database(root.get("database"), &mut issues);
    let tables = validate_tables(root.get("tables"), &mut issues);

    if !issues.is_empty() {
        return Err(issues);
    }
    match (creator, database) {
        (Some(creator), Some(database)) => Ok(SchemaDsl {
            request_id,
            creator,
            database,
            tables,
        }),
        _ => Err(vec![ValidationIssue::new(
            "$",
            "INVALID_PAYLOAD",
            "schema document is incomplete",
        )]),
    }
}

fn validate_creator(value: Option<&Value>, issues: &mut Vec<ValidationIssue>) -> Option<Creator> {
    let Some(raw) = value
        .and_then(Value::as_object)
        .and_then(|creator| creator.get("walletAddress"))
        .and_then(Value::as_str)
    else {
        issues.push(ValidationIssue::new(
            "creator.walletAddress",
            "REQUIRED",
            "creator.walletAddress must be a string",
        ));
        return None;
    };
    match wallet_auth::normalize_address(raw) {
        Ok(wallet_address) => Some(Creator { wallet_address }),
        Err(error) => {
            issues.push(ValidationIssue::new(
                "creator.walletAddress",
                "INVALID_WALLET_ADDRESS",
                error.to_string(),
            ));
            None
        }
    }
}

fn validate_database(
    value: Option<&Value>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<DatabaseSpec> {
    let Some(database) = value.and_then(Value::as_object) else {
        issues.push(ValidationIssue::new(
            "database",
            "REQUIRED",
            "database must be an object",
        ));
        return None;
    };
    let name = validate_identifier(database.get("name"), "database.name", issues);
    let engine = match database.get("engine").and_then(Value::as_str) {
        Some(raw) => {
            let engine = SqlDialect::parse(raw);
            if engine.is_none() {
                issues.push(ValidationIssue::new(
                    "database.engine",
                    "INVALID_ENGINE",
                    format!("unsupported engine {raw}; expected postgres or sqlite"),
                ));
            }
            engine
        }
        None => {
            issues.push(ValidationIssue::new(
                "database.engine",
                "REQUIRED",
                "database.engine must be a string",
            ));
            None
        }
    };
    let description = match database.get("description") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Some(_) => {
            issues.push(ValidationIssue::new(
                "database.description",
                "INVALID_TYPE",
                "database.description must be a string",
            ));
            None
        }
    };
    Some(DatabaseSpec {
        name: name?,
        engine: engine?,
        description,
    })
}

fn validate_tables(value: Option<&Value>, issues: &mut Vec<ValidationIssue>) -> Vec<TableSpec> {
    let Some(raw_tables) = value.and_then(Value::as_array) else {
        issues.push(ValidationIssue::new(
            "tables",
            "REQUIRED",
            "tables must be an array",
        ));
        return Vec::new();
    };
    if raw_tables.is_empty() {
        issues.push(ValidationIssue::new(
            "tables",
            "EMPTY_TABLES",
            "at least one table is required",
        ));
    }

    let mut seen = HashSet::new();
    let mut tables = Vec::with_capacity(raw_tables.len());
    for (index, raw_table) in raw_tables.iter().enumerate() {
        let path = format!("tables[{index}]");
        let Some(table) = raw_table.as_object() else {
            issues.push(ValidationIssue::new(
                path,
                "INVALID_TYPE",
                "table must be an object",
            ));
            continue;
        };
        let name = validate_identifier(table.get("name"), &format!("{path}.name"), issues);
        if let Some(name) = name.as_ref().filter(|name| !seen.insert((*name).clone())) {
            issues.push(ValidationIssue::new(
                format!("{path}.name"),
                "DUPLICATE_TABLE",
                format!("table {name} is declared more than once"),
            ));
        }
        let fields = validate_fields(table, &path, issues);
        if let Some(name) = name {
            tables.push(TableSpec { name, fields });
        }
    }
    tables
}

fn validate_fields(
    table: &Map<String, Value>,
    table_path: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Vec<FieldSpec> {
    let fields_path = format!("{table_path}.fields");
    let Some(raw_fields) = table.get("fields").and_then(Value::as_array) else {
        issues.push(ValidationIssue::new(
            fields_path,
            "REQUIRED",
            "fields must be an array",
        ));
        return Vec::new();
    };
    if raw_fields.is_empty() {
        issues.push(ValidationIssue::new(
            fields_path.clone(),
            "EMPTY_FIELDS",
            "at least one field is required",
        ));
    }

    let mut names = HashSet::new();
    let mut positions = BTreeMap::new();
    let mut primary_keys = 0_usize;
    let mut fields = Vec::with_capacity(raw_fields.len());
    for (index, raw_field) in raw_fields.iter().enumerate() {
        let path = format!("{fields_path}[{index}]");
        let Some(field) = raw_field.as_object() else {
            issues.push(ValidationIssue::new(
                path,
                "INVALID_TYPE",
                "field must be an object",
            ));
            continue;
        };

        let name = validate_identifier(field.get("name"), &format!("{path}.name"), issues);
        if let Some(name) = name.as_ref().filter(|name| !names.insert((*name).clone())) {
            issues.push(ValidationIssue::new(
                format!("{path}.name"),
                "DUPLICATE_FIELD",
                format!("field {name} is declared more than once"),
            ));
        }

        let field_type = match field.get("type").and_then(Value::as_str) {
            Some(raw) => {
                let parsed = FieldType::parse(raw);
                if parsed.is_none() {
                    issues.push(ValidationIssue::new(
                        format!("{path}.type"),
                        "INVALID_FIELD_TYPE",
                        format!(
                            "unsupported type {raw}; expected text, integer, numeric, boolean, timestamp or jsonb"
                        ),
                    ));
                }
                parsed
            }
            None => {
                issues.push(ValidationIssue::new(
                    format!("{path}.type"),
                    "REQUIRED",
                    "type must be a string",
                ));
                None
            }
        };

        let primary_key = optional_bool(field.get("primaryKey"), &format!("{path}.primaryKey"), issues)
            .unwrap_or(false);
        let nullable = optional_bool(field.get("nullable"), &format!("{path}.nullable"), issues);
        if primary_key {
            primary_keys += 1;
            if primary_keys > 1 {
                issues.push(ValidationIssue::new(
                    format!("{path}.primaryKey"),
                    "MULTIPLE_PRIMARY_KEYS",
                    "a table may declare at most one primary key field",
                ));
            }
            if nullable == Some(true) {
                issues.push(ValidationIssue::new(
                    format!("{path}.nullable"),
                    "PRIMARY_KEY_NULLABLE",
                    "a primary key field cannot be nullable",
                ));
            }
        }

        let default_position = u32::try_from(index).unwrap_or(u32::MAX);
        let position = match field.get("position") {
            None | Some(Value::Null) => Some(default_position),
            Some(raw) => {
                let parsed = raw.as_u64().and_then(|value| u32::try_from(value).ok());
                if parsed.is_none() {
                    issues.push(ValidationIssue::new(
                        format!("{path}.position"),
                        "INVALID_POSITION",
                        "position must be a non-negative integer",
                    ));
                }
                parsed
            }
        };
        let duplicate = position.and_then(|position| {
            positions
                .insert(position, index)
                .map(|previous| (position, previous))
        });
        if let Some((position, previous)) = duplicate {
            issues.push(ValidationIssue::new(
                format!("{path}.position"),
                "DUPLICATE_POSITION",
                format!("position {position} is already used by {fields_path}[{previous}]"),
            ));
        }

        if let (Some(name), Some(field_type), Some(position)) = (name, field_type, position) {
            fields.push(FieldSpec {
                name,
                field_type,
                nullable: !primary_key && nullable.unwrap_or(true),
                primary_key,
                position,
            });
        }
    }
    fields
}

fn validate_identifier(
    value: Option<&Value>,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    let Some(raw) = value.and_then(Value::as_str) else {
        issues.push(ValidationIssue::new(
            path,
            "REQUIRED",
            "identifier must be a string",
        ));
        return None;
    };
    let normalized = raw.trim().to_ascii_lowercase();
    if !is_valid_identifier(&normalized) {
        issues.push(ValidationIssue::new(
            path,
            "INVALID_IDENTIFIER",
            format!("{raw} must match ^[a-z][a-z0-9_]{{0,62}}$"),
        ));
        return None;
    }
    if RESERVED_WORDS.contains(&normalized.as_str()) {
        issues.push(ValidationIssue::new(
            path,
            "RESERVED_IDENTIFIER",
            format!("{normalized} is a reserved word"),
        ));
        return None;
    }
    Some(normalized)
}

fn optional_bool(
    value: Option<&Value>,
    path: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Option<bool> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Bool(flag)) => Some(*flag),
        Some(_) => {
            issues.push(ValidationIssue::new(
                path,
                "INVALID_TYPE",
                "expected a boolean",
            ));
            None
        }
    }
}
