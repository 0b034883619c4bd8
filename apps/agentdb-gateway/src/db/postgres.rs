use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, GenericClient, NoTls, Row};

use super::{
    AccessMode, DbError, QueryOutcome, SqlDialect, SqlExecutor, SqlRow, SqlValue, Statement,
    redact_url,
};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Postgres executor sharing one client; the connection task runs in the background.
#[derive(Clone)]
pub struct PostgresExecutor {
    client: Arc<Mutex<Client>>,
}

impl PostgresExecutor {
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|error| {
                DbError::Connect(format!("{}: {error}", redact_url(database_url)))
            })?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "agentdb postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn execute(&self, statement: Statement) -> Result<QueryOutcome, DbError> {
        let client = self.client.lock().await;
        run_statement(&*client, &statement).await
    }

    async fn run_in_transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<QueryOutcome>, DbError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(map_error)?;
        let mut outcomes = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            match run_statement(&tx, statement).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        tracing::error!(reason = %rollback_error, "agentdb postgres rollback failed");
                    }
                    return Err(error.at_statement(index));
                }
            }
        }
        tx.commit().await.map_err(map_error)?;
        Ok(outcomes)
    }
}

async fn run_statement<C: GenericClient + Sync>(
    client: &C,
    statement: &Statement,
) -> Result<QueryOutcome, DbError> {
    let prepared = client.prepare(&statement.sql).await.map_err(map_error)?;
    let params = statement
        .values
        .iter()
        .zip(prepared.params())
        .map(|(value, ty)| bind_param(value, ty))
        .collect::<Result<Vec<_>, _>>()?;
    let refs = params
        .iter()
        .map(|param| param.as_ref() as &(dyn ToSql + Sync))
        .collect::<Vec<_>>();

    match statement.mode {
        AccessMode::Write => {
            let affected = client.execute(&prepared, &refs).await.map_err(map_error)?;
            Ok(QueryOutcome {
                rows: Vec::new(),
                rows_affected: affected,
            })
        }
        AccessMode::Read => {
            let rows = client.query(&prepared, &refs).await.map_err(map_error)?;
            let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
            Ok(QueryOutcome {
                rows,
                rows_affected: 0,
            })
        }
    }
}

// Binds by the parameter type Postgres inferred, since the wire protocol is typed.
fn bind_param(value: &SqlValue, ty: &Type) -> Result<BoxedParam, DbError> {
    let mismatch = || DbError::query(format!("cannot bind {value:?} as {ty}"));
    let param: BoxedParam = match value {
        SqlValue::Null => match *ty {
            Type::BOOL => Box::new(None::<bool>),
            Type::INT2 => Box::new(None::<i16>),
            Type::INT4 => Box::new(None::<i32>),
            Type::INT8 => Box::new(None::<i64>),
            Type::FLOAT4 => Box::new(None::<f32>),
            Type::FLOAT8 => Box::new(None::<f64>),
            Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
            Type::JSON | Type::JSONB => Box::new(None::<Value>),
            Type::NUMERIC => Box::new(None::<Decimal>),
            _ => Box::new(None::<String>),
        },
        SqlValue::Bool(flag) => match *ty {
            Type::INT2 | Type::INT4 | Type::INT8 => {
                return bind_param(&SqlValue::Integer(i64::from(*flag)), ty);
            }
            Type::TEXT | Type::VARCHAR => Box::new(flag.to_string()),
            _ => Box::new(*flag),
        },
        SqlValue::Integer(integer) => match *ty {
            Type::INT2 => Box::new(i16::try_from(*integer).map_err(|_| mismatch())?),
            Type::INT4 => Box::new(i32::try_from(*integer).map_err(|_| mismatch())?),
            Type::FLOAT4 => Box::new(*integer as f32),
            Type::FLOAT8 => Box::new(*integer as f64),
            Type::BOOL => Box::new(*integer != 0),
            Type::NUMERIC => Box::new(Decimal::from(*integer)),
            Type::TEXT | Type::VARCHAR => Box::new(integer.to_string()),
            Type::JSON | Type::JSONB => Box::new(Value::from(*integer)),
            _ => Box::new(*integer),
        },
        SqlValue::Real(real) => match *ty {
            Type::FLOAT4 => Box::new(*real as f32),
            Type::NUMERIC => Box::new(Decimal::try_from(*real).map_err(|_| mismatch())?),
            Type::TEXT | Type::VARCHAR => Box::new(real.to_string()),
            Type::JSON | Type::JSONB => Box::new(Value::from(*real)),
            _ => Box::new(*real),
        },
        SqlValue::Text(text) => match *ty {
            Type::TIMESTAMPTZ => Box::new(
                DateTime::parse_from_rfc3339(text)
                    .map_err(|_| mismatch())?
                    .with_timezone(&Utc),
            ),
            Type::JSON | Type::JSONB => {
                Box::new(serde_json::from_str::<Value>(text).map_err(|_| mismatch())?)
            }
            Type::INT8 => Box::new(text.parse::<i64>().map_err(|_| mismatch())?),
            Type::NUMERIC => Box::new(Decimal::from_str(text.trim()).map_err(|_| mismatch())?),
            Type::BOOL => Box::new(text.parse::<bool>().map_err(|_| mismatch())?),
            _ => Box::new(text.clone()),
        },
    };
    Ok(param)
}

fn decode_row(row: &Row) -> Result<SqlRow, DbError> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let decode = |error: tokio_postgres::Error| {
            DbError::Decode(format!("column {}: {error}", column.name()))
        };
        let value = match *column.type_() {
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
                .try_get::<_, Option<String>>(index)
                .map_err(decode)?
                .into(),
            Type::INT8 => row.try_get::<_, Option<i64>>(index).map_err(decode)?.into(),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(index)
                .map_err(decode)?
                .map(i64::from)
                .into(),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(index)
                .map_err(decode)?
                .map(i64::from)
                .into(),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(index)
                .map_err(decode)?
                .map_or(SqlValue::Null, SqlValue::Real),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(index)
                .map_err(decode)?
                .map_or(SqlValue::Null, |real| SqlValue::Real(f64::from(real))),
            Type::BOOL => row.try_get::<_, Option<bool>>(index).map_err(decode)?.into(),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(index)
                .map_err(decode)?
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
                .into(),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<Value>>(index)
                .map_err(decode)?
                .map(|json| json.to_string())
                .into(),
            // Exact decimals travel as text so no precision is lost in JSON.
            Type::NUMERIC => row
                .try_get::<_, Option<Decimal>>(index)
                .map_err(decode)?
                .map(|decimal| decimal.to_string())
                .into(),
            ref other => {
                return Err(DbError::UnsupportedColumnType {
                    column: column.name().to_string(),
                    type_name: other.name().to_string(),
                });
            }
        };
        values.push((column.name().to_string(), value));
    }
    Ok(SqlRow::new(values))
}

fn map_error(error: tokio_postgres::Error) -> DbError {
    if let Some(state) = error.code() {
        return from_sqlstate(state.code(), error.to_string());
    }
    let io_failure = error.is_closed()
        || std::error::Error::source(&error).is_some_and(|source| source.is::<std::io::Error>());
    if io_failure {
        DbError::Unavailable(error.to_string())
    } else {
        DbError::query(error.to_string())
    }
}

// Class 23 is integrity violations; 08, 40, 53, 57 and 58 are the connection,
// rollback, resource and operator classes a retry can clear.
fn from_sqlstate(code: &str, message: String) -> DbError {
    match code.get(..2) {
        Some("23") => DbError::Constraint {
            statement: None,
            message,
        },
        Some("08" | "40" | "53" | "57" | "58") => DbError::Unavailable(message),
        _ => DbError::query(message),
    }
}
