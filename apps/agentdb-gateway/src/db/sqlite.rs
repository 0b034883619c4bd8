use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{Connection, ErrorCode, params_from_iter};

use super::{AccessMode, DbError, QueryOutcome, SqlDialect, SqlExecutor, SqlRow, SqlValue, Statement};

/// SQLite executor over a single shared connection. Statements run on the
/// blocking pool so file I/O never stalls the async workers.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|error| DbError::Connect(error.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn =
            Connection::open_in_memory().map_err(|error| DbError::Connect(error.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_connection<T, F>(&self, work: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            work(&mut *guard)
        })
        .await
        .map_err(|error| DbError::Unavailable(format!("sqlite worker failed: {error}")))?
    }
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, statement: Statement) -> Result<QueryOutcome, DbError> {
        self.with_connection(move |conn| run_statement(conn, &statement))
            .await
    }

    async fn run_in_transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Result<Vec<QueryOutcome>, DbError> {
        self.with_connection(move |conn| run_batch(conn, &statements))
            .await
    }
}

fn run_batch(conn: &mut Connection, statements: &[Statement]) -> Result<Vec<QueryOutcome>, DbError> {
    let tx = conn.transaction().map_err(map_error)?;
    let mut outcomes = Vec::with_capacity(statements.len());
    for (index, statement) in statements.iter().enumerate() {
        // Dropping `tx` on the error path rolls the whole batch back.
        outcomes.push(run_statement(&tx, statement).map_err(|error| error.at_statement(index))?);
    }
    tx.commit().map_err(map_error)?;
    Ok(outcomes)
}

fn run_statement(conn: &Connection, statement: &Statement) -> Result<QueryOutcome, DbError> {
    match statement.mode {
        AccessMode::Write => {
            let affected = conn
                .execute(&statement.sql, params_from_iter(statement.values.iter()))
                .map_err(map_error)?;
            Ok(QueryOutcome {
                rows: Vec::new(),
                rows_affected: affected as u64,
            })
        }
        AccessMode::Read => {
            let mut prepared = conn.prepare(&statement.sql).map_err(map_error)?;
            let columns = prepared
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            let mut rows = prepared
                .query(params_from_iter(statement.values.iter()))
                .map_err(map_error)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(map_error)? {
                let mut values = Vec::with_capacity(columns.len());
                for (index, name) in columns.iter().enumerate() {
                    let raw = row.get_ref(index).map_err(map_error)?;
                    values.push((name.clone(), decode_value(name, raw)?));
                }
                out.push(SqlRow::new(values));
            }
            Ok(QueryOutcome {
                rows: out,
                rows_affected: 0,
            })
        }
    }
}

fn decode_value(column: &str, raw: ValueRef<'_>) -> Result<SqlValue, DbError> {
    match raw {
        ValueRef::Null => Ok(SqlValue::Null),
        ValueRef::Integer(integer) => Ok(SqlValue::Integer(integer)),
        ValueRef::Real(real) => Ok(SqlValue::Real(real)),
        ValueRef::Text(bytes) => String::from_utf8(bytes.to_vec())
            .map(SqlValue::Text)
            .map_err(|error| DbError::Decode(format!("column {column}: {error}"))),
        ValueRef::Blob(_) => Err(DbError::UnsupportedColumnType {
            column: column.to_string(),
            type_name: "BLOB".to_string(),
        }),
    }
}

fn map_error(error: rusqlite::Error) -> DbError {
    let code = match &error {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    };
    match code {
        Some(ErrorCode::ConstraintViolation) => DbError::Constraint {
            statement: None,
            message: error.to_string(),
        },
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::CannotOpen
            | ErrorCode::OutOfMemory,
        ) => DbError::Unavailable(error.to_string()),
        _ => DbError::query(error.to_string()),
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Self::Bool(flag) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*flag))),
            Self::Integer(integer) => ToSqlOutput::Owned(SqliteValue::Integer(*integer)),
            Self::Real(real) => ToSqlOutput::Owned(SqliteValue::Real(*real)),
            Self::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteExecutor;
    use crate::db::{SqlExecutor, SqlValue, Statement};

    #[tokio::test]
    async fn reads_return_named_columns() -> anyhow::Result<()> {
        let db = SqliteExecutor::open_in_memory()?;
        db.execute(Statement::write(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, score REAL, archived INTEGER)",
            Vec::new(),
        ))
        .await?;
        let inserted = db
            .execute(Statement::write(
                "INSERT INTO notes (id, body, score, archived) VALUES (?1, ?2, ?3, ?4)",
                vec![
                    SqlValue::Integer(1),
                    SqlValue::from("hello"),
                    SqlValue::Real(0.5),
                    SqlValue::Bool(true),
                ],
            ))
            .await?;
        assert_eq!(inserted.rows_affected, 1);

        let outcome = db
            .execute(Statement::read(
                "SELECT id, body, score, archived FROM notes WHERE id = ?1",
                vec![SqlValue::Integer(1)],
            ))
            .await?;
        assert_eq!(outcome.rows.len(), 1);
        let row = &outcome.rows[0];
        assert_eq!(row.text("body")?, "hello");
        assert_eq!(row.integer("archived")?, 1);
        assert_eq!(row.get("score"), Some(&SqlValue::Real(0.5)));
        Ok(())
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_earlier_statements() -> anyhow::Result<()> {
        let db = SqliteExecutor::open_in_memory()?;
        let error = db
            .run_in_transaction(vec![
                Statement::write("CREATE TABLE kept (id INTEGER)", Vec::new()),
                Statement::write("CREATE TABLE broken (", Vec::new()),
            ])
            .await
            .expect_err("batch should fail");
        assert_eq!(error.failed_statement(), Some(1));

        let tables = db
            .execute(Statement::read(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'kept'",
                Vec::new(),
            ))
            .await?;
        assert!(tables.rows.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unique_violations_are_constraint_errors() -> anyhow::Result<()> {
        let db = SqliteExecutor::open_in_memory()?;
        db.execute(Statement::write("CREATE TABLE t (id TEXT PRIMARY KEY)", Vec::new()))
            .await?;
        let insert = Statement::write("INSERT INTO t (id) VALUES (?1)", vec![SqlValue::from("a")]);
        db.execute(insert.clone()).await?;
        let error = db.execute(insert).await.expect_err("duplicate");
        assert!(error.is_constraint_violation());
        Ok(())
    }

    #[tokio::test]
    async fn caller_mistakes_are_rejected_statements() -> anyhow::Result<()> {
        let db = SqliteExecutor::open_in_memory()?;
        db.execute(Statement::write(
            "CREATE TABLE t (id TEXT PRIMARY KEY, body TEXT NOT NULL)",
            Vec::new(),
        ))
        .await?;

        let error = db
            .execute(Statement::write(
                "INSERT INTO t (id) VALUES (?1)",
                vec![SqlValue::from("a")],
            ))
            .await
            .expect_err("not null");
        assert!(error.is_constraint_violation());

        let error = db
            .execute(Statement::read("SELECT missing FROM t", Vec::new()))
            .await
            .expect_err("unknown column");
        assert!(error.is_rejected_statement());
        assert!(!error.is_unavailable());
        Ok(())
    }

    #[tokio::test]
    async fn file_backed_connection_is_shared_across_tasks() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = SqliteExecutor::open(dir.path().join("shared.db"))?;
        db.execute(Statement::write("CREATE TABLE t (id INTEGER)", Vec::new()))
            .await?;
        let writers = (0..4).map(|id| {
            let db = db.clone();
            tokio::spawn(async move {
                db.execute(Statement::write(
                    "INSERT INTO t (id) VALUES (?1)",
                    vec![SqlValue::Integer(id)],
                ))
                .await
            })
        });
        for writer in writers.collect::<Vec<_>>() {
            writer.await??;
        }
        let count = db
            .execute(Statement::read("SELECT COUNT(*) AS n FROM t", Vec::new()))
            .await?;
        assert_eq!(count.rows[0].integer("n")?, 4);
        Ok(())
    }
}
