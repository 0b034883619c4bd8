use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{
    Effect, Grant, GrantCriteria, GrantOperation, ListGrantsQuery, NewGrant, RevokeGrant,
    ScopeType,
};
use crate::db::{DbError, SqlDialect, SqlExecutor, SqlRow, SqlValue, Statement};

#[derive(Debug, Error)]
pub enum GrantStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Creates backing tables; a no-op for stores without a schema.
    async fn ensure_schema(&self) -> Result<(), GrantStoreError> {
        Ok(())
    }

    async fn count_active_grants(&self, tenant_id: &str) -> Result<u64, GrantStoreError>;

    /// Newest first (`created_at` desc, then `grant_id` desc).
    async fn list_grants(&self, query: &ListGrantsQuery) -> Result<Vec<Grant>, GrantStoreError>;

    async fn list_active_grants(
        &self,
        tenant_id: &str,
        wallet_address: Option<&str>,
    ) -> Result<Vec<Grant>, GrantStoreError> {
        self.list_grants(&ListGrantsQuery::active(tenant_id, wallet_address))
            .await
    }

    async fn get_grant_by_id(
        &self,
        tenant_id: &str,
        grant_id: &str,
    ) -> Result<Option<Grant>, GrantStoreError>;

    async fn find_active_equivalent(
        &self,
        criteria: &GrantCriteria,
    ) -> Result<Option<Grant>, GrantStoreError>;

    /// Persists a new grant under a fresh id. At most one active bootstrap
    /// grant may exist per tenant; a second one is a `Conflict`.
    async fn create_grant(&self, grant: NewGrant) -> Result<Grant, GrantStoreError>;

    /// Compare-and-swap on `revoked_at IS NULL`; `false` when nothing changed.
    async fn revoke_grant(&self, revoke: &RevokeGrant) -> Result<bool, GrantStoreError>;
}

pub fn memory() -> Arc<dyn GrantStore> {
    Arc::new(MemoryGrantStore::default())
}

pub fn sql(db: Arc<dyn SqlExecutor>) -> Arc<dyn GrantStore> {
    Arc::new(SqlGrantStore { db })
}

fn new_grant_id() -> String {
    format!("grant_{}", Uuid::now_v7().simple())
}

// Timestamps are stored at millisecond precision; returned grants match what a
// later read yields.
fn materialize(grant: NewGrant) -> Grant {
    Grant {
        grant_id: new_grant_id(),
        tenant_id: grant.tenant_id,
        wallet_address: grant.wallet_address,
        scope_type: grant.scope_type,
        scope_id: grant.scope_id,
        operation: grant.operation,
        effect: grant.effect,
        created_by: grant.created_by,
        created_at: grant.created_at.trunc_subsecs(3),
        signature_hash: grant.signature_hash,
        revoked_at: None,
        revoked_by: None,
        bootstrap: grant.bootstrap,
    }
}

fn newest_first(grants: &mut [Grant]) {
    grants.sort_by(|left, right| {
        right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| right.grant_id.cmp(&left.grant_id))
    });
}

#[derive(Default)]
struct MemoryGrantStore {
    inner: Mutex<Vec<Grant>>,
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn count_active_grants(&self, tenant_id: &str) -> Result<u64, GrantStoreError> {
        let grants = self.inner.lock().await;
        Ok(grants
            .iter()
            .filter(|grant| grant.tenant_id == tenant_id && grant.is_active())
            .count() as u64)
    }

    async fn list_grants(&self, query: &ListGrantsQuery) -> Result<Vec<Grant>, GrantStoreError> {
        let grants = self.inner.lock().await;
        let mut out = grants
            .iter()
            .filter(|grant| query.matches(grant))
            .cloned()
            .collect::<Vec<_>>();
        newest_first(&mut out);
        Ok(out)
    }

    async fn get_grant_by_id(
        &self,
        tenant_id: &str,
        grant_id: &str,
    ) -> Result<Option<Grant>, GrantStoreError> {
        let grants = self.inner.lock().await;
        Ok(grants
            .iter()
            .find(|grant| grant.tenant_id == tenant_id && grant.grant_id == grant_id)
            .cloned())
    }

    async fn find_active_equivalent(
        &self,
        criteria: &GrantCriteria,
    ) -> Result<Option<Grant>, GrantStoreError> {
        let grants = self.inner.lock().await;
        Ok(grants
            .iter()
            .find(|grant| grant.is_active() && criteria.matches(grant))
            .cloned())
    }

    async fn create_grant(&self, grant: NewGrant) -> Result<Grant, GrantStoreError> {
        let mut grants = self.inner.lock().await;
        if grant.bootstrap
            && grants.iter().any(|existing| {
                existing.bootstrap && existing.is_active() && existing.tenant_id == grant.tenant_id
            })
        {
            return Err(GrantStoreError::Conflict(
                "tenant already has an active bootstrap grant".to_string(),
            ));
        }
        let created = materialize(grant);
        grants.push(created.clone());
        Ok(created)
    }

    async fn revoke_grant(&self, revoke: &RevokeGrant) -> Result<bool, GrantStoreError> {
        let mut grants = self.inner.lock().await;
        let Some(grant) = grants.iter_mut().find(|grant| {
            grant.tenant_id == revoke.tenant_id
                && grant.grant_id == revoke.grant_id
                && grant.is_active()
        }) else {
            return Ok(false);
        };
        grant.revoked_at = Some(revoke.revoked_at.trunc_subsecs(3));
        grant.revoked_by = Some(revoke.revoked_by.clone());
        Ok(true)
    }
}

const GRANT_COLUMNS: &str = "grant_id, tenant_id, wallet_address, scope_type, scope_id, operation, effect, \
     created_by, created_at, signature_hash, revoked_at, revoked_by, bootstrap";

/// Portable across Postgres and SQLite: timestamps are RFC 3339 text with a
/// fixed width, so lexical order is chronological.
const GRANT_SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS policy_grants (
        grant_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        wallet_address TEXT NOT NULL,
        scope_type TEXT NOT NULL,
        scope_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        effect TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        signature_hash TEXT NOT NULL,
        revoked_at TEXT,
        revoked_by TEXT,
        bootstrap BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS policy_grants_active_wallet_idx
        ON policy_grants (tenant_id, wallet_address)
        WHERE revoked_at IS NULL
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS policy_grants_single_bootstrap_idx
        ON policy_grants (tenant_id)
        WHERE bootstrap = 1 AND revoked_at IS NULL
    "#,
];

struct SqlGrantStore {
    db: Arc<dyn SqlExecutor>,
}

impl SqlGrantStore {
    fn dialect(&self) -> SqlDialect {
        self.db.dialect()
    }

    fn p(&self, index: usize) -> String {
        self.dialect().placeholder(index)
    }

    async fn select(&self, sql: String, values: Vec<SqlValue>) -> Result<Vec<Grant>, GrantStoreError> {
        let outcome = self.db.execute(Statement::read(sql, values)).await?;
        outcome
            .rows
            .iter()
            .map(|row| map_grant_row(row).map_err(GrantStoreError::from))
            .collect()
    }
}

#[async_trait]
impl GrantStore for SqlGrantStore {
    async fn ensure_schema(&self) -> Result<(), GrantStoreError> {
        let statements = GRANT_SCHEMA
            .iter()
            .map(|sql| Statement::write(*sql, Vec::new()))
            .collect();
        self.db.run_in_transaction(statements).await?;
        Ok(())
    }

    async fn count_active_grants(&self, tenant_id: &str) -> Result<u64, GrantStoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS active_count FROM policy_grants \
             WHERE tenant_id = {} AND revoked_at IS NULL",
            self.p(1)
        );
        let outcome = self
            .db
            .execute(Statement::read(sql, vec![SqlValue::from(tenant_id)]))
            .await?;
        let count = match outcome.rows.first() {
            Some(row) => row.integer("active_count")?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn list_grants(&self, query: &ListGrantsQuery) -> Result<Vec<Grant>, GrantStoreError> {
        let mut sql = format!(
            "SELECT {GRANT_COLUMNS} FROM policy_grants WHERE tenant_id = {}",
            self.p(1)
        );
        let mut values = vec![SqlValue::from(query.tenant_id.as_str())];
        if let Some(wallet) = &query.wallet_address {
            values.push(SqlValue::from(wallet.to_ascii_lowercase()));
            sql.push_str(&format!(" AND wallet_address = {}", self.p(values.len())));
        }
        if !query.include_revoked {
            sql.push_str(" AND revoked_at IS NULL");
        }
        sql.push_str(" ORDER BY created_at DESC, grant_id DESC");
        self.select(sql, values).await
    }

    async fn get_grant_by_id(
        &self,
        tenant_id: &str,
        grant_id: &str,
    ) -> Result<Option<Grant>, GrantStoreError> {
        let sql = format!(
            "SELECT {GRANT_COLUMNS} FROM policy_grants WHERE tenant_id = {} AND grant_id = {}",
            self.p(1),
            self.p(2)
        );
        let grants = self
            .select(sql, vec![SqlValue::from(tenant_id), SqlValue::from(grant_id)])
            .await?;
        Ok(grants.into_iter().next())
    }

    async fn find_active_equivalent(
        &self,
        criteria: &GrantCriteria,
    ) -> Result<Option<Grant>, GrantStoreError> {
        let sql = format!(
            "SELECT {GRANT_COLUMNS} FROM policy_grants \
             WHERE tenant_id = {} AND wallet_address = {} AND scope_type = {} \
               AND scope_id = {} AND operation = {} AND effect = {} AND revoked_at IS NULL \
             ORDER BY created_at DESC, grant_id DESC",
            self.p(1),
            self.p(2),
            self.p(3),
            self.p(4),
            self.p(5),
            self.p(6)
        );
        let grants = self
            .select(
                sql,
                vec![
                    SqlValue::from(criteria.tenant_id.as_str()),
                    SqlValue::from(criteria.wallet_address.to_ascii_lowercase()),
                    SqlValue::from(criteria.scope_type.as_str()),
                    SqlValue::from(criteria.scope_id.as_str()),
                    SqlValue::from(criteria.operation.as_str()),
                    SqlValue::from(criteria.effect.as_str()),
                ],
            )
            .await?;
        Ok(grants.into_iter().next())
    }

    async fn create_grant(&self, grant: NewGrant) -> Result<Grant, GrantStoreError> {
        let created = materialize(grant);
        let placeholders = (1..=13).map(|index| self.p(index)).collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO policy_grants ({GRANT_COLUMNS}) VALUES ({})",
            placeholders.join(", ")
        );
        let values = vec![
            SqlValue::from(created.grant_id.as_str()),
            SqlValue::from(created.tenant_id.as_str()),
            SqlValue::from(created.wallet_address.as_str()),
            SqlValue::from(created.scope_type.as_str()),
            SqlValue::from(created.scope_id.as_str()),
            SqlValue::from(created.operation.as_str()),
            SqlValue::from(created.effect.as_str()),
            SqlValue::from(created.created_by.as_str()),
            SqlValue::from(format_timestamp(created.created_at)),
            SqlValue::from(created.signature_hash.as_str()),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::Integer(i64::from(created.bootstrap)),
        ];
        match self.db.execute(Statement::write(sql, values)).await {
            Ok(_) => Ok(created),
            Err(error) if error.is_constraint_violation() && created.bootstrap => Err(
                GrantStoreError::Conflict("tenant already has an active bootstrap grant".to_string()),
            ),
            Err(error) => Err(error.into()),
        }
    }

    async fn revoke_grant(&self, revoke: &RevokeGrant) -> Result<bool, GrantStoreError> {
        let sql = format!(
            "UPDATE policy_grants SET revoked_at = {}, revoked_by = {} \
             WHERE tenant_id = {} AND grant_id = {} AND revoked_at IS NULL",
            self.p(1),
            self.p(2),
            self.p(3),
            self.p(4)
        );
        let outcome = self
            .db
            .execute(Statement::write(
                sql,
                vec![
                    SqlValue::from(format_timestamp(revoke.revoked_at)),
                    SqlValue::from(revoke.revoked_by.as_str()),
                    SqlValue::from(revoke.tenant_id.as_str()),
                    SqlValue::from(revoke.grant_id.as_str()),
                ],
            ))
            .await?;
        Ok(outcome.rows_affected > 0)
    }
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|error| DbError::Decode(format!("invalid timestamp {raw}: {error}")))
}

fn map_grant_row(row: &SqlRow) -> Result<Grant, DbError> {
    let decode = |error: super::types::PolicyError| DbError::Decode(error.to_string());
    Ok(Grant {
        grant_id: row.text("grant_id")?,
        tenant_id: row.text("tenant_id")?,
        wallet_address: row.text("wallet_address")?,
        scope_type: ScopeType::parse(&row.text("scope_type")?).map_err(decode)?,
        scope_id: row.text("scope_id")?,
        operation: GrantOperation::parse(&row.text("operation")?).map_err(decode)?,
        effect: Effect::parse(&row.text("effect")?).map_err(decode)?,
        created_by: row.text("created_by")?,
        created_at: parse_timestamp(&row.text("created_at")?)?,
        signature_hash: row.text("signature_hash")?,
        revoked_at: row
            .optional_text("revoked_at")?
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        revoked_by: row.optional_text("revoked_by")?,
        bootstrap: row.integer("bootstrap")? != 0,
    })
}
