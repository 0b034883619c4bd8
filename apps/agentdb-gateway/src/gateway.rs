use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use wallet_auth::{Clock, Eip191Signer, MutationAuthenticator, NonceStore, SystemClock};

use crate::config::Config;
use crate::data_ops::DataOperationService;
use crate::db::{self, SqlExecutor, redact_url};
use crate::migration::MigrationRunner;
use crate::policy::{ActionAuthorizer, GrantService, store};
use crate::schema::SchemaService;


/// Every service wired to one database, one nonce store and one clock.
pub struct Gateway {
    config: Config,
    db: Arc<dyn SqlExecutor>,
    authorizer: Arc<ActionAuthorizer>,
    migrations: Arc<MigrationRunner>,
    grants: GrantService,
    schema: SchemaService,
    data: DataOperationService,
}

impl Gateway {
    pub async fn from_config(config: Config) -> Result<Self> {
        let url = config
            .db_url
            .clone()
            .ok_or_else(|| anyhow!("AGENTDB_DB_URL (or DATABASE_URL) is not set"))?;
        let db = db::connect(&url)
            .await
            .with_context(|| format!("failed to open database {}", redact_url(&url)))?;
        Self::with_executor(config, db, Arc::new(SystemClock)).await
    }

    /// Builds the gateway on an existing executor and creates the metadata tables.
    pub async fn with_executor(
        config: Config,
        db: Arc<dyn SqlExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let authenticator = Arc::new(MutationAuthenticator::new(
            config.mutation_auth,
            Arc::new(NonceStore::new(config.nonce_store)),
            Arc::new(Eip191Signer),
            Arc::clone(&clock),
        ));
        let grant_store = store::sql(Arc::clone(&db));
        grant_store
            .ensure_schema()
            .await
            .context("failed to create policy grant tables")?;
        let migrations = Arc::new(MigrationRunner::new(Arc::clone(&db), clock));
        migrations
            .ensure_schema()
            .await
            .context("failed to create migration metadata tables")?;

        let authorizer = Arc::new(ActionAuthorizer::new(authenticator, grant_store));
        let grants = GrantService::new(Arc::clone(&authorizer));
        let schema = SchemaService::new(Arc::clone(&authorizer), Arc::clone(&migrations));
        let data = DataOperationService::new(
            Arc::clone(&authorizer),
            Arc::clone(&migrations),
            Arc::clone(&db),
        );
        tracing::info!(
            dialect = %db.dialect(),
            auth_bypass = config.mutation_auth.bypass,
            nonce_ttl_seconds = config.mutation_auth.nonce_ttl_seconds,
            "gateway ready"
        );
        Ok(Self {
            config,
            db,
            authorizer,
            migrations,
            grants,
            schema,
            data,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> Arc<dyn SqlExecutor> {
        Arc::clone(&self.db)
    }

    pub fn authorizer(&self) -> &ActionAuthorizer {
        &self.authorizer
    }

    pub fn migrations(&self) -> &MigrationRunner {
        &self.migrations
    }

    pub fn grants(&self) -> &GrantService {
        &self.grants
    }

    pub fn schema(&self) -> &SchemaService {
        &self.schema
    }

    pub fn data(&self) -> &DataOperationService {
        &self.data
    }
}
