use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use wallet_auth::MutationAuth;

use super::compile::{CompileError, MigrationPlan, compile_migration_plan};
use super::dsl::{ValidationIssue, validate_schema_dsl};
use crate::migration::{AppliedMigration, ApplyMigrationRequest, MigrationError, MigrationRunner};
use crate::policy::{
    ActionAuthorizer, AuthorizationError, AuthorizationRequest, DATABASE_SCOPE_ID,
    GrantOperation, PolicyDecision, ScopeType, forbidden_override_key,
};

pub const SCHEMA_APPLY_ACTION: &str = "schema.apply";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySchemaRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub actor_wallet: String,
    #[serde(default)]
    pub auth: Option<MutationAuth>,
    pub schema: Value,
    /// Hash of a previously reviewed plan; apply refuses if compilation drifts.
    #[serde(default)]
    pub expected_plan_hash: Option<String>,
}

impl ApplySchemaRequest {
    pub fn signing_payload(&self) -> Value {
        json!({
            "schema": self.schema,
            "expectedPlanHash": self.expected_plan_hash,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedSchema {
    pub actor_wallet: String,
    pub signature_hash: String,
    pub decision: PolicyDecision,
    pub plan: MigrationPlan,
    pub migration: AppliedMigration,
}

#[derive(Debug, Error)]
pub enum SchemaServiceError {
    #[error("schema document has {} validation issue(s)", .issues.len())]
    Validation { issues: Vec<ValidationIssue> },
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("compiled plan hash {actual} does not match expected {expected}")]
    PlanHashMismatch { expected: String, actual: String },
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl SchemaServiceError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "SCHEMA_VALIDATION_FAILED",
            Self::Authorization(error) => error.code(),
            Self::Compile(_) => "PLAN_COMPILE_FAILED",
            Self::PlanHashMismatch { .. } => "PLAN_HASH_MISMATCH",
            Self::Migration(error) => error.code(),
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authorization(error) => error.status(),
            Self::Compile(_) => 500,
            Self::PlanHashMismatch { .. } => 409,
            Self::Migration(error) => error.status(),
        }
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Self::Validation { issues } => issues,
            _ => &[],
        }
    }
}

/// Validate, authorize, compile and apply a schema document.
pub struct SchemaService {
    authorizer: Arc<ActionAuthorizer>,
    runner: Arc<MigrationRunner>,
}

impl SchemaService {
    pub fn new(authorizer: Arc<ActionAuthorizer>, runner: Arc<MigrationRunner>) -> Self {
        Self { authorizer, runner }
    }

    /// Validation and compilation only; nothing is authenticated or written.
    pub fn preview(&self, schema: &Value) -> Result<MigrationPlan, SchemaServiceError> {
        let dsl = validate_schema_dsl(schema)
            .map_err(|issues| SchemaServiceError::Validation { issues })?;
        Ok(compile_migration_plan(&dsl)?)
    }

    pub async fn apply(
        &self,
        request: ApplySchemaRequest,
    ) -> Result<AppliedSchema, SchemaServiceError> {
        let dsl = validate_schema_dsl(&request.schema)
            .map_err(|issues| SchemaServiceError::Validation { issues })?;
        if let Some(key) = forbidden_override_key(&request.schema) {
            return Err(AuthorizationError::ForbiddenOverride { key }.into());
        }

        let action_payload = request.signing_payload();
        let authorized = self
            .authorizer
            .authorize(AuthorizationRequest {
                request_id: request.request_id.clone(),
                tenant_id: request.tenant_id.clone(),
                actor_wallet: request.actor_wallet,
                auth: request.auth,
                action: SCHEMA_APPLY_ACTION.to_string(),
                action_payload,
                scope_type: ScopeType::Database,
                scope_id: DATABASE_SCOPE_ID.to_string(),
                operation: GrantOperation::Alter,
            })
            .await?;

        let plan = compile_migration_plan(&dsl)?;
        let drifted = request
            .expected_plan_hash
            .as_deref()
            .map(str::trim)
            .filter(|expected| !expected.eq_ignore_ascii_case(&plan.plan_hash));
        if let Some(expected) = drifted {
            tracing::warn!(
                request_id = %request.request_id,
                tenant_id = %request.tenant_id,
                plan_hash = %plan.plan_hash,
                expected_plan_hash = %expected,
                code = "PLAN_HASH_MISMATCH",
                "compiled plan drifted from the reviewed draft"
            );
            return Err(SchemaServiceError::PlanHashMismatch {
                expected: expected.to_string(),
                actual: plan.plan_hash,
            });
        }

        let migration = self
            .runner
            .apply_migration_plan(ApplyMigrationRequest {
                tenant_id: request.tenant_id,
                request_id: request.request_id,
                migration_plan: plan.clone(),
            })
            .await?;
        Ok(AppliedSchema {
            actor_wallet: authorized.actor_wallet,
            signature_hash: authorized.signature_hash,
            decision: authorized.decision,
            plan,
            migration,
        })
    }
}
