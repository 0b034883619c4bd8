use std::sync::Arc;

use chrono::SubsecRound;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use wallet_auth::{AuthenticatedMutation, MutationAuth, MutationRequest};

use super::authorization::{ActionAuthorizer, AuthorizationError};
use super::store::{GrantStore, GrantStoreError};
use super::types::{
    DATABASE_SCOPE_ID, DecisionRequest, Effect, Grant, GrantOperation, ListGrantsQuery, NewGrant,
    PolicyDecision, PolicyError, RevokeGrant, ScopeType, normalize_scope_id, validate_tenant_id,
};

pub const GRANT_CREATE_ACTION: &str = "policy.grant.create";
pub const GRANT_REVOKE_ACTION: &str = "policy.grant.revoke";

/// The grant being created, exactly as the actor signs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    pub wallet_address: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub operation: GrantOperation,
    pub effect: Effect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGrantRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub actor_wallet: String,
    #[serde(default)]
    pub auth: Option<MutationAuth>,
    pub grant: GrantSpec,
}

impl CreateGrantRequest {
    pub fn signing_payload(&self) -> Value {
        json!({
            "walletAddress": self.grant.wallet_address,
            "scopeType": self.grant.scope_type,
            "scopeId": self.grant.scope_id,
            "operation": self.grant.operation,
            "effect": self.grant.effect,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeGrantRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub actor_wallet: String,
    #[serde(default)]
    pub auth: Option<MutationAuth>,
    pub grant_id: String,
    /// Pins the revocation to the signature that issued the grant.
    #[serde(default)]
    pub expected_signature_hash: Option<String>,
}

impl RevokeGrantRequest {
    pub fn signing_payload(&self) -> Value {
        json!({
            "grantId": self.grant_id,
            "expectedSignatureHash": self.expected_signature_hash,
        })
    }
}

#[derive(Debug, Error)]
pub enum GrantServiceError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("tenant has no grants; the first grant must be the actor's own database:*:all:allow")]
    BootstrapRequired,
    #[error("actor lacks {operation} on {scope_type}:{scope_id}")]
    SelfEscalationBlocked {
        scope_type: ScopeType,
        scope_id: String,
        operation: GrantOperation,
        decision: Box<PolicyDecision>,
    },
    #[error("an equivalent active grant already exists: {grant_id}")]
    GrantAlreadyExists { grant_id: String },
    #[error("grant not found")]
    GrantNotFound,
    #[error("grant is already revoked")]
    GrantAlreadyRevoked,
    #[error("grant signature hash does not match the expected value")]
    TamperCheckFailed,
    #[error("another bootstrap grant was created concurrently")]
    BootstrapConflict,
}

impl From<PolicyError> for GrantServiceError {
    fn from(error: PolicyError) -> Self {
        Self::Authorization(AuthorizationError::InvalidRequest(error))
    }
}

impl From<GrantStoreError> for GrantServiceError {
    fn from(error: GrantStoreError) -> Self {
        Self::Authorization(AuthorizationError::Store(error))
    }
}

impl GrantServiceError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authorization(error) => error.code(),
            Self::BootstrapRequired => "BOOTSTRAP_REQUIRED",
            Self::SelfEscalationBlocked { .. } => "SELF_ESCALATION_BLOCKED",
            Self::GrantAlreadyExists { .. } => "GRANT_ALREADY_EXISTS",
            Self::GrantNotFound => "GRANT_NOT_FOUND",
            Self::GrantAlreadyRevoked => "GRANT_ALREADY_REVOKED",
            Self::TamperCheckFailed => "GRANT_TAMPER_CHECK_FAILED",
            Self::BootstrapConflict => "BOOTSTRAP_CONFLICT",
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Authorization(error) => error.status(),
            Self::BootstrapRequired | Self::SelfEscalationBlocked { .. } => 403,
            Self::GrantNotFound => 404,
            Self::GrantAlreadyExists { .. }
            | Self::GrantAlreadyRevoked
            | Self::TamperCheckFailed
            | Self::BootstrapConflict => 409,
        }
    }
}

/// Grant lifecycle: bootstrap, authority-checked creation and revocation.
pub struct GrantService {
    authorizer: Arc<ActionAuthorizer>,
    grants: Arc<dyn GrantStore>,
}

impl GrantService {
    pub fn new(authorizer: Arc<ActionAuthorizer>) -> Self {
        let grants = authorizer.grants();
        Self { authorizer, grants }
    }

    pub async fn create_grant(&self, request: CreateGrantRequest) -> Result<Grant, GrantServiceError> {
        let tenant_id = validate_tenant_id(&request.tenant_id)?;
        let wallet_address = wallet_auth::normalize_address(&request.grant.wallet_address)
            .map_err(|_| PolicyError::InvalidWalletAddress(request.grant.wallet_address.clone()))?;
        let scope_id = normalize_scope_id(request.grant.scope_type, &request.grant.scope_id)?;

        let authenticated = self.authenticate(
            &request,
            &tenant_id,
            GRANT_CREATE_ACTION,
            request.signing_payload(),
        )?;
        let actor = authenticated.actor_wallet.clone();

        let active = self.grants.count_active_grants(&tenant_id).await?;
        let bootstrap = active == 0;
        if bootstrap {
            let is_bootstrap_shape = wallet_address == actor
                && request.grant.scope_type == ScopeType::Database
                && scope_id == DATABASE_SCOPE_ID
                && request.grant.operation == GrantOperation::All
                && request.grant.effect == Effect::Allow;
            if !is_bootstrap_shape {
                tracing::warn!(
                    request_id = %request.request_id,
                    tenant_id = %tenant_id,
                    actor_wallet = %actor,
                    code = "BOOTSTRAP_REQUIRED",
                    "rejected non-bootstrap grant for tenant without grants"
                );
                return Err(GrantServiceError::BootstrapRequired);
            }
        } else {
            self.ensure_authority(
                &tenant_id,
                &actor,
                request.grant.scope_type,
                &scope_id,
                request.grant.operation,
            )
            .await?;
        }

        let new_grant = NewGrant {
            tenant_id: tenant_id.clone(),
            wallet_address,
            scope_type: request.grant.scope_type,
            scope_id,
            operation: request.grant.operation,
            effect: request.grant.effect,
            created_by: actor.clone(),
            created_at: self.authorizer.authenticator().clock().now(),
            signature_hash: authenticated.signature_hash.clone(),
            bootstrap,
        };
        if let Some(existing) = self.grants.find_active_equivalent(&new_grant.criteria()).await? {
            return Err(GrantServiceError::GrantAlreadyExists {
                grant_id: existing.grant_id,
            });
        }

        let grant = match self.grants.create_grant(new_grant).await {
            Ok(grant) => grant,
            Err(GrantStoreError::Conflict(_)) => return Err(GrantServiceError::BootstrapConflict),
            Err(error) => return Err(error.into()),
        };
        tracing::info!(
            request_id = %request.request_id,
            tenant_id = %tenant_id,
            actor_wallet = %actor,
            grant_id = %grant.grant_id,
            bootstrap,
            "policy grant created"
        );
        Ok(grant)
    }

    pub async fn revoke_grant(&self, request: RevokeGrantRequest) -> Result<Grant, GrantServiceError> {
        let tenant_id = validate_tenant_id(&request.tenant_id)?;
        let authenticated = self.authenticate(
            &request,
            &tenant_id,
            GRANT_REVOKE_ACTION,
            request.signing_payload(),
        )?;
        let actor = authenticated.actor_wallet;

        let grant = self
            .grants
            .get_grant_by_id(&tenant_id, request.grant_id.trim())
            .await?
            .ok_or(GrantServiceError::GrantNotFound)?;
        if !grant.is_active() {
            return Err(GrantServiceError::GrantAlreadyRevoked);
        }
        let pinned_elsewhere = request
            .expected_signature_hash
            .as_deref()
            .is_some_and(|expected| !expected.trim().eq_ignore_ascii_case(&grant.signature_hash));
        if pinned_elsewhere {
            tracing::warn!(
                request_id = %request.request_id,
                tenant_id = %tenant_id,
                grant_id = %grant.grant_id,
                code = "GRANT_TAMPER_CHECK_FAILED",
                "revocation pinned to a different signature"
            );
            return Err(GrantServiceError::TamperCheckFailed);
        }
        self.ensure_authority(
            &tenant_id,
            &actor,
            grant.scope_type,
            &grant.scope_id,
            grant.operation,
        )
        .await?;

        let revoke = RevokeGrant {
            tenant_id: tenant_id.clone(),
            grant_id: grant.grant_id.clone(),
            revoked_by: actor.clone(),
            revoked_at: self.authorizer.authenticator().clock().now().trunc_subsecs(3),
        };
        if !self.grants.revoke_grant(&revoke).await? {
            return Err(GrantServiceError::GrantAlreadyRevoked);
        }
        tracing::info!(
            request_id = %request.request_id,
            tenant_id = %tenant_id,
            actor_wallet = %actor,
            grant_id = %grant.grant_id,
            "policy grant revoked"
        );
        Ok(Grant {
            revoked_at: Some(revoke.revoked_at),
            revoked_by: Some(revoke.revoked_by),
            ..grant
        })
    }

    pub async fn list_grants(&self, query: &ListGrantsQuery) -> Result<Vec<Grant>, GrantServiceError> {
        let tenant_id = validate_tenant_id(&query.tenant_id)?;
        let wallet_address = query
            .wallet_address
            .as_deref()
            .map(|wallet| {
                wallet_auth::normalize_address(wallet)
                    .map_err(|_| PolicyError::InvalidWalletAddress(wallet.to_string()))
            })
            .transpose()?;
        Ok(self
            .grants
            .list_grants(&ListGrantsQuery {
                tenant_id,
                wallet_address,
                include_revoked: query.include_revoked,
            })
            .await?)
    }

    /// Dry-run evaluation with the full rule trace; nothing is authenticated or written.
    pub async fn preview_decision(
        &self,
        request: &DecisionRequest,
    ) -> Result<PolicyDecision, GrantServiceError> {
        Ok(self.authorizer.decide(request).await?)
    }

    // Every operation the grant implies must already be allowed for the actor.
    async fn ensure_authority(
        &self,
        tenant_id: &str,
        actor: &str,
        scope_type: ScopeType,
        scope_id: &str,
        operation: GrantOperation,
    ) -> Result<(), GrantServiceError> {
        for concrete in operation.expand() {
            let decision = self
                .authorizer
                .decide(&DecisionRequest {
                    tenant_id: tenant_id.to_string(),
                    wallet_address: actor.to_string(),
                    scope_type,
                    scope_id: scope_id.to_string(),
                    operation: concrete,
                })
                .await?;
            if !decision.allowed {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    actor_wallet = %actor,
                    scope_type = %scope_type,
                    scope_id = %scope_id,
                    operation = %concrete,
                    code = "SELF_ESCALATION_BLOCKED",
                    "actor lacks authority for grant change"
                );
                return Err(GrantServiceError::SelfEscalationBlocked {
                    scope_type,
                    scope_id: scope_id.to_string(),
                    operation: concrete,
                    decision: Box::new(decision),
                });
            }
        }
        Ok(())
    }

    fn authenticate(
        &self,
        request: &impl SignedGrantRequest,
        tenant_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<AuthenticatedMutation, GrantServiceError> {
        Ok(self.authorizer.authenticate(&MutationRequest {
            request_id: request.request_id().to_string(),
            tenant_id: tenant_id.to_string(),
            actor_wallet: request.actor_wallet().to_string(),
            action: action.to_string(),
            payload,
            auth: request.auth().cloned(),
        })?)
    }
}

trait SignedGrantRequest {
    fn request_id(&self) -> &str;
    fn actor_wallet(&self) -> &str;
    fn auth(&self) -> Option<&MutationAuth>;
}

impl SignedGrantRequest for CreateGrantRequest {
    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn actor_wallet(&self) -> &str {
        &self.actor_wallet
    }

    fn auth(&self) -> Option<&MutationAuth> {
        self.auth.as_ref()
    }
}

impl SignedGrantRequest for RevokeGrantRequest {
    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn actor_wallet(&self) -> &str {
        &self.actor_wallet
    }

    fn auth(&self) -> Option<&MutationAuth> {
        self.auth.as_ref()
    }
}
