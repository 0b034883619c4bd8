use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use wallet_auth::{
    AuthenticatedMutation, MutationAuth, MutationAuthError, MutationAuthenticator, MutationRequest,
};

use super::engine;
use super::store::{GrantStore, GrantStoreError};
use super::types::{
    DecisionRequest, GrantOperation, PolicyDecision, PolicyError, ScopeType, normalize_scope_id,
    validate_tenant_id,
};

/// Payload keys an agent could use to claim elevated authority. Matched
/// case-insensitively at the top level of the action payload.
pub const FORBIDDEN_OVERRIDE_KEYS: [&str; 9] = [
    "bypassPolicy",
    "policyBypass",
    "skipAuthorization",
    "skipPolicy",
    "forceAllow",
    "isAdmin",
    "adminOverride",
    "elevated",
    "superuser",
];

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub actor_wallet: String,
    pub auth: Option<MutationAuth>,
    pub action: String,
    pub action_payload: Value,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub operation: GrantOperation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedAction {
    pub actor_wallet: String,
    pub signature_hash: String,
    pub decision: PolicyDecision,
    pub authenticated: AuthenticatedMutation,
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error(transparent)]
    InvalidRequest(#[from] PolicyError),
    #[error("payload sets forbidden override flag {key}")]
    ForbiddenOverride { key: String },
    #[error(transparent)]
    Authentication(#[from] MutationAuthError),
    #[error("policy denied: {}", .decision.message)]
    PolicyDenied { decision: Box<PolicyDecision> },
    #[error("grant store unavailable: {0}")]
    Store(#[from] GrantStoreError),
}

impl AuthorizationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(error) => error.code(),
            Self::ForbiddenOverride { .. } => "FORBIDDEN_OVERRIDE_FLAG",
            Self::Authentication(error) => error.code(),
            Self::PolicyDenied { .. } => "POLICY_DENIED",
            Self::Store(_) => "POLICY_STORE_UNAVAILABLE",
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(error) => error.status(),
            Self::ForbiddenOverride { .. } | Self::PolicyDenied { .. } => 403,
            Self::Authentication(error) => error.status(),
            Self::Store(_) => 503,
        }
    }

    pub fn decision(&self) -> Option<&PolicyDecision> {
        match self {
            Self::PolicyDenied { decision } => Some(&**decision),
            _ => None,
        }
    }
}

/// Authenticate, then evaluate policy: the gate every mutating flow goes through.
pub struct ActionAuthorizer {
    authenticator: Arc<MutationAuthenticator>,
    grants: Arc<dyn GrantStore>,
}

impl ActionAuthorizer {
    pub fn new(authenticator: Arc<MutationAuthenticator>, grants: Arc<dyn GrantStore>) -> Self {
        Self {
            authenticator,
            grants,
        }
    }

    pub fn authenticator(&self) -> &MutationAuthenticator {
        &self.authenticator
    }

    pub fn grants(&self) -> Arc<dyn GrantStore> {
        Arc::clone(&self.grants)
    }

    pub async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizedAction, AuthorizationError> {
        let tenant_id = validate_tenant_id(&request.tenant_id)?;
        let scope_id = normalize_scope_id(request.scope_type, &request.scope_id)?;
        if !request.operation.is_concrete() {
            return Err(PolicyError::InvalidOperation(request.operation.as_str().to_string()).into());
        }
        if let Some(key) = forbidden_override_key(&request.action_payload) {
            tracing::warn!(
                request_id = %request.request_id,
                tenant_id = %tenant_id,
                actor_wallet = %request.actor_wallet,
                key = %key,
                code = "FORBIDDEN_OVERRIDE_FLAG",
                "rejected action payload with override flag"
            );
            return Err(AuthorizationError::ForbiddenOverride { key });
        }

        let authenticated = self.authenticate(&MutationRequest {
            request_id: request.request_id.clone(),
            tenant_id: tenant_id.clone(),
            actor_wallet: request.actor_wallet,
            action: request.action.clone(),
            payload: request.action_payload,
            auth: request.auth,
        })?;

        let decision = self
            .decide(&DecisionRequest {
                tenant_id: tenant_id.clone(),
                wallet_address: authenticated.actor_wallet.clone(),
                scope_type: request.scope_type,
                scope_id,
                operation: request.operation,
            })
            .await?;
        if !decision.allowed {
            tracing::warn!(
                request_id = %request.request_id,
                tenant_id = %tenant_id,
                actor_wallet = %authenticated.actor_wallet,
                action = %request.action,
                code = decision.code,
                "action denied by policy"
            );
            return Err(AuthorizationError::PolicyDenied {
                decision: Box::new(decision),
            });
        }

        tracing::info!(
            request_id = %request.request_id,
            tenant_id = %tenant_id,
            actor_wallet = %authenticated.actor_wallet,
            action = %request.action,
            code = decision.code,
            "action authorized"
        );
        Ok(AuthorizedAction {
            actor_wallet: authenticated.actor_wallet.clone(),
            signature_hash: authenticated.signature_hash.clone(),
            decision,
            authenticated,
        })
    }

    /// Signature check only, for flows that apply their own authority rules.
    pub fn authenticate(
        &self,
        request: &MutationRequest,
    ) -> Result<AuthenticatedMutation, AuthorizationError> {
        Ok(self.authenticator.authenticate(request)?)
    }

    /// Evaluates `request` against the wallet's active grants without authenticating.
    pub async fn decide(&self, request: &DecisionRequest) -> Result<PolicyDecision, AuthorizationError> {
        let request = request.normalized()?;
        let grants = self
            .grants
            .list_active_grants(&request.tenant_id, Some(&request.wallet_address))
            .await?;
        Ok(engine::evaluate(&request, &grants)?)
    }
}

/// First forbidden key present with a truthy value, using JavaScript truthiness.
pub fn forbidden_override_key(payload: &Value) -> Option<String> {
    let object = payload.as_object()?;
    object
        .iter()
        .find(|(key, value)| {
            is_truthy(value)
                && FORBIDDEN_OVERRIDE_KEYS
                    .iter()
                    .any(|forbidden| forbidden.eq_ignore_ascii_case(key))
        })
        .map(|(key, _)| key.clone())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
