//! Grant model, precedence-ordered decision engine, grant storage and the
//! authorization gate shared by schema and data flows.

pub mod authorization;
pub mod engine;
pub mod grants;
pub mod store;
pub mod types;


pub use authorization::{
    ActionAuthorizer, AuthorizationError, AuthorizationRequest, AuthorizedAction,
    FORBIDDEN_OVERRIDE_KEYS, forbidden_override_key,
};
pub use engine::{DECISION_RULES, FALLBACK_DENY, evaluate};
pub use grants::{
    CreateGrantRequest, GRANT_CREATE_ACTION, GRANT_REVOKE_ACTION, GrantService,
    GrantServiceError, GrantSpec, RevokeGrantRequest,
};
pub use store::{GrantStore, GrantStoreError};
pub use types::{
    DATABASE_SCOPE_ID, DecisionRequest, Effect, EvaluationStep, Grant, GrantCriteria,
    GrantOperation, ListGrantsQuery, NewGrant, PolicyDecision, PolicyError, RevokeGrant,
    ScopeType, is_valid_identifier, normalize_scope_id, validate_tenant_id,
};
