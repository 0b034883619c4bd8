use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATABASE_SCOPE_ID: &str = "*";
pub const MAX_TENANT_ID_LEN: usize = 128;
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Database,
    Table,
}

impl ScopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Table => "table",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "database" => Ok(Self::Database),
            "table" => Ok(Self::Table),
            other => Err(PolicyError::InvalidScopeType(other.to_string())),
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantOperation {
    Read,
    Insert,
    Update,
    Delete,
    Alter,
    All,
}

impl GrantOperation {
    /// Operations a request can actually perform; `All` only appears on grants.
    pub const CONCRETE: [Self; 5] = [
        Self::Read,
        Self::Insert,
        Self::Update,
        Self::Delete,
        Self::Alter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Alter => "alter",
            Self::All => "all",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "alter" => Ok(Self::Alter),
            "all" => Ok(Self::All),
            other => Err(PolicyError::InvalidOperation(other.to_string())),
        }
    }

    pub fn is_concrete(self) -> bool {
        self != Self::All
    }

    pub fn expand(self) -> Vec<Self> {
        match self {
            Self::All => Self::CONCRETE.to_vec(),
            concrete => vec![concrete],
        }
    }
}

impl fmt::Display for GrantOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(PolicyError::InvalidEffect(other.to_string())),
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub grant_id: String,
    pub tenant_id: String,
    pub wallet_address: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub operation: GrantOperation,
    pub effect: Effect,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub signature_hash: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    #[serde(default)]
    pub bootstrap: bool,
}

impl Grant {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    pub fn criteria(&self) -> GrantCriteria {
        GrantCriteria {
            tenant_id: self.tenant_id.clone(),
            wallet_address: self.wallet_address.clone(),
            scope_type: self.scope_type,
            scope_id: self.scope_id.clone(),
            operation: self.operation,
            effect: self.effect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGrant {
    pub tenant_id: String,
    pub wallet_address: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub operation: GrantOperation,
    pub effect: Effect,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub signature_hash: String,
    pub bootstrap: bool,
}

impl NewGrant {
    pub fn criteria(&self) -> GrantCriteria {
        GrantCriteria {
            tenant_id: self.tenant_id.clone(),
            wallet_address: self.wallet_address.clone(),
            scope_type: self.scope_type,
            scope_id: self.scope_id.clone(),
            operation: self.operation,
            effect: self.effect,
        }
    }
}

/// Identity of a grant for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantCriteria {
    pub tenant_id: String,
    pub wallet_address: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub operation: GrantOperation,
    pub effect: Effect,
}

impl GrantCriteria {
    pub fn matches(&self, grant: &Grant) -> bool {
        grant.tenant_id == self.tenant_id
            && grant.wallet_address.eq_ignore_ascii_case(&self.wallet_address)
            && grant.scope_type == self.scope_type
            && grant.scope_id == self.scope_id
            && grant.operation == self.operation
            && grant.effect == self.effect
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListGrantsQuery {
    pub tenant_id: String,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub include_revoked: bool,
}

impl ListGrantsQuery {
    pub fn active(tenant_id: &str, wallet_address: Option<&str>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            wallet_address: wallet_address.map(str::to_string),
            include_revoked: false,
        }
    }

    pub fn matches(&self, grant: &Grant) -> bool {
        grant.tenant_id == self.tenant_id
            && (self.include_revoked || grant.is_active())
            && self
                .wallet_address
                .as_deref()
                .is_none_or(|wallet| grant.wallet_address.eq_ignore_ascii_case(wallet))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeGrant {
    pub tenant_id: String,
    pub grant_id: String,
    pub revoked_by: String,
    pub revoked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub tenant_id: String,
    pub wallet_address: String,
    pub scope_type: ScopeType,
    pub scope_id: String,
    pub operation: GrantOperation,
}

impl DecisionRequest {
    /// Validated copy with a lower-cased wallet and normalized scope id.
    pub fn normalized(&self) -> Result<Self, PolicyError> {
        let tenant_id = validate_tenant_id(&self.tenant_id)?;
        let wallet_address = wallet_auth::normalize_address(&self.wallet_address)
            .map_err(|_| PolicyError::InvalidWalletAddress(self.wallet_address.clone()))?;
        let scope_id = normalize_scope_id(self.scope_type, &self.scope_id)?;
        if !self.operation.is_concrete() {
            return Err(PolicyError::InvalidOperation(
                self.operation.as_str().to_string(),
            ));
        }
        Ok(Self {
            tenant_id,
            wallet_address,
            scope_type: self.scope_type,
            scope_id,
            operation: self.operation,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationStep {
    pub rule: &'static str,
    pub matched: bool,
    pub grant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub code: &'static str,
    pub message: String,
    pub matched_grant: Option<Grant>,
    pub evaluation_path: Vec<EvaluationStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("tenant id must be 1-128 characters")]
    InvalidTenantId,
    #[error("invalid wallet address: {0}")]
    InvalidWalletAddress(String),
    #[error("invalid scope type: {0}")]
    InvalidScopeType(String),
    #[error("invalid scope id: {0}")]
    InvalidScopeId(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid effect: {0}")]
    InvalidEffect(String),
}

impl PolicyError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTenantId => "INVALID_TENANT_ID",
            Self::InvalidWalletAddress(_) => "INVALID_WALLET_ADDRESS",
            Self::InvalidScopeType(_) => "INVALID_SCOPE_TYPE",
            Self::InvalidScopeId(_) => "INVALID_SCOPE_ID",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::InvalidEffect(_) => "INVALID_EFFECT",
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        400
    }
}

/// `[a-z][a-z0-9_]{0,62}`, shared by grant scopes and the schema DSL.
pub fn is_valid_identifier(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && candidate.len() <= MAX_IDENTIFIER_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn validate_tenant_id(raw: &str) -> Result<String, PolicyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_TENANT_ID_LEN {
        return Err(PolicyError::InvalidTenantId);
    }
    Ok(trimmed.to_string())
}

/// Database scope only admits `*`; table scope must be a lower-cased identifier.
pub fn normalize_scope_id(scope_type: ScopeType, raw: &str) -> Result<String, PolicyError> {
    let normalized = raw.trim().to_ascii_lowercase();
    let valid = match scope_type {
        ScopeType::Database => normalized == DATABASE_SCOPE_ID,
        ScopeType::Table => is_valid_identifier(&normalized),
    };
    if valid {
        Ok(normalized)
    } else {
        Err(PolicyError::InvalidScopeId(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        GrantOperation, PolicyError, ScopeType, is_valid_identifier, normalize_scope_id,
    };

    #[test]
    fn identifier_pattern_is_enforced() {
        assert!(is_valid_identifier("notes"));
        assert!(is_valid_identifier("a1_b2"));
        assert!(is_valid_identifier(&format!("a{}", "b".repeat(62))));
        assert!(!is_valid_identifier(&format!("a{}", "b".repeat(63))));
        assert!(!is_valid_identifier("1notes"));
        assert!(!is_valid_identifier("_notes"));
        assert!(!is_valid_identifier("Notes"));
        assert!(!is_valid_identifier("no-tes"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn scope_ids_are_normalized_per_scope_type() {
        assert_eq!(normalize_scope_id(ScopeType::Database, " * "), Ok("*".to_string()));
        assert_eq!(normalize_scope_id(ScopeType::Table, "Notes"), Ok("notes".to_string()));
        assert!(matches!(
            normalize_scope_id(ScopeType::Database, "notes"),
            Err(PolicyError::InvalidScopeId(_))
        ));
        assert!(matches!(
            normalize_scope_id(ScopeType::Table, "*"),
            Err(PolicyError::InvalidScopeId(_))
        ));
    }

    #[test]
    fn all_expands_to_every_concrete_operation() {
        assert_eq!(GrantOperation::All.expand(), GrantOperation::CONCRETE.to_vec());
        assert_eq!(GrantOperation::Insert.expand(), vec![GrantOperation::Insert]);
        assert_eq!(GrantOperation::parse(" ALL "), Ok(GrantOperation::All));
        assert_eq!(
            GrantOperation::parse("drop").map_err(|error| error.code()),
            Err("INVALID_OPERATION")
        );
    }
}
