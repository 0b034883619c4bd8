use super::types::{
    DecisionRequest, Effect, EvaluationStep, Grant, GrantOperation, PolicyDecision, PolicyError,
    ScopeType,
};

pub const FALLBACK_DENY: &str = "FALLBACK_DENY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    Table,
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOperation {
    /// The grant names the exact operation being requested.
    Requested,
    /// The grant uses the `all` wildcard.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionRule {
    pub id: &'static str,
    pub scope: RuleScope,
    pub operation: RuleOperation,
    pub effect: Effect,
    pub message: &'static str,
}

/// Evaluated top to bottom, first match wins. Table rules are skipped for
/// database-scope requests. The order is the precedence contract: table beats
/// database, deny beats allow at equal specificity, `all` grants come last.
pub const DECISION_RULES: [DecisionRule; 8] = [
    DecisionRule {
        id: "TABLE_OPERATION_DENY",
        scope: RuleScope::Table,
        operation: RuleOperation::Requested,
        effect: Effect::Deny,
        message: "denied by a table grant for this operation",
    },
    DecisionRule {
        id: "TABLE_OPERATION_ALLOW",
        scope: RuleScope::Table,
        operation: RuleOperation::Requested,
        effect: Effect::Allow,
        message: "allowed by a table grant for this operation",
    },
    DecisionRule {
        id: "DATABASE_OPERATION_DENY",
        scope: RuleScope::Database,
        operation: RuleOperation::Requested,
        effect: Effect::Deny,
        message: "denied by a database grant for this operation",
    },
    DecisionRule {
        id: "DATABASE_OPERATION_ALLOW",
        scope: RuleScope::Database,
        operation: RuleOperation::Requested,
        effect: Effect::Allow,
        message: "allowed by a database grant for this operation",
    },
    DecisionRule {
        id: "TABLE_ALL_DENY",
        scope: RuleScope::Table,
        operation: RuleOperation::All,
        effect: Effect::Deny,
        message: "denied by a table grant for all operations",
    },
    DecisionRule {
        id: "TABLE_ALL_ALLOW",
        scope: RuleScope::Table,
        operation: RuleOperation::All,
        effect: Effect::Allow,
        message: "allowed by a table grant for all operations",
    },
    DecisionRule {
        id: "DATABASE_ALL_DENY",
        scope: RuleScope::Database,
        operation: RuleOperation::All,
        effect: Effect::Deny,
        message: "denied by a database grant for all operations",
    },
    DecisionRule {
        id: "DATABASE_ALL_ALLOW",
        scope: RuleScope::Database,
        operation: RuleOperation::All,
        effect: Effect::Allow,
        message: "allowed by a database grant for all operations",
    },
];

impl DecisionRule {
    pub fn applies_to(&self, scope_type: ScopeType) -> bool {
        self.scope == RuleScope::Database || scope_type == ScopeType::Table
    }

    pub fn matches(&self, grant: &Grant, request: &DecisionRequest) -> bool {
        let scope_matches = match self.scope {
            RuleScope::Table => {
                grant.scope_type == ScopeType::Table && grant.scope_id == request.scope_id
            }
            RuleScope::Database => grant.scope_type == ScopeType::Database,
        };
        let operation_matches = match self.operation {
            RuleOperation::Requested => grant.operation == request.operation,
            RuleOperation::All => grant.operation == GrantOperation::All,
        };
        scope_matches && operation_matches && grant.effect == self.effect
    }
}

/// Pure allow/deny evaluation with a full trace of every rule attempted.
pub fn evaluate(request: &DecisionRequest, grants: &[Grant]) -> Result<PolicyDecision, PolicyError> {
    let request = request.normalized()?;

    let mut candidates = grants
        .iter()
        .filter(|grant| {
            grant.is_active()
                && grant.tenant_id == request.tenant_id
                && grant.wallet_address.eq_ignore_ascii_case(&request.wallet_address)
        })
        .collect::<Vec<_>>();
    candidates.sort_by(|left, right| {
        right
            .created_at
            .cmp(&left.created_at)
            .then_with(|| right.grant_id.cmp(&left.grant_id))
    });

    let mut evaluation_path = Vec::new();
    for rule in DECISION_RULES
        .iter()
        .filter(|rule| rule.applies_to(request.scope_type))
    {
        let matched = candidates
            .iter()
            .find(|grant| rule.matches(grant, &request))
            .copied();
        evaluation_path.push(EvaluationStep {
            rule: rule.id,
            matched: matched.is_some(),
            grant_id: matched.map(|grant| grant.grant_id.clone()),
        });
        if let Some(grant) = matched {
            return Ok(PolicyDecision {
                allowed: rule.effect == Effect::Allow,
                code: rule.id,
                message: rule.message.to_string(),
                matched_grant: Some(grant.clone()),
                evaluation_path,
            });
        }
    }

    Ok(PolicyDecision {
        allowed: false,
        code: FALLBACK_DENY,
        message: "no grant matches; default deny".to_string(),
        matched_grant: None,
        evaluation_path,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{DECISION_RULES, FALLBACK_DENY, evaluate};
    use crate::policy::types::{
        DecisionRequest, Effect, Grant, GrantOperation, PolicyError, ScopeType,
    };

    const TENANT: &str = "tenant-a";
    const WALLET: &str = "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23";
    const OTHER_WALLET: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).single().expect("time")
    }

    fn grant(
        id: &str,
        scope_type: ScopeType,
        scope_id: &str,
        operation: GrantOperation,
        effect: Effect,
        minutes: i64,
    ) -> Grant {
        Grant {
            grant_id: id.to_string(),
            tenant_id: TENANT.to_string(),
            wallet_address: WALLET.to_string(),
            scope_type,
            scope_id: scope_id.to_string(),
            operation,
            effect,
            created_by: WALLET.to_string(),
            created_at: base_time() + Duration::minutes(minutes),
            signature_hash: format!("hash-{id}"),
            revoked_at: None,
            revoked_by: None,
            bootstrap: false,
        }
    }

    fn table_request(table: &str, operation: GrantOperation) -> DecisionRequest {
        DecisionRequest {
            tenant_id: TENANT.to_string(),
            wallet_address: WALLET.to_string(),
            scope_type: ScopeType::Table,
            scope_id: table.to_string(),
            operation,
        }
    }

    #[test]
    fn rule_table_order_is_fixed() {
        let ids = DECISION_RULES.iter().map(|rule| rule.id).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                "TABLE_OPERATION_DENY",
                "TABLE_OPERATION_ALLOW",
                "DATABASE_OPERATION_DENY",
                "DATABASE_OPERATION_ALLOW",
                "TABLE_ALL_DENY",
                "TABLE_ALL_ALLOW",
                "DATABASE_ALL_DENY",
                "DATABASE_ALL_ALLOW",
            ]
        );
    }

    #[test]
    fn table_deny_beats_table_allow_and_database_all() {
        let grants = vec![
            grant("g1", ScopeType::Database, "*", GrantOperation::All, Effect::Allow, 0),
            grant("g2", ScopeType::Table, "notes", GrantOperation::Read, Effect::Allow, 1),
            grant("g3", ScopeType::Table, "notes", GrantOperation::Read, Effect::Deny, 2),
        ];
        let decision =
            evaluate(&table_request("notes", GrantOperation::Read), &grants).expect("decision");
        assert!(!decision.allowed);
        assert_eq!(decision.code, "TABLE_OPERATION_DENY");
        assert_eq!(
            decision.matched_grant.map(|grant| grant.grant_id),
            Some("g3".to_string())
        );
        assert_eq!(decision.evaluation_path.len(), 1);
    }

    #[test]
    fn empty_grant_set_falls_back_to_deny() {
        let decision =
            evaluate(&table_request("notes", GrantOperation::Insert), &[]).expect("decision");
        assert!(!decision.allowed);
        assert_eq!(decision.code, FALLBACK_DENY);
        assert!(decision.matched_grant.is_none());
        assert_eq!(decision.evaluation_path.len(), 8);
        assert!(decision.evaluation_path.iter().all(|step| !step.matched));
    }

    #[test]
    fn database_scope_skips_table_rules() {
        let grants = vec![grant(
            "g1",
            ScopeType::Table,
            "notes",
            GrantOperation::Alter,
            Effect::Allow,
            0,
        )];
        let request = DecisionRequest {
            tenant_id: TENANT.to_string(),
            wallet_address: WALLET.to_string(),
            scope_type: ScopeType::Database,
            scope_id: "*".to_string(),
            operation: GrantOperation::Alter,
        };
        let decision = evaluate(&request, &grants).expect("decision");
        assert_eq!(decision.code, FALLBACK_DENY);
        let rules = decision
            .evaluation_path
            .iter()
            .map(|step| step.rule)
            .collect::<Vec<_>>();
        assert_eq!(
            rules,
            vec![
                "DATABASE_OPERATION_DENY",
                "DATABASE_OPERATION_ALLOW",
                "DATABASE_ALL_DENY",
                "DATABASE_ALL_ALLOW",
            ]
        );
    }

    #[test]
    fn specific_operation_outranks_all_wildcard() {
        let grants = vec![
            grant("g1", ScopeType::Table, "notes", GrantOperation::All, Effect::Deny, 0),
            grant("g2", ScopeType::Database, "*", GrantOperation::Read, Effect::Allow, 1),
        ];
        let decision =
            evaluate(&table_request("notes", GrantOperation::Read), &grants).expect("decision");
        assert!(decision.allowed);
        assert_eq!(decision.code, "DATABASE_OPERATION_ALLOW");

        let decision =
            evaluate(&table_request("notes", GrantOperation::Delete), &grants).expect("decision");
        assert!(!decision.allowed);
        assert_eq!(decision.code, "TABLE_ALL_DENY");
    }

    #[test]
    fn newest_equivalent_grant_is_reported() {
        let grants = vec![
            grant("g-a", ScopeType::Table, "notes", GrantOperation::Read, Effect::Allow, 0),
            grant("g-c", ScopeType::Table, "notes", GrantOperation::Read, Effect::Allow, 5),
            grant("g-b", ScopeType::Table, "notes", GrantOperation::Read, Effect::Allow, 5),
        ];
        let decision =
            evaluate(&table_request("notes", GrantOperation::Read), &grants).expect("decision");
        assert_eq!(
            decision.matched_grant.map(|grant| grant.grant_id),
            Some("g-c".to_string())
        );
    }

    #[test]
    fn other_wallets_tenants_and_revoked_grants_are_ignored() {
        let mut foreign_wallet =
            grant("g1", ScopeType::Database, "*", GrantOperation::All, Effect::Allow, 0);
        foreign_wallet.wallet_address = OTHER_WALLET.to_string();
        let mut foreign_tenant =
            grant("g2", ScopeType::Database, "*", GrantOperation::All, Effect::Allow, 0);
        foreign_tenant.tenant_id = "tenant-b".to_string();
        let mut revoked =
            grant("g3", ScopeType::Database, "*", GrantOperation::All, Effect::Allow, 0);
        revoked.revoked_at = Some(base_time());

        let decision = evaluate(
            &table_request("notes", GrantOperation::Read),
            &[foreign_wallet, foreign_tenant, revoked],
        )
        .expect("decision");
        assert_eq!(decision.code, FALLBACK_DENY);
    }

    #[test]
    fn wallet_match_is_case_insensitive() {
        let grants = vec![grant(
            "g1",
            ScopeType::Database,
            "*",
            GrantOperation::All,
            Effect::Allow,
            0,
        )];
        let mut request = table_request("notes", GrantOperation::Update);
        request.wallet_address = "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23".to_string();
        let decision = evaluate(&request, &grants).expect("decision");
        assert!(decision.allowed);
        assert_eq!(decision.code, "DATABASE_ALL_ALLOW");
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let all = table_request("notes", GrantOperation::All);
        assert!(matches!(
            evaluate(&all, &[]),
            Err(PolicyError::InvalidOperation(_))
        ));
        let bad_table = table_request("Bad-Name", GrantOperation::Read);
        assert!(matches!(
            evaluate(&bad_table, &[]),
            Err(PolicyError::InvalidScopeId(_))
        ));
        let mut bad_wallet = table_request("notes", GrantOperation::Read);
        bad_wallet.wallet_address = "wallet".to_string();
        assert!(matches!(
            evaluate(&bad_wallet, &[]),
            Err(PolicyError::InvalidWalletAddress(_))
        ));
    }
}
