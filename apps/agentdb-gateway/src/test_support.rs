use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use wallet_auth::{
    Eip191Signer, FixedClock, MutationAuth, MutationRequest, address_from_private_key,
    normalize_address, sign_mutation,
};

use crate::config::Config;
use crate::db::SqliteExecutor;
use crate::gateway::Gateway;
use crate::policy::{
    CreateGrantRequest, Effect, GRANT_CREATE_ACTION, GRANT_REVOKE_ACTION, GrantOperation,
    GrantSpec, RevokeGrantRequest, ScopeType,
};

pub const TENANT: &str = "tenant-a";
pub const ADMIN_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const AGENT_KEY: &str = "0x8da4ef21b864d2cc526dbdb2a120bd2874c36c9d0a1fb7f8c63d7f7a8b41de8f";
pub const OUTSIDER_KEY: &str =
    "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub fn wallet(key: &str) -> String {
    normalize_address(&address_from_private_key(key).expect("address")).expect("normalized")
}

pub fn sign(key: &str, request_id: &str, action: &str, payload: Value) -> MutationAuth {
    sign_for(TENANT, key, request_id, action, payload)
}

pub fn sign_for(
    tenant_id: &str,
    key: &str,
    request_id: &str,
    action: &str,
    payload: Value,
) -> MutationAuth {
    let request = MutationRequest {
        request_id: request_id.to_string(),
        tenant_id: tenant_id.to_string(),
        actor_wallet: wallet(key),
        action: action.to_string(),
        payload,
        auth: None,
    };
    let signed_at = now().to_rfc3339_opts(SecondsFormat::Secs, true);
    sign_mutation(
        &Eip191Signer,
        key,
        &request,
        &format!("nonce-{request_id}"),
        &signed_at,
    )
    .expect("signed mutation")
}

pub fn grant_spec(
    wallet_address: &str,
    scope_type: ScopeType,
    scope_id: &str,
    operation: GrantOperation,
    effect: Effect,
) -> GrantSpec {
    GrantSpec {
        wallet_address: wallet_address.to_string(),
        scope_type,
        scope_id: scope_id.to_string(),
        operation,
        effect,
    }
}

pub fn bootstrap_spec(key: &str) -> GrantSpec {
    grant_spec(
        &wallet(key),
        ScopeType::Database,
        "*",
        GrantOperation::All,
        Effect::Allow,
    )
}

pub fn create_request(key: &str, request_id: &str, grant: GrantSpec) -> CreateGrantRequest {
    create_request_for(TENANT, key, request_id, grant)
}

pub fn create_request_for(
    tenant_id: &str,
    key: &str,
    request_id: &str,
    grant: GrantSpec,
) -> CreateGrantRequest {
    let mut request = CreateGrantRequest {
        request_id: request_id.to_string(),
        tenant_id: tenant_id.to_string(),
        actor_wallet: wallet(key),
        auth: None,
        grant,
    };
    request.auth = Some(sign_for(
        tenant_id,
        key,
        request_id,
        GRANT_CREATE_ACTION,
        request.signing_payload(),
    ));
    request
}

pub fn revoke_request(
    key: &str,
    request_id: &str,
    grant_id: &str,
    expected_signature_hash: Option<&str>,
) -> RevokeGrantRequest {
    let mut request = RevokeGrantRequest {
        request_id: request_id.to_string(),
        tenant_id: TENANT.to_string(),
        actor_wallet: wallet(key),
        auth: None,
        grant_id: grant_id.to_string(),
        expected_signature_hash: expected_signature_hash.map(str::to_string),
    };
    request.auth = Some(sign(
        key,
        request_id,
        GRANT_REVOKE_ACTION,
        request.signing_payload(),
    ));
    request
}

pub struct TestGateway {
    pub gateway: Gateway,
    pub clock: Arc<FixedClock>,
}

/// Gateway on a fresh in-memory SQLite database with the clock pinned to [`now`].
pub async fn test_gateway() -> anyhow::Result<TestGateway> {
    let clock = Arc::new(FixedClock::new(now()));
    let gateway = Gateway::with_executor(
        Config::default(),
        Arc::new(SqliteExecutor::open_in_memory()?),
        clock.clone(),
    )
    .await?;
    Ok(TestGateway { gateway, clock })
}
