use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical::{canonical_json_of, sha256_hex};
use crate::clock::Clock;
use crate::nonce::NonceStore;
use crate::signer::{AddressError, SignerError, WalletSigner, normalize_address};

pub const MUTATION_DOMAIN_TAG: &str = "agentdb:mutation:v1";
pub const BYPASS_SIGNATURE_HASH: &str = "auth-bypass";
pub const DEFAULT_MAX_FUTURE_SKEW_SECONDS: i64 = 60;
pub const DEFAULT_NONCE_TTL_SECONDS: i64 = 300;
pub const MAX_NONCE_LEN: usize = 128;

/// Whether this build is able to honor `MutationAuthConfig::bypass`.
pub const BYPASS_AVAILABLE: bool = cfg!(feature = "dev-auth-bypass");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationAuthConfig {
    pub max_future_skew_seconds: i64,
    pub nonce_ttl_seconds: i64,
    pub bypass: bool,
}

impl Default for MutationAuthConfig {
    fn default() -> Self {
        Self {
            max_future_skew_seconds: DEFAULT_MAX_FUTURE_SKEW_SECONDS,
            nonce_ttl_seconds: DEFAULT_NONCE_TTL_SECONDS,
            bypass: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationAuth {
    pub signature: String,
    pub nonce: String,
    pub signed_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub actor_wallet: String,
    pub action: String,
    pub payload: Value,
    #[serde(default)]
    pub auth: Option<MutationAuth>,
}

/// The exact structure a wallet signs, before canonicalization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningEnvelope<'a> {
    pub request_id: &'a str,
    pub tenant_id: &'a str,
    pub actor_wallet: &'a str,
    pub action: &'a str,
    pub payload: &'a Value,
    pub nonce: &'a str,
    pub signed_at: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedMutation {
    pub actor_wallet: String,
    pub signed_at: Option<DateTime<Utc>>,
    pub nonce: Option<String>,
    pub signature_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationAuthError {
    #[error("actor wallet is invalid: {0}")]
    InvalidActorWallet(AddressError),
    #[error("mutation auth envelope is required")]
    MissingAuth,
    #[error("nonce must be 1-128 characters")]
    InvalidNonce,
    #[error("signedAt must be an ISO-8601 timestamp")]
    InvalidSignedAt,
    #[error("signedAt is {ahead_seconds}s ahead of server time")]
    SignedAtInFuture { ahead_seconds: i64 },
    #[error("signature expired {age_seconds}s after signing")]
    SignatureExpired { age_seconds: i64 },
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),
    #[error("recovered signer {recovered} does not match actor wallet {expected}")]
    SignerMismatch { expected: String, recovered: String },
    #[error("nonce has already been used")]
    NonceReplay,
    #[error("failed to canonicalize signing envelope: {0}")]
    CanonicalizationFailed(String),
}

impl MutationAuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidActorWallet(_) => "INVALID_ACTOR_WALLET",
            Self::MissingAuth => "MISSING_AUTH",
            Self::InvalidNonce => "INVALID_NONCE",
            Self::InvalidSignedAt => "INVALID_SIGNED_AT",
            Self::SignedAtInFuture { .. } => "SIGNED_AT_IN_FUTURE",
            Self::SignatureExpired { .. } => "SIGNATURE_EXPIRED",
            Self::InvalidSignatureFormat(_) => "INVALID_SIGNATURE_FORMAT",
            Self::SignerMismatch { .. } => "SIGNER_MISMATCH",
            Self::NonceReplay => "NONCE_REPLAY",
            Self::CanonicalizationFailed(_) => "CANONICALIZATION_FAILED",
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidActorWallet(_) | Self::CanonicalizationFailed(_) => 400,
            _ => 401,
        }
    }
}

pub fn build_signing_message(envelope: &SigningEnvelope<'_>) -> Result<String, MutationAuthError> {
    let canonical = canonical_json_of(envelope)
        .map_err(|error| MutationAuthError::CanonicalizationFailed(error.to_string()))?;
    Ok(format!("{MUTATION_DOMAIN_TAG}\n{canonical}"))
}

/// Client-side helper: signs `request` the way `MutationAuthenticator` verifies it.
pub fn sign_mutation(
    signer: &dyn WalletSigner,
    private_key: &str,
    request: &MutationRequest,
    nonce: &str,
    signed_at: &str,
) -> Result<MutationAuth, MutationAuthError> {
    let actor_wallet =
        normalize_address(&request.actor_wallet).map_err(MutationAuthError::InvalidActorWallet)?;
    let message = build_signing_message(&SigningEnvelope {
        request_id: &request.request_id,
        tenant_id: &request.tenant_id,
        actor_wallet: &actor_wallet,
        action: &request.action,
        payload: &request.payload,
        nonce: nonce.trim(),
        signed_at: signed_at.trim(),
    })?;
    let signature = signer
        .sign(&message, private_key)
        .map_err(|error| MutationAuthError::InvalidSignatureFormat(error.to_string()))?;
    Ok(MutationAuth {
        signature,
        nonce: nonce.to_string(),
        signed_at: signed_at.to_string(),
    })
}

pub struct MutationAuthenticator {
    config: MutationAuthConfig,
    nonces: Arc<NonceStore>,
    signer: Arc<dyn WalletSigner>,
    clock: Arc<dyn Clock>,
}

impl MutationAuthenticator {
    pub fn new(
        config: MutationAuthConfig,
        nonces: Arc<NonceStore>,
        signer: Arc<dyn WalletSigner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if config.bypass && !BYPASS_AVAILABLE {
            tracing::warn!("mutation auth bypass requested but not compiled in; verifying anyway");
        }
        Self {
            config,
            nonces,
            signer,
            clock,
        }
    }

    pub fn config(&self) -> MutationAuthConfig {
        self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn authenticate(
        &self,
        request: &MutationRequest,
    ) -> Result<AuthenticatedMutation, MutationAuthError> {
        match self.verify(request) {
            Ok(authenticated) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    tenant_id = %request.tenant_id,
                    actor_wallet = %authenticated.actor_wallet,
                    action = %request.action,
                    "mutation authenticated"
                );
                Ok(authenticated)
            }
            Err(error) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    tenant_id = %request.tenant_id,
                    actor_wallet = %request.actor_wallet,
                    action = %request.action,
                    code = error.code(),
                    reason = %error,
                    "mutation authentication rejected"
                );
                Err(error)
            }
        }
    }

    fn verify(&self, request: &MutationRequest) -> Result<AuthenticatedMutation, MutationAuthError> {
        let actor_wallet = normalize_address(&request.actor_wallet)
            .map_err(MutationAuthError::InvalidActorWallet)?;

        if self.bypass_enabled() {
            return Ok(AuthenticatedMutation {
                actor_wallet,
                signed_at: None,
                nonce: None,
                signature_hash: BYPASS_SIGNATURE_HASH.to_string(),
            });
        }

        let auth = request.auth.as_ref().ok_or(MutationAuthError::MissingAuth)?;
        let nonce = auth.nonce.trim();
        if nonce.is_empty() || nonce.chars().count() > MAX_NONCE_LEN {
            return Err(MutationAuthError::InvalidNonce);
        }
        let signature = auth.signature.trim();
        if signature.is_empty() {
            return Err(MutationAuthError::InvalidSignatureFormat(
                "signature is empty".to_string(),
            ));
        }
        let signed_at_raw = auth.signed_at.trim();
        let signed_at = DateTime::parse_from_rfc3339(signed_at_raw)
            .map_err(|_| MutationAuthError::InvalidSignedAt)?
            .with_timezone(&Utc);

        let now = self.clock.now();
        let ahead = signed_at - now;
        if ahead > Duration::seconds(self.config.max_future_skew_seconds) {
            return Err(MutationAuthError::SignedAtInFuture {
                ahead_seconds: ahead.num_seconds(),
            });
        }
        // The nonce entry lives until `signed_at + ttl` exclusive, so the
        // signature must stop verifying at that same instant.
        let age = now - signed_at;
        if age >= Duration::seconds(self.config.nonce_ttl_seconds) {
            return Err(MutationAuthError::SignatureExpired {
                age_seconds: age.num_seconds(),
            });
        }

        let message = build_signing_message(&SigningEnvelope {
            request_id: &request.request_id,
            tenant_id: &request.tenant_id,
            actor_wallet: &actor_wallet,
            action: &request.action,
            payload: &request.payload,
            nonce,
            signed_at: signed_at_raw,
        })?;
        let recovered = self
            .signer
            .recover(&message, signature)
            .map_err(|error| match error {
                SignerError::InvalidSignatureFormat(reason) => {
                    MutationAuthError::InvalidSignatureFormat(reason)
                }
                other => MutationAuthError::InvalidSignatureFormat(other.to_string()),
            })?;
        if recovered != actor_wallet {
            return Err(MutationAuthError::SignerMismatch {
                expected: actor_wallet,
                recovered,
            });
        }

        let expires_at = signed_at + Duration::seconds(self.config.nonce_ttl_seconds);
        self.nonces
            .consume(
                &actor_wallet,
                nonce,
                expires_at.timestamp_millis(),
                now.timestamp_millis(),
            )
            .map_err(|_| MutationAuthError::NonceReplay)?;

        Ok(AuthenticatedMutation {
            actor_wallet,
            signed_at: Some(signed_at),
            nonce: Some(nonce.to_string()),
            signature_hash: sha256_hex(signature.to_ascii_lowercase()),
        })
    }

    fn bypass_enabled(&self) -> bool {
        BYPASS_AVAILABLE && self.config.bypass
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::{
        MutationAuthConfig, MutationAuthError, MutationAuthenticator, MutationRequest,
        SigningEnvelope, build_signing_message, sign_mutation,
    };
    use crate::canonical::sha256_hex;
    use crate::clock::FixedClock;
    use crate::nonce::NonceStore;
    use crate::signer::{Eip191Signer, address_from_private_key};

    const KEY_A: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const KEY_B: &str = "0x8da4ef21b864d2cc526dbdb2a120bd2874c36c9d0a1fb7f8c63d7f7a8b41de8f";
    const SIGNED_AT: &str = "2025-03-01T12:00:00Z";

    fn fixture() -> (MutationAuthenticator, Arc<FixedClock>) {
        let now = Utc
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 30)
            .single()
            .expect("now");
        let clock = Arc::new(FixedClock::new(now));
        let auth = MutationAuthenticator::new(
            MutationAuthConfig::default(),
            Arc::new(NonceStore::default()),
            Arc::new(Eip191Signer),
            clock.clone(),
        );
        (auth, clock)
    }

    fn request(key: &str, nonce: &str, signed_at: &str) -> MutationRequest {
        let mut request = MutationRequest {
            request_id: "req-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            actor_wallet: address_from_private_key(key).expect("address"),
            action: "data.insert".to_string(),
            payload: json!({"table": "notes", "values": {"body": "hi"}}),
            auth: None,
        };
        request.auth =
            Some(sign_mutation(&Eip191Signer, key, &request, nonce, signed_at).expect("sign"));
        request
    }

    #[test]
    fn signing_message_is_tagged_canonical_json() {
        let payload = json!({"b": 1, "a": 2});
        let message = build_signing_message(&SigningEnvelope {
            request_id: "r",
            tenant_id: "t",
            actor_wallet: "0xabc",
            action: "schema.apply",
            payload: &payload,
            nonce: "n",
            signed_at: "2025-01-01T00:00:00Z",
        })
        .expect("message");
        assert_eq!(
            message,
            "agentdb:mutation:v1\n{\"action\":\"schema.apply\",\"actorWallet\":\"0xabc\",\"nonce\":\"n\",\"payload\":{\"a\":2,\"b\":1},\"requestId\":\"r\",\"signedAt\":\"2025-01-01T00:00:00Z\",\"tenantId\":\"t\"}"
        );
    }

    #[test]
    fn valid_signature_authenticates_and_hashes_signature() {
        let (auth, _) = fixture();
        let request = request(KEY_A, "nonce-1", SIGNED_AT);
        let result = auth.authenticate(&request).expect("authenticated");
        assert_eq!(result.actor_wallet, request.actor_wallet);
        assert_eq!(result.nonce.as_deref(), Some("nonce-1"));
        let signature = request.auth.as_ref().expect("auth").signature.to_ascii_lowercase();
        assert_eq!(result.signature_hash, sha256_hex(signature));
    }

    #[test]
    fn replay_is_rejected_until_ttl_passes() {
        let (auth, clock) = fixture();
        let first = request(KEY_A, "nonce-1", SIGNED_AT);
        auth.authenticate(&first).expect("first");
        assert_eq!(
            auth.authenticate(&first).expect_err("replay"),
            MutationAuthError::NonceReplay
        );

        // Past the TTL the old signature is stale, but a fresh one may reuse the nonce.
        clock.advance(Duration::seconds(400));
        assert_eq!(auth.authenticate(&first).expect_err("stale").code(), "SIGNATURE_EXPIRED");
        let resigned = request(KEY_A, "nonce-1", "2025-03-01T12:06:30Z");
        auth.authenticate(&resigned).expect("nonce reusable after expiry");
    }

    #[test]
    fn signature_expires_when_its_nonce_does() {
        let (auth, clock) = fixture();
        let signed = request(KEY_A, "nonce-edge", SIGNED_AT);
        auth.authenticate(&signed).expect("first");

        clock.advance(Duration::seconds(270) - Duration::milliseconds(1));
        assert_eq!(auth.authenticate(&signed).expect_err("replay").code(), "NONCE_REPLAY");

        clock.advance(Duration::milliseconds(1));
        assert_eq!(
            auth.authenticate(&signed).expect_err("expired at ttl").code(),
            "SIGNATURE_EXPIRED"
        );
    }

    #[test]
    fn signature_from_other_wallet_is_signer_mismatch() {
        let (auth, _) = fixture();
        let mut forged = request(KEY_B, "nonce-2", SIGNED_AT);
        forged.actor_wallet = address_from_private_key(KEY_A).expect("address");
        let error = auth.authenticate(&forged).expect_err("mismatch");
        assert_eq!(error.code(), "SIGNER_MISMATCH");
        assert_eq!(error.status(), 401);
    }

    #[test]
    fn tampered_payload_does_not_verify() {
        let (auth, _) = fixture();
        let mut tampered = request(KEY_A, "nonce-3", SIGNED_AT);
        tampered.action = "data.delete".to_string();
        assert_eq!(
            auth.authenticate(&tampered).expect_err("tampered").code(),
            "SIGNER_MISMATCH"
        );
    }

    #[test]
    fn freshness_window_is_enforced() {
        let (auth, _) = fixture();
        let future = request(KEY_A, "nonce-4", "2025-03-01T12:05:00Z");
        assert_eq!(auth.authenticate(&future).expect_err("future").code(), "SIGNED_AT_IN_FUTURE");

        let near_future = request(KEY_A, "nonce-5", "2025-03-01T12:01:00Z");
        auth.authenticate(&near_future).expect("within skew");

        let old = request(KEY_A, "nonce-6", "2025-03-01T11:50:00Z");
        assert_eq!(auth.authenticate(&old).expect_err("old").code(), "SIGNATURE_EXPIRED");
    }

    #[test]
    fn structural_failures_have_distinct_codes() {
        let (auth, _) = fixture();
        let mut signed = request(KEY_A, "nonce-7", SIGNED_AT);

        let mut bad_wallet = signed.clone();
        bad_wallet.actor_wallet = "0x123".to_string();
        let error = auth.authenticate(&bad_wallet).expect_err("wallet");
        assert_eq!((error.code(), error.status()), ("INVALID_ACTOR_WALLET", 400));

        let mut missing = signed.clone();
        missing.auth = None;
        assert_eq!(auth.authenticate(&missing).expect_err("missing").code(), "MISSING_AUTH");

        let mut long_nonce = signed.clone();
        if let Some(envelope) = long_nonce.auth.as_mut() {
            envelope.nonce = "n".repeat(129);
        }
        assert_eq!(auth.authenticate(&long_nonce).expect_err("nonce").code(), "INVALID_NONCE");

        let mut bad_time = signed.clone();
        if let Some(envelope) = bad_time.auth.as_mut() {
            envelope.signed_at = "yesterday".to_string();
        }
        assert_eq!(auth.authenticate(&bad_time).expect_err("time").code(), "INVALID_SIGNED_AT");

        if let Some(envelope) = signed.auth.as_mut() {
            envelope.signature = "0xdeadbeef".to_string();
        }
        assert_eq!(
            auth.authenticate(&signed).expect_err("format").code(),
            "INVALID_SIGNATURE_FORMAT"
        );
    }

    #[test]
    fn bypass_is_only_honored_with_feature() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().expect("now");
        let auth = MutationAuthenticator::new(
            MutationAuthConfig {
                bypass: true,
                ..MutationAuthConfig::default()
            },
            Arc::new(NonceStore::default()),
            Arc::new(Eip191Signer),
            Arc::new(FixedClock::new(now)),
        );
        let mut unsigned = request(KEY_A, "nonce-8", SIGNED_AT);
        unsigned.auth = None;
        let result = auth.authenticate(&unsigned);
        if cfg!(feature = "dev-auth-bypass") {
            assert_eq!(result.expect("bypass").signature_hash, "auth-bypass");
        } else {
            assert_eq!(result.expect_err("verified").code(), "MISSING_AUTH");
        }
    }
}
