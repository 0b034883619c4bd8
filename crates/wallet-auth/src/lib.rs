#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Wallet-signed mutation authentication.
//!
//! A mutation is accepted only when its canonical signing message was signed by
//! the claimed wallet, the signature is fresh, and the nonce has not been seen.

pub mod canonical;
pub mod clock;
pub mod mutation;
pub mod nonce;
pub mod signer;

pub use canonical::{canonical_json, canonical_json_of, sha256_hex};
pub use clock::{Clock, FixedClock, SystemClock};
pub use mutation::{
    AuthenticatedMutation, BYPASS_AVAILABLE, BYPASS_SIGNATURE_HASH, MUTATION_DOMAIN_TAG,
    MutationAuth, MutationAuthConfig, MutationAuthError, MutationAuthenticator, MutationRequest,
    SigningEnvelope, build_signing_message, sign_mutation,
};
pub use nonce::{NonceReplay, NonceStore, NonceStoreConfig};
pub use signer::{
    AddressError, Eip191Signer, SignerError, WalletSigner, address_from_private_key,
    normalize_address, personal_message_hash, to_checksum_address,
};
