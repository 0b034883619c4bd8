use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";
const SIGNATURE_LEN: usize = 65;
const ADDRESS_HEX_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("signer recovery failed")]
    RecoveryFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("wallet address must be 0x followed by 40 hex characters")]
    Malformed,
    #[error("wallet address checksum mismatch")]
    ChecksumMismatch,
}

/// Signature capability used by mutation authentication.
///
/// Keys and signatures are `0x`-prefixed hex strings; recovered addresses are
/// lower-cased.
pub trait WalletSigner: Send + Sync {
    fn sign(&self, message: &str, private_key: &str) -> Result<String, SignerError>;
    fn recover(&self, message: &str, signature: &str) -> Result<String, SignerError>;
}

/// EIP-191 `personal_sign` over secp256k1.
#[derive(Debug, Default, Clone, Copy)]
pub struct Eip191Signer;

impl WalletSigner for Eip191Signer {
    fn sign(&self, message: &str, private_key: &str) -> Result<String, SignerError> {
        let key = parse_private_key(private_key)?;
        let digest = personal_message_hash(message.as_bytes());
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&digest)
            .map_err(|_| SignerError::InvalidPrivateKey)?;
        let mut bytes = Vec::with_capacity(SIGNATURE_LEN);
        bytes.extend_from_slice(&signature.to_bytes());
        bytes.push(recovery_id.to_byte() + 27);
        Ok(format!("0x{}", hex::encode(bytes)))
    }

    fn recover(&self, message: &str, signature: &str) -> Result<String, SignerError> {
        let (signature, recovery_id) = parse_signature(signature)?;
        let digest = personal_message_hash(message.as_bytes());
        let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
            .map_err(|_| SignerError::RecoveryFailed)?;
        Ok(address_from_verifying_key(&key))
    }
}

pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_MESSAGE_PREFIX.as_bytes());
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Lower-cased address for a well-formed input.
///
/// Mixed-case input is treated as EIP-55 checksummed and must verify.
pub fn normalize_address(raw: &str) -> Result<String, AddressError> {
    let trimmed = raw.trim();
    let hex_part = trimmed.strip_prefix("0x").ok_or(AddressError::Malformed)?;
    if hex_part.len() != ADDRESS_HEX_LEN || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::Malformed);
    }
    let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
    let lowered = format!("0x{}", hex_part.to_ascii_lowercase());
    if has_lower && has_upper && to_checksum_address(&lowered)? != trimmed {
        return Err(AddressError::ChecksumMismatch);
    }
    Ok(lowered)
}

pub fn to_checksum_address(address: &str) -> Result<String, AddressError> {
    let hex_part = address
        .trim()
        .strip_prefix("0x")
        .ok_or(AddressError::Malformed)?
        .to_ascii_lowercase();
    if hex_part.len() != ADDRESS_HEX_LEN || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::Malformed);
    }
    let hash = Keccak256::digest(hex_part.as_bytes());
    let checksummed = hex_part
        .chars()
        .enumerate()
        .map(|(index, c)| {
            let byte = hash[index / 2];
            let nibble = if index % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            if c.is_ascii_alphabetic() && nibble >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect::<String>();
    Ok(format!("0x{checksummed}"))
}

pub fn address_from_private_key(private_key: &str) -> Result<String, SignerError> {
    let key = parse_private_key(private_key)?;
    Ok(address_from_verifying_key(key.verifying_key()))
}

fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

fn parse_private_key(raw: &str) -> Result<SigningKey, SignerError> {
    let trimmed = raw.trim();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(hex_part).map_err(|_| SignerError::InvalidPrivateKey)?;
    SigningKey::from_slice(&bytes).map_err(|_| SignerError::InvalidPrivateKey)
}

fn parse_signature(raw: &str) -> Result<(Signature, RecoveryId), SignerError> {
    let trimmed = raw.trim();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(hex_part)
        .map_err(|_| SignerError::InvalidSignatureFormat("signature is not hex".to_string()))?;
    if bytes.len() != SIGNATURE_LEN {
        return Err(SignerError::InvalidSignatureFormat(format!(
            "signature must be {SIGNATURE_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let v = match bytes[64] {
        0 | 27 => 0,
        1 | 28 => 1,
        other => {
            return Err(SignerError::InvalidSignatureFormat(format!(
                "unsupported recovery byte {other}"
            )));
        }
    };
    let mut recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| SignerError::InvalidSignatureFormat("invalid recovery id".to_string()))?;
    let mut signature = Signature::from_slice(&bytes[..64]).map_err(|_| {
        SignerError::InvalidSignatureFormat("signature scalars out of range".to_string())
    })?;
    if let Some(normalized) = signature.normalize_s() {
        signature = normalized;
        recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
    }
    Ok((signature, recovery_id))
}
