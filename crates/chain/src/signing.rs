//! Claim signing and recovery.
//!
//! The contract's digest convention: Keccak-256 over the contract
//! address (20 bytes), the channel id (32 bytes) and the claim value as
//! a decimal ASCII string. Signatures travel flat as `r ‖ s ‖ v` with
//! `v ∈ {27, 28}` (the recovery id plus 27 — several signer libraries
//! hand back 0/1 instead, so the offset is applied here).

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

use paychan_core::{Address, ChannelId, ClaimSignature};

use crate::{ChainError, Result};

/// Digest a claim the way the channel contract hashes it.
pub fn claim_digest(contract: &Address, channel_id: &ChannelId, value: u128) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(contract.as_bytes());
    hasher.update(channel_id.as_bytes());
    hasher.update(value.to_string().as_bytes());
    hasher.finalize().into()
}

/// Derive the on-chain address of a verifying key.
fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    // Skip the 0x04 uncompressed-point tag.
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..]).expect("keccak output is 32 bytes")
}

/// Holds the account key and signs claims against outgoing channels.
pub struct ClaimSigner {
    key: SigningKey,
    address: Address,
}

impl ClaimSigner {
    /// Generate a fresh random account key.
    pub fn random() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self> {
        let key = SigningKey::from_slice(secret).map_err(|_| ChainError::InvalidSecretKey)?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    /// Our on-chain address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign `(contract, channel_id, value)` and return the flat form.
    pub fn sign_claim(
        &self,
        contract: &Address,
        channel_id: &ChannelId,
        value: u128,
    ) -> Result<ClaimSignature> {
        let digest = claim_digest(contract, channel_id, value);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| ChainError::InvalidSignature(e.to_string()))?;

        let mut flat = [0u8; 65];
        flat[..64].copy_from_slice(signature.to_bytes().as_slice());
        flat[64] = 27 + recovery_id.to_byte();
        Ok(ClaimSignature(flat))
    }
}

impl std::fmt::Debug for ClaimSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimSigner").field("address", &self.address).finish()
    }
}

/// Recover the address that signed a claim.
pub fn recover_claim_signer(
    contract: &Address,
    channel_id: &ChannelId,
    value: u128,
    signature: &ClaimSignature,
) -> Result<Address> {
    let v = signature.v();
    let recovery_byte = v
        .checked_sub(27)
        .filter(|b| *b <= 1)
        .ok_or_else(|| ChainError::InvalidSignature(format!("v must be 27 or 28, got {}", v)))?;
    let recovery_id =
        RecoveryId::from_byte(recovery_byte).expect("recovery byte is 0 or 1");

    let sig = Signature::from_slice(&signature.as_bytes()[..64])
        .map_err(|e| ChainError::InvalidSignature(e.to_string()))?;

    let digest = claim_digest(contract, channel_id, value);
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .map_err(|e| ChainError::InvalidSignature(e.to_string()))?;
    Ok(address_of(&key))
}

/// Check a claim signature against the channel's funding party.
pub fn verify_claim(
    contract: &Address,
    channel_id: &ChannelId,
    value: u128,
    signature: &ClaimSignature,
    sender: &Address,
) -> bool {
    match recover_claim_signer(contract, channel_id, value, signature) {
        Ok(recovered) => recovered == *sender,
        Err(_) => false,
    }
}

/// Mixed-case checksum encoding of an address.
pub fn to_checksum_address(address: &Address) -> String {
    let lower = hex::encode(address.as_bytes());
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (4 * (1 - i % 2))) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse an address received from a peer.
///
/// Uniform-case hex is accepted as-is; mixed case must carry a valid
/// checksum.
pub fn parse_peer_address(s: &str) -> Result<Address> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ChainError::InvalidAddress(s.to_string()));
    }

    let bytes = hex::decode(stripped.to_ascii_lowercase())
        .map_err(|_| ChainError::InvalidAddress(s.to_string()))?;
    let address = Address::from_slice(&bytes).map_err(|e| ChainError::InvalidAddress(e.to_string()))?;

    let has_upper = stripped.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = stripped.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower && to_checksum_address(&address)[2..] != *stripped {
        return Err(ChainError::InvalidAddress(format!("bad checksum: {}", s)));
    }

    Ok(address)
}
