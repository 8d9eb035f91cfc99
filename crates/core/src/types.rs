//! Channel and claim types.
//!
//! On-chain values (channel `value`, claim `value`, `spent`) are wei.
//! Balances held by the engine are gwei. See [`crate::units`] for the
//! conversions.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// 20-byte on-chain account address.
///
/// Displays as `0x`-prefixed lowercase hex. Checksum (mixed-case)
/// validation for addresses received from a peer lives in the chain
/// crate; this type only deals in raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Create from a byte slice; the slice must be exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidAddress(format!("expected 20 bytes, got {}", bytes.len())))?;
        Ok(Address(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        if stripped.len() != 40 {
            return Err(CoreError::InvalidAddress(s.to_string()));
        }
        let bytes = hex::decode(stripped).map_err(|_| CoreError::InvalidAddress(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// 32-byte channel identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Generate a fresh random identifier for a new outgoing channel.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        ChannelId(bytes)
    }

    /// Short display (first 4 bytes), for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for ChannelId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        if stripped.len() != 64 {
            return Err(CoreError::InvalidChannelId(s.to_string()));
        }
        let bytes = hex::decode(stripped).map_err(|_| CoreError::InvalidChannelId(s.to_string()))?;
        let arr: [u8; 32] = bytes.try_into().expect("length checked above");
        Ok(ChannelId(arr))
    }
}

/// Flat 65-byte recoverable signature: `r ‖ s ‖ v`, `v ∈ {27, 28}`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClaimSignature(pub [u8; 65]);

impl ClaimSignature {
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// The recovery byte `v`.
    pub fn v(&self) -> u8 {
        self.0[64]
    }
}

impl fmt::Display for ClaimSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ClaimSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}…{}", hex::encode(&self.0[..4]), self.0[64])
    }
}

impl FromStr for ClaimSignature {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        if stripped.len() != 130 {
            return Err(CoreError::InvalidSignature(s.to_string()));
        }
        let bytes = hex::decode(stripped).map_err(|_| CoreError::InvalidSignature(s.to_string()))?;
        let arr: [u8; 65] = bytes.try_into().expect("length checked above");
        Ok(ClaimSignature(arr))
    }
}

// Hex-string serde for the three newtypes, so persisted snapshots and
// peer-facing JSON stay human-readable.
macro_rules! hex_string_serde {
    ($ty:ident, $expecting:expr) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct HexVisitor;

                impl<'de> Visitor<'de> for HexVisitor {
                    type Value = $ty;

                    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<$ty, E> {
                        v.parse().map_err(|e| E::custom(format!("{}", e)))
                    }
                }

                deserializer.deserialize_str(HexVisitor)
            }
        }
    };
}

hex_string_serde!(Address, "a 0x-prefixed 40-char hex address");
hex_string_serde!(ChannelId, "a 0x-prefixed 64-char hex channel id");
hex_string_serde!(ClaimSignature, "a 0x-prefixed 130-char hex signature");

/// On-chain view of a unidirectional payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: ChannelId,
    /// Address of the channel contract this channel lives on.
    pub contract_address: Address,
    /// The funding party; claims must be signed by this key.
    pub sender: Address,
    /// The party entitled to claim up to `spent`.
    pub receiver: Address,
    /// Total deposited, in wei.
    pub value: u128,
    /// Close delay committed by the sender, in blocks.
    pub dispute_period: u64,
    /// Block height at which a started dispute expires. `None` while
    /// the channel is open and undisputed.
    pub disputed_until: Option<u64>,
}

impl ChannelState {
    pub fn is_disputed(&self) -> bool {
        self.disputed_until.is_some()
    }
}

/// A channel together with its best claim.
///
/// Used for both cells of an account: the outgoing cell stores the
/// latest claim we signed, the incoming cell stores the peer's best
/// claim we accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedChannel {
    pub channel: ChannelState,
    /// Wei paid via the latest claim. `0 <= spent <= channel.value`.
    pub spent: u128,
    /// Signature over `(contract_address, channel_id, spent)`.
    pub signature: ClaimSignature,
}

impl SignedChannel {
    /// Capacity left for further claims, in wei.
    pub fn remaining(&self) -> u128 {
        self.channel.value.saturating_sub(self.spent)
    }

    /// The wire form of this channel's best claim.
    pub fn claim(&self) -> PaymentClaim {
        PaymentClaim {
            channel_id: self.channel.channel_id,
            signature: self.signature,
            value: self.spent,
            contract_address: self.channel.contract_address,
        }
    }
}

/// A payment claim as exchanged with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentClaim {
    pub channel_id: ChannelId,
    pub signature: ClaimSignature,
    /// Cumulative amount authorized, in wei.
    pub value: u128,
    pub contract_address: Address,
}

/// Persisted form of an account, written through after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub account_name: String,
    /// Owed to us by the peer, gwei.
    pub receivable_balance: i128,
    /// Owed by us to the peer, gwei.
    pub payable_balance: i128,
    /// Promised but not yet reflected in a signed claim, gwei.
    pub payout_amount: u128,
    pub peer_address: Option<Address>,
    pub incoming: Option<SignedChannel>,
    pub outgoing: Option<SignedChannel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address(byte: u8) -> Address {
        Address([byte; 20])
    }

    fn test_channel(value: u128) -> ChannelState {
        ChannelState {
            channel_id: ChannelId([7u8; 32]),
            contract_address: test_address(1),
            sender: test_address(2),
            receiver: test_address(3),
            value,
            dispute_period: 1000,
            disputed_until: None,
        }
    }

    #[test]
    fn test_address_roundtrip() {
        let addr = test_address(0xab);
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn test_address_rejects_bad_length() {
        assert!("0xabcd".parse::<Address>().is_err());
        assert!(Address::from_slice(&[0u8; 19]).is_err());
    }

    #[test]
    fn test_address_parse_without_prefix() {
        let parsed: Address = "ab".repeat(20).parse().unwrap();
        assert_eq!(parsed, test_address(0xab));
    }

    #[test]
    fn test_channel_id_random_distinct() {
        assert_ne!(ChannelId::random(), ChannelId::random());
    }

    #[test]
    fn test_channel_id_roundtrip() {
        let id = ChannelId::random();
        let parsed: ChannelId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_signature_roundtrip() {
        let mut bytes = [0x11u8; 65];
        bytes[64] = 27;
        let sig = ClaimSignature(bytes);
        let parsed: ClaimSignature = sig.to_string().parse().unwrap();
        assert_eq!(sig, parsed);
        assert_eq!(parsed.v(), 27);
    }

    #[test]
    fn test_signed_channel_remaining() {
        let ch = SignedChannel {
            channel: test_channel(1_000),
            spent: 400,
            signature: ClaimSignature([0u8; 65]),
        };
        assert_eq!(ch.remaining(), 600);
    }

    #[test]
    fn test_claim_json_field_names() {
        let claim = PaymentClaim {
            channel_id: ChannelId([7u8; 32]),
            signature: ClaimSignature([0u8; 65]),
            value: 12345,
            contract_address: test_address(1),
        };
        let json = serde_json::to_value(&claim).unwrap();
        assert!(json.get("channelId").is_some());
        assert!(json.get("contractAddress").is_some());
        assert_eq!(json["value"], 12345);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = AccountSnapshot {
            account_name: "peer-1".to_string(),
            receivable_balance: -5,
            payable_balance: 10,
            payout_amount: 3,
            peer_address: Some(test_address(9)),
            incoming: None,
            outgoing: Some(SignedChannel {
                channel: test_channel(500),
                spent: 100,
                signature: ClaimSignature([2u8; 65]),
            }),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: AccountSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.receivable_balance, -5);
        assert_eq!(back.outgoing.unwrap().spent, 100);
    }
}
