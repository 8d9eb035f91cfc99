//! Forwarded-packet types.
//!
//! The engine only needs the request/accept/refuse shape of the
//! upstream packet protocol and the amounts riding on it; the full
//! wire codec is the plugin layer's concern. Packets cross the peer
//! link as JSON inside the `ilp` sub-protocol record.
//!
//! Amounts are gwei.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Reject code: packet amount above the configured cap.
pub const CODE_AMOUNT_TOO_LARGE: &str = "F08";
/// Reject code: accepting the packet would exceed the balance cap.
pub const CODE_INSUFFICIENT_LIQUIDITY: &str = "T04";
/// Reject code: a handler failed while processing the packet.
pub const CODE_INTERNAL_ERROR: &str = "T00";
/// Reject code: no handler is registered to take the packet.
pub const CODE_UNREACHABLE: &str = "F02";

/// A forwarded payment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    /// Amount of credit the packet consumes, gwei.
    pub amount: u64,
    pub destination: String,
    pub data: Vec<u8>,
}

/// Acceptance of a prepare; the credit sticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfill {
    pub fulfillment: [u8; 32],
    pub data: Vec<u8>,
}

/// Refusal of a prepare; the credit rolls back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub code: String,
    pub message: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    Prepare(Prepare),
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Packet {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("packet serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))
    }

    pub fn reject(code: &str, message: impl Into<String>) -> Self {
        Packet::Reject(Reject {
            code: code.to_string(),
            message: message.into(),
            data: Vec::new(),
        })
    }

    /// Translate a handler failure into a reject reply.
    pub fn reject_from_error(err: impl std::fmt::Display) -> Self {
        Packet::reject(CODE_INTERNAL_ERROR, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::Prepare(Prepare {
            amount: 42,
            destination: "g.peer".to_string(),
            data: vec![1, 2, 3],
        });
        let back = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(packet, back);
    }

    #[test]
    fn test_reject_helper() {
        let Packet::Reject(reject) = Packet::reject(CODE_AMOUNT_TOO_LARGE, "too big") else {
            panic!("expected reject");
        };
        assert_eq!(reject.code, "F08");
        assert_eq!(reject.message, "too big");
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Packet::from_bytes(b"not json").is_err());
    }
}
