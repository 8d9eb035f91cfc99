//! Paychan Chain Adapter
//!
//! Claim signing (recoverable secp256k1 over the contract's Keccak-256
//! digest) and the seam to the channel contract: a [`ChannelLedger`]
//! trait for reads and confirmed submissions, plus an in-memory
//! [`MockLedger`] so the engine is fully exercisable without a node.

mod client;
mod signing;

pub use client::*;
pub use signing::*;

use paychan_core::ChannelId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Channel {0} did not reach the expected state")]
    RefreshTimeout(ChannelId),
}

pub type Result<T> = std::result::Result<T, ChainError>;
