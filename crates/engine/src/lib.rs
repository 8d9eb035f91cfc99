//! Paychan Settlement Engine
//!
//! One engine instance manages one peer account. Packets flowing
//! between the peers accumulate net debt; the engine settles what it
//! owes by signing monotonically increasing claims against its outgoing
//! channel, validates the peer's claims against the incoming channel,
//! and runs the on-chain channel lifecycle (open, deposit, watch,
//! claim).
//!
//! ## Components
//!
//! - **ReducerQueue**: serializes all mutation of a channel cell
//! - **Account**: balances, peer address and the two channel cells
//! - **Outgoing engine**: auto-funding, deposits, claim production
//! - **Incoming engine**: claim validation and on-chain claiming
//! - **Channel watcher**: dispute detection
//! - **Messaging adapter**: the five peer sub-protocols
//! - **Forwarding hooks**: packet admission and reply handling

mod account;
mod engine;
mod hooks;
mod incoming;
mod messaging;
mod outgoing;
mod queue;
mod watcher;

pub use account::*;
pub use engine::*;
pub use messaging::*;
pub use outgoing::{authorize_always, AuthorizeFn};
pub use queue::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Queue closed")]
    QueueClosed,

    #[error("Chain error: {0}")]
    Chain(#[from] paychan_chain::ChainError),

    #[error("Store error: {0}")]
    Store(#[from] paychan_core::StoreError),

    #[error("Codec error: {0}")]
    Core(#[from] paychan_core::CoreError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authorization declined: {0}")]
    AuthorizeDeclined(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
