//! Paychan Core Types
//!
//! This crate defines the fundamental data structures shared by the
//! settlement engine and the on-chain adapter: addresses, channels,
//! claims, packet types, unit conversions and configuration.

mod config;
mod error;
mod packet;
mod store;
mod types;
mod units;

pub use config::*;
pub use error::*;
pub use packet::*;
pub use store::*;
pub use types::*;
pub use units::*;
