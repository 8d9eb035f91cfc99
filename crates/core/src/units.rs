//! Unit conversions.
//!
//! On-chain values are wei; packet amounts and account balances are
//! gwei. Crediting a peer always rounds down.

/// Wei per gwei.
pub const WEI_PER_GWEI: u128 = 1_000_000_000;

/// Convert a gwei amount to wei.
pub fn gwei_to_wei(gwei: u128) -> u128 {
    gwei.saturating_mul(WEI_PER_GWEI)
}

/// Convert a wei amount to gwei, rounding down.
pub fn wei_to_gwei_floor(wei: u128) -> u128 {
    wei / WEI_PER_GWEI
}
