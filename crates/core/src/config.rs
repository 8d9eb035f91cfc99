//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Per-engine settlement settings.
///
/// Channel amounts are wei; packet and balance limits are gwei.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default value for a new outgoing channel, and the top-up
    /// increment once remaining capacity drops below half of it.
    #[serde(default = "default_outgoing_channel_amount")]
    pub outgoing_channel_amount: u128,

    /// Minimum incoming channel value before we collateralize the peer
    /// with an auto-funded outgoing channel.
    #[serde(default = "default_min_incoming_channel_amount")]
    pub min_incoming_channel_amount: u128,

    /// Dispute period committed to new outgoing channels, in blocks.
    #[serde(default = "default_outgoing_dispute_period")]
    pub outgoing_dispute_period: u64,

    /// Floor for accepting an incoming channel's dispute period.
    #[serde(default = "default_min_incoming_dispute_period")]
    pub min_incoming_dispute_period: u64,

    /// Polling period of the channel watcher, in milliseconds.
    #[serde(default = "default_channel_watcher_interval_ms")]
    pub channel_watcher_interval_ms: u64,

    /// Per-packet size cap, in gwei.
    #[serde(default = "default_max_packet_amount")]
    pub max_packet_amount: u64,

    /// Receivable balance cap, in gwei.
    #[serde(default = "default_max_balance")]
    pub max_balance: i128,
}

// 0.04 ETH per channel, topped up in kind.
fn default_outgoing_channel_amount() -> u128 {
    40_000_000_000_000_000
}

// 0.0025 ETH before we reciprocate with collateral.
fn default_min_incoming_channel_amount() -> u128 {
    2_500_000_000_000_000
}

// Roughly one week at 15s blocks.
fn default_outgoing_dispute_period() -> u64 {
    40_320
}

// Roughly three days at 15s blocks.
fn default_min_incoming_dispute_period() -> u64 {
    17_280
}

fn default_channel_watcher_interval_ms() -> u64 {
    60_000
}

fn default_max_packet_amount() -> u64 {
    u64::MAX
}

fn default_max_balance() -> i128 {
    i128::MAX
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outgoing_channel_amount: default_outgoing_channel_amount(),
            min_incoming_channel_amount: default_min_incoming_channel_amount(),
            outgoing_dispute_period: default_outgoing_dispute_period(),
            min_incoming_dispute_period: default_min_incoming_dispute_period(),
            channel_watcher_interval_ms: default_channel_watcher_interval_ms(),
            max_packet_amount: default_max_packet_amount(),
            max_balance: default_max_balance(),
        }
    }
}
