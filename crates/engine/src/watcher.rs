//! Channel watcher.
//!
//! While an incoming claim is cached, a periodic task polls the
//! channel's on-chain state. The moment the channel is disputed (the
//! sender started closing) or has vanished, the best claim is submitted
//! at claim priority so it is not stuck behind queued validations. The
//! watcher stops itself once no incoming claim remains.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::SettlementEngine;

impl SettlementEngine {
    /// Start the watcher if it is not already running.
    pub(crate) fn ensure_watcher(&self) {
        if self.watcher_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = self.weak_self.clone();
        let period = Duration::from_millis(self.config.channel_watcher_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly
            // accepted claim is not re-checked at once.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(engine) = weak.upgrade() else {
                    return;
                };
                if engine.is_unloaded() {
                    engine.watcher_running.store(false, Ordering::SeqCst);
                    return;
                }
                let Some(channel) = engine.account.incoming.state() else {
                    debug!(account = engine.account.name(), "no incoming claim left, watcher stopping");
                    engine.watcher_running.store(false, Ordering::SeqCst);
                    return;
                };

                let channel_id = channel.channel.channel_id;
                match engine.ledger.fetch_channel(channel_id).await {
                    Ok(Some(fresh)) if !fresh.is_disputed() => {}
                    Ok(state) => {
                        info!(
                            account = engine.account.name(),
                            channel = %channel_id.short(),
                            gone = state.is_none(),
                            "incoming channel disputed or gone, submitting best claim"
                        );
                        if let Err(e) = engine.claim_if_profitable(true, None).await {
                            error!(
                                channel = %channel_id.short(),
                                "claim submission failed: {}",
                                e
                            );
                        }
                    }
                    Err(e) => {
                        debug!(channel = %channel_id.short(), "watcher poll failed: {}", e);
                    }
                }
            }
        });
    }
}
