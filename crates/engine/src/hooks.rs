//! Forwarding hooks.
//!
//! Inbound prepares are admitted against the packet and balance caps
//! before the data handler sees them; the receivable credit sticks on a
//! fulfill and rolls back on a reject. Replies to prepares we forwarded
//! drive settlement: a fulfill raises the payable balance and triggers
//! `send_money`, a liquidity reject makes us re-send the latest claim
//! in case the peer missed it.

use tracing::debug;

use paychan_core::{
    Packet, Prepare, CODE_AMOUNT_TOO_LARGE, CODE_INSUFFICIENT_LIQUIDITY, CODE_INTERNAL_ERROR,
    CODE_UNREACHABLE,
};

use crate::engine::SettlementEngine;
use crate::messaging::PeerMessage;
use crate::{EngineError, Result};

impl SettlementEngine {
    /// Admit an inbound prepare, hand it to the data handler, and
    /// settle the receivable credit according to the reply.
    pub async fn handle_incoming_prepare(&self, prepare: Prepare) -> Packet {
        if prepare.amount > self.config.max_packet_amount {
            return Packet::reject(
                CODE_AMOUNT_TOO_LARGE,
                format!(
                    "packet of {} gwei exceeds maximum of {} gwei",
                    prepare.amount, self.config.max_packet_amount
                ),
            );
        }

        let admitted = self.account.with_balances(|balances| {
            let next = balances.receivable + prepare.amount as i128;
            if next > self.config.max_balance {
                false
            } else {
                balances.receivable = next;
                true
            }
        });
        if !admitted {
            return Packet::reject(
                CODE_INSUFFICIENT_LIQUIDITY,
                format!(
                    "accepting {} gwei would exceed the balance cap of {} gwei",
                    prepare.amount, self.config.max_balance
                ),
            );
        }
        self.persist_later();

        let handler = {
            let slot = self.data_handler.read().expect("handler lock poisoned");
            slot.clone()
        };
        let Some(handler) = handler else {
            self.roll_back_receivable(prepare.amount);
            return Packet::reject(CODE_UNREACHABLE, "no data handler registered");
        };

        match handler(prepare.clone()).await {
            Ok(Packet::Fulfill(fulfill)) => Packet::Fulfill(fulfill),
            Ok(Packet::Reject(reject)) => {
                self.roll_back_receivable(prepare.amount);
                Packet::Reject(reject)
            }
            Ok(Packet::Prepare(_)) => {
                self.roll_back_receivable(prepare.amount);
                Packet::reject(CODE_INTERNAL_ERROR, "handler returned a prepare")
            }
            Err(e) => {
                self.roll_back_receivable(prepare.amount);
                Packet::reject_from_error(e)
            }
        }
    }

    fn roll_back_receivable(&self, amount: u64) {
        self.account
            .with_balances(|balances| balances.receivable -= amount as i128);
        self.persist_later();
    }

    /// Forward a prepare to the peer and process the reply.
    pub async fn send_packet(&self, prepare: Prepare) -> Result<Packet> {
        let amount = prepare.amount;
        let records = PeerMessage::Packet(Packet::Prepare(prepare).to_bytes()).into_protocols();
        let response = self.transport.send_protocols(records).await?;

        let reply = match PeerMessage::from_protocols(&response)? {
            Some(PeerMessage::Packet(bytes)) => Packet::from_bytes(&bytes)?,
            _ => {
                return Err(EngineError::Transport(
                    "peer reply carried no packet".to_string(),
                ))
            }
        };
        self.handle_outbound_reply(amount, &reply).await;
        Ok(reply)
    }

    /// Process the reply to a prepare we forwarded.
    pub async fn handle_outbound_reply(&self, amount: u64, reply: &Packet) {
        match reply {
            Packet::Fulfill(_) => {
                self.account
                    .with_balances(|balances| balances.payable += amount as i128);
                self.persist_later();

                let this = self.strong();
                tokio::spawn(async move {
                    if let Err(e) = this.send_money(None).await {
                        debug!(
                            account = this.account.name(),
                            "settlement after fulfill failed: {}",
                            e
                        );
                    }
                });
            }
            Packet::Reject(reject) if reject.code == CODE_INSUFFICIENT_LIQUIDITY => {
                // The peer may have missed our latest claim.
                if let Some(channel) = self.account.outgoing.state() {
                    debug!(
                        account = self.account.name(),
                        "peer reports missing liquidity, re-sending latest claim"
                    );
                    self.forward_claim(channel.claim());
                }
            }
            _ => {}
        }
    }
}
