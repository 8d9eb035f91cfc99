//! Outgoing settlement: channel funding and claim production.
//!
//! Everything here runs inside the account's outgoing queue, with one
//! exception: while a deposit transaction is in flight, claim creation
//! runs on a transient side-queue seeded with the pre-deposit state, so
//! settlement throughput does not stall behind the confirmation wait.
//! The merge at deposit completion keeps the fresh on-chain identity
//! and value and the side-queue's spent/signature; both were produced
//! against the pre-deposit value, so `spent <= pre_value <= post_value`
//! and monotonicity holds.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info};

use paychan_chain::{await_channel, CallKind, Deposit, OpenChannel};
use paychan_core::{gwei_to_wei, wei_to_gwei_floor, ChannelId, ChannelState, SignedChannel};

use crate::account::ChannelCell;
use crate::engine::SettlementEngine;
use crate::queue::{ReducerQueue, PRIORITY_VALIDATE};
use crate::{EngineError, Result};

/// Fee approval hook: receives the estimated fee in wei and may
/// decline, in which case no transaction is sent.
pub type AuthorizeFn = Box<dyn FnOnce(u128) -> BoxFuture<'static, Result<()>> + Send>;

/// Approve any fee. Used by auto-funding.
pub fn authorize_always() -> AuthorizeFn {
    Box::new(|_fee| async { Ok(()) }.boxed())
}

/// Merge the completed deposit with whatever the side-queue reached:
/// channel identity and value from the fresh on-chain snapshot, spent
/// and signature from the claims produced while the deposit ran.
fn merge_deposit(on_chain: ChannelState, side: ChannelCell) -> ChannelCell {
    side.map(|side_channel| SignedChannel {
        channel: on_chain,
        spent: side_channel.spent,
        signature: side_channel.signature,
    })
}

impl SettlementEngine {
    /// Open a channel to the peer, or top up the existing one.
    pub async fn fund_outgoing_channel(
        &self,
        value: u128,
        authorize: AuthorizeFn,
    ) -> Result<ChannelCell> {
        let this = self.strong();
        self.account
            .outgoing
            .add(PRIORITY_VALIDATE, move |cell| async move {
                match cell {
                    None => this.open_channel(value, authorize).await,
                    Some(channel) => this.deposit_to_channel(channel, value, authorize).await,
                }
            })
            .await
    }

    /// Top up the outgoing channel when it runs low, gated on the peer
    /// having collateralized us first. Conditions are re-checked inside
    /// the reducer, so a stale trigger becomes a no-op.
    pub fn auto_fund(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.is_unloaded() {
                return;
            }
            let this = self.strong();
            let result = self
                .account
                .outgoing
                .add(PRIORITY_VALIDATE, move |cell| async move {
                    let amount = this.config.outgoing_channel_amount;
                    let needs_funding = match &cell {
                        None => true,
                        Some(channel) => channel.remaining() < amount / 2,
                    };
                    let solvent = matches!(
                        this.account.incoming.state(),
                        Some(channel) if channel.channel.value >= this.config.min_incoming_channel_amount
                    );
                    if !needs_funding || !solvent {
                        return Ok(cell);
                    }
                    match cell {
                        None => this.open_channel(amount, authorize_always()).await,
                        Some(channel) => this.deposit_to_channel(channel, amount, authorize_always()).await,
                    }
                })
                .await;
            if let Err(e) = result {
                error!(account = self.account.name(), "auto-funding failed: {}", e);
            }
        }
        .boxed()
    }

    /// Open a new outgoing channel. Reducer body; aborts silently when
    /// the peer's address cannot be learned or the fee is declined.
    async fn open_channel(
        self: Arc<Self>,
        value: u128,
        authorize: AuthorizeFn,
    ) -> Result<ChannelCell> {
        let receiver = match self.account.peer_address() {
            Some(address) => address,
            None => {
                self.exchange_info().await;
                match self.account.peer_address() {
                    Some(address) => address,
                    None => {
                        debug!(account = self.account.name(), "peer address unknown, not opening");
                        return Ok(None);
                    }
                }
            }
        };

        let channel_id = ChannelId::random();
        let fee = self.ledger.estimate_fee(CallKind::Open).await?;
        if let Err(e) = authorize(fee).await {
            debug!(account = self.account.name(), "open not authorized: {}", e);
            return Ok(None);
        }

        self.ledger
            .open_channel(OpenChannel {
                channel_id,
                sender: self.signer.address(),
                receiver,
                dispute_period: self.config.outgoing_dispute_period,
                value,
            })
            .await?;

        let state = await_channel(&*self.ledger, channel_id, |state| state.is_some())
            .await?
            .ok_or(paychan_chain::ChainError::RefreshTimeout(channel_id))?;

        // Zero-amount claim so the peer can link the channel to us.
        let signature =
            self.signer
                .sign_claim(&state.contract_address, &channel_id, 0)?;
        let channel = SignedChannel { channel: state, spent: 0, signature };

        info!(
            account = self.account.name(),
            channel = %channel_id.short(),
            value,
            "outgoing channel open"
        );
        self.forward_claim(channel.claim());
        Ok(Some(channel))
    }

    /// Deposit into the existing channel. Claim signing continues on a
    /// transient side-queue while the transaction confirms.
    async fn deposit_to_channel(
        self: Arc<Self>,
        channel: SignedChannel,
        value: u128,
        authorize: AuthorizeFn,
    ) -> Result<ChannelCell> {
        let channel_id = channel.channel.channel_id;
        let prior_value = channel.channel.value;

        let side = Arc::new(ReducerQueue::new(Some(channel)));
        *self.side_queue.lock().await = Some(side.clone());

        // Drain any settlement request that arrived just before the
        // deposit took the main queue. Enqueued now, awaited off-task.
        {
            let this = self.clone();
            let pending = side.add(PRIORITY_VALIDATE, move |cell| this.create_claim(cell));
            tokio::spawn(async move {
                if let Err(e) = pending.await {
                    debug!("pre-deposit claim creation failed: {}", e);
                }
            });
        }

        let deposit_outcome: Result<ChannelState> = async {
            let fee = self.ledger.estimate_fee(CallKind::Deposit).await?;
            authorize(fee)
                .await
                .map_err(|e| EngineError::AuthorizeDeclined(e.to_string()))?;
            self.ledger.deposit(Deposit { channel_id, value }).await?;

            let target = prior_value + value;
            let state = await_channel(&*self.ledger, channel_id, move |state| {
                matches!(state, Some(c) if c.value >= target)
            })
            .await?;
            state.ok_or_else(|| paychan_chain::ChainError::RefreshTimeout(channel_id).into())
        }
        .await;

        match &deposit_outcome {
            Ok(state) => {
                info!(
                    account = self.account.name(),
                    channel = %channel_id.short(),
                    value = state.value,
                    "deposit confirmed"
                );
                self.notify_deposit();
            }
            Err(EngineError::AuthorizeDeclined(reason)) => {
                debug!(account = self.account.name(), "deposit not authorized: {}", reason);
            }
            Err(e) => {
                error!(account = self.account.name(), "deposit failed: {}", e);
            }
        }

        // Stop routing new claims to the side-queue, then drain it.
        // Claims signed while the deposit was pending are kept either way.
        *self.side_queue.lock().await = None;
        let side_final = side.clear().await?;

        Ok(match deposit_outcome {
            Ok(on_chain) => merge_deposit(on_chain, side_final),
            Err(_) => side_final,
        })
    }

    /// Add to the payout backlog and settle as much of it as the
    /// channel allows. With no amount, settles the outstanding payable
    /// balance.
    pub async fn send_money(&self, amount: Option<u64>) -> Result<ChannelCell> {
        self.account.with_balances(|balances| {
            let add: u128 = match amount {
                Some(amount) => amount as u128,
                None => balances.payable.max(0) as u128,
            };
            balances.payout += add;
        });
        self.persist_later();

        let this = self.strong();
        let side = { self.side_queue.lock().await.clone() };
        match side {
            Some(queue) => {
                queue
                    .add(PRIORITY_VALIDATE, move |cell| this.create_claim(cell))
                    .await
            }
            None => {
                self.account
                    .outgoing
                    .add(PRIORITY_VALIDATE, move |cell| this.create_claim(cell))
                    .await
            }
        }
    }

    /// Claim-producing reducer: convert as much of the payout backlog
    /// as the channel's remaining capacity covers into a higher signed
    /// claim, and transmit it.
    pub(crate) async fn create_claim(self: Arc<Self>, cell: ChannelCell) -> Result<ChannelCell> {
        // Opportunistic top-up check; never blocks claim production.
        {
            let this = self.clone();
            tokio::spawn(async move { this.auto_fund().await });
        }

        let Some(channel) = cell else {
            debug!(account = self.account.name(), "no outgoing channel, settlement deferred");
            return Ok(None);
        };

        let budget = gwei_to_wei(self.account.balances().payout);
        let remaining = channel.remaining();
        if budget == 0 || remaining == 0 {
            return Ok(Some(channel));
        }

        let increment = budget.min(remaining);
        let new_spent = channel.spent + increment;
        let signature = self.signer.sign_claim(
            &channel.channel.contract_address,
            &channel.channel.channel_id,
            new_spent,
        )?;
        let updated = SignedChannel {
            channel: channel.channel,
            spent: new_spent,
            signature,
        };

        let settled_gwei = wei_to_gwei_floor(increment);
        self.account.with_balances(|balances| {
            balances.payable -= settled_gwei as i128;
            balances.payout = balances.payout.saturating_sub(settled_gwei);
        });
        self.persist_later();

        debug!(
            account = self.account.name(),
            channel = %updated.channel.channel_id.short(),
            spent = new_spent,
            "claim updated"
        );
        self.forward_claim(updated.claim());
        Ok(Some(updated))
    }
}
