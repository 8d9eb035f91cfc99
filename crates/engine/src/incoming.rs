//! Incoming claim validation and on-chain claiming.
//!
//! `validate_claim` runs at normal priority; `claim_if_profitable` runs
//! at claim priority so a dispute response is never stuck behind a
//! backlog of validations. Validation failures are logged at debug and
//! leave the cached state untouched; the peer gets no notification.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use paychan_chain::{await_channel, verify_claim, CallKind, ClaimChannel};
use paychan_core::{wei_to_gwei_floor, ChannelState, PaymentClaim, SignedChannel};

use crate::account::{registry_key, ChannelCell};
use crate::engine::SettlementEngine;
use crate::outgoing::AuthorizeFn;
use crate::queue::{PRIORITY_CLAIM, PRIORITY_VALIDATE};
use crate::{EngineError, Result};

const VALIDATE_ATTEMPTS: u32 = 20;
const VALIDATE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Outcome of one validation pass.
enum Verdict {
    /// Claim is acceptable against this channel view.
    Accept { channel: ChannelState },
    /// Permanently unacceptable; drop it.
    Reject(String),
    /// The chain may still catch up (channel or deposit in flight).
    Retry(&'static str),
}

impl SettlementEngine {
    /// Validate a claim received from the peer and, when it is the new
    /// best claim, commit it to the incoming cell.
    pub async fn validate_claim(&self, claim: PaymentClaim) -> Result<ChannelCell> {
        let this = self.strong();
        self.account
            .incoming
            .add(PRIORITY_VALIDATE, move |cell| {
                this.validate_claim_reducer(cell, claim)
            })
            .await
    }

    /// Reducer body: bounded retry around the validation pass, so an
    /// in-flight channel open or deposit gets time to land on-chain.
    async fn validate_claim_reducer(
        self: Arc<Self>,
        cached: ChannelCell,
        claim: PaymentClaim,
    ) -> Result<ChannelCell> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.judge_claim(&cached, &claim).await? {
                Verdict::Accept { channel } => {
                    return self.accept_claim(cached, claim, channel).await;
                }
                Verdict::Reject(reason) => {
                    debug!(
                        account = self.account.name(),
                        channel = %claim.channel_id.short(),
                        "claim dropped: {}",
                        reason
                    );
                    return Ok(cached);
                }
                Verdict::Retry(reason) => {
                    if attempts > VALIDATE_ATTEMPTS {
                        debug!(
                            account = self.account.name(),
                            channel = %claim.channel_id.short(),
                            "claim dropped after {} attempts: {}",
                            attempts - 1,
                            reason
                        );
                        return Ok(cached);
                    }
                    debug!(
                        channel = %claim.channel_id.short(),
                        attempts,
                        "retrying validation: {}",
                        reason
                    );
                    tokio::time::sleep(VALIDATE_RETRY_DELAY).await;
                }
            }
        }
    }

    /// One validation pass: schema, identity, signature, capacity and
    /// novelty, against the cached snapshot or a fresh fetch.
    async fn judge_claim(&self, cached: &ChannelCell, claim: &PaymentClaim) -> Result<Verdict> {
        let channel: ChannelState = match cached {
            // First claim for this account: the channel must already be
            // on-chain, paying us, with an acceptable dispute period.
            None => match self.ledger.fetch_channel(claim.channel_id).await? {
                None => return Ok(Verdict::Retry("channel not yet visible on-chain")),
                Some(state) => {
                    if state.receiver != self.signer.address() {
                        return Ok(Verdict::Reject(format!(
                            "channel pays {}, not us",
                            state.receiver
                        )));
                    }
                    if state.dispute_period < self.config.min_incoming_dispute_period {
                        return Ok(Verdict::Reject(format!(
                            "dispute period {} below minimum {}",
                            state.dispute_period, self.config.min_incoming_dispute_period
                        )));
                    }
                    state
                }
            },
            Some(current) => {
                if claim.channel_id != current.channel.channel_id {
                    return Ok(Verdict::Reject(
                        "claim references a different channel".to_string(),
                    ));
                }
                if claim.value > current.channel.value {
                    // Claimed beyond the cached value: refresh, the
                    // sender may have deposited.
                    match self.ledger.fetch_channel(claim.channel_id).await? {
                        None => {
                            return Ok(Verdict::Reject("channel vanished on-chain".to_string()))
                        }
                        Some(state) => state,
                    }
                } else {
                    current.channel
                }
            }
        };

        if claim.contract_address != self.ledger.contract_address() {
            return Ok(Verdict::Reject(format!(
                "claim against foreign contract {}",
                claim.contract_address
            )));
        }
        if !verify_claim(
            &claim.contract_address,
            &claim.channel_id,
            claim.value,
            &claim.signature,
            &channel.sender,
        ) {
            return Ok(Verdict::Reject(
                "signature does not recover to the channel sender".to_string(),
            ));
        }
        if channel.value < claim.value {
            // A deposit covering the difference may still be confirming.
            return Ok(Verdict::Retry("claim exceeds on-chain value"));
        }

        let cached_spent = cached.as_ref().map(|c| c.spent).unwrap_or(0);
        let best = claim.value.min(channel.value);
        if cached.is_some() && best <= cached_spent {
            return Ok(Verdict::Reject(format!(
                "claim of {} is not better than {}",
                best, cached_spent
            )));
        }

        Ok(Verdict::Accept { channel })
    }

    /// Commit an accepted claim: bind channel uniqueness, credit the
    /// money handler, advance the cached best claim, keep the watcher
    /// alive.
    async fn accept_claim(
        self: Arc<Self>,
        cached: ChannelCell,
        claim: PaymentClaim,
        channel: ChannelState,
    ) -> Result<ChannelCell> {
        // A channel id may only ever be bound to one account. Bound
        // before the commit that relies on it.
        if cached.is_none() {
            let key = registry_key(&claim.channel_id);
            match self.store.get(&key).await? {
                Some(owner) if owner != self.account.name() => {
                    debug!(
                        channel = %claim.channel_id.short(),
                        owner = %owner,
                        "channel already bound to another account"
                    );
                    return Ok(cached);
                }
                Some(_) => {}
                None => {
                    self.store
                        .set(&key, self.account.name().to_string())
                        .await?;
                }
            }
        }

        let cached_spent = cached.as_ref().map(|c| c.spent).unwrap_or(0);
        let increment = claim.value.min(channel.value) - cached_spent;
        let credited_gwei = wei_to_gwei_floor(increment);
        if credited_gwei > 0 {
            let handler = {
                let slot = self.money_handler.read().expect("handler lock poisoned");
                slot.clone()
            };
            if let Some(handler) = handler {
                handler(u64::try_from(credited_gwei).unwrap_or(u64::MAX))
                    .await
                    .map_err(|e| EngineError::Handler(e.to_string()))?;
            }
            self.account
                .with_balances(|balances| balances.receivable -= credited_gwei as i128);
            self.persist_later();
        }

        info!(
            account = self.account.name(),
            channel = %claim.channel_id.short(),
            spent = claim.value,
            credited = credited_gwei,
            "incoming claim accepted"
        );

        self.ensure_watcher();
        let this = self.clone();
        tokio::spawn(async move { this.auto_fund().await });

        Ok(Some(SignedChannel {
            channel,
            spent: claim.value,
            signature: claim.signature,
        }))
    }

    /// Claim the incoming channel on-chain when the fee is worth it (or
    /// the authorizer says go). With `require_disputed`, a healthy
    /// channel is left alone.
    pub async fn claim_if_profitable(
        &self,
        require_disputed: bool,
        authorize: Option<AuthorizeFn>,
    ) -> Result<ChannelCell> {
        let this = self.strong();
        self.account
            .incoming
            .add(PRIORITY_CLAIM, move |cell| {
                this.claim_channel_reducer(cell, require_disputed, authorize)
            })
            .await
    }

    async fn claim_channel_reducer(
        self: Arc<Self>,
        cell: ChannelCell,
        require_disputed: bool,
        authorize: Option<AuthorizeFn>,
    ) -> Result<ChannelCell> {
        let Some(channel) = cell else {
            return Ok(None);
        };
        let channel_id = channel.channel.channel_id;

        let Some(fresh) = self.ledger.fetch_channel(channel_id).await? else {
            debug!(channel = %channel_id.short(), "incoming channel gone on-chain");
            return Ok(None);
        };
        if require_disputed && !fresh.is_disputed() {
            return Ok(Some(channel));
        }

        let fee = self.ledger.estimate_fee(CallKind::Claim).await?;
        let approved = match authorize {
            Some(authorize) => match authorize(fee).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(channel = %channel_id.short(), "claim declined: {}", e);
                    false
                }
            },
            None => fee < channel.spent,
        };
        if !approved {
            debug!(
                channel = %channel_id.short(),
                fee,
                spent = channel.spent,
                "claim not worth the fee, leaving channel"
            );
            return Ok(Some(channel));
        }

        self.ledger
            .claim(ClaimChannel {
                channel_id,
                value: channel.spent,
                signature: channel.signature,
            })
            .await?;
        await_channel(&*self.ledger, channel_id, |state| state.is_none()).await?;

        info!(
            account = self.account.name(),
            channel = %channel_id.short(),
            value = channel.spent,
            "incoming channel claimed"
        );
        Ok(None)
    }

    /// Handle the peer's deposit notification: poll until the incoming
    /// channel's value grows, then fold the fresh value in from inside
    /// the incoming queue, provided the channel identity is unchanged.
    pub(crate) async fn reconcile_peer_deposit(&self) -> Result<()> {
        let Some(cached) = self.account.incoming.state() else {
            return Ok(());
        };
        let channel_id = cached.channel.channel_id;
        let prior_value = cached.channel.value;

        let mut grew = false;
        for _ in 0..VALIDATE_ATTEMPTS {
            match self.ledger.fetch_channel(channel_id).await? {
                Some(state) if state.value > prior_value => {
                    grew = true;
                    break;
                }
                _ => tokio::time::sleep(VALIDATE_RETRY_DELAY).await,
            }
        }
        if !grew {
            debug!(channel = %channel_id.short(), "announced deposit never appeared");
            return Ok(());
        }

        let this = self.strong();
        self.account
            .incoming
            .add(PRIORITY_VALIDATE, move |cell| async move {
                let Some(current) = cell else {
                    return Ok(None);
                };
                match this.ledger.fetch_channel(current.channel.channel_id).await? {
                    Some(fresh)
                        if fresh.sender == current.channel.sender
                            && fresh.receiver == current.channel.receiver =>
                    {
                        Ok(Some(SignedChannel { channel: fresh, ..current }))
                    }
                    _ => Ok(Some(current)),
                }
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::RecordingTransport;
    use paychan_chain::{ChannelLedger, ClaimSigner, MockLedger};
    use paychan_core::{Address, ChannelId, EngineConfig, MemoryStore, StateStore};

    const GWEI: u128 = 1_000_000_000;
    const CONTRACT: Address = Address([0xcc; 20]);

    struct Fixture {
        engine: Arc<SettlementEngine>,
        ledger: Arc<MockLedger>,
        store: Arc<MemoryStore>,
        payer: ClaimSigner,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MockLedger::new(CONTRACT));
        let transport = Arc::new(RecordingTransport::new());
        let config = EngineConfig {
            min_incoming_dispute_period: 100,
            ..EngineConfig::default()
        };
        let engine = SettlementEngine::connect(
            "peer-1",
            config,
            store.clone(),
            ledger.clone(),
            ClaimSigner::random(),
            transport,
        )
        .await
        .unwrap();
        Fixture {
            engine,
            ledger,
            store,
            payer: ClaimSigner::random(),
        }
    }

    impl Fixture {
        /// Put a channel paying us on the mock chain.
        fn fund_incoming(&self, value: u128) -> ChannelId {
            let channel_id = ChannelId::random();
            self.ledger.insert_channel(paychan_core::ChannelState {
                channel_id,
                contract_address: CONTRACT,
                sender: self.payer.address(),
                receiver: self.engine.address(),
                value,
                dispute_period: 1_000,
                disputed_until: None,
            });
            channel_id
        }

        fn claim(&self, channel_id: ChannelId, value: u128) -> PaymentClaim {
            PaymentClaim {
                channel_id,
                signature: self.payer.sign_claim(&CONTRACT, &channel_id, value).unwrap(),
                value,
                contract_address: CONTRACT,
            }
        }
    }

    #[tokio::test]
    async fn test_zero_claim_opens_account_channel() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);

        let cell = f.engine.validate_claim(f.claim(channel_id, 0)).await.unwrap();
        let channel = cell.unwrap();
        assert_eq!(channel.spent, 0);
        assert_eq!(channel.channel.channel_id, channel_id);

        // Registry now binds the channel to this account.
        let owner = f.store.get(&registry_key(&channel_id)).await.unwrap();
        assert_eq!(owner.as_deref(), Some("peer-1"));
    }

    #[tokio::test]
    async fn test_zero_claim_on_existing_channel_rejected() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);

        f.engine.validate_claim(f.claim(channel_id, 2 * GWEI)).await.unwrap();
        let cell = f.engine.validate_claim(f.claim(channel_id, 0)).await.unwrap();
        // Unchanged: the zero claim is not a better claim.
        assert_eq!(cell.unwrap().spent, 2 * GWEI);
    }

    #[tokio::test]
    async fn test_accepts_increasing_claims_and_credits() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);

        f.engine.validate_claim(f.claim(channel_id, 2 * GWEI)).await.unwrap();
        let cell = f.engine.validate_claim(f.claim(channel_id, 5 * GWEI)).await.unwrap();
        assert_eq!(cell.unwrap().spent, 5 * GWEI);

        // Credited 5 gwei total against the receivable balance.
        assert_eq!(f.engine.account().balances().receivable, -5);
    }

    #[tokio::test]
    async fn test_stale_claim_rejected() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);

        f.engine.validate_claim(f.claim(channel_id, 5 * GWEI)).await.unwrap();
        let cell = f.engine.validate_claim(f.claim(channel_id, 3 * GWEI)).await.unwrap();
        assert_eq!(cell.unwrap().spent, 5 * GWEI);
        assert_eq!(f.engine.account().balances().receivable, -5);
    }

    #[tokio::test]
    async fn test_rejects_channel_paying_someone_else() {
        let f = fixture().await;
        let channel_id = ChannelId::random();
        f.ledger.insert_channel(paychan_core::ChannelState {
            channel_id,
            contract_address: CONTRACT,
            sender: f.payer.address(),
            receiver: Address([0x99; 20]),
            value: 10 * GWEI,
            dispute_period: 1_000,
            disputed_until: None,
        });

        let cell = f.engine.validate_claim(f.claim(channel_id, GWEI)).await.unwrap();
        assert!(cell.is_none());
    }

    #[tokio::test]
    async fn test_rejects_short_dispute_period() {
        let f = fixture().await;
        let channel_id = ChannelId::random();
        f.ledger.insert_channel(paychan_core::ChannelState {
            channel_id,
            contract_address: CONTRACT,
            sender: f.payer.address(),
            receiver: f.engine.address(),
            value: 10 * GWEI,
            dispute_period: 99,
            disputed_until: None,
        });

        let cell = f.engine.validate_claim(f.claim(channel_id, GWEI)).await.unwrap();
        assert!(cell.is_none());
    }

    #[tokio::test]
    async fn test_rejects_foreign_contract() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);

        let mut claim = f.claim(channel_id, GWEI);
        claim.contract_address = Address([0xdd; 20]);
        let cell = f.engine.validate_claim(claim).await.unwrap();
        assert!(cell.is_none());
    }

    #[tokio::test]
    async fn test_rejects_forged_signature() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);

        let forger = ClaimSigner::random();
        let claim = PaymentClaim {
            channel_id,
            signature: forger.sign_claim(&CONTRACT, &channel_id, GWEI).unwrap(),
            value: GWEI,
            contract_address: CONTRACT,
        };
        let cell = f.engine.validate_claim(claim).await.unwrap();
        assert!(cell.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_beyond_value_waits_for_deposit() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(GWEI);
        f.engine.validate_claim(f.claim(channel_id, GWEI)).await.unwrap();

        // Claim for 1.5x the channel value: validation retries until the
        // deposit lands.
        let pending = {
            let engine = f.engine.clone();
            let claim = f.claim(channel_id, GWEI + GWEI / 2);
            tokio::spawn(async move { engine.validate_claim(claim).await })
        };
        tokio::time::sleep(Duration::from_millis(600)).await;
        f.ledger.credit_deposit(channel_id, GWEI);

        let cell = pending.await.unwrap().unwrap();
        assert_eq!(cell.unwrap().spent, GWEI + GWEI / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_beyond_value_gives_up() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(GWEI);
        f.engine.validate_claim(f.claim(channel_id, GWEI)).await.unwrap();

        let cell = f
            .engine
            .validate_claim(f.claim(channel_id, 5 * GWEI))
            .await
            .unwrap();
        // The deposit never arrived; cached claim unchanged.
        assert_eq!(cell.unwrap().spent, GWEI);
    }

    #[tokio::test]
    async fn test_channel_id_bound_to_other_account_rejected() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);
        f.store
            .set(&registry_key(&channel_id), "other-peer".to_string())
            .await
            .unwrap();

        let cell = f.engine.validate_claim(f.claim(channel_id, GWEI)).await.unwrap();
        assert!(cell.is_none());
        // Binding untouched.
        let owner = f.store.get(&registry_key(&channel_id)).await.unwrap();
        assert_eq!(owner.as_deref(), Some("other-peer"));
    }

    #[tokio::test]
    async fn test_claim_when_profitable() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);
        f.engine.validate_claim(f.claim(channel_id, 5 * GWEI)).await.unwrap();

        f.ledger.set_fee(CallKind::Claim, GWEI);
        let cell = f.engine.claim_if_profitable(false, None).await.unwrap();
        assert!(cell.is_none());
        assert!(f.ledger.fetch_channel(channel_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unprofitable_claim_is_skipped() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);
        f.engine.validate_claim(f.claim(channel_id, GWEI)).await.unwrap();

        f.ledger.set_fee(CallKind::Claim, 2 * GWEI);
        let cell = f.engine.claim_if_profitable(false, None).await.unwrap();
        assert_eq!(cell.unwrap().spent, GWEI);
        assert!(f.ledger.fetch_channel(channel_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_require_disputed_leaves_healthy_channel() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(10 * GWEI);
        f.engine.validate_claim(f.claim(channel_id, 5 * GWEI)).await.unwrap();

        f.ledger.set_fee(CallKind::Claim, GWEI);
        let cell = f.engine.claim_if_profitable(true, None).await.unwrap();
        assert!(cell.is_some());
        assert!(f.ledger.fetch_channel(channel_id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_peer_deposit_updates_value() {
        let f = fixture().await;
        let channel_id = f.fund_incoming(GWEI);
        f.engine.validate_claim(f.claim(channel_id, GWEI)).await.unwrap();

        f.ledger.credit_deposit(channel_id, GWEI);
        f.engine.reconcile_peer_deposit().await.unwrap();

        let cell = f.engine.account().incoming.state().unwrap();
        assert_eq!(cell.channel.value, 2 * GWEI);
        assert_eq!(cell.spent, GWEI);
    }
}
