//! Channel contract adapter.
//!
//! [`ChannelLedger`] is the seam to the chain: reads return the current
//! channel record or its absence, submissions block until the
//! transaction confirms (retry and gas bumping are the implementor's
//! concern). [`MockLedger`] tracks channels in-memory with scriptable
//! fees, dispute control and failure injection, so the whole engine
//! runs in tests without a node.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use paychan_core::{Address, ChannelId, ChannelState, ClaimSignature};

use crate::signing::recover_claim_signer;
use crate::{ChainError, Result};

/// Transaction hash of a confirmed submission.
pub type TxHash = [u8; 32];

/// Contract call kinds, for fee estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Open,
    Deposit,
    Claim,
}

/// `open(channelId, receiver, disputePeriod)` with attached value.
#[derive(Debug, Clone)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub sender: Address,
    pub receiver: Address,
    pub dispute_period: u64,
    /// Attached deposit, wei.
    pub value: u128,
}

/// `deposit(channelId)` with attached value.
#[derive(Debug, Clone)]
pub struct Deposit {
    pub channel_id: ChannelId,
    /// Attached top-up, wei.
    pub value: u128,
}

/// `claim(channelId, value, signature)`.
#[derive(Debug, Clone)]
pub struct ClaimChannel {
    pub channel_id: ChannelId,
    /// Claimed amount, wei.
    pub value: u128,
    pub signature: ClaimSignature,
}

/// Read and write access to the channel contract.
#[async_trait]
pub trait ChannelLedger: Send + Sync {
    /// The channel contract this ledger talks to.
    fn contract_address(&self) -> Address;

    async fn fetch_channel(&self, channel_id: ChannelId) -> Result<Option<ChannelState>>;

    async fn open_channel(&self, call: OpenChannel) -> Result<TxHash>;

    async fn deposit(&self, call: Deposit) -> Result<TxHash>;

    async fn claim(&self, call: ClaimChannel) -> Result<TxHash>;

    /// Estimated total fee for a call, wei.
    async fn estimate_fee(&self, kind: CallKind) -> Result<u128>;
}

const REFRESH_ATTEMPTS: u32 = 20;
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Poll the ledger until `predicate` holds for the fetched state.
///
/// Used to wait for channel appearance after `open`, value equality
/// after `deposit`, and absence after `claim`.
pub async fn await_channel<F>(
    ledger: &dyn ChannelLedger,
    channel_id: ChannelId,
    mut predicate: F,
) -> Result<Option<ChannelState>>
where
    F: FnMut(&Option<ChannelState>) -> bool + Send,
{
    for attempt in 1..=REFRESH_ATTEMPTS {
        let state = ledger.fetch_channel(channel_id).await?;
        if predicate(&state) {
            return Ok(state);
        }
        debug!(
            channel = %channel_id.short(),
            attempt,
            "channel not yet in expected state, polling again"
        );
        if attempt < REFRESH_ATTEMPTS {
            tokio::time::sleep(REFRESH_INTERVAL).await;
        }
    }
    Err(ChainError::RefreshTimeout(channel_id))
}

/// In-memory chain state shared by every handle of a [`MockLedger`].
#[derive(Debug, Default)]
struct MockChain {
    channels: HashMap<ChannelId, ChannelState>,
    fees: HashMap<CallKind, u128>,
    /// Submissions to fail before behaving normally again.
    fail_submissions: u32,
    /// Artificial confirmation delay for submissions.
    submit_delay: Duration,
    tx_counter: u64,
}

/// Mock channel contract for tests and development.
#[derive(Debug, Clone)]
pub struct MockLedger {
    contract: Address,
    chain: Arc<RwLock<MockChain>>,
}

impl MockLedger {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            chain: Arc::new(RwLock::new(MockChain::default())),
        }
    }

    /// Set the estimated fee for a call kind, wei.
    pub fn set_fee(&self, kind: CallKind, fee: u128) {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        chain.fees.insert(kind, fee);
    }

    /// Fail the next `count` submissions with a transaction error.
    pub fn fail_next_submissions(&self, count: u32) {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        chain.fail_submissions = count;
    }

    /// Delay every submission by `delay` before it confirms.
    pub fn set_submit_delay(&self, delay: Duration) {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        chain.submit_delay = delay;
    }

    /// Insert a channel record directly, bypassing `open`.
    pub fn insert_channel(&self, state: ChannelState) {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        chain.channels.insert(state.channel_id, state);
    }

    /// Raise a channel's value directly, as if the sender deposited.
    pub fn credit_deposit(&self, channel_id: ChannelId, value: u128) {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        if let Some(channel) = chain.channels.get_mut(&channel_id) {
            channel.value += value;
        }
    }

    /// Start a dispute on a channel, closing it at `until_block`.
    pub fn start_dispute(&self, channel_id: ChannelId, until_block: u64) {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        if let Some(channel) = chain.channels.get_mut(&channel_id) {
            channel.disputed_until = Some(until_block);
        }
    }

    /// Drop a channel record, as if it was claimed externally.
    pub fn remove_channel(&self, channel_id: ChannelId) {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        chain.channels.remove(&channel_id);
    }

    fn next_tx_hash(chain: &mut MockChain) -> TxHash {
        chain.tx_counter += 1;
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&chain.tx_counter.to_le_bytes());
        hash[8..16].copy_from_slice(b"mocktxn!");
        hash
    }

    /// Apply failure injection and confirmation delay; returns the
    /// delay to sleep outside the lock.
    fn pre_submit(&self) -> Result<Duration> {
        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        if chain.fail_submissions > 0 {
            chain.fail_submissions -= 1;
            return Err(ChainError::TransactionFailed("injected failure".to_string()));
        }
        Ok(chain.submit_delay)
    }
}

#[async_trait]
impl ChannelLedger for MockLedger {
    fn contract_address(&self) -> Address {
        self.contract
    }

    async fn fetch_channel(&self, channel_id: ChannelId) -> Result<Option<ChannelState>> {
        let chain = self.chain.read().expect("mock chain lock poisoned");
        Ok(chain.channels.get(&channel_id).copied())
    }

    async fn open_channel(&self, call: OpenChannel) -> Result<TxHash> {
        let delay = self.pre_submit()?;
        tokio::time::sleep(delay).await;

        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        if chain.channels.contains_key(&call.channel_id) {
            return Err(ChainError::TransactionFailed(format!(
                "channel {} already exists",
                call.channel_id.short()
            )));
        }
        chain.channels.insert(
            call.channel_id,
            ChannelState {
                channel_id: call.channel_id,
                contract_address: self.contract,
                sender: call.sender,
                receiver: call.receiver,
                value: call.value,
                dispute_period: call.dispute_period,
                disputed_until: None,
            },
        );
        info!(channel = %call.channel_id.short(), value = call.value, "channel opened");
        Ok(Self::next_tx_hash(&mut chain))
    }

    async fn deposit(&self, call: Deposit) -> Result<TxHash> {
        let delay = self.pre_submit()?;
        tokio::time::sleep(delay).await;

        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        let channel = chain.channels.get_mut(&call.channel_id).ok_or_else(|| {
            ChainError::TransactionFailed(format!("no channel {}", call.channel_id.short()))
        })?;
        channel.value += call.value;
        info!(channel = %call.channel_id.short(), value = channel.value, "deposit confirmed");
        Ok(Self::next_tx_hash(&mut chain))
    }

    async fn claim(&self, call: ClaimChannel) -> Result<TxHash> {
        let delay = self.pre_submit()?;
        tokio::time::sleep(delay).await;

        let mut chain = self.chain.write().expect("mock chain lock poisoned");
        let channel = *chain.channels.get(&call.channel_id).ok_or_else(|| {
            ChainError::TransactionFailed(format!("no channel {}", call.channel_id.short()))
        })?;

        if call.value > channel.value {
            return Err(ChainError::TransactionFailed(
                "claim exceeds channel value".to_string(),
            ));
        }
        let signer = recover_claim_signer(
            &self.contract,
            &call.channel_id,
            call.value,
            &call.signature,
        )?;
        if signer != channel.sender {
            return Err(ChainError::TransactionFailed(
                "claim not signed by channel sender".to_string(),
            ));
        }

        chain.channels.remove(&call.channel_id);
        info!(channel = %call.channel_id.short(), value = call.value, "channel claimed");
        Ok(Self::next_tx_hash(&mut chain))
    }

    async fn estimate_fee(&self, kind: CallKind) -> Result<u128> {
        let chain = self.chain.read().expect("mock chain lock poisoned");
        // 0.0005 ETH unless scripted otherwise.
        Ok(chain.fees.get(&kind).copied().unwrap_or(500_000_000_000_000))
    }
}
