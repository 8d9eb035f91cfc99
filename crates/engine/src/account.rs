//! Per-peer account state.
//!
//! Balances are gwei. All channel mutation goes through the two
//! reducer queues; everything else sits behind plain locks and is
//! written through to the store after each change.

use std::sync::RwLock;

use paychan_core::{AccountSnapshot, Address, ChannelId, SignedChannel};

use crate::queue::ReducerQueue;

/// The value held by each of the account's two queues.
pub type ChannelCell = Option<SignedChannel>;

/// Storage key of the serialized account snapshot.
pub fn account_key(name: &str) -> String {
    format!("{}:account", name)
}

/// Storage key of the channel-uniqueness registry entry.
pub fn registry_key(channel_id: &ChannelId) -> String {
    format!("{}:incoming-channel", channel_id)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Balances {
    /// Owed to us by the peer for packets we forwarded, gwei.
    pub receivable: i128,
    /// Owed by us to the peer, gwei.
    pub payable: i128,
    /// Promised but not yet reflected in a signed claim, gwei.
    pub payout: u128,
}

/// One peer account: balances, the linked settlement address, and the
/// incoming/outgoing channel cells.
pub struct Account {
    name: String,
    balances: RwLock<Balances>,
    peer_address: RwLock<Option<Address>>,
    pub incoming: ReducerQueue<ChannelCell>,
    pub outgoing: ReducerQueue<ChannelCell>,
}

impl Account {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            balances: RwLock::new(Balances::default()),
            peer_address: RwLock::new(None),
            incoming: ReducerQueue::new(None),
            outgoing: ReducerQueue::new(None),
        }
    }

    /// Rebuild an account from its persisted snapshot.
    pub fn from_snapshot(snapshot: AccountSnapshot) -> Self {
        Self {
            name: snapshot.account_name,
            balances: RwLock::new(Balances {
                receivable: snapshot.receivable_balance,
                payable: snapshot.payable_balance,
                payout: snapshot.payout_amount,
            }),
            peer_address: RwLock::new(snapshot.peer_address),
            incoming: ReducerQueue::new(snapshot.incoming),
            outgoing: ReducerQueue::new(snapshot.outgoing),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn balances(&self) -> Balances {
        *self.balances.read().expect("balances lock poisoned")
    }

    /// Mutate balances under the lock.
    pub fn with_balances<R>(&self, mutate: impl FnOnce(&mut Balances) -> R) -> R {
        let mut balances = self.balances.write().expect("balances lock poisoned");
        mutate(&mut balances)
    }

    pub fn peer_address(&self) -> Option<Address> {
        *self.peer_address.read().expect("peer address lock poisoned")
    }

    /// Link the peer's settlement address. Once assigned it never
    /// changes; returns whether this call assigned it.
    pub fn link_peer_address(&self, address: Address) -> bool {
        let mut slot = self.peer_address.write().expect("peer address lock poisoned");
        if slot.is_none() {
            *slot = Some(address);
            true
        } else {
            false
        }
    }

    /// Current state of the account for persistence.
    pub fn snapshot(&self) -> AccountSnapshot {
        let balances = self.balances();
        AccountSnapshot {
            account_name: self.name.clone(),
            receivable_balance: balances.receivable,
            payable_balance: balances.payable,
            payout_amount: balances.payout,
            peer_address: self.peer_address(),
            incoming: self.incoming.state(),
            outgoing: self.outgoing.state(),
        }
    }
}
