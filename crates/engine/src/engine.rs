//! Engine assembly: construction, hydration and persistence.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock, Weak};

use futures::future::BoxFuture;
use tracing::{debug, error};

use paychan_chain::{ChannelLedger, ClaimSigner};
use paychan_core::{AccountSnapshot, Address, EngineConfig, Packet, Prepare, StateStore};

use crate::account::{account_key, Account, ChannelCell};
use crate::messaging::PeerTransport;
use crate::queue::ReducerQueue;
use crate::{EngineError, Result};

/// Takes an inbound packet, returns the reply packet.
pub type DataHandler = Arc<dyn Fn(Prepare) -> BoxFuture<'static, Result<Packet>> + Send + Sync>;

/// Credited with incoming settlements, gwei.
pub type MoneyHandler = Arc<dyn Fn(u64) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The per-account settlement engine.
///
/// All channel-state mutation runs inside the account's two reducer
/// queues; the transient deposit side-queue is the single sanctioned
/// exception (see the outgoing engine).
pub struct SettlementEngine {
    pub(crate) config: EngineConfig,
    pub(crate) account: Account,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) ledger: Arc<dyn ChannelLedger>,
    pub(crate) signer: ClaimSigner,
    pub(crate) transport: Arc<dyn PeerTransport>,
    /// Present only while a deposit is in flight; claim creation routes
    /// here instead of the main outgoing queue.
    pub(crate) side_queue: tokio::sync::Mutex<Option<Arc<ReducerQueue<ChannelCell>>>>,
    pub(crate) watcher_running: AtomicBool,
    pub(crate) unloaded: AtomicBool,
    pub(crate) data_handler: RwLock<Option<DataHandler>>,
    pub(crate) money_handler: RwLock<Option<MoneyHandler>>,
    /// Back-reference for spawning tasks from `&self` methods.
    pub(crate) weak_self: Weak<SettlementEngine>,
}

impl SettlementEngine {
    /// Hydrate (or create) the account and start background duties:
    /// the auto-funding sweep, and the channel watcher when an incoming
    /// claim was restored.
    pub async fn connect(
        account_name: &str,
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn ChannelLedger>,
        signer: ClaimSigner,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>> {
        let key = account_key(account_name);
        store.load(&key).await?;
        let account = match store.get(&key).await? {
            Some(raw) => {
                let snapshot: AccountSnapshot = serde_json::from_str(&raw)
                    .map_err(|e| EngineError::Serialization(e.to_string()))?;
                debug!(account = account_name, "restored account from store");
                Account::from_snapshot(snapshot)
            }
            None => Account::new(account_name),
        };

        let engine = Arc::new_cyclic(|weak| Self {
            config,
            account,
            store,
            ledger,
            signer,
            transport,
            side_queue: tokio::sync::Mutex::new(None),
            watcher_running: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
            data_handler: RwLock::new(None),
            money_handler: RwLock::new(None),
            weak_self: weak.clone(),
        });
        engine.wire_persistence();

        if engine.account.incoming.state().is_some() {
            engine.ensure_watcher();
        }
        let startup = engine.clone();
        tokio::spawn(async move { startup.auto_fund().await });

        Ok(engine)
    }

    /// A strong handle on ourselves, for reducers and spawned tasks.
    pub(crate) fn strong(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("engine still referenced")
    }

    /// Write the account snapshot through after every queue commit.
    fn wire_persistence(&self) {
        let weak = self.weak_self.clone();
        self.account.incoming.on_commit(move |_cell| {
            if let Some(engine) = weak.upgrade() {
                engine.persist_later();
            }
        });
        let weak = self.weak_self.clone();
        self.account.outgoing.on_commit(move |_cell| {
            if let Some(engine) = weak.upgrade() {
                engine.persist_later();
            }
        });
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Our on-chain address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn register_data_handler(&self, handler: DataHandler) {
        let mut slot = self.data_handler.write().expect("handler lock poisoned");
        *slot = Some(handler);
    }

    pub fn deregister_data_handler(&self) {
        let mut slot = self.data_handler.write().expect("handler lock poisoned");
        *slot = None;
    }

    pub fn register_money_handler(&self, handler: MoneyHandler) {
        let mut slot = self.money_handler.write().expect("handler lock poisoned");
        *slot = Some(handler);
    }

    pub fn deregister_money_handler(&self) {
        let mut slot = self.money_handler.write().expect("handler lock poisoned");
        *slot = None;
    }

    /// Persist the account snapshot without blocking the caller.
    pub(crate) fn persist_later(&self) {
        let engine = self.strong();
        tokio::spawn(async move { engine.persist().await });
    }

    pub(crate) async fn persist(&self) {
        let snapshot = self.account.snapshot();
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                error!(account = self.account.name(), "failed to serialize account: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set(&account_key(self.account.name()), raw).await {
            error!(account = self.account.name(), "failed to persist account: {}", e);
        }
    }

    /// Tear the account down. Channel state stays persisted; only the
    /// cache entry is dropped.
    pub async fn unload(&self) -> Result<()> {
        self.unloaded.store(true, std::sync::atomic::Ordering::SeqCst);
        self.persist().await;
        self.store.unload(&account_key(self.account.name())).await?;
        Ok(())
    }

    pub(crate) fn is_unloaded(&self) -> bool {
        self.unloaded.load(std::sync::atomic::Ordering::SeqCst)
    }
}
