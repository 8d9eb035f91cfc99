//! Single-cell reducer queue.
//!
//! Serializes asynchronous reducers `T -> T` over one value. Reducers
//! run strictly one at a time in (priority, arrival) order; a higher
//! priority entry jumps ahead of pending equal-or-lower entries but
//! never preempts the one that is running. A failed reducer leaves the
//! prior state intact and surfaces the error to its caller only.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Notify};

use crate::{EngineError, Result};

/// Claim validation and everything else that can wait.
pub const PRIORITY_VALIDATE: u8 = 0;
/// On-chain claim submission; must not queue behind validations.
pub const PRIORITY_CLAIM: u8 = 1;

type BoxReducer<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, Result<T>> + Send>;
type CommitCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    priority: u8,
    seq: u64,
    reducer: BoxReducer<T>,
    reply: oneshot::Sender<Result<T>>,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Max-heap: highest priority first, then earliest arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    /// The authoritative cell. Taken while a reducer runs.
    cell: Option<T>,
    /// Last committed value, for synchronous peeks.
    committed: T,
    pending: BinaryHeap<Entry<T>>,
    next_seq: u64,
    running: bool,
    closing: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    idle: Notify,
    on_commit: RwLock<Option<CommitCallback<T>>>,
}

/// A priority FIFO that linearizes mutation of a single value.
pub struct ReducerQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> ReducerQueue<T> {
    pub fn new(initial: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    cell: Some(initial.clone()),
                    committed: initial,
                    pending: BinaryHeap::new(),
                    next_seq: 0,
                    running: false,
                    closing: false,
                }),
                idle: Notify::new(),
                on_commit: RwLock::new(None),
            }),
        }
    }

    /// Latest committed value. Best-effort snapshot; linearized access
    /// goes through [`ReducerQueue::add`].
    pub fn state(&self) -> T {
        self.shared.inner.lock().expect("queue lock poisoned").committed.clone()
    }

    /// Register the change callback fired after each successful commit.
    pub fn on_commit(&self, callback: impl Fn(&T) + Send + Sync + 'static) {
        let mut slot = self.shared.on_commit.write().expect("queue lock poisoned");
        *slot = Some(Arc::new(callback));
    }

    /// Enqueue a reducer; await the returned future for its commit.
    ///
    /// The entry is pushed before this returns, so enqueue order is the
    /// call order even when the completion future is polled later.
    pub fn add<F, Fut>(&self, priority: u8, reducer: F) -> impl Future<Output = Result<T>>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let queued = {
            let mut inner = self.shared.inner.lock().expect("queue lock poisoned");
            if inner.closing {
                false
            } else {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.pending.push(Entry {
                    priority,
                    seq,
                    reducer: Box::new(move |state| reducer(state).boxed()),
                    reply,
                });
                if !inner.running {
                    inner.running = true;
                    tokio::spawn(Self::drain(self.shared.clone()));
                }
                true
            }
        };
        async move {
            if !queued {
                return Err(EngineError::QueueClosed);
            }
            receiver.await.map_err(|_| EngineError::QueueClosed)?
        }
    }

    /// Drain pending work, then consume the final value. Enqueues that
    /// race with teardown are rejected.
    pub async fn clear(&self) -> Result<T> {
        {
            let mut inner = self.shared.inner.lock().expect("queue lock poisoned");
            inner.closing = true;
        }
        loop {
            // Register for the wakeup before checking, so a notify
            // between the check and the await is not lost.
            let mut idle = std::pin::pin!(self.shared.idle.notified());
            idle.as_mut().enable();
            {
                let mut inner = self.shared.inner.lock().expect("queue lock poisoned");
                if !inner.running && inner.pending.is_empty() {
                    return inner.cell.take().ok_or(EngineError::QueueClosed);
                }
            }
            idle.await;
        }
    }

    async fn drain(shared: Arc<Shared<T>>) {
        loop {
            let (entry, prior) = {
                let mut inner = shared.inner.lock().expect("queue lock poisoned");
                match inner.pending.pop() {
                    Some(entry) => {
                        let prior = inner.cell.take().expect("cell present while queue idle");
                        (entry, prior)
                    }
                    None => {
                        inner.running = false;
                        shared.idle.notify_waiters();
                        return;
                    }
                }
            };

            let result = (entry.reducer)(prior.clone()).await;

            let callback = shared
                .on_commit
                .read()
                .expect("queue lock poisoned")
                .clone();
            let mut inner = shared.inner.lock().expect("queue lock poisoned");
            match result {
                Ok(next) => {
                    inner.cell = Some(next.clone());
                    inner.committed = next.clone();
                    drop(inner);
                    if let Some(callback) = callback {
                        callback(&next);
                    }
                    let _ = entry.reply.send(Ok(next));
                }
                Err(err) => {
                    inner.cell = Some(prior);
                    drop(inner);
                    let _ = entry.reply.send(Err(err));
                }
            }
            shared.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_reducers_run_in_order() {
        let queue = ReducerQueue::new(Vec::<u32>::new());
        let mut handles = Vec::new();
        for i in 0..5u32 {
            handles.push(queue.add(PRIORITY_VALIDATE, move |mut state| async move {
                state.push(i);
                Ok(state)
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(queue.state(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_jumps_pending_entries() {
        let queue = Arc::new(ReducerQueue::new(Vec::<&'static str>::new()));

        // Occupy the worker so later entries stack up as pending.
        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .add(PRIORITY_VALIDATE, |mut state: Vec<&'static str>| async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        state.push("first");
                        Ok(state)
                    })
                    .await
            })
        };
        // Paused clock: the sleeps below only advance once the worker is
        // inside the blocking reducer, so both entries land as pending.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let normal = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .add(PRIORITY_VALIDATE, |mut state: Vec<&'static str>| async move {
                        state.push("normal");
                        Ok(state)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let urgent = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .add(PRIORITY_CLAIM, |mut state: Vec<&'static str>| async move {
                        state.push("urgent");
                        Ok(state)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        blocker.await.unwrap().unwrap();
        urgent.await.unwrap().unwrap();
        normal.await.unwrap().unwrap();
        assert_eq!(queue.state(), vec!["first", "urgent", "normal"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_prior_state() {
        let queue = ReducerQueue::new(10u32);
        let err = queue
            .add(PRIORITY_VALIDATE, |_state| async move {
                Err(EngineError::Handler("boom".to_string()))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(queue.state(), 10);

        // Subsequent entries proceed against the unchanged state.
        let next = queue
            .add(PRIORITY_VALIDATE, |state| async move { Ok(state + 1) })
            .await
            .unwrap();
        assert_eq!(next, 11);
    }

    #[tokio::test]
    async fn test_clear_drains_then_rejects() {
        let queue = Arc::new(ReducerQueue::new(0u32));
        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .add(PRIORITY_VALIDATE, |state| async move { Ok(state + 5) })
                    .await
            })
        };
        pending.await.unwrap().unwrap();

        let final_state = queue.clear().await.unwrap();
        assert_eq!(final_state, 5);

        let rejected = queue
            .add(PRIORITY_VALIDATE, |state| async move { Ok(state) })
            .await;
        assert!(matches!(rejected, Err(EngineError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_commit_callback_fires_per_commit() {
        let queue = ReducerQueue::new(0u32);
        let commits = Arc::new(AtomicU32::new(0));
        {
            let commits = commits.clone();
            queue.on_commit(move |_state| {
                commits.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }

        queue.add(PRIORITY_VALIDATE, |s| async move { Ok(s + 1) }).await.unwrap();
        let _ = queue
            .add(PRIORITY_VALIDATE, |_s: u32| async move {
                Err(EngineError::Handler("no commit".to_string()))
            })
            .await;
        queue.add(PRIORITY_VALIDATE, |s| async move { Ok(s + 1) }).await.unwrap();

        assert_eq!(commits.load(AtomicOrdering::SeqCst), 2);
    }
}
