//! Retry queue
//!
//! Collections waiting for a background push, either because a push was
//! deferred by rate limiting or because it failed. The queue holds at most
//! one entry per collection. A ticker drains one entry per period; a
//! failed entry goes to the back so other collections get a turn.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::client::PushOutcome;
use crate::error::SyncError;

/// Something that can push a collection on the queue's behalf.
#[async_trait]
pub trait PushTarget: Send + Sync {
    /// Push `collection` now, without rate limiting.
    async fn push_scheduled(&self, collection: &str) -> Result<PushOutcome, SyncError>;
}

/// What a single drain step did.
#[derive(Debug)]
pub enum DrainOutcome {
    Synced {
        collection: String,
        outcome: PushOutcome,
    },
    Requeued {
        collection: String,
        error: SyncError,
    },
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    members: HashSet<String>,
}

/// Deduplicating FIFO of collections pending a sync attempt.
#[derive(Default)]
pub struct RetryQueue {
    state: Mutex<QueueState>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `collection` at the back. Returns `false` if it was already queued.
    pub fn enqueue(&self, collection: &str) -> bool {
        let mut state = self.lock();
        if !state.members.insert(collection.to_string()) {
            return false;
        }
        state.order.push_back(collection.to_string());
        true
    }

    /// Take the entry at the front.
    pub fn pop(&self) -> Option<String> {
        let mut state = self.lock();
        let collection = state.order.pop_front()?;
        state.members.remove(&collection);
        Some(collection)
    }

    /// Drop a pending entry, e.g. after a push made it redundant.
    pub fn remove(&self, collection: &str) -> bool {
        let mut state = self.lock();
        if !state.members.remove(collection) {
            return false;
        }
        state.order.retain(|c| c != collection);
        true
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.lock().members.contains(collection)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().order.is_empty()
    }

    /// Pending collections, front first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().order.iter().cloned().collect()
    }

    /// Push the front entry, re-enqueueing it at the back on failure.
    ///
    /// Returns `None` if the queue was empty.
    pub async fn drain_one(&self, target: &dyn PushTarget) -> Option<DrainOutcome> {
        let collection = self.pop()?;
        match target.push_scheduled(&collection).await {
            Ok(outcome) => {
                tracing::debug!("Retry push of {} done: {:?}", collection, outcome);
                Some(DrainOutcome::Synced { collection, outcome })
            }
            Err(error) => {
                tracing::warn!("Retry push of {} failed, requeued: {}", collection, error);
                self.enqueue(&collection);
                Some(DrainOutcome::Requeued { collection, error })
            }
        }
    }

    /// Drain one entry every `period` until the ticker is shut down.
    pub fn spawn_ticker(self: Arc<Self>, target: Arc<dyn PushTarget>, period: Duration) -> RetryTicker {
        let queue = self;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("Retry ticker started (every {:?})", period);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticks.tick() => {
                        queue.drain_one(target.as_ref()).await;
                    }
                }
            }
            tracing::info!("Retry ticker stopped ({} pending)", queue.len());
        });
        RetryTicker {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

/// Handle to a running retry ticker. Dropping it stops the ticker.
pub struct RetryTicker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetryTicker {
    /// Stop the ticker, letting an in-progress drain finish first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Retry ticker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RetryTicker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::VersionToken;

    /// Records pushes; fails the collections listed in `failing`.
    #[derive(Default)]
    struct FakeTarget {
        pushed: Mutex<Vec<String>>,
        failing: Mutex<HashSet<String>>,
    }

    impl FakeTarget {
        fn fail(&self, collection: &str, fail: bool) {
            let mut failing = self.failing.lock().unwrap();
            if fail {
                failing.insert(collection.to_string());
            } else {
                failing.remove(collection);
            }
        }

        fn pushed(&self) -> Vec<String> {
            self.pushed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushTarget for FakeTarget {
        async fn push_scheduled(&self, collection: &str) -> Result<PushOutcome, SyncError> {
            self.pushed.lock().unwrap().push(collection.to_string());
            if self.failing.lock().unwrap().contains(collection) {
                return Err(SyncError::Transport {
                    collection: collection.to_string(),
                    source: RemoteError::Timeout,
                });
            }
            Ok(PushOutcome::Pushed {
                version: VersionToken::new("v1"),
                attempts: 1,
            })
        }
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let queue = RetryQueue::new();
        assert!(queue.enqueue("trips"));
        assert!(!queue.enqueue("trips"));
        assert!(queue.enqueue("users"));
        assert!(!queue.enqueue("trips"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.snapshot(), vec!["trips", "users"]);
    }

    #[test]
    fn test_pop_and_remove() {
        let queue = RetryQueue::new();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("c");

        assert!(queue.remove("b"));
        assert!(!queue.remove("b"));
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert!(!queue.contains("a"));
        assert!(queue.enqueue("a"));
        assert_eq!(queue.snapshot(), vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_drain_empty() {
        let queue = RetryQueue::new();
        let target = FakeTarget::default();
        assert!(queue.drain_one(&target).await.is_none());
        assert!(target.pushed().is_empty());
    }

    #[tokio::test]
    async fn test_drain_one_at_a_time() {
        let queue = RetryQueue::new();
        let target = FakeTarget::default();
        queue.enqueue("trips");
        queue.enqueue("users");

        match queue.drain_one(&target).await {
            Some(DrainOutcome::Synced { collection, .. }) => assert_eq!(collection, "trips"),
            other => panic!("Expected Synced, got {:?}", other),
        }
        assert_eq!(queue.snapshot(), vec!["users"]);
        assert_eq!(target.pushed(), vec!["trips"]);
    }

    #[tokio::test]
    async fn test_failed_entry_moves_to_back() {
        let queue = RetryQueue::new();
        let target = FakeTarget::default();
        target.fail("trips", true);
        queue.enqueue("trips");
        queue.enqueue("users");

        assert!(matches!(
            queue.drain_one(&target).await,
            Some(DrainOutcome::Requeued { .. })
        ));
        assert_eq!(queue.snapshot(), vec!["users", "trips"]);

        queue.drain_one(&target).await;
        target.fail("trips", false);
        queue.drain_one(&target).await;

        assert!(queue.is_empty());
        assert_eq!(target.pushed(), vec!["trips", "users", "trips"]);
    }

    #[tokio::test]
    async fn test_ticker_drains_and_stops() {
        let queue = Arc::new(RetryQueue::new());
        let target = Arc::new(FakeTarget::default());
        queue.enqueue("trips");
        queue.enqueue("users");

        let ticker = queue.clone().spawn_ticker(target.clone(), Duration::from_millis(10));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ticker.shutdown().await;

        assert!(queue.is_empty());
        assert_eq!(target.pushed(), vec!["trips", "users"]);

        // No drains after shutdown.
        queue.enqueue("trips");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 1);
    }
}
