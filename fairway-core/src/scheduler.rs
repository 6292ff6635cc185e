//! Sync scheduler
//!
//! Rate limits pushes per collection. A change is pushed immediately when
//! forced or when the collection's last successful push is at least
//! `interval` old; otherwise the collection is parked on the retry queue
//! and the mutation carries on without waiting for the remote store.
//! An unforced change is also parked while a push of its collection is
//! already running or queued, so a burst costs at most one round trip.
//!
//! The scheduler keeps a small ledger per collection: when it last synced,
//! and generation counters telling whether changes are still unpushed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::client::{PushOutcome, ReplicationClient};
use crate::error::SyncError;
use crate::queue::{PushTarget, RetryQueue};

/// What happened to a sync request.
#[derive(Debug)]
pub enum SyncRequestOutcome {
    /// Pushed before returning.
    Pushed(PushOutcome),
    /// A push was started in the background.
    Started,
    /// Inside the rate-limit window; queued for the retry ticker.
    Deferred,
    /// The push failed and the collection was queued for retry.
    Failed(SyncError),
    /// Nothing changed, so nothing was requested.
    Skipped,
}

/// Operator view of one collection's sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStatus {
    pub collection: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending: bool,
    pub queued: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct LedgerEntry {
    last_sync: Option<Instant>,
    last_sync_at: Option<DateTime<Utc>>,
    /// Bumped on every accepted change.
    requested: u64,
    /// Highest `requested` value known to be on the remote.
    synced: u64,
    /// Admitted pushes that have not finished.
    in_flight: u32,
    last_error: Option<String>,
}

impl LedgerEntry {
    fn pending(&self) -> bool {
        self.synced < self.requested
    }
}

/// Per-collection rate limiter in front of the replication client.
pub struct SyncScheduler {
    client: Arc<ReplicationClient>,
    queue: Arc<RetryQueue>,
    interval: Duration,
    ledger: Mutex<HashMap<String, LedgerEntry>>,
}

impl SyncScheduler {
    pub fn new(client: Arc<ReplicationClient>, queue: Arc<RetryQueue>, interval: Duration) -> Self {
        Self {
            client,
            queue,
            interval,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<ReplicationClient> {
        &self.client
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<String, LedgerEntry>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a change and decide whether it may be pushed now.
    ///
    /// A change that may not is queued before this returns. An admitted
    /// push must be released with an [`InFlight`] guard.
    fn admit(&self, collection: &str, force: bool) -> bool {
        let due = {
            let mut ledger = self.ledger();
            let entry = ledger.entry(collection.to_string()).or_default();
            entry.requested += 1;
            let due = force
                || (entry.in_flight == 0
                    && !self.queue.contains(collection)
                    && entry
                        .last_sync
                        .map_or(true, |at| at.elapsed() >= self.interval));
            if due {
                entry.in_flight += 1;
            }
            due
        };
        if !due && self.queue.enqueue(collection) {
            tracing::debug!("Sync of {} deferred to retry queue", collection);
        }
        due
    }

    /// Request a sync of `collection`, pushing inline when allowed.
    pub async fn request_sync(&self, collection: &str, force: bool) -> SyncRequestOutcome {
        if !self.admit(collection, force) {
            return SyncRequestOutcome::Deferred;
        }
        let _in_flight = InFlight {
            scheduler: self,
            collection,
        };
        match self.push_tracked(collection).await {
            Ok(outcome) => SyncRequestOutcome::Pushed(outcome),
            Err(e) => {
                tracing::warn!("Sync of {} failed, queued for retry: {}", collection, e);
                self.queue.enqueue(collection);
                SyncRequestOutcome::Failed(e)
            }
        }
    }

    /// Like [`request_sync`](Self::request_sync), but an allowed push runs
    /// on a spawned task so the caller never waits on the remote store.
    pub fn request_sync_detached(self: Arc<Self>, collection: &str, force: bool) -> SyncRequestOutcome {
        if !self.admit(collection, force) {
            return SyncRequestOutcome::Deferred;
        }
        let collection = collection.to_string();
        tokio::spawn(async move {
            let _in_flight = InFlight {
                scheduler: &self,
                collection: &collection,
            };
            if let Err(e) = self.push_tracked(&collection).await {
                tracing::warn!("Sync of {} failed, queued for retry: {}", collection, e);
                self.queue.enqueue(&collection);
            }
        });
        SyncRequestOutcome::Started
    }

    /// Push and update the ledger. Does not consult the rate limit.
    async fn push_tracked(&self, collection: &str) -> Result<PushOutcome, SyncError> {
        // Changes counted so far are on disk before the push reads it.
        let generation = self
            .ledger()
            .get(collection)
            .map_or(0, |entry| entry.requested);

        let result = self.client.push(collection).await;

        let mut ledger = self.ledger();
        let entry = ledger.entry(collection.to_string()).or_default();
        match &result {
            Ok(_) => {
                entry.last_sync = Some(Instant::now());
                entry.last_sync_at = Some(Utc::now());
                entry.synced = entry.synced.max(generation);
                entry.last_error = None;
                if !entry.pending() {
                    self.queue.remove(collection);
                }
            }
            Err(e) => entry.last_error = Some(e.to_string()),
        }
        result
    }

    /// Whether `collection` has changes not yet on the remote.
    pub fn is_pending(&self, collection: &str) -> bool {
        self.ledger()
            .get(collection)
            .is_some_and(LedgerEntry::pending)
    }

    /// Sync state of every collection the scheduler has seen or queued.
    pub fn status(&self) -> Vec<CollectionStatus> {
        let queued = self.queue.snapshot();
        let ledger = self.ledger();
        let mut out: BTreeMap<String, CollectionStatus> = BTreeMap::new();
        for (collection, entry) in ledger.iter() {
            out.insert(
                collection.clone(),
                CollectionStatus {
                    collection: collection.clone(),
                    last_sync: entry.last_sync_at,
                    pending: entry.pending(),
                    queued: false,
                    last_error: entry.last_error.clone(),
                },
            );
        }
        for collection in queued {
            out.entry(collection.clone())
                .or_insert_with(|| CollectionStatus {
                    collection: collection.clone(),
                    last_sync: None,
                    pending: false,
                    queued: false,
                    last_error: None,
                })
                .queued = true;
        }
        out.into_values().collect()
    }

    /// Push every pending or queued collection once, ignoring the rate limit.
    pub async fn flush(&self) -> Vec<(String, Result<PushOutcome, SyncError>)> {
        let mut collections: Vec<String> = self
            .ledger()
            .iter()
            .filter(|(_, entry)| entry.pending())
            .map(|(c, _)| c.clone())
            .collect();
        for queued in self.queue.snapshot() {
            if !collections.contains(&queued) {
                collections.push(queued);
            }
        }
        collections.sort();

        let mut results = Vec::with_capacity(collections.len());
        for collection in collections {
            self.queue.remove(&collection);
            let result = self.push_tracked(&collection).await;
            if let Err(e) = &result {
                tracing::warn!("Flush of {} failed: {}", collection, e);
                self.queue.enqueue(&collection);
            }
            results.push((collection, result));
        }
        results
    }
}

/// Releases an admitted push, including when its future is dropped.
struct InFlight<'a> {
    scheduler: &'a SyncScheduler,
    collection: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.scheduler.ledger().get_mut(self.collection) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }
}

#[async_trait]
impl PushTarget for SyncScheduler {
    async fn push_scheduled(&self, collection: &str) -> Result<PushOutcome, SyncError> {
        self.push_tracked(collection).await
    }
}
