//! Document store
//!
//! The local source of truth: one aggregate per collection, cached in
//! memory and persisted through [`LocalStorage`]. Every read and mutation
//! of a collection goes through that collection's lock, so mutations are
//! applied one at a time in the order they were accepted. Different
//! collections never wait on each other.
//!
//! A mutation works on a private copy. The copy becomes visible only after
//! it is durably on disk; a failed mutator or a failed write leaves both
//! the file and the cache as they were.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::aggregate::{Aggregate, ChangeKind};
use crate::error::StoreError;
use crate::local::{validate_collection, LocalStorage};
use crate::notify::{ChangeEvent, ChangeNotifier};
use crate::scheduler::{SyncRequestOutcome, SyncScheduler};

/// Options for [`DocumentStore::mutate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MutateOptions {
    /// Push to the remote store before returning, ignoring the rate limit.
    pub force: bool,
}

impl MutateOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// A committed mutation.
#[derive(Debug)]
pub struct Mutation<R> {
    /// The aggregate as persisted.
    pub aggregate: Aggregate,
    /// Whatever the mutator returned.
    pub output: R,
    pub changes: Vec<(String, ChangeKind)>,
    /// What the scheduler did with the change. Remote failures end up
    /// here, never in the mutation's `Err`.
    pub sync: SyncRequestOutcome,
}

#[derive(Default)]
struct Slot {
    /// `None` until first loaded from disk.
    aggregate: Option<Aggregate>,
}

async fn ensure_loaded<'a>(
    slot: &'a mut Slot,
    local: &LocalStorage,
    collection: &str,
) -> Result<&'a Aggregate, StoreError> {
    let aggregate = match slot.aggregate.take() {
        Some(aggregate) => aggregate,
        None => local.load_or_create(collection).await?,
    };
    Ok(slot.aggregate.insert(aggregate))
}

/// Exclusive hold on one collection, used to replace its content wholesale.
pub(crate) struct CollectionGuard {
    collection: String,
    local: LocalStorage,
    slot: OwnedMutexGuard<Slot>,
}

impl CollectionGuard {
    pub(crate) fn collection(&self) -> &str {
        &self.collection
    }

    /// Persist `aggregate` and make it the cached content.
    pub(crate) async fn replace(&mut self, aggregate: Aggregate) -> Result<(), StoreError> {
        self.local.save(&self.collection, &aggregate).await?;
        self.slot.aggregate = Some(aggregate);
        Ok(())
    }
}

/// Per-collection serialized aggregate store.
pub struct DocumentStore {
    local: LocalStorage,
    scheduler: Arc<SyncScheduler>,
    notifier: ChangeNotifier,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Slot>>>>,
}

impl DocumentStore {
    pub fn new(local: LocalStorage, scheduler: Arc<SyncScheduler>, notifier: ChangeNotifier) -> Self {
        Self {
            local,
            scheduler,
            notifier,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &LocalStorage {
        &self.local
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    fn slot(&self, collection: &str) -> Result<Arc<AsyncMutex<Slot>>, StoreError> {
        validate_collection(collection)?;
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots
            .entry(collection.to_string())
            .or_default()
            .clone())
    }

    /// Current aggregate of `collection`.
    ///
    /// A collection that was never written is created empty on disk, so a
    /// missing collection is never an error. This fails only for an invalid
    /// collection name or a local file that cannot be read or parsed.
    pub async fn read(&self, collection: &str) -> Result<Aggregate, StoreError> {
        let slot = self.slot(collection)?;
        let mut slot = slot.lock().await;
        Ok(ensure_loaded(&mut slot, &self.local, collection)
            .await?
            .clone())
    }

    /// One record of `collection`, or `None` if there is no such id.
    pub async fn read_record(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let slot = self.slot(collection)?;
        let mut slot = slot.lock().await;
        let aggregate = ensure_loaded(&mut slot, &self.local, collection).await?;
        Ok(aggregate.get(id).cloned())
    }

    /// Typed variant of [`read_record`](Self::read_record).
    pub async fn read_record_as<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let slot = self.slot(collection)?;
        let mut slot = slot.lock().await;
        let aggregate = ensure_loaded(&mut slot, &self.local, collection).await?;
        aggregate
            .get_as(id)
            .map_err(|e| StoreError::corrupt(collection, e))
    }

    /// Apply `mutator` to `collection` and persist the result.
    ///
    /// Returns once the new aggregate is durable. Change events are sent
    /// for every record the mutator touched, then a sync is requested.
    /// If nothing changed, nothing is written, sent or requested.
    pub async fn mutate<R, F>(
        &self,
        collection: &str,
        options: MutateOptions,
        mutator: F,
    ) -> Result<Mutation<R>, StoreError>
    where
        F: FnOnce(&mut Aggregate) -> anyhow::Result<R>,
    {
        let slot = self.slot(collection)?;
        let mut slot = slot.lock().await;
        let current = ensure_loaded(&mut slot, &self.local, collection).await?;

        let mut next = current.clone();
        let output = mutator(&mut next).map_err(StoreError::Rejected)?;
        let changes = current.diff(&next);
        if changes.is_empty() {
            tracing::debug!("Mutation of {} changed nothing", collection);
            return Ok(Mutation {
                aggregate: next,
                output,
                changes,
                sync: SyncRequestOutcome::Skipped,
            });
        }

        if let Err(e) = self.local.save(collection, &next).await {
            tracing::error!("Failed to persist {}: {}", collection, e);
            return Err(e);
        }
        slot.aggregate = Some(next.clone());
        tracing::debug!(
            "Committed {} change(s) to {} ({} records)",
            changes.len(),
            collection,
            next.len()
        );

        // Sent under the lock so events keep commit order.
        for (record_id, kind) in &changes {
            self.notifier.notify(ChangeEvent {
                collection: collection.to_string(),
                record_id: record_id.clone(),
                kind: *kind,
            });
        }
        drop(slot);

        let sync = if options.force {
            self.scheduler.request_sync(collection, true).await
        } else {
            self.scheduler.clone().request_sync_detached(collection, false)
        };

        Ok(Mutation {
            aggregate: next,
            output,
            changes,
            sync,
        })
    }

    /// Wait for exclusive access to `collection`.
    pub(crate) async fn lock_collection(&self, collection: &str) -> Result<CollectionGuard, StoreError> {
        let slot = self.slot(collection)?.lock_owned().await;
        Ok(CollectionGuard {
            collection: collection.to_string(),
            local: self.local.clone(),
            slot,
        })
    }
}
