//! Startup restore
//!
//! Runs once before the store takes mutations: every configured collection
//! is fetched from the remote store and, if present, overwrites the local
//! copy. The remote is authoritative here, so local changes that were never
//! pushed are discarded.
//!
//! All collections are locked before any fetch starts and each lock is
//! released when that collection's restore finishes or times out, so no
//! mutation can land and then be overwritten by a late restore.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::client::ReplicationClient;
use crate::error::{RemoteError, SyncError};
use crate::store::{CollectionGuard, DocumentStore};

/// Result of restoring one collection.
#[derive(Debug)]
pub enum RestoreOutcome {
    /// Local state now equals the remote content.
    Restored { records: usize },
    /// Nothing on the remote; local state was left alone.
    Absent,
    /// The remote could not be read (or the result not stored); local
    /// state was left alone.
    Unavailable(SyncError),
}

/// Per-collection outcomes of one restore run, sorted by collection.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub outcomes: Vec<(String, RestoreOutcome)>,
}

impl RestoreReport {
    pub fn get(&self, collection: &str) -> Option<&RestoreOutcome> {
        self.outcomes
            .iter()
            .find(|(c, _)| c == collection)
            .map(|(_, outcome)| outcome)
    }

    pub fn restored(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RestoreOutcome::Restored { .. }))
            .count()
    }

    pub fn unavailable(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RestoreOutcome::Unavailable(_)))
            .count()
    }
}

pub struct StartupRestorer {
    client: Arc<ReplicationClient>,
    timeout: Duration,
}

impl StartupRestorer {
    /// `timeout` bounds each collection's restore as a whole.
    pub fn new(client: Arc<ReplicationClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Restore `collections` into `store`. Never fails as a whole; see the
    /// per-collection outcomes.
    pub async fn restore_all(&self, store: &DocumentStore, collections: &[String]) -> RestoreReport {
        let mut names: Vec<&str> = collections.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();

        let mut report = RestoreReport::default();
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            match store.lock_collection(name).await {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    tracing::warn!("Skipping restore of {}: {}", name, e);
                    report
                        .outcomes
                        .push((name.to_string(), RestoreOutcome::Unavailable(e.into())));
                }
            }
        }

        let restored = join_all(guards.into_iter().map(|guard| self.restore_one(guard))).await;
        report.outcomes.extend(restored);
        report.outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::info!(
            "Restore finished: {} restored, {} unavailable, {} total",
            report.restored(),
            report.unavailable(),
            report.outcomes.len()
        );
        report
    }

    async fn restore_one(&self, mut guard: CollectionGuard) -> (String, RestoreOutcome) {
        let collection = guard.collection().to_string();
        let fetched = match tokio::time::timeout(self.timeout, self.client.restore(&collection)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::transport(&collection, RemoteError::Timeout)),
        };

        let outcome = match fetched {
            Ok(Some(aggregate)) => {
                let records = aggregate.len();
                match guard.replace(aggregate).await {
                    Ok(()) => {
                        tracing::info!("Restored {} ({} records)", collection, records);
                        RestoreOutcome::Restored { records }
                    }
                    Err(e) => {
                        tracing::error!("Failed to write restored {}: {}", collection, e);
                        RestoreOutcome::Unavailable(e.into())
                    }
                }
            }
            Ok(None) => {
                tracing::info!("No remote copy of {}, keeping local state", collection);
                RestoreOutcome::Absent
            }
            Err(e) => {
                tracing::warn!("Restore of {} unavailable, keeping local state: {}", collection, e);
                RestoreOutcome::Unavailable(e)
            }
        };
        (collection, outcome)
    }
}
