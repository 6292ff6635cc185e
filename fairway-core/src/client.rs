//! Replication client
//!
//! Pushes the local aggregate of a collection to the remote blob store
//! with compare-and-set, and fetches remote content for restores.
//!
//! A push is: fetch the remote version, read the local aggregate, write it
//! conditioned on that version. Losing the race to another writer re-runs
//! the whole sequence with a fresh version, up to `max_attempts` times.
//! Transport failures are returned at once; retrying them is the retry
//! queue's job.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::aggregate::Aggregate;
use crate::error::{RemoteError, StoreError, SyncError};
use crate::local::LocalStorage;
use crate::remote::{RemoteBlob, RemoteBlobStore, VersionToken};

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The local aggregate was written; `attempts` counts CAS rounds used.
    Pushed { version: VersionToken, attempts: u32 },
    /// The remote already held the local content; nothing was written.
    Unchanged { version: VersionToken },
    /// There is no local file for the collection, so nothing to publish.
    NoLocalContent,
}

/// Versioned fetch and compare-and-set write against a remote blob store.
pub struct ReplicationClient {
    remote: Arc<dyn RemoteBlobStore>,
    local: LocalStorage,
    max_attempts: u32,
    timeout: Duration,
    /// One lock per collection so pushes of a collection never overlap.
    push_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReplicationClient {
    pub fn new(
        remote: Arc<dyn RemoteBlobStore>,
        local: LocalStorage,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            remote,
            local,
            max_attempts: max_attempts.max(1),
            timeout,
            push_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteBlobStore> {
        &self.remote
    }

    fn push_lock(&self, collection: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.push_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn bounded<T, F>(&self, collection: &str, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| SyncError::transport(collection, e)),
            Err(_) => Err(SyncError::transport(collection, RemoteError::Timeout)),
        }
    }

    async fn fetch(&self, collection: &str) -> Result<Option<RemoteBlob>, SyncError> {
        self.bounded(collection, self.remote.fetch(collection)).await
    }

    /// Push the current local aggregate of `collection`.
    pub async fn push(&self, collection: &str) -> Result<PushOutcome, SyncError> {
        let lock = self.push_lock(collection);
        let _guard = lock.lock().await;

        for attempt in 1..=self.max_attempts {
            let remote = self.fetch(collection).await?;
            let Some(local) = self.local.load(collection).await? else {
                tracing::debug!("Nothing to push for {}: no local file", collection);
                return Ok(PushOutcome::NoLocalContent);
            };

            if let Some(blob) = &remote {
                if Aggregate::from_slice(&blob.content).ok().as_ref() == Some(&local) {
                    tracing::debug!("Remote {} already at {}", collection, blob.version);
                    return Ok(PushOutcome::Unchanged {
                        version: blob.version.clone(),
                    });
                }
            }

            let payload = local
                .to_vec()
                .map_err(|e| SyncError::Local(StoreError::corrupt(collection, e)))?;
            let expected = remote.as_ref().map(|b| &b.version);

            let write = self.remote.put(collection, Bytes::from(payload), expected);
            match tokio::time::timeout(self.timeout, write).await {
                Ok(Ok(version)) => {
                    tracing::info!(
                        "Pushed {} ({} records) as {} on attempt {}",
                        collection,
                        local.len(),
                        version,
                        attempt
                    );
                    return Ok(PushOutcome::Pushed {
                        version,
                        attempts: attempt,
                    });
                }
                Ok(Err(RemoteError::VersionMismatch)) => {
                    tracing::warn!(
                        "Remote {} changed during push (attempt {}/{}), refetching",
                        collection,
                        attempt,
                        self.max_attempts
                    );
                }
                Ok(Err(e)) => return Err(SyncError::transport(collection, e)),
                Err(_) => return Err(SyncError::transport(collection, RemoteError::Timeout)),
            }
        }

        Err(SyncError::Conflict {
            collection: collection.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Fetch the remote aggregate of `collection`, or `None` if absent.
    pub async fn restore(&self, collection: &str) -> Result<Option<Aggregate>, SyncError> {
        let Some(blob) = self.fetch(collection).await? else {
            return Ok(None);
        };
        let aggregate =
            Aggregate::from_slice(&blob.content).map_err(|e| SyncError::InvalidRemote {
                collection: collection.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(
            "Fetched {} at {} ({} records)",
            collection,
            blob.version,
            aggregate.len()
        );
        Ok(Some(aggregate))
    }

    /// Current remote version of `collection`, if it exists.
    pub async fn remote_version(&self, collection: &str) -> Result<Option<VersionToken>, SyncError> {
        Ok(self.fetch(collection).await?.map(|b| b.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBlobStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(max_attempts: u32) -> (TempDir, Arc<MemoryBlobStore>, LocalStorage, ReplicationClient) {
        let tmp = TempDir::new().unwrap();
        let remote = Arc::new(MemoryBlobStore::new());
        let local = LocalStorage::new(tmp.path());
        let client = ReplicationClient::new(
            remote.clone(),
            local.clone(),
            max_attempts,
            Duration::from_secs(5),
        );
        (tmp, remote, local, client)
    }

    fn trips(n: u64) -> Aggregate {
        let mut agg = Aggregate::new();
        agg.insert("T1", json!({"rounds": n}));
        agg
    }

    fn remote_aggregate(remote: &MemoryBlobStore, collection: &str) -> Aggregate {
        Aggregate::from_slice(&remote.content(collection).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_push_creates_remote() {
        let (_tmp, remote, local, client) = setup(3);
        local.save("trips", &trips(3)).await.unwrap();

        let outcome = client.push("trips").await.unwrap();
        assert!(matches!(outcome, PushOutcome::Pushed { attempts: 1, .. }));
        assert_eq!(remote_aggregate(&remote, "trips"), trips(3));
    }

    #[tokio::test]
    async fn test_push_unchanged_skips_write() {
        let (_tmp, remote, local, client) = setup(3);
        local.save("trips", &trips(3)).await.unwrap();
        client.push("trips").await.unwrap();

        let outcome = client.push("trips").await.unwrap();
        assert!(matches!(outcome, PushOutcome::Unchanged { .. }));
        assert_eq!(remote.put_count("trips"), 1);
    }

    #[tokio::test]
    async fn test_push_without_local_file() {
        let (_tmp, remote, _local, client) = setup(3);
        assert_eq!(client.push("trips").await.unwrap(), PushOutcome::NoLocalContent);
        assert!(remote.content("trips").is_none());
    }

    #[tokio::test]
    async fn test_conflict_retry_keeps_payload() {
        let (_tmp, remote, local, client) = setup(3);
        remote.write_external("trips", trips(1).to_vec().unwrap());
        local.save("trips", &trips(7)).await.unwrap();
        remote.inject_conflicts(2);

        let outcome = client.push("trips").await.unwrap();
        assert!(matches!(outcome, PushOutcome::Pushed { attempts: 3, .. }));
        assert_eq!(remote_aggregate(&remote, "trips"), trips(7));
    }

    #[tokio::test]
    async fn test_conflict_exhausted() {
        let (_tmp, remote, local, client) = setup(2);
        local.save("trips", &trips(7)).await.unwrap();
        remote.inject_conflicts(5);

        match client.push("trips").await {
            Err(SyncError::Conflict { collection, attempts }) => {
                assert_eq!(collection, "trips");
                assert_eq!(attempts, 2);
            }
            other => panic!("Expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_not_retried() {
        let (_tmp, remote, local, client) = setup(3);
        local.save("trips", &trips(2)).await.unwrap();
        remote.fail_next_puts(1);

        let err = client.push("trips").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
        assert_eq!(remote.fetch_count("trips"), 1);
        assert!(remote.content("trips").is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_transport_error() {
        let tmp = TempDir::new().unwrap();
        let remote = Arc::new(MemoryBlobStore::new());
        remote.set_latency(Some(Duration::from_millis(200)));
        let local = LocalStorage::new(tmp.path());
        local.save("trips", &trips(2)).await.unwrap();
        let client = ReplicationClient::new(remote.clone(), local, 3, Duration::from_millis(20));

        match client.push("trips").await {
            Err(SyncError::Transport { source, .. }) => assert_eq!(source, RemoteError::Timeout),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_pushes_do_not_overlap() {
        let (_tmp, remote, local, client) = setup(3);
        let client = Arc::new(client);
        remote.set_latency(Some(Duration::from_millis(10)));
        local.save("trips", &trips(1)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.push("trips").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(remote.max_in_flight("trips"), 1);
        assert_eq!(remote.put_count("trips"), 1);
    }

    #[tokio::test]
    async fn test_restore() {
        let (_tmp, remote, _local, client) = setup(3);
        assert!(client.restore("users").await.unwrap().is_none());

        remote.write_external("users", trips(4).to_vec().unwrap());
        assert_eq!(client.restore("users").await.unwrap(), Some(trips(4)));

        remote.write_external("users", "not json");
        assert!(matches!(
            client.restore("users").await,
            Err(SyncError::InvalidRemote { .. })
        ));
    }
}
