//! In-process remote blob store.
//!
//! Behaves like a real compare-and-set store, and can be told to fail,
//! slow down, or lose a race against another writer.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{RemoteBlob, RemoteBlobStore, VersionToken};
use crate::error::RemoteError;

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<String, (Bytes, u64)>,
    next_version: u64,
    puts: HashMap<String, u64>,
    fetches: HashMap<String, u64>,
    in_flight: HashMap<String, u32>,
    max_in_flight: HashMap<String, u32>,
    fail_fetches: u32,
    fail_puts: u32,
    conflicts: u32,
    latency: Option<Duration>,
}

impl MemoryState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Counts a request as in flight until dropped, including on cancellation.
struct InFlight<'a> {
    store: &'a MemoryBlobStore,
    collection: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.leave(&self.collection);
    }
}

/// Memory-backed [`RemoteBlobStore`].
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<MemoryState>,
}

fn token(version: u64) -> VersionToken {
    VersionToken::new(format!("v{}", version))
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store content directly, as another writer would.
    pub fn write_external(&self, collection: &str, content: impl Into<Bytes>) -> VersionToken {
        let mut state = self.lock();
        let version = state.bump();
        state
            .blobs
            .insert(collection.to_string(), (content.into(), version));
        token(version)
    }

    pub fn content(&self, collection: &str) -> Option<Bytes> {
        self.lock().blobs.get(collection).map(|(c, _)| c.clone())
    }

    pub fn version(&self, collection: &str) -> Option<VersionToken> {
        self.lock().blobs.get(collection).map(|(_, v)| token(*v))
    }

    /// Successful writes accepted for `collection`.
    pub fn put_count(&self, collection: &str) -> u64 {
        self.lock().puts.get(collection).copied().unwrap_or(0)
    }

    pub fn fetch_count(&self, collection: &str) -> u64 {
        self.lock().fetches.get(collection).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous requests seen for `collection`.
    pub fn max_in_flight(&self, collection: &str) -> u32 {
        self.lock().max_in_flight.get(collection).copied().unwrap_or(0)
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.lock().fail_fetches = n;
    }

    /// Fail the next `n` writes with a transport error.
    pub fn fail_next_puts(&self, n: u32) {
        self.lock().fail_puts = n;
    }

    /// Let another writer win the race before each of the next `n` writes.
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().conflicts = n;
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    async fn enter(&self, collection: &str) -> InFlight<'_> {
        let guard = InFlight {
            store: self,
            collection: collection.to_string(),
        };
        let latency = {
            let mut state = self.lock();
            let count = state.in_flight.entry(collection.to_string()).or_insert(0);
            *count += 1;
            let current = *count;
            let max = state.max_in_flight.entry(collection.to_string()).or_insert(0);
            *max = (*max).max(current);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn leave(&self, collection: &str) {
        if let Some(count) = self.lock().in_flight.get_mut(collection) {
            *count = count.saturating_sub(1);
        }
    }

    fn fetch_now(&self, collection: &str) -> Result<Option<RemoteBlob>, RemoteError> {
        let mut state = self.lock();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(RemoteError::Transport("injected fetch failure".into()));
        }
        *state.fetches.entry(collection.to_string()).or_insert(0) += 1;
        Ok(state.blobs.get(collection).map(|(content, version)| RemoteBlob {
            content: content.clone(),
            version: token(*version),
        }))
    }

    fn put_now(
        &self,
        collection: &str,
        content: Bytes,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, RemoteError> {
        let mut state = self.lock();
        if state.fail_puts > 0 {
            state.fail_puts -= 1;
            return Err(RemoteError::Transport("injected put failure".into()));
        }
        if state.conflicts > 0 {
            state.conflicts -= 1;
            let version = state.bump();
            let existing = state
                .blobs
                .get(collection)
                .map(|(c, _)| c.clone())
                .unwrap_or_default();
            state
                .blobs
                .insert(collection.to_string(), (existing, version));
        }

        let current = state.blobs.get(collection).map(|(_, v)| token(*v));
        if current.as_ref() != expected {
            return Err(RemoteError::VersionMismatch);
        }

        let version = state.bump();
        state
            .blobs
            .insert(collection.to_string(), (content, version));
        *state.puts.entry(collection.to_string()).or_insert(0) += 1;
        Ok(token(version))
    }
}

#[async_trait]
impl RemoteBlobStore for MemoryBlobStore {
    async fn fetch(&self, collection: &str) -> Result<Option<RemoteBlob>, RemoteError> {
        let _in_flight = self.enter(collection).await;
        self.fetch_now(collection)
    }

    async fn put(
        &self,
        collection: &str,
        content: Bytes,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, RemoteError> {
        let _in_flight = self.enter(collection).await;
        self.put_now(collection, content, expected)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
