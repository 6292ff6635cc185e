//! Remote blob store abstraction
//!
//! A remote blob store keeps one blob per collection and guards writes with
//! an opaque version token (compare-and-set): a write is accepted only if
//! it names the version currently stored.

pub mod github;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::RemoteConfig;
use crate::error::RemoteError;

pub use github::GitHubContentStore;
pub use memory::MemoryBlobStore;

/// Identifies one revision of a remote blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote content together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBlob {
    pub content: Bytes,
    pub version: VersionToken,
}

/// Versioned blob storage reachable over the network.
#[async_trait]
pub trait RemoteBlobStore: Send + Sync {
    /// Fetch the current blob, or `None` if the collection has none yet.
    async fn fetch(&self, collection: &str) -> Result<Option<RemoteBlob>, RemoteError>;

    /// Write `content` if the stored version is still `expected`.
    ///
    /// `expected = None` creates the blob and fails with
    /// [`RemoteError::VersionMismatch`] if one already exists.
    async fn put(
        &self,
        collection: &str,
        content: Bytes,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken, RemoteError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Build the remote store named by a config.
pub fn from_config(
    config: &RemoteConfig,
    timeout: std::time::Duration,
) -> Result<Arc<dyn RemoteBlobStore>, RemoteError> {
    match config {
        RemoteConfig::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        RemoteConfig::GitHub { .. } => Ok(Arc::new(GitHubContentStore::from_config(config, timeout)?)),
    }
}
