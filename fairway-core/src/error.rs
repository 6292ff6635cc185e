//! Error types for Fairway
//!
//! Local persistence failures are the only errors a mutating caller ever
//! sees. Remote failures are reported to the sync machinery, which turns
//! them into retries.

/// Errors raised by local storage and the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("Failed to persist collection {collection}: {source}")]
    Persistence {
        collection: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Collection {collection} is not a valid aggregate: {source}")]
    Corrupt {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Mutation rejected: {0}")]
    Rejected(anyhow::Error),
}

impl StoreError {
    pub(crate) fn persistence(collection: &str, source: std::io::Error) -> Self {
        StoreError::Persistence {
            collection: collection.to_string(),
            source,
        }
    }

    pub(crate) fn corrupt(collection: &str, source: serde_json::Error) -> Self {
        StoreError::Corrupt {
            collection: collection.to_string(),
            source,
        }
    }
}

/// Errors raised by a remote blob store binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Version token is stale")]
    VersionMismatch,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to decode remote response: {0}")]
    Decode(String),
}

/// Errors raised while replicating a collection.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Collection {collection} still conflicted after {attempts} attempts")]
    Conflict { collection: String, attempts: u32 },

    #[error("Remote unavailable for collection {collection}: {source}")]
    Transport {
        collection: String,
        #[source]
        source: RemoteError,
    },

    #[error("Local snapshot unavailable: {0}")]
    Local(#[from] StoreError),

    #[error("Remote content for collection {collection} is invalid: {reason}")]
    InvalidRemote { collection: String, reason: String },
}

impl SyncError {
    pub(crate) fn transport(collection: &str, source: RemoteError) -> Self {
        SyncError::Transport {
            collection: collection.to_string(),
            source,
        }
    }

    /// Whether a later attempt may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Conflict { .. } | SyncError::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_retryable() {
        let conflict = SyncError::Conflict {
            collection: "trips".into(),
            attempts: 3,
        };
        assert!(conflict.is_retryable());

        let transport = SyncError::transport("trips", RemoteError::Timeout);
        assert!(transport.is_retryable());

        let invalid = SyncError::InvalidRemote {
            collection: "trips".into(),
            reason: "not an object".into(),
        };
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_error_messages_name_collection() {
        let err = StoreError::persistence(
            "users",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        );
        let msg = err.to_string();
        assert!(msg.contains("users"));
        assert!(msg.contains("read-only"));
    }
}
