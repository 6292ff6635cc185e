//! Fairway Core Library
//!
//! Durable document storage for the trip bookkeeping service, with
//! rate-limited, conflict-aware replication to a remote blob store:
//! - Aggregate documents (one JSON document per collection)
//! - Local stable storage with atomic replace
//! - Per-collection serialized mutations and change notification
//! - Versioned compare-and-set pushes to the remote store
//! - Rate limiting, retry queue and periodic drain
//! - Startup restore from the remote store

pub mod aggregate;
pub mod client;
pub mod config;
pub mod error;
pub mod local;
pub mod model;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod replica;
pub mod restore;
pub mod scheduler;
pub mod store;

pub use aggregate::{Aggregate, ChangeKind};
pub use client::{PushOutcome, ReplicationClient};
pub use config::{FairwayConfig, RemoteConfig};
pub use error::{RemoteError, StoreError, SyncError};
pub use local::LocalStorage;
pub use model::{ModelError, Trip, User, TRIPS, USERS};
pub use notify::{ChangeEvent, ChangeNotifier};
pub use queue::{DrainOutcome, PushTarget, RetryQueue, RetryTicker};
pub use remote::{GitHubContentStore, MemoryBlobStore, RemoteBlob, RemoteBlobStore, VersionToken};
pub use replica::Replica;
pub use restore::{RestoreOutcome, RestoreReport, StartupRestorer};
pub use scheduler::{CollectionStatus, SyncRequestOutcome, SyncScheduler};
pub use store::{DocumentStore, MutateOptions, Mutation};
