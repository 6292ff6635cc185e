//! Replica lifecycle
//!
//! Wires local storage, the replication client, scheduler, retry queue and
//! document store together from one [`FairwayConfig`].
//!
//! Startup order: restore every configured collection, then start the retry
//! ticker. Shutdown stops the ticker and pushes whatever is still pending.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, PoisonError};

use crate::client::{PushOutcome, ReplicationClient};
use crate::config::FairwayConfig;
use crate::error::SyncError;
use crate::local::LocalStorage;
use crate::notify::ChangeNotifier;
use crate::queue::{RetryQueue, RetryTicker};
use crate::remote::{self, RemoteBlobStore};
use crate::restore::{RestoreReport, StartupRestorer};
use crate::scheduler::SyncScheduler;
use crate::store::DocumentStore;

pub struct Replica {
    config: FairwayConfig,
    client: Arc<ReplicationClient>,
    scheduler: Arc<SyncScheduler>,
    store: Arc<DocumentStore>,
    ticker: Mutex<Option<RetryTicker>>,
}

impl Replica {
    /// Build a replica that replicates to `remote`. Nothing runs until
    /// [`start`](Self::start).
    pub fn open(config: FairwayConfig, remote: Arc<dyn RemoteBlobStore>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let local = LocalStorage::new(&config.data_dir);
        let client = Arc::new(ReplicationClient::new(
            remote,
            local.clone(),
            config.max_cas_attempts,
            config.remote_timeout(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            client.clone(),
            Arc::new(RetryQueue::new()),
            config.sync_interval(),
        ));
        let notifier = ChangeNotifier::new(config.notify_capacity);
        let store = Arc::new(DocumentStore::new(local, scheduler.clone(), notifier));

        tracing::info!(
            "Opened replica at {} (remote {})",
            config.data_dir.display(),
            client.remote().describe()
        );
        Ok(Self {
            config,
            client,
            scheduler,
            store,
            ticker: Mutex::new(None),
        })
    }

    /// Build the remote binding named by the config, then [`open`](Self::open).
    pub fn from_config(config: FairwayConfig) -> Result<Self> {
        let remote = remote::from_config(&config.remote, config.remote_timeout())
            .context("Failed to create remote store")?;
        Self::open(config, remote)
    }

    pub fn config(&self) -> &FairwayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn client(&self) -> &Arc<ReplicationClient> {
        &self.client
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        self.store.notifier()
    }

    pub fn restorer(&self) -> StartupRestorer {
        StartupRestorer::new(self.client.clone(), self.config.restore_timeout())
    }

    /// Restore all configured collections, then start draining the retry
    /// queue. Calling it again restores again but keeps the one ticker.
    pub async fn start(&self) -> RestoreReport {
        let report = self
            .restorer()
            .restore_all(&self.store, &self.config.collections)
            .await;

        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_none() {
            *ticker = Some(
                self.scheduler
                    .queue()
                    .clone()
                    .spawn_ticker(self.scheduler.clone(), self.config.retry_tick()),
            );
        }
        report
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the retry ticker and push every collection still pending once.
    /// Failures are logged and returned, not raised.
    pub async fn shutdown(&self) -> Vec<(String, Result<PushOutcome, SyncError>)> {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.shutdown().await;
        }

        let results = self.scheduler.flush().await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(
                "Shutdown flush left {} of {} collection(s) unsynced",
                failed,
                results.len()
            );
        } else {
            tracing::info!("Shutdown flush pushed {} collection(s)", results.len());
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::config::RemoteConfig;
    use crate::model::{TRIPS, USERS};
    use crate::remote::MemoryBlobStore;
    use crate::restore::RestoreOutcome;
    use crate::store::MutateOptions;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> FairwayConfig {
        FairwayConfig {
            data_dir: tmp.path().join("data"),
            sync_interval_secs: 3600,
            retry_tick_secs: 3600,
            ..FairwayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let tmp = TempDir::new().unwrap();
        let bad = FairwayConfig {
            max_cas_attempts: 0,
            ..config(&tmp)
        };
        assert!(Replica::open(bad, Arc::new(MemoryBlobStore::new())).is_err());
    }

    #[tokio::test]
    async fn test_from_config_memory() {
        let tmp = TempDir::new().unwrap();
        let replica = Replica::from_config(FairwayConfig {
            remote: RemoteConfig::Memory,
            ..config(&tmp)
        })
        .unwrap();
        assert_eq!(replica.client().remote().describe(), "memory");
    }

    #[tokio::test]
    async fn test_start_restores_then_runs() {
        let tmp = TempDir::new().unwrap();
        let remote = Arc::new(MemoryBlobStore::new());
        let mut trips = Aggregate::new();
        trips.insert("T1", json!({"rounds": 2}));
        remote.write_external(TRIPS, trips.to_vec().unwrap());

        let replica = Replica::open(config(&tmp), remote.clone()).unwrap();
        assert!(!replica.is_running());

        let report = replica.start().await;
        assert!(replica.is_running());
        assert!(matches!(report.get(TRIPS), Some(RestoreOutcome::Restored { records: 1 })));
        assert!(matches!(report.get(USERS), Some(RestoreOutcome::Absent)));
        assert_eq!(replica.store().read(TRIPS).await.unwrap(), trips);

        // A second start does not spawn a second ticker.
        replica.start().await;
        replica.shutdown().await;
        assert!(!replica.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let tmp = TempDir::new().unwrap();
        let remote = Arc::new(MemoryBlobStore::new());
        let replica = Replica::open(config(&tmp), remote.clone()).unwrap();
        replica.start().await;

        replica
            .store()
            .mutate(USERS, MutateOptions::forced(), |agg| {
                agg.insert("alice", json!({}));
                Ok(())
            })
            .await
            .unwrap();
        replica
            .store()
            .mutate(USERS, MutateOptions::default(), |agg| {
                agg.insert("bob", json!({}));
                Ok(())
            })
            .await
            .unwrap();
        assert!(replica.scheduler().is_pending(USERS));

        let results = replica.shutdown().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        let pushed = Aggregate::from_slice(&remote.content(USERS).unwrap()).unwrap();
        assert!(pushed.contains("alice"));
        assert!(pushed.contains("bob"));
    }

    #[tokio::test]
    async fn test_ticker_drains_deferred_sync() {
        let tmp = TempDir::new().unwrap();
        let remote = Arc::new(MemoryBlobStore::new());
        let cfg = FairwayConfig {
            retry_tick_secs: 1,
            ..config(&tmp)
        };
        let replica = Replica::open(cfg, remote.clone()).unwrap();
        replica.start().await;

        let store = replica.store();
        store
            .mutate(TRIPS, MutateOptions::forced(), |agg| {
                agg.insert("T1", json!(1));
                Ok(())
            })
            .await
            .unwrap();
        store
            .mutate(TRIPS, MutateOptions::default(), |agg| {
                agg.insert("T1", json!(2));
                Ok(())
            })
            .await
            .unwrap();
        assert!(replica.scheduler().queue().contains(TRIPS));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while replica.scheduler().is_pending(TRIPS) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!replica.scheduler().is_pending(TRIPS));
        assert_eq!(remote.put_count(TRIPS), 2);
        replica.shutdown().await;
    }
}
