//! Configuration for a Fairway replica.
//!
//! Stored as JSON (e.g. `fairway.json`). A missing file yields defaults,
//! which replicate to an in-process memory store.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::{TRIPS, USERS};

/// Environment variable consulted for the GitHub token.
pub const GITHUB_TOKEN_ENV: &str = "FAIRWAY_GITHUB_TOKEN";

/// Which remote blob store a replica pushes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// In-process store; nothing leaves the process.
    Memory,
    /// Repository contents API of a hosted git service.
    #[serde(rename = "github")]
    GitHub {
        #[serde(default = "default_api_base")]
        api_base: String,
        owner: String,
        repo: String,
        #[serde(default = "default_branch")]
        branch: String,
        /// Prepended to `<collection>.json` inside the repository.
        #[serde(default)]
        path_prefix: String,
        #[serde(default)]
        token: Option<String>,
    },
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

/// Replica configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FairwayConfig {
    /// Directory holding one `<collection>.json` file per collection.
    pub data_dir: PathBuf,
    /// Collections restored from the remote store at startup.
    pub collections: Vec<String>,
    /// Minimum seconds between two unforced pushes of one collection.
    pub sync_interval_secs: u64,
    /// Period of the retry queue drain.
    pub retry_tick_secs: u64,
    /// Compare-and-set attempts per push before reporting a conflict.
    pub max_cas_attempts: u32,
    /// Bound on each remote fetch or write.
    pub remote_timeout_secs: u64,
    /// Bound on restoring one collection at startup.
    pub restore_timeout_secs: u64,
    /// Buffered change events per subscriber.
    pub notify_capacity: usize,
    pub remote: RemoteConfig,
}

impl Default for FairwayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            collections: vec![TRIPS.to_string(), USERS.to_string()],
            sync_interval_secs: 60,
            retry_tick_secs: 5,
            max_cas_attempts: 3,
            remote_timeout_secs: 30,
            restore_timeout_secs: 60,
            notify_capacity: 256,
            remote: RemoteConfig::Memory,
        }
    }
}

impl FairwayConfig {
    /// Load config from `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: FairwayConfig = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config JSON in {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to `path` (write to temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Reject settings the sync machinery cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_cas_attempts == 0 {
            return Err(anyhow!("max_cas_attempts must be at least 1"));
        }
        if self.retry_tick_secs == 0 {
            return Err(anyhow!("retry_tick_secs must be at least 1"));
        }
        if self.remote_timeout_secs == 0 {
            return Err(anyhow!("remote_timeout_secs must be at least 1"));
        }
        if self.notify_capacity == 0 {
            return Err(anyhow!("notify_capacity must be at least 1"));
        }
        if let RemoteConfig::GitHub { owner, repo, .. } = &self.remote {
            if owner.is_empty() || repo.is_empty() {
                return Err(anyhow!("github remote needs both owner and repo"));
            }
        }
        Ok(())
    }

    /// Fill in settings that may come from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Like [`apply_env_overrides`](Self::apply_env_overrides) with an explicit lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let RemoteConfig::GitHub { token, .. } = &mut self.remote {
            if token.is_none() {
                *token = lookup(GITHUB_TOKEN_ENV).filter(|t| !t.is_empty());
            }
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn retry_tick(&self) -> Duration {
        Duration::from_secs(self.retry_tick_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = FairwayConfig::load(&tmp.path().join("fairway.json")).unwrap();
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.retry_tick(), Duration::from_secs(5));
        assert_eq!(config.max_cas_attempts, 3);
        assert_eq!(config.collections, vec!["trips", "users"]);
        assert_eq!(config.remote, RemoteConfig::Memory);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conf").join("fairway.json");
        let mut config = FairwayConfig::default();
        config.sync_interval_secs = 120;
        config.remote = RemoteConfig::GitHub {
            api_base: default_api_base(),
            owner: "acme".into(),
            repo: "golf-data".into(),
            branch: "main".into(),
            path_prefix: "db/".into(),
            token: None,
        };
        config.save(&path).unwrap();

        let loaded = FairwayConfig::load(&path).unwrap();
        assert_eq!(loaded.sync_interval_secs, 120);
        assert_eq!(loaded.remote, config.remote);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fairway.json");
        fs::write(
            &path,
            r#"{"data_dir": "/var/lib/fairway", "remote": {"kind": "github", "owner": "o", "repo": "r"}}"#,
        )
        .unwrap();

        let config = FairwayConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fairway"));
        assert_eq!(config.retry_tick_secs, 5);
        match config.remote {
            RemoteConfig::GitHub { api_base, branch, .. } => {
                assert_eq!(api_base, "https://api.github.com");
                assert_eq!(branch, "main");
            }
            other => panic!("Expected github remote, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fairway.json");
        fs::write(&path, r#"{"max_cas_attempts": 0}"#).unwrap();
        assert!(FairwayConfig::load(&path).is_err());

        let config = FairwayConfig {
            remote_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(FairwayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_token_override() {
        let mut config = FairwayConfig {
            remote: RemoteConfig::GitHub {
                api_base: default_api_base(),
                owner: "o".into(),
                repo: "r".into(),
                branch: "main".into(),
                path_prefix: String::new(),
                token: None,
            },
            ..Default::default()
        };
        config.apply_overrides_from(|key| {
            (key == GITHUB_TOKEN_ENV).then(|| "secret".to_string())
        });
        match &config.remote {
            RemoteConfig::GitHub { token, .. } => assert_eq!(token.as_deref(), Some("secret")),
            _ => unreachable!(),
        }

        // An explicit token in the file wins.
        config.apply_overrides_from(|_| Some("other".to_string()));
        match &config.remote {
            RemoteConfig::GitHub { token, .. } => assert_eq!(token.as_deref(), Some("secret")),
            _ => unreachable!(),
        }
    }
}
