//! Local stable storage
//!
//! One file per collection: `<root>/<collection>.json`, holding the full
//! serialized aggregate. Writes go to a temp file that is synced and then
//! renamed over the old file, so readers only ever see a complete aggregate.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::aggregate::Aggregate;
use crate::error::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

const EXTENSION: &str = "json";

/// Check that `name` is usable as a collection (and file) name.
pub fn validate_collection(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

/// File-per-collection storage rooted at a data directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing `collection`.
    pub fn path_for(&self, collection: &str) -> Result<PathBuf> {
        validate_collection(collection)?;
        Ok(self.root.join(format!("{}.{}", collection, EXTENSION)))
    }

    /// Load a collection, or `None` if it has never been written.
    pub async fn load(&self, collection: &str) -> Result<Option<Aggregate>> {
        let path = self.path_for(collection)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::persistence(collection, e)),
        };
        Aggregate::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::corrupt(collection, e))
    }

    /// Load a collection, creating it with an empty aggregate if absent.
    pub async fn load_or_create(&self, collection: &str) -> Result<Aggregate> {
        match self.load(collection).await? {
            Some(aggregate) => Ok(aggregate),
            None => {
                let aggregate = Aggregate::new();
                self.save(collection, &aggregate).await?;
                tracing::debug!("Created empty collection {}", collection);
                Ok(aggregate)
            }
        }
    }

    /// Durably replace the stored aggregate.
    pub async fn save(&self, collection: &str, aggregate: &Aggregate) -> Result<()> {
        let path = self.path_for(collection)?;
        let data = aggregate
            .to_vec()
            .map_err(|e| StoreError::corrupt(collection, e))?;
        self.write_atomic(&path, &data)
            .await
            .map_err(|e| StoreError::persistence(collection, e))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let tmp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await
    }

    /// Collections that currently have a file, sorted by name.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::persistence("*", e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::persistence("*", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_collection(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Size in bytes of a collection's file, if it exists.
    pub async fn size_of(&self, collection: &str) -> Result<Option<u64>> {
        let path = self.path_for(collection)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::persistence(collection, e)),
        }
    }
}
