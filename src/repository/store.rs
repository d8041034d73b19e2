use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Error;
use crate::types::Result;
use crate::utils::FsUtils;

/// Key/value backend behind the certificate repository.
///
/// Keys have the form `<namespace>/<id>`.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace a value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a value; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// One JSON file per key under a root directory: `<root>/<namespace>/<id>.json`
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let (namespace, id) = split_key(key)?;
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(Error::InvalidRequest(format!("Invalid storage key: {}", key)));
        }
        Ok(self.root.join(namespace).join(format!("{}.json", id)))
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    let (namespace, id) = key
        .split_once('/')
        .ok_or_else(|| Error::InvalidRequest(format!("Invalid storage key: {}", key)))?;
    if namespace.is_empty() || namespace.contains('\\') || namespace.starts_with('.') {
        return Err(Error::InvalidRequest(format!("Invalid storage key: {}", key)));
    }
    Ok((namespace, id))
}

fn storage_err(key: &str, err: Error) -> Error {
    match err {
        Error::Io(e) => Error::Storage(format!("{}: {}", key, e)),
        other => other,
    }
}

#[async_trait]
impl DataStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        FsUtils::read_optional(&path).await.map_err(|e| storage_err(key, e))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        debug!(path = %path.display(), "Writing record");
        FsUtils::write_atomic(&path, value).await.map_err(|e| storage_err(key, e))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        FsUtils::remove_file(&path).await.map_err(|e| storage_err(key, e))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let (namespace, id_prefix) = split_key(prefix)?;
        let files = FsUtils::list_files(self.root.join(namespace), "json")
            .await
            .map_err(|e| storage_err(prefix, e))?;

        let mut entries = Vec::new();
        for file in files {
            let id = match file.file_stem().and_then(|s| s.to_str()) {
                Some(id) if id.starts_with(id_prefix) => id.to_string(),
                _ => continue,
            };
            let key = format!("{}/{}", namespace, id);
            // removed between listing and reading
            if let Some(value) = self.get(&key).await? {
                entries.push((key, value));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
