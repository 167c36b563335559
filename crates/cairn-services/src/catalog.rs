//! Local resource catalog — the files this peer offers to the LAN.
//!
//! A sorted name → descriptor mapping behind one readers–writer lock.
//! Registration validates the caller's input against the protocol limits
//! and stats the file once; the descriptor then carries the size and
//! timestamp observed at that moment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use cairn_core::wire::{MAX_CATALOG_ENTRIES, MAX_NAME_LEN, MAX_PATH_LEN, MAX_RESOURCE_SIZE};

/// One catalog entry, as captured at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub name: String,
    pub path: PathBuf,
    /// File size in bytes when the resource was registered.
    pub size: u64,
    /// Registration time, seconds since the epoch.
    pub last_modified: u64,
}

/// Errors reported to the caller at registration time. The catalog is
/// unchanged whenever one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("resource path not found or not a regular file: {0}")]
    NotFound(PathBuf),

    #[error("resource name is empty")]
    EmptyName,

    #[error("resource name is {0} bytes, limit {}", MAX_NAME_LEN)]
    NameTooLong(usize),

    #[error("resource path is {0} bytes, limit {}", MAX_PATH_LEN)]
    PathTooLong(usize),

    #[error("resource is {0} bytes, limit {}", MAX_RESOURCE_SIZE)]
    FileTooLarge(u64),

    #[error("catalog already holds {} entries", MAX_CATALOG_ENTRIES)]
    Full,
}

/// Thread-safe catalog of local resources. Cheap to clone — clones share
/// the same underlying index.
#[derive(Clone, Default)]
pub struct LocalCatalog {
    inner: Arc<RwLock<BTreeMap<String, ResourceInfo>>>,
}

impl LocalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource under `name`, replacing any existing entry.
    ///
    /// Returns `true` if the name was new, `false` if an entry was
    /// overwritten. The path must exist and be a regular file; its size
    /// and the current time are captured into the descriptor.
    pub fn add(&self, name: &str, path: impl AsRef<Path>) -> Result<bool, CatalogError> {
        let path = path.as_ref();
        if name.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(CatalogError::NameTooLong(name.len()));
        }
        if path.as_os_str().len() > MAX_PATH_LEN {
            return Err(CatalogError::PathTooLong(path.as_os_str().len()));
        }

        let metadata =
            std::fs::metadata(path).map_err(|_| CatalogError::NotFound(path.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(CatalogError::NotFound(path.to_path_buf()));
        }
        if metadata.len() > MAX_RESOURCE_SIZE {
            return Err(CatalogError::FileTooLarge(metadata.len()));
        }

        let info = ResourceInfo {
            name: name.to_owned(),
            path: path.to_path_buf(),
            size: metadata.len(),
            last_modified: unix_now_secs(),
        };

        let mut resources = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !resources.contains_key(name) && resources.len() >= MAX_CATALOG_ENTRIES {
            return Err(CatalogError::Full);
        }
        let added = resources.insert(name.to_owned(), info).is_none();
        tracing::debug!(name, size = metadata.len(), added, "resource registered");
        Ok(added)
    }

    /// Remove a resource. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let existed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if existed {
            tracing::debug!(name, "resource removed");
        }
        existed
    }

    pub fn get(&self, name: &str) -> Option<ResourceInfo> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|info| info.path.clone())
    }

    /// Point-in-time copy of the catalog, sorted by name. Callers iterate
    /// without holding the lock.
    pub fn snapshot(&self) -> Vec<(String, ResourceInfo)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
