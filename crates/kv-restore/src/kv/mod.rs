use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

/// A stored value together with its optional per-key metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The target store a restore writes into. Every call is a potential suspension point.
pub trait KeyValueStore: Send + Sync {
    fn name(&self) -> &str;

    fn get_with_metadata(&self, key: &str) -> Result<Option<StoredValue>>;

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_with_metadata(key)?.map(|v| v.value))
    }

    /// Metadata only. Backends that keep metadata apart from values can skip the value read.
    fn metadata(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get_with_metadata(key)?.and_then(|v| v.metadata))
    }

    fn put(&self, key: &str, value: &str, metadata: Option<&serde_json::Value>) -> Result<()>;

    /// Create `key` only if it does not exist yet. Returns false when it already exists.
    fn put_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Ok even if the key does not exist.
    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically delete `key` if `pred` accepts its current entry. `pred` gets `None`
    /// when the entry exists but cannot be decoded. Returns true when the key is absent
    /// afterwards, whether removed here or already gone.
    fn remove_if(&self, key: &str, pred: &dyn Fn(Option<&StoredValue>) -> bool) -> Result<bool>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

impl std::fmt::Debug for dyn KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyValueStore({})", self.name())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Fs,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub root_dir: Option<String>,
}

pub fn open_store(cfg: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    match cfg.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::default())),
        StoreBackend::Fs => {
            let Some(root) = cfg
                .root_dir
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            else {
                return Err(Error::config("store.root_dir is required for the fs backend"));
            };
            Ok(Arc::new(FsStore::open(root)?))
        }
    }
}
