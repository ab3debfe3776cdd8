use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, StoredValue};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.entries.lock().map(|g| g.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut BTreeMap<String, StoredValue>) -> T) -> Result<T> {
        let mut g = self
            .entries
            .lock()
            .map_err(|_| Error::storage("memory store mutex poisoned"))?;
        Ok(f(&mut g))
    }
}

impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_with_metadata(&self, key: &str) -> Result<Option<StoredValue>> {
        self.with_entries(|e| e.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str, metadata: Option<&serde_json::Value>) -> Result<()> {
        self.with_entries(|e| {
            e.insert(
                key.to_string(),
                StoredValue {
                    value: value.to_string(),
                    metadata: metadata.cloned(),
                },
            );
        })
    }

    fn put_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        self.with_entries(|e| {
            if e.contains_key(key) {
                return false;
            }
            e.insert(
                key.to_string(),
                StoredValue {
                    value: value.to_string(),
                    metadata: None,
                },
            );
            true
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_entries(|e| {
            e.remove(key);
        })
    }

    fn remove_if(&self, key: &str, pred: &dyn Fn(Option<&StoredValue>) -> bool) -> Result<bool> {
        self.with_entries(|e| {
            let remove = match e.get(key) {
                None => return true,
                Some(v) => pred(Some(v)),
            };
            if remove {
                e.remove(key);
            }
            remove
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_entries(|e| {
            e.range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect()
        })
    }
}
