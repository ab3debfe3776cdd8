use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::kv::StoreConfig;
use crate::task::DriverMode;

pub const CONFIG_ENV: &str = "KVRESTORE_CONFIG";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl Default for ConfigDoc {
    fn default() -> Self {
        Self {
            path: PathBuf::from("<default>"),
            value: Value::Table(Default::default()),
        }
    }
}

impl ConfigDoc {
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Ok(Self {
            path: PathBuf::from("<mem>"),
            value,
        })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.value;
        for seg in path.trim().split('.').filter(|s| !s.is_empty()) {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize config at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    pub fn settings(&self) -> Result<Settings> {
        let restore: RestoreConfig = self.deserialize_path("restore")?.unwrap_or_default();
        restore.validate()?;
        Ok(Settings {
            restore,
            store: self.deserialize_path("store")?.unwrap_or_default(),
            logging: self.deserialize_path("logging")?.unwrap_or_default(),
        })
    }
}

fn default_chunk_size() -> usize {
    20
}

fn default_quantum() -> usize {
    20
}

fn default_checkpoint_every() -> usize {
    50
}

fn default_key_prefix() -> String {
    "restore@".into()
}

fn default_lease_ttl_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Entries per persisted chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Entries processed by one step.
    #[serde(default = "default_quantum")]
    pub quantum: usize,
    /// Entries between record checkpoints in run-to-completion mode.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    pub mode: DriverMode,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            quantum: default_quantum(),
            checkpoint_every: default_checkpoint_every(),
            mode: DriverMode::default(),
            key_prefix: default_key_prefix(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl RestoreConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("restore.chunk_size", self.chunk_size),
            ("restore.quantum", self.quantum),
            ("restore.checkpoint_every", self.checkpoint_every),
        ] {
            if v == 0 {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }
        if self.key_prefix.trim().is_empty() {
            return Err(Error::config("restore.key_prefix must not be empty"));
        }
        Ok(())
    }
}

fn default_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub restore: RestoreConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn load_value(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let parent = value
        .as_table_mut()
        .and_then(|t| t.remove("extends"))
        .and_then(|v| v.as_str().map(str::to_string));
    if let Some(parent) = parent {
        let p = PathBuf::from(&parent);
        let p = if p.is_absolute() {
            p
        } else {
            path.parent().unwrap_or_else(|| Path::new(".")).join(p)
        };
        out = load_value(&p, seen)?;
    }
    merge(&mut out, value);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let value = load_value(path, &mut HashSet::new())?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// `--config` wins, then `$KVRESTORE_CONFIG`, then built-in defaults.
pub fn load_or_default(explicit: Option<&Path>) -> Result<ConfigDoc> {
    if let Some(p) = explicit {
        return load(p);
    }
    match std::env::var(CONFIG_ENV) {
        Ok(p) if !p.trim().is_empty() => load(Path::new(p.trim())),
        _ => Ok(ConfigDoc::default()),
    }
}
