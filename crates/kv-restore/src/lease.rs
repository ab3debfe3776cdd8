use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::kv::KeyValueStore;
use crate::task::Keys;

/// Advisory per-task lease stored next to the task record.
#[derive(Debug, Serialize, Deserialize)]
struct LeaseEntry {
    token: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held while a driver advances a task. Dropping it releases the lease.
#[derive(Debug)]
pub struct LeaseGuard {
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Refresh `acquired_at` so long-running holders are not broken as stale.
    pub fn renew(&self) -> Result<()> {
        if !self.is_ours()? {
            return Err(Error::new(
                ErrorKind::Busy,
                format!("lease '{}' was taken over", self.key),
            ));
        }
        let entry = LeaseEntry {
            token: self.token.clone(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_string(&entry)
            .map_err(|e| Error::storage(format!("lease encode failed: {e}")))?;
        self.store.put(&self.key, &body, None)
    }

    fn is_ours(&self) -> Result<bool> {
        Ok(match self.store.get(&self.key)? {
            Some(raw) => serde_json::from_str::<LeaseEntry>(&raw)
                .map(|e| e.token == self.token)
                .unwrap_or(false),
            None => false,
        })
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // A stale-broken lease may have been re-acquired by another driver.
        let token = self.token.clone();
        let released = self.store.remove_if(&self.key, &|current| {
            current
                .and_then(|v| serde_json::from_str::<LeaseEntry>(&v.value).ok())
                .is_some_and(|e| e.token == token)
        });
        if let Err(e) = released {
            warn!(lease = %self.key, error = %e, "failed to release lease");
        }
    }
}

/// Try to take the lease for `task_id`. `Ok(None)` means a live lease is held
/// elsewhere; callers must not advance the task.
pub fn try_acquire(
    store: &Arc<dyn KeyValueStore>,
    keys: &Keys,
    task_id: &str,
    ttl_secs: u64,
) -> Result<Option<LeaseGuard>> {
    let key = keys.lease(task_id);
    let token = format!("{:032x}", rand::random::<u128>());
    let entry = LeaseEntry {
        token: token.clone(),
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let body = serde_json::to_string(&entry)
        .map_err(|e| Error::storage(format!("lease encode failed: {e}")))?;

    // Second attempt only after the previous holder's entry is gone.
    for _ in 0..2 {
        if store.put_if_absent(&key, &body)? {
            debug!(task_id, "lease acquired");
            return Ok(Some(LeaseGuard {
                store: Arc::clone(store),
                key,
                token,
            }));
        }
        if !break_if_stale(store.as_ref(), &key, ttl_secs)? {
            debug!(task_id, "lease held elsewhere");
            return Ok(None);
        }
    }
    Ok(None)
}

/// Remove the entry at `key` only if it is stale at the moment of removal. The check
/// runs inside the store's conditional delete, so a lease taken by someone else in
/// the meantime is never removed.
fn break_if_stale(store: &dyn KeyValueStore, key: &str, ttl_secs: u64) -> Result<bool> {
    let ttl_secs = i64::try_from(ttl_secs)
        .unwrap_or(i64::MAX)
        .min(i64::MAX / 1000);
    let ttl = Duration::seconds(ttl_secs);
    store.remove_if(key, &|current| {
        let entry = current.and_then(|v| serde_json::from_str::<LeaseEntry>(&v.value).ok());
        match entry {
            Some(entry) => {
                let stale = Utc::now().signed_duration_since(entry.acquired_at) > ttl;
                if stale {
                    warn!(lease = %key, holder_pid = entry.pid, "breaking stale task lease");
                }
                stale
            }
            None => {
                warn!(lease = %key, "breaking unreadable task lease");
                true
            }
        }
    })
}
