//! Process-wide API key partition: valid keys vs blocked keys.
//!
//! Readers on request-handling threads take snapshot copies; the inbound
//! dispatcher is the single writer. A key is in at most one of the two
//! sets, and moves between them atomically under one write lock.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tallyproto::{mask_api_key, KeyStatus};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Partition {
    valid: HashSet<String>,
    /// Block reason keyed by blocked key; empty string when the broker
    /// sent none.
    blocked: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct KeyStore {
    partition: RwLock<Partition>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently permitted. Keys never seen in an update
    /// fail closed.
    pub fn is_valid(&self, key: &str) -> bool {
        self.partition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .valid
            .contains(key)
    }

    /// Snapshot of the valid set; the caller may mutate it freely.
    pub fn valid_keys(&self) -> HashSet<String> {
        self.partition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .valid
            .clone()
    }

    /// Snapshot of the blocked set.
    pub fn blocked_keys(&self) -> HashSet<String> {
        self.partition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocked
            .keys()
            .cloned()
            .collect()
    }

    /// The recorded reason for a blocked key, if it is blocked.
    pub fn blocked_reason(&self, key: &str) -> Option<String> {
        self.partition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blocked
            .get(key)
            .cloned()
    }

    /// Apply one broker-pushed status change. The sole mutator.
    pub fn apply_update(&self, key: &str, status: KeyStatus, reason: &str) {
        match status {
            KeyStatus::Blocked => {
                let mut partition = self
                    .partition
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                partition.valid.remove(key);
                partition.blocked.insert(key.to_string(), reason.to_string());
                drop(partition);
                warn!("API key blocked: {} (reason: {})", mask_api_key(key), reason);
            }
            KeyStatus::Ok => {
                let mut partition = self
                    .partition
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                partition.blocked.remove(key);
                partition.valid.insert(key.to_string());
                drop(partition);
                info!("API key allowed: {}", mask_api_key(key));
            }
            KeyStatus::Unknown => {
                warn!(
                    "ignoring key update with unrecognized status for {}",
                    mask_api_key(key)
                );
            }
        }
    }
}
