//! Persisted enforcement state.
//!
//! The blocked domain list, the blocked package list and the lock expiry live
//! in an opaque [`KeyValueStore`]. Lists are stored as JSON arrays of strings;
//! the expiry as a timestamp string.

mod domains;
mod store;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

pub use domains::DomainListParser;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};

use crate::error::{Result, StoreError};

pub const KEY_DOMAINS: &str = "blocked_domains";
pub const KEY_BLOCKED_APPS: &str = "blocked_apps";
pub const KEY_LOCK_EXPIRY: &str = "lock_expiry";

/// Typed access to the persisted blocklists and lock expiry.
#[derive(Clone)]
pub struct BlocklistStore {
    store: Arc<dyn KeyValueStore>,
}

impl BlocklistStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Store backed by memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn save_domains<S: AsRef<str>>(&self, domains: &[S]) -> Result<()> {
        self.save_list(KEY_DOMAINS, domains)
    }

    /// Blocked domains, lowercased. Missing or unreadable lists are empty.
    pub fn domains(&self) -> Result<HashSet<String>> {
        Ok(self
            .load_list(KEY_DOMAINS)?
            .into_iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect())
    }

    pub fn clear_domains(&self) -> Result<()> {
        self.store.remove(KEY_DOMAINS)
    }

    pub fn save_blocked_apps<S: AsRef<str>>(&self, packages: &[S]) -> Result<()> {
        self.save_list(KEY_BLOCKED_APPS, packages)
    }

    /// Blocked application identifiers, as stored.
    pub fn blocked_apps(&self) -> Result<HashSet<String>> {
        Ok(self.load_list(KEY_BLOCKED_APPS)?.into_iter().collect())
    }

    pub fn clear_blocked_apps(&self) -> Result<()> {
        self.store.remove(KEY_BLOCKED_APPS)
    }

    pub fn save_lock_expiry(&self, expiry: &str) -> Result<()> {
        self.store.set(KEY_LOCK_EXPIRY, expiry)
    }

    pub fn lock_expiry(&self) -> Result<Option<String>> {
        self.store.get(KEY_LOCK_EXPIRY)
    }

    pub fn clear_lock_expiry(&self) -> Result<()> {
        self.store.remove(KEY_LOCK_EXPIRY)
    }

    fn save_list<S: AsRef<str>>(&self, key: &str, items: &[S]) -> Result<()> {
        let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
        let json = serde_json::to_string(&items).map_err(StoreError::Encode)?;
        self.store.set(key, &json)
    }

    fn load_list(&self, key: &str) -> Result<Vec<String>> {
        let Some(json) = self.store.get(key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<String>>(&json) {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(key, error = %err, "ignoring unreadable list");
                Ok(Vec::new())
            }
        }
    }
}
