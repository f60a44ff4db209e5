//! Time-boxed lock derived from the persisted expiry.
//!
//! The lock is never stored as a flag: it is locked exactly when an expiry is
//! persisted, parses, and lies in the future.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::blocklist::BlocklistStore;
use crate::error::{Error, Result};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Snapshot of the lock, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockState {
    pub is_locked: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Parse a persisted expiry.
///
/// Accepts RFC 3339 with any offset, and naive `YYYY-MM-DDTHH:MM:SS[.fff]`
/// timestamps, which are taken as UTC.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Reads and mutates the lock expiry.
#[derive(Clone)]
pub struct LockGate {
    store: BlocklistStore,
    clock: Arc<dyn Clock>,
}

impl LockGate {
    pub fn new(store: BlocklistStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: BlocklistStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Whether enforcement is active right now.
    ///
    /// Side-effect free; absent, unreadable or unparseable expiries all mean
    /// unlocked.
    pub fn is_locked(&self) -> bool {
        self.expires_at()
            .is_some_and(|expiry| expiry > self.clock.now())
    }

    /// The persisted expiry, if any parses.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let raw = match self.store.lock_expiry() {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(error = %err, "failed to read lock expiry");
                return None;
            }
        };
        parse_expiry(&raw)
    }

    pub fn state(&self) -> LockState {
        let expires_at = self.expires_at();
        LockState {
            is_locked: expires_at.is_some_and(|expiry| expiry > self.clock.now()),
            expires_at,
        }
    }

    /// Persist `expiry` verbatim.
    pub fn set_expiry(&self, expiry: &str) -> Result<()> {
        if parse_expiry(expiry).is_none() {
            warn!(expiry, "storing unparseable lock expiry, lock will read as inactive");
        }
        self.store.save_lock_expiry(expiry)
    }

    pub fn set_expiry_at(&self, expiry: DateTime<Utc>) -> Result<()> {
        self.store.save_lock_expiry(&expiry.to_rfc3339())
    }

    pub fn clear_expiry(&self) -> Result<()> {
        self.store.clear_lock_expiry()
    }

    /// Push the expiry `hours` further and persist it.
    ///
    /// Extends from the current expiry when it is still in the future,
    /// otherwise from now.
    pub fn extend(&self, hours: u32) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let base = self
            .expires_at()
            .filter(|expiry| *expiry > now)
            .unwrap_or(now);
        let expiry = base
            .checked_add_signed(TimeDelta::hours(i64::from(hours)))
            .ok_or(Error::LockOutOfRange(hours))?;

        self.set_expiry_at(expiry)?;
        info!(hours, expiry = %expiry.to_rfc3339(), "lock extended");
        Ok(expiry)
    }
}

/// Edge observed by [`LockWatcher::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTransition {
    Unchanged,
    Engaged,
    Expired,
}

/// Periodically samples the lock to drive expiry-based teardown.
pub struct LockWatcher {
    gate: LockGate,
    was_locked: bool,
}

impl LockWatcher {
    pub fn new(gate: LockGate) -> Self {
        let was_locked = gate.is_locked();
        Self { gate, was_locked }
    }

    /// Sample the lock. On expiry the stale timestamp is cleared.
    pub fn tick(&mut self) -> LockTransition {
        let locked = self.gate.is_locked();
        let transition = match (self.was_locked, locked) {
            (true, false) => {
                if let Err(err) = self.gate.clear_expiry() {
                    warn!(error = %err, "failed to clear expired lock");
                }
                LockTransition::Expired
            }
            (false, true) => LockTransition::Engaged,
            _ => LockTransition::Unchanged,
        };
        self.was_locked = locked;
        transition
    }
}
