//! The Key Space
//!
//! [`Db`] pairs two dictionaries:
//!
//! ```text
//!   data:    key -> value
//!   expires: key -> deadline (integer Value, ms since the UNIX epoch)
//! ```
//!
//! A key is *live* if it is in `data` and either has no deadline or its
//! deadline is still in the future. Expired keys are removed in two ways:
//!
//! - **Lazy expiry**: every keyed read checks the deadline first.
//! - **Active expiry**: the server cron samples the expiry table and
//!   removes what it finds due (see [`Db::active_expire_cycle`]).
//!
//! All methods take the current time explicitly so tests can drive the clock.

use crate::storage::dict::{Dict, DictStats, DictType};
use crate::storage::value::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Milliseconds since the UNIX epoch.
pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Result of a `TTL` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// Milliseconds until the key expires.
    Remaining(i64),
}

/// The in-memory database.
#[derive(Debug)]
pub struct Db {
    data: Dict,
    expires: Dict,
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    pub fn new() -> Self {
        Self {
            data: Dict::new(DictType::STRING_KEYS),
            expires: Dict::new(DictType::STRING_KEYS),
        }
    }

    /// Number of keys in the key space, including expired keys not yet
    /// reclaimed.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of keys with a deadline.
    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    pub fn data_stats(&self) -> DictStats {
        self.data.stats()
    }

    pub fn expires_stats(&self) -> DictStats {
        self.expires.stats()
    }

    /// Deletes `key` if its deadline is at or before `now_ms`. Returns true if
    /// the key was expired.
    pub fn expire_if_needed(&mut self, key: &Value, now_ms: i64) -> bool {
        let Some(when) = self.expires.get(key).and_then(|d| d.as_int()) else {
            return false;
        };
        if when > now_ms {
            return false;
        }
        trace!(key = ?key, when, now_ms, "Lazily expiring key");
        self.delete(key);
        true
    }

    /// Looks up a key for reading, applying lazy expiry first.
    pub fn lookup_read(&mut self, key: &Value, now_ms: i64) -> Option<Value> {
        self.expire_if_needed(key, now_ms);
        self.data.get(key)
    }

    pub fn exists(&mut self, key: &Value, now_ms: i64) -> bool {
        self.expire_if_needed(key, now_ms);
        self.data.contains_key(key)
    }

    /// Stores `val` under `key` and drops any deadline the key had.
    pub fn set(&mut self, key: Value, val: Value) {
        let _ = self.expires.delete(&key);
        self.data.set(key, val);
    }

    /// Records an absolute deadline for `key`.
    pub fn set_expire(&mut self, key: Value, when_ms: i64) {
        self.expires.set(key, Value::from_int(when_ms));
    }

    /// Removes a key from both tables. Returns true if the key had a value.
    pub fn delete(&mut self, key: &Value) -> bool {
        let _ = self.expires.delete(key);
        self.data.delete(key).is_ok()
    }

    /// Drops the deadline of a live key. Returns true if one was removed.
    pub fn persist(&mut self, key: &Value, now_ms: i64) -> bool {
        if !self.exists(key, now_ms) {
            return false;
        }
        self.expires.delete(key).is_ok()
    }

    pub fn ttl(&mut self, key: &Value, now_ms: i64) -> Ttl {
        if !self.exists(key, now_ms) {
            return Ttl::Missing;
        }
        match self.expires.get(key).and_then(|d| d.as_int()) {
            Some(when) => Ttl::Remaining(when - now_ms),
            None => Ttl::Persistent,
        }
    }

    /// Samples up to `samples` keys from the expiry table and removes the ones
    /// that are due. Returns the number of stored keys removed; a deadline
    /// left without a value is dropped but not counted.
    pub fn active_expire_cycle(&mut self, samples: usize, now_ms: i64) -> usize {
        let mut expired = 0;
        for _ in 0..samples {
            let Some(entry) = self.expires.random_entry() else {
                break;
            };
            let when = entry.val().as_int();
            let key = entry.key().clone();

            if when.is_some_and(|when| when <= now_ms) && self.delete(&key) {
                expired += 1;
            }
        }
        expired
    }

    /// Advances incremental rehashing of both tables.
    pub fn rehash(&mut self, steps: usize) {
        self.data.rehash(steps);
        self.expires.rehash(steps);
    }
}
