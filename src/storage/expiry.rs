//! Active Expiry Cycle
//!
//! Lazy expiry (checking on access) never reclaims a key that is not read
//! again. The server therefore runs a periodic cron on the event loop that
//! samples the expiry table and deletes keys whose deadline has passed.
//!
//! ## Design
//!
//! The cron is a repeating reactor timer (default: every 100ms). Each run:
//! 1. Draws up to `samples_per_cycle` random entries from the expiry table
//! 2. Deletes every sampled key that is due, from both tables
//! 3. Advances incremental rehashing of both tables by `rehash_steps`
//! 4. Logs what it did
//!
//! Sampling bounds the work per tick regardless of how many keys have a
//! deadline.

use crate::storage::db::Db;
use std::time::Duration;
use tracing::{debug, trace};

/// Configuration for the expiry cron.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval between cron runs (default: 100ms)
    pub interval: Duration,

    /// Random draws from the expiry table per run (default: 100)
    pub samples_per_cycle: usize,

    /// Rehash steps applied to each table per run (default: 100)
    pub rehash_steps: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            samples_per_cycle: 100,
            rehash_steps: 100,
        }
    }
}

/// What a single cron run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub expired: usize,
    pub keys_remaining: usize,
}

/// Runs one cron cycle against `db`.
pub fn run_cycle(db: &mut Db, config: &ExpiryConfig, now_ms: i64) -> CycleReport {
    let expired = db.active_expire_cycle(config.samples_per_cycle, now_ms);
    db.rehash(config.rehash_steps);

    let report = CycleReport {
        expired,
        keys_remaining: db.len(),
    };

    if expired > 0 {
        debug!(
            expired = report.expired,
            keys_remaining = report.keys_remaining,
            "Expired keys cleaned up"
        );
    } else {
        trace!(keys = report.keys_remaining, "Expiry cycle found nothing due");
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::Value;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_default_config() {
        let config = ExpiryConfig::default();
        assert_eq!(config.interval, Duration::from_millis(100));
        assert_eq!(config.samples_per_cycle, 100);
        assert_eq!(config.rehash_steps, 100);
    }

    #[test]
    fn test_cycle_cleans_expired_keys() {
        let mut db = Db::new();
        for i in 0..10 {
            let k = Value::from(format!("key{}", i).as_str());
            db.set(k.clone(), Value::from("value"));
            db.set_expire(k, NOW - 50);
        }
        db.set(Value::from("persistent"), Value::from("value"));
        assert_eq!(db.len(), 11);

        let config = ExpiryConfig::default();
        let mut expired = 0;
        for _ in 0..20 {
            expired += run_cycle(&mut db, &config, NOW).expired;
        }

        assert_eq!(expired, 10);
        assert_eq!(db.len(), 1);
        assert!(db.exists(&Value::from("persistent"), NOW));
    }

    #[test]
    fn test_cycle_leaves_future_deadlines() {
        let mut db = Db::new();
        db.set(Value::from("k"), Value::from("v"));
        db.set_expire(Value::from("k"), NOW + 1_000);

        let report = run_cycle(&mut db, &ExpiryConfig::default(), NOW);
        assert_eq!(report, CycleReport { expired: 0, keys_remaining: 1 });
        assert_eq!(db.expires_len(), 1);
    }

    #[test]
    fn test_cycle_finishes_rehash() {
        let mut db = Db::new();
        // Enough keys to push the initial table past its load factor.
        for i in 0..25 {
            db.set(Value::from(format!("key{}", i).as_str()), Value::from("v"));
        }
        assert!(db.data_stats().rehash_index.is_some());

        run_cycle(&mut db, &ExpiryConfig::default(), NOW);
        assert!(db.data_stats().rehash_index.is_none());
        assert_eq!(db.len(), 25);
    }
}
