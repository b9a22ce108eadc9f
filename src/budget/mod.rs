//! Budget manager.
//!
//! Rolling daily and hourly spend windows with an in-memory fast path and a
//! durable write-behind log. `check_budget` touches only the in-memory cache
//! and the config (no I/O); `record_spend` updates the cache synchronously
//! and queues the record for the flusher, so the in-memory view leads and
//! never lags the durable log.

pub mod flush;

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::clock::now_ms;
use crate::config::{BreachAction, BudgetConfig};
use crate::db::Database;

pub use self::flush::spawn_spend_flusher;

// ---------------------------------------------------------------------------
// Records and results
// ---------------------------------------------------------------------------

/// One spend event. Append-only; never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct SpendRecord {
    pub amount_usd: f64,
    pub model: String,
    /// `YYYY-MM-DD`, UTC.
    pub daily_window: String,
    /// `YYYY-MM-DDTHH`, UTC.
    pub hourly_window: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreachType {
    None,
    Daily,
    Hourly,
    PerRequest,
}

/// Result of the fast-path check.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub breached: bool,
    pub breach_type: BreachType,
    pub action: BreachAction,
    pub current_daily_spend: f64,
    pub current_hourly_spend: f64,
    /// Thresholds newly met this window, ascending. The caller marks each
    /// one fired to suppress re-emission.
    pub thresholds_crossed: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Window keys
// ---------------------------------------------------------------------------

fn window_keys() -> (String, String) {
    let now = Utc::now();
    (
        now.format("%Y-%m-%d").to_string(),
        now.format("%Y-%m-%dT%H").to_string(),
    )
}

// ---------------------------------------------------------------------------
// BudgetManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SpendCache {
    daily_key: String,
    hourly_key: String,
    daily_spend: f64,
    hourly_spend: f64,
    /// Thresholds already emitted within the current daily window.
    fired: HashSet<u8>,
}

pub struct BudgetManager {
    cache: Mutex<SpendCache>,
    tx: mpsc::UnboundedSender<SpendRecord>,
    db: Option<Database>,
}

impl BudgetManager {
    /// Build the manager and hand back the receiver side of the write-behind
    /// queue for [`spawn_spend_flusher`].
    pub fn new(db: Option<Database>) -> (Self, mpsc::UnboundedReceiver<SpendRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            cache: Mutex::new(SpendCache::default()),
            tx,
            db,
        };
        (manager, rx)
    }

    /// Fast-path check. Memory-only; must stay well under 5 ms.
    pub fn check_budget(&self, cfg: &BudgetConfig, estimated_cost: Option<f64>) -> BudgetCheck {
        let mut cache = self.cache.lock().expect("spend cache mutex poisoned");
        self.ensure_windows(&mut cache);

        let daily = cache.daily_spend;
        let hourly = cache.hourly_spend;

        let mut check = BudgetCheck {
            allowed: true,
            breached: false,
            breach_type: BreachType::None,
            action: cfg.on_breach,
            current_daily_spend: daily,
            current_hourly_spend: hourly,
            thresholds_crossed: Vec::new(),
        };

        if !cfg.enabled {
            return check;
        }

        // Per-request estimate is checked first.
        if let (Some(estimate), Some(limit)) = (estimated_cost, cfg.per_request_usd) {
            if estimate > limit {
                check.breached = true;
                check.breach_type = BreachType::PerRequest;
            }
        }
        if !check.breached {
            if let Some(limit) = cfg.daily_usd {
                if limit > 0.0 && daily >= limit {
                    check.breached = true;
                    check.breach_type = BreachType::Daily;
                }
            }
        }
        if !check.breached {
            if let Some(limit) = cfg.hourly_usd {
                if limit > 0.0 && hourly >= limit {
                    check.breached = true;
                    check.breach_type = BreachType::Hourly;
                }
            }
        }

        if check.breached && cfg.on_breach == BreachAction::Block {
            check.allowed = false;
        }

        // Daily-utilization thresholds, each reported once per window.
        if let Some(limit) = cfg.daily_usd {
            if limit > 0.0 {
                let pct = daily / limit * 100.0;
                for threshold in &cfg.thresholds {
                    if pct >= f64::from(*threshold) && !cache.fired.contains(threshold) {
                        check.thresholds_crossed.push(*threshold);
                    }
                }
            }
        }

        check
    }

    /// Record spend: synchronous cache update plus a queued durable write.
    pub fn record_spend(&self, amount_usd: f64, model: &str) {
        let (daily_window, hourly_window) = {
            let mut cache = self.cache.lock().expect("spend cache mutex poisoned");
            self.ensure_windows(&mut cache);
            cache.daily_spend += amount_usd;
            cache.hourly_spend += amount_usd;
            (cache.daily_key.clone(), cache.hourly_key.clone())
        };

        let record = SpendRecord {
            amount_usd,
            model: model.to_string(),
            daily_window,
            hourly_window,
            timestamp_ms: now_ms(),
        };
        // The flusher may already be gone during shutdown; dropping the
        // record then is fine, the cache was updated first.
        let _ = self.tx.send(record);
    }

    /// Suppress further emission of `threshold` in the current daily window.
    pub fn mark_threshold_fired(&self, threshold: u8) {
        let mut cache = self.cache.lock().expect("spend cache mutex poisoned");
        self.ensure_windows(&mut cache);
        cache.fired.insert(threshold);
    }

    /// Daily budget utilization in percent (0 when no daily limit is set).
    pub fn utilization_percent(&self, cfg: &BudgetConfig) -> f64 {
        let Some(limit) = cfg.daily_usd.filter(|l| *l > 0.0) else {
            return 0.0;
        };
        let mut cache = self.cache.lock().expect("spend cache mutex poisoned");
        self.ensure_windows(&mut cache);
        cache.daily_spend / limit * 100.0
    }

    /// Drop all in-memory and durable spend state (explicit reset only).
    pub fn reset(&self) {
        {
            let mut cache = self.cache.lock().expect("spend cache mutex poisoned");
            *cache = SpendCache::default();
        }
        if let Some(ref db) = self.db {
            let _ = db.with_conn(|conn| {
                conn.execute("DELETE FROM spend_log", [])?;
                Ok(())
            });
        }
    }

    /// Recompute window keys; on rollover, reload the cached sums from the
    /// durable log (when available) and clear the fired-thresholds set for a
    /// new daily window.
    fn ensure_windows(&self, cache: &mut SpendCache) {
        let (daily_key, hourly_key) = window_keys();

        if cache.daily_key != daily_key {
            cache.daily_key = daily_key.clone();
            cache.daily_spend = self.durable_sum("daily_window", &daily_key);
            cache.fired.clear();
        }
        if cache.hourly_key != hourly_key {
            cache.hourly_key = hourly_key.clone();
            cache.hourly_spend = self.durable_sum("hourly_window", &hourly_key);
        }
    }

    fn durable_sum(&self, column: &str, key: &str) -> f64 {
        let Some(ref db) = self.db else {
            return 0.0;
        };
        db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT COALESCE(SUM(amount_usd), 0.0) FROM spend_log WHERE {column} = ?1"),
                params![key],
                |row| row.get(0),
            )
        })
        .unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A sequence of record_spend calls sums exactly (modulo window
        /// rollover, which cannot occur inside a single fast test).
        #[test]
        fn prop_spend_is_monotonic_sum(amounts in prop::collection::vec(0.0f64..5.0, 1..30)) {
            let (manager, _rx) = BudgetManager::new(None);
            let cfg = BudgetConfig {
                enabled: true,
                daily_usd: Some(1_000_000.0),
                ..BudgetConfig::default()
            };

            let mut expected = 0.0;
            let mut last = 0.0;
            for amount in &amounts {
                manager.record_spend(*amount, "claude-sonnet-4-6");
                expected += amount;
                let seen = manager.check_budget(&cfg, None).current_daily_spend;
                // Never lags what was recorded so far.
                prop_assert!(seen >= last);
                prop_assert!((seen - expected).abs() < 1e-6);
                last = seen;
            }
        }
    }
}
