//! Provider cooldown tracker.
//!
//! Rolling failure window per provider: `allowed_fails` failures within
//! `window_seconds` trigger a quarantine of `cooldown_seconds`. A success
//! clears the counter. The router never selects a cooled provider; when every
//! candidate is cooled the pipeline answers 503.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::clock::now_ms;
use crate::config::CooldownConfig;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CooldownRecord {
    /// Failure timestamps (ms) within the rolling window.
    pub failures: Vec<u64>,
    pub cooled_until_ms: Option<u64>,
}

pub struct CooldownTracker {
    records: Mutex<HashMap<String, CooldownRecord>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record a provider failure. Returns `true` when this failure tripped
    /// the quarantine.
    pub fn record_failure(&self, cfg: &CooldownConfig, provider: &str) -> bool {
        self.record_failure_at(cfg, provider, now_ms())
    }

    fn record_failure_at(&self, cfg: &CooldownConfig, provider: &str, now: u64) -> bool {
        let window_ms = cfg.window_seconds * 1000;
        let mut records = self.records.lock().expect("cooldown mutex poisoned");
        let record = records.entry(provider.to_string()).or_default();

        record.failures.push(now);
        record
            .failures
            .retain(|ts| now.saturating_sub(*ts) < window_ms);

        if record.failures.len() >= cfg.allowed_fails {
            let cooled_until = now + cfg.cooldown_seconds * 1000;
            record.cooled_until_ms = Some(cooled_until);
            tracing::warn!(
                provider = %provider,
                failures = record.failures.len(),
                cooldown_secs = cfg.cooldown_seconds,
                "Provider quarantined"
            );
            return true;
        }
        false
    }

    /// A success clears the failure counter and any active quarantine.
    pub fn record_success(&self, provider: &str) {
        let mut records = self.records.lock().expect("cooldown mutex poisoned");
        if let Some(record) = records.get_mut(provider) {
            record.failures.clear();
            record.cooled_until_ms = None;
        }
    }

    /// Whether the provider is currently quarantined. Expired quarantines
    /// are cleared lazily here.
    pub fn is_cooled(&self, provider: &str) -> bool {
        self.is_cooled_at(provider, now_ms())
    }

    fn is_cooled_at(&self, provider: &str, now: u64) -> bool {
        let mut records = self.records.lock().expect("cooldown mutex poisoned");
        let Some(record) = records.get_mut(provider) else {
            return false;
        };
        match record.cooled_until_ms {
            Some(until) if now < until => true,
            Some(_) => {
                // Quarantine elapsed: reset the window too.
                record.cooled_until_ms = None;
                record.failures.clear();
                false
            }
            None => false,
        }
    }

    /// Remaining quarantine in milliseconds, if any.
    pub fn cooled_for_ms(&self, provider: &str) -> Option<u64> {
        let now = now_ms();
        let records = self.records.lock().expect("cooldown mutex poisoned");
        records
            .get(provider)
            .and_then(|r| r.cooled_until_ms)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Snapshot for the stats endpoints.
    pub fn snapshot(&self) -> HashMap<String, CooldownRecord> {
        self.records
            .lock()
            .expect("cooldown mutex poisoned")
            .clone()
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
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
        /// After `allowed_fails` failures in quick succession, the provider
        /// is unavailable for exactly `cooldown_seconds` from the tripping
        /// failure.
        #[test]
        fn prop_cooldown_fairness(
            allowed_fails in 1usize..6,
            cooldown_seconds in 1u64..600,
            start in 1_000_000u64..2_000_000,
        ) {
            let cfg = CooldownConfig {
                allowed_fails,
                window_seconds: 60,
                cooldown_seconds,
            };
            let tracker = CooldownTracker::new();

            let mut trip_time = start;
            for i in 0..allowed_fails {
                trip_time = start + i as u64;
                tracker.record_failure_at(&cfg, "p", trip_time);
            }

            let cooldown_ms = cooldown_seconds * 1000;
            prop_assert!(tracker.is_cooled_at("p", trip_time));
            prop_assert!(tracker.is_cooled_at("p", trip_time + cooldown_ms - 1));
            prop_assert!(!tracker.is_cooled_at("p", trip_time + cooldown_ms));
        }
    }
}
