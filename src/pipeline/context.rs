//! Per-request trace accumulation and the run log.
//!
//! Every completed request leaves a [`RequestTrace`] in a bounded ring that
//! backs `/runs`, `/stats` and the savings view.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::cache::CacheStatus;

/// Ring capacity for completed request traces.
const RUN_LOG_SIZE: usize = 100;

/// Summary of one completed request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    pub request_id: String,
    pub timestamp_ms: u64,
    pub original_model: String,
    pub routed_model: String,
    pub mode: String,
    pub cache: CacheStatus,
    pub downgraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downgrade_reason: Option<String>,
    pub escalations: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub status: u16,
}

/// Lifetime counters (not bounded by the ring).
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunTotals {
    pub total_requests: u64,
    pub total_cost_usd: f64,
    pub cache_hits: u64,
    pub downgrades: u64,
    pub escalations: u64,
    pub total_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub total_requests: u64,
    pub total_cost_usd: f64,
    pub cache_hits: u64,
    pub downgrades: u64,
    pub escalations: u64,
    pub avg_latency_ms: u64,
}

pub struct RunLog {
    ring: Mutex<VecDeque<RequestTrace>>,
    totals: Mutex<RunTotals>,
}

impl RunLog {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RUN_LOG_SIZE)),
            totals: Mutex::new(RunTotals::default()),
        }
    }

    pub fn record(&self, trace: RequestTrace) {
        {
            let mut totals = self.totals.lock().expect("run totals mutex poisoned");
            totals.total_requests += 1;
            totals.total_cost_usd += trace.cost_usd;
            totals.total_latency_ms += trace.latency_ms;
            if trace.cache == CacheStatus::Hit {
                totals.cache_hits += 1;
            }
            if trace.downgraded {
                totals.downgrades += 1;
            }
            totals.escalations += u64::from(trace.escalations);
        }

        let mut ring = self.ring.lock().expect("run log mutex poisoned");
        ring.push_back(trace);
        while ring.len() > RUN_LOG_SIZE {
            ring.pop_front();
        }
    }

    /// Most recent traces, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RequestTrace> {
        let ring = self.ring.lock().expect("run log mutex poisoned");
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> RunStats {
        let totals = self.totals.lock().expect("run totals mutex poisoned");
        RunStats {
            total_requests: totals.total_requests,
            total_cost_usd: totals.total_cost_usd,
            cache_hits: totals.cache_hits,
            downgrades: totals.downgrades,
            escalations: totals.escalations,
            avg_latency_ms: if totals.total_requests == 0 {
                0
            } else {
                totals.total_latency_ms / totals.total_requests
            },
        }
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(cost: f64, cache: CacheStatus) -> RequestTrace {
        RequestTrace {
            request_id: "r1".to_string(),
            timestamp_ms: 0,
            original_model: "claude-opus-4-6".to_string(),
            routed_model: "claude-sonnet-4-6".to_string(),
            mode: "passthrough".to_string(),
            cache,
            downgraded: false,
            downgrade_reason: None,
            escalations: 0,
            tokens_in: 100,
            tokens_out: 20,
            cost_usd: cost,
            latency_ms: 50,
            status: 200,
        }
    }

    #[test]
    fn test_record_and_recent() {
        let log = RunLog::new();
        log.record(trace(0.01, CacheStatus::Miss));
        log.record(trace(0.02, CacheStatus::Hit));

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        // Newest first.
        assert!((recent[0].cost_usd - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_ring_bounded_to_100() {
        let log = RunLog::new();
        for _ in 0..250 {
            log.record(trace(0.0, CacheStatus::Miss));
        }
        assert_eq!(log.recent(1000).len(), RUN_LOG_SIZE);
        // Totals keep counting past the ring.
        assert_eq!(log.stats().total_requests, 250);
    }

    #[test]
    fn test_stats_aggregation() {
        let log = RunLog::new();
        log.record(trace(0.5, CacheStatus::Miss));
        log.record(trace(0.0, CacheStatus::Hit));

        let stats = log.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
        assert!((stats.total_cost_usd - 0.5).abs() < 1e-9);
        assert_eq!(stats.avg_latency_ms, 50);
    }
}
