//! Anomaly detector.
//!
//! A bounded ring of the last 100 completed request traces, analyzed on every
//! record. Four independent detectors run over the configured window; their
//! findings are aggregated and handed to the alert manager by the pipeline.
//! The ring is the sole shared state and mutates only in
//! [`AnomalyDetector::record_and_analyze`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::json;

use crate::alerts::Severity;
use crate::config::AnomalyConfig;

/// Ring capacity; oldest entries drop first.
const TRACE_RING_SIZE: usize = 100;

/// Minute buckets kept for the velocity baseline.
const BASELINE_BUCKETS: usize = 60;

/// Baseline comparisons only engage once this many buckets exist.
const MIN_BASELINE_BUCKETS: usize = 5;

/// Velocity flags when the current rate exceeds baseline by this factor.
const VELOCITY_BASELINE_FACTOR: f64 = 10.0;

/// A completed request summary.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub timestamp_ms: u64,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TokenExplosion,
    VelocitySpike,
    Repetition,
    CostAcceleration,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenExplosion => "token_explosion",
            Self::VelocitySpike => "velocity_spike",
            Self::Repetition => "repetition",
            Self::CostAcceleration => "cost_acceleration",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub message: String,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RingState {
    entries: VecDeque<TraceEntry>,
    /// (minute timestamp, request count) pairs, newest last.
    minute_buckets: VecDeque<(u64, u64)>,
    /// Kinds flagged by the most recent analysis, for the pipeline's
    /// read-only precheck.
    last_flagged: Vec<AnomalyKind>,
}

pub struct AnomalyDetector {
    ring: Mutex<RingState>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(RingState::default()),
        }
    }

    /// Kinds flagged by the most recent analysis. Read-only.
    pub fn active(&self) -> Vec<AnomalyKind> {
        self.ring
            .lock()
            .expect("trace ring mutex poisoned")
            .last_flagged
            .clone()
    }

    /// Number of traces currently held (<= 100).
    pub fn trace_count(&self) -> usize {
        self.ring
            .lock()
            .expect("trace ring mutex poisoned")
            .entries
            .len()
    }

    /// Record a completed request and run all detectors over the in-window
    /// subset of the ring.
    pub fn record_and_analyze(&self, cfg: &AnomalyConfig, entry: TraceEntry) -> Vec<Anomaly> {
        let mut ring = self.ring.lock().expect("trace ring mutex poisoned");
        let now = entry.timestamp_ms;

        // Maintain the baseline minute buckets.
        let minute = now / 60_000;
        let same_bucket = matches!(ring.minute_buckets.back(), Some((m, _)) if *m == minute);
        if same_bucket {
            if let Some((_, count)) = ring.minute_buckets.back_mut() {
                *count += 1;
            }
        } else {
            ring.minute_buckets.push_back((minute, 1));
            while ring.minute_buckets.len() > BASELINE_BUCKETS {
                ring.minute_buckets.pop_front();
            }
        }

        ring.entries.push_back(entry.clone());
        while ring.entries.len() > TRACE_RING_SIZE {
            ring.entries.pop_front();
        }

        let window_start = now.saturating_sub(cfg.window_secs * 1000);
        let in_window: Vec<&TraceEntry> = ring
            .entries
            .iter()
            .filter(|e| e.timestamp_ms >= window_start)
            .collect();

        let mut anomalies = Vec::new();
        if let Some(a) = detect_token_explosion(cfg, &entry) {
            anomalies.push(a);
        }
        if let Some(a) = detect_velocity_spike(cfg, &in_window, &ring.minute_buckets) {
            anomalies.push(a);
        }
        if let Some(a) = detect_repetition(cfg, &in_window) {
            anomalies.push(a);
        }
        if let Some(a) = detect_cost_acceleration(&in_window) {
            anomalies.push(a);
        }

        ring.last_flagged = anomalies.iter().map(|a| a.kind).collect();
        anomalies
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Individual detectors
// ---------------------------------------------------------------------------

/// A single request whose cost alone exceeds the configured ceiling.
fn detect_token_explosion(cfg: &AnomalyConfig, entry: &TraceEntry) -> Option<Anomaly> {
    if entry.cost_usd <= cfg.token_explosion_usd {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::TokenExplosion,
        severity: Severity::Critical,
        message: format!(
            "single request on {} cost ${:.2} (limit ${:.2})",
            entry.model, entry.cost_usd, cfg.token_explosion_usd
        ),
        data: json!({
            "model": entry.model,
            "cost_usd": entry.cost_usd,
            "tokens_in": entry.tokens_in,
            "tokens_out": entry.tokens_out,
        }),
    })
}

/// Too many requests in the window, absolutely or relative to the
/// minute-bucket baseline.
fn detect_velocity_spike(
    cfg: &AnomalyConfig,
    in_window: &[&TraceEntry],
    minute_buckets: &VecDeque<(u64, u64)>,
) -> Option<Anomaly> {
    let count = in_window.len();
    let window_minutes = (cfg.window_secs as f64 / 60.0).max(1.0 / 60.0);
    let current_rate = count as f64 / window_minutes;

    let baseline = (minute_buckets.len() >= MIN_BASELINE_BUCKETS).then(|| {
        let total: u64 = minute_buckets.iter().map(|(_, c)| c).sum();
        total as f64 / minute_buckets.len() as f64
    });

    let absolute_trip = count >= cfg.velocity_threshold;
    let baseline_trip = baseline
        .is_some_and(|b| b > 0.0 && current_rate > VELOCITY_BASELINE_FACTOR * b);

    if !absolute_trip && !baseline_trip {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::VelocitySpike,
        severity: Severity::Warning,
        message: format!(
            "{count} requests in the last {}s ({current_rate:.1}/min)",
            cfg.window_secs
        ),
        data: json!({
            "count": count,
            "rate_per_min": current_rate,
            "baseline_per_min": baseline,
        }),
    })
}

/// Repeated near-identical requests: bucketed by model and total tokens
/// rounded to the nearest 100. The classic runaway-agent-loop signature.
fn detect_repetition(cfg: &AnomalyConfig, in_window: &[&TraceEntry]) -> Option<Anomaly> {
    let mut buckets: HashMap<(&str, u64), usize> = HashMap::new();
    for entry in in_window {
        let rounded = ((entry.tokens_in + entry.tokens_out) + 50) / 100 * 100;
        *buckets.entry((entry.model.as_str(), rounded)).or_insert(0) += 1;
    }

    let ((model, tokens), count) = buckets
        .into_iter()
        .max_by_key(|(_, count)| *count)?;
    if count < cfg.repetition_threshold {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::Repetition,
        severity: Severity::Critical,
        message: format!(
            "{count} near-identical requests on {model} (~{tokens} tokens each), possible agent loop"
        ),
        data: json!({
            "model": model,
            "rounded_tokens": tokens,
            "count": count,
        }),
    })
}

/// Spend accelerating within the window: the second half's time-normalized
/// cost rate more than doubles the first half's, with material spend.
fn detect_cost_acceleration(in_window: &[&TraceEntry]) -> Option<Anomaly> {
    if in_window.len() < 10 {
        return None;
    }
    let mid = in_window.len() / 2;
    let (first, second) = in_window.split_at(mid);

    let span_ms = |entries: &[&TraceEntry]| -> f64 {
        let start = entries.first().map_or(0, |e| e.timestamp_ms);
        let end = entries.last().map_or(0, |e| e.timestamp_ms);
        (end.saturating_sub(start)).max(1) as f64
    };
    let cost = |entries: &[&TraceEntry]| -> f64 { entries.iter().map(|e| e.cost_usd).sum() };

    let first_cost = cost(first);
    let second_cost = cost(second);
    let first_rate = first_cost / span_ms(first);
    let second_rate = second_cost / span_ms(second);

    if second_rate <= 2.0 * first_rate || second_cost <= 1.0 {
        return None;
    }
    Some(Anomaly {
        kind: AnomalyKind::CostAcceleration,
        severity: Severity::Warning,
        message: format!(
            "spend rate more than doubled within the window (${first_cost:.2} -> ${second_cost:.2})"
        ),
        data: json!({
            "first_half_cost_usd": first_cost,
            "second_half_cost_usd": second_cost,
        }),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::now_ms;

    fn entry(ts: u64, model: &str, tokens_in: u64, tokens_out: u64, cost: f64) -> TraceEntry {
        TraceEntry {
            timestamp_ms: ts,
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cost_usd: cost,
        }
    }

    fn base() -> u64 {
        now_ms()
    }

    #[test]
    fn test_ring_never_exceeds_capacity() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig::default();
        let start = base();
        for i in 0..250 {
            detector.record_and_analyze(&cfg, entry(start + i, "m", 10, 10, 0.001));
            assert!(detector.trace_count() <= TRACE_RING_SIZE);
        }
        assert_eq!(detector.trace_count(), TRACE_RING_SIZE);
    }

    #[test]
    fn test_token_explosion() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig::default(); // $5 ceiling
        let anomalies =
            detector.record_and_analyze(&cfg, entry(base(), "claude-opus-4-6", 900_000, 50_000, 9.5));
        let explosion = anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::TokenExplosion)
            .expect("token explosion expected");
        assert_eq!(explosion.severity, Severity::Critical);
    }

    #[test]
    fn test_no_token_explosion_below_threshold() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig::default();
        let anomalies = detector.record_and_analyze(&cfg, entry(base(), "m", 100, 10, 0.01));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_repetition_fires_at_threshold() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig {
            // Keep velocity out of the way so only repetition fires.
            velocity_threshold: 1000,
            ..AnomalyConfig::default()
        };
        let start = base();

        let mut last = Vec::new();
        for i in 0..20 {
            last = detector.record_and_analyze(&cfg, entry(start + i * 100, "x", 1050, 50, 0.001));
        }
        let repetition = last
            .iter()
            .find(|a| a.kind == AnomalyKind::Repetition)
            .expect("repetition expected on the 20th record");
        assert_eq!(repetition.severity, Severity::Critical);
        assert_eq!(repetition.data["count"], 20);

        // 19 identical requests were not enough.
        let detector2 = AnomalyDetector::new();
        let mut result = Vec::new();
        for i in 0..19 {
            result = detector2.record_and_analyze(&cfg, entry(start + i * 100, "x", 1050, 50, 0.001));
        }
        assert!(result.iter().all(|a| a.kind != AnomalyKind::Repetition));
    }

    #[test]
    fn test_repetition_buckets_by_rounded_tokens() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig {
            repetition_threshold: 5,
            velocity_threshold: 1000,
            ..AnomalyConfig::default()
        };
        let start = base();

        // 1040+50 and 1060+40 both round to 1100 total tokens.
        let mut last = Vec::new();
        for i in 0..5 {
            let (tin, tout) = if i % 2 == 0 { (1040, 50) } else { (1060, 40) };
            last = detector.record_and_analyze(&cfg, entry(start + i, "x", tin, tout, 0.001));
        }
        assert!(last.iter().any(|a| a.kind == AnomalyKind::Repetition));
    }

    #[test]
    fn test_velocity_spike_absolute() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig {
            velocity_threshold: 10,
            repetition_threshold: 1000,
            ..AnomalyConfig::default()
        };
        let start = base();

        let mut last = Vec::new();
        for i in 0..10 {
            // Distinct token counts so repetition stays quiet.
            last = detector.record_and_analyze(
                &cfg,
                entry(start + i * 10, "m", 1000 * (i + 1), 10, 0.001),
            );
        }
        let spike = last
            .iter()
            .find(|a| a.kind == AnomalyKind::VelocitySpike)
            .expect("velocity spike expected");
        assert_eq!(spike.severity, Severity::Warning);
    }

    #[test]
    fn test_cost_acceleration() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig {
            velocity_threshold: 1000,
            repetition_threshold: 1000,
            token_explosion_usd: 100.0,
            ..AnomalyConfig::default()
        };
        let start = base();

        // First half cheap over a long span, second half expensive and fast.
        let mut last = Vec::new();
        for i in 0..6u64 {
            last = detector.record_and_analyze(
                &cfg,
                entry(start + i * 10_000, "m", 100 + i, 10, 0.01),
            );
        }
        for i in 0..6u64 {
            last = detector.record_and_analyze(
                &cfg,
                entry(start + 60_000 + i * 500, "m", 5000 + i, 500, 0.40),
            );
        }
        let accel = last
            .iter()
            .find(|a| a.kind == AnomalyKind::CostAcceleration)
            .expect("cost acceleration expected");
        assert_eq!(accel.severity, Severity::Warning);
    }

    #[test]
    fn test_active_reflects_last_analysis() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig::default();
        assert!(detector.active().is_empty());

        detector.record_and_analyze(&cfg, entry(base(), "m", 0, 0, 50.0));
        assert!(detector.active().contains(&AnomalyKind::TokenExplosion));

        detector.record_and_analyze(&cfg, entry(base(), "m", 10, 10, 0.001));
        assert!(!detector.active().contains(&AnomalyKind::TokenExplosion));
    }

    #[test]
    fn test_entries_outside_window_ignored() {
        let detector = AnomalyDetector::new();
        let cfg = AnomalyConfig {
            repetition_threshold: 5,
            velocity_threshold: 1000,
            window_secs: 300,
            ..AnomalyConfig::default()
        };
        let start = base();

        // Four identical old entries, well outside the window of the fifth.
        for i in 0..4 {
            detector.record_and_analyze(&cfg, entry(start + i, "x", 1050, 50, 0.001));
        }
        let result = detector.record_and_analyze(
            &cfg,
            entry(start + 10 * 60 * 1000, "x", 1050, 50, 0.001),
        );
        assert!(result.iter().all(|a| a.kind != AnomalyKind::Repetition));
    }
}
