//! Alert manager.
//!
//! Three fire paths (threshold, anomaly, breach), each deduplicated by key
//! within a cooldown window. Alerts go to the durable store when one is
//! available, else to a bounded in-memory ring. Webhook delivery is
//! fire-and-forget: the POST happens off-lock in a spawned task and its
//! outcome never affects the caller.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::anomaly::Anomaly;
use crate::budget::BreachType;
use crate::clock::now_ms;
use crate::config::AlertConfig;
use crate::db::Database;

/// Webhook POST timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Threshold,
    Anomaly,
    Breach,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Anomaly => "anomaly",
            Self::Breach => "breach",
        }
    }
}

/// An emitted alert. Immutable after creation except the `delivered` flag,
/// which the webhook task flips best-effort.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp_ms: u64,
    pub data: serde_json::Value,
    pub delivered: bool,
}

// ---------------------------------------------------------------------------
// AlertManager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AlertState {
    /// Dedup key -> last fire time (ms).
    last_fired: HashMap<String, u64>,
    /// In-memory history, newest last. Used alongside or instead of the
    /// durable store.
    ring: VecDeque<Alert>,
}

pub struct AlertManager {
    /// Shared with spawned delivery tasks for the best-effort `delivered`
    /// flip.
    state: Arc<Mutex<AlertState>>,
    db: Option<Database>,
    http: reqwest::Client,
}

impl AlertManager {
    pub fn new(db: Option<Database>) -> Self {
        Self {
            state: Arc::new(Mutex::new(AlertState::default())),
            db,
            http: reqwest::Client::new(),
        }
    }

    // -- fire operations -----------------------------------------------------

    /// Budget threshold crossed (e.g. 80% of the daily limit).
    pub fn fire_threshold(
        &self,
        cfg: &AlertConfig,
        percent: u8,
        daily_spend: f64,
        daily_limit: f64,
    ) -> Option<Alert> {
        self.fire(
            cfg,
            format!("threshold:{percent}"),
            AlertKind::Threshold,
            if percent >= 95 {
                Severity::Critical
            } else {
                Severity::Warning
            },
            format!("daily budget {percent}% reached (${daily_spend:.2} of ${daily_limit:.2})"),
            json!({
                "percent": percent,
                "daily_spend_usd": daily_spend,
                "daily_limit_usd": daily_limit,
            }),
        )
    }

    /// An anomaly reported by the detector.
    pub fn fire_anomaly(&self, cfg: &AlertConfig, anomaly: &Anomaly) -> Option<Alert> {
        self.fire(
            cfg,
            format!("anomaly:{}", anomaly.kind.as_str()),
            AlertKind::Anomaly,
            anomaly.severity,
            anomaly.message.clone(),
            anomaly.data.clone(),
        )
    }

    /// A budget breach (daily, hourly, or per-request).
    pub fn fire_breach(
        &self,
        cfg: &AlertConfig,
        breach: BreachType,
        daily_spend: f64,
    ) -> Option<Alert> {
        let breach_name = match breach {
            BreachType::None => return None,
            BreachType::Daily => "daily",
            BreachType::Hourly => "hourly",
            BreachType::PerRequest => "per-request",
        };
        self.fire(
            cfg,
            format!("breach:{breach_name}"),
            AlertKind::Breach,
            Severity::Critical,
            format!("{breach_name} budget breached (daily spend ${daily_spend:.2})"),
            json!({
                "breach_type": breach_name,
                "daily_spend_usd": daily_spend,
            }),
        )
    }

    /// Dedup, allocate, store, then deliver asynchronously. Returns `None`
    /// with no side effects when the key fired within the cooldown window.
    fn fire(
        &self,
        cfg: &AlertConfig,
        dedup_key: String,
        kind: AlertKind,
        severity: Severity,
        message: String,
        data: serde_json::Value,
    ) -> Option<Alert> {
        let now = now_ms();
        let cooldown_ms = cfg.cooldown_secs * 1000;

        let alert = {
            let mut state = self.state.lock().expect("alert store mutex poisoned");
            if let Some(last) = state.last_fired.get(&dedup_key) {
                if now.saturating_sub(*last) < cooldown_ms {
                    debug!(key = %dedup_key, "Alert suppressed by cooldown");
                    return None;
                }
            }
            state.last_fired.insert(dedup_key, now);

            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                kind,
                severity,
                message,
                timestamp_ms: now,
                data,
                delivered: false,
            };

            state.ring.push_back(alert.clone());
            while state.ring.len() > cfg.max_history {
                state.ring.pop_front();
            }
            alert
        };

        self.persist(&alert, cfg.max_history);

        // Webhook delivery happens entirely off-lock and off the request
        // path.
        if let Some(url) = cfg.webhook_url.clone() {
            let http = self.http.clone();
            let db = self.db.clone();
            let state = Arc::clone(&self.state);
            let outgoing = alert.clone();
            tokio::spawn(async move {
                deliver(http, db, state, url, outgoing).await;
            });
        }

        Some(alert)
    }

    // -- storage -------------------------------------------------------------

    fn persist(&self, alert: &Alert, max_history: usize) {
        let Some(ref db) = self.db else {
            return;
        };
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alerts (id, kind, severity, message, timestamp_ms, data, delivered) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    alert.id,
                    alert.kind.as_str(),
                    alert.severity.as_str(),
                    alert.message,
                    alert.timestamp_ms as i64,
                    alert.data.to_string(),
                ],
            )?;
            // Prune oldest-first down to the history cap.
            conn.execute(
                "DELETE FROM alerts WHERE id NOT IN \
                 (SELECT id FROM alerts ORDER BY timestamp_ms DESC LIMIT ?1)",
                params![max_history as i64],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist alert, in-memory history only");
        }
    }

    /// Recent alerts, newest first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let state = self.state.lock().expect("alert store mutex poisoned");
        state.ring.iter().rev().take(limit).cloned().collect()
    }

}

// ---------------------------------------------------------------------------
// Webhook delivery
// ---------------------------------------------------------------------------

async fn deliver(
    http: reqwest::Client,
    db: Option<Database>,
    state: Arc<Mutex<AlertState>>,
    url: String,
    alert: Alert,
) {
    let body = json!({
        "source": "relayplane",
        "alert": alert,
    });
    let result = http
        .post(&url)
        .timeout(WEBHOOK_TIMEOUT)
        .json(&body)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            mark_delivered(&db, &state, &alert.id);
        }
        Ok(response) => {
            warn!(status = %response.status(), "Alert webhook rejected");
        }
        Err(e) => {
            warn!(error = %e, "Alert webhook delivery failed");
        }
    }
}

/// Best-effort `delivered` flip; not part of any contract.
fn mark_delivered(db: &Option<Database>, state: &Arc<Mutex<AlertState>>, id: &str) {
    {
        let mut state = state.lock().expect("alert store mutex poisoned");
        if let Some(alert) = state.ring.iter_mut().find(|a| a.id == id) {
            alert.delivered = true;
        }
    }
    if let Some(db) = db {
        let _ = db.with_conn(|conn| {
            conn.execute("UPDATE alerts SET delivered = 1 WHERE id = ?1", params![id])?;
            Ok(())
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
