//! Mesh sync state.
//!
//! The cloud mesh itself is plain REST handled elsewhere; the proxy only
//! tracks how much local telemetry has been synced and when. Counters are
//! mirrored into `mesh.db` when it is available.

use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::params;
use serde::Serialize;

use crate::clock::now_ms;
use crate::db::Database;

/// Default RelayPlane cloud endpoint; `RELAYPLANE_API_URL` overrides it.
const DEFAULT_API_URL: &str = "https://api.relayplane.com";

#[derive(Debug, Clone, Serialize)]
pub struct MeshStats {
    pub connected: bool,
    pub api_url: String,
    pub synced_runs: u64,
    pub last_sync_ms: u64,
}

pub struct MeshState {
    db: Option<Database>,
    api_url: String,
    synced_runs: AtomicU64,
    last_sync_ms: AtomicU64,
}

impl MeshState {
    pub fn new(db: Option<Database>) -> Self {
        let api_url = std::env::var("RELAYPLANE_API_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let state = Self {
            db,
            api_url,
            synced_runs: AtomicU64::new(0),
            last_sync_ms: AtomicU64::new(0),
        };
        state.restore();
        state
    }

    fn restore(&self) {
        let Some(ref db) = self.db else {
            return;
        };
        let load = |key: &str| -> u64 {
            db.with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM mesh_state WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
            })
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
        };
        self.synced_runs.store(load("synced_runs"), Ordering::Relaxed);
        self.last_sync_ms.store(load("last_sync_ms"), Ordering::Relaxed);
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            connected: self.db.is_some(),
            api_url: self.api_url.clone(),
            synced_runs: self.synced_runs.load(Ordering::Relaxed),
            last_sync_ms: self.last_sync_ms.load(Ordering::Relaxed),
        }
    }

    /// Record a sync of `total_runs` completed requests.
    pub fn sync(&self, total_runs: u64) -> MeshStats {
        let now = now_ms();
        self.synced_runs.store(total_runs, Ordering::Relaxed);
        self.last_sync_ms.store(now, Ordering::Relaxed);

        if let Some(ref db) = self.db {
            let _ = db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO mesh_state (key, value) VALUES ('synced_runs', ?1) \
                     ON CONFLICT(key) DO UPDATE SET value = ?1",
                    params![total_runs.to_string()],
                )?;
                conn.execute(
                    "INSERT INTO mesh_state (key, value) VALUES ('last_sync_ms', ?1) \
                     ON CONFLICT(key) DO UPDATE SET value = ?1",
                    params![now.to_string()],
                )?;
                Ok(())
            });
        }
        self.stats()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
