use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe database handle wrapping a SQLite connection.
///
/// Each durable store (spend log, alerts, cache index, mesh counters) lives
/// in its own file under `~/.relayplane/` and is opened with the schema that
/// store needs.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path with WAL mode and apply
    /// the provided schema.
    pub fn open(path: &Path, schema: &str) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn(|conn| {
            conn.execute_batch(schema)?;
            Ok(())
        })?;
        Ok(db)
    }

    /// Open an in-memory database (for testing and memory-only degradation).
    pub fn open_in_memory(schema: &str) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn(|conn| {
            conn.execute_batch(schema)?;
            Ok(())
        })?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self.conn.lock().expect("database mutex poisoned");
        f(&conn)
    }
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

/// Append-only spend log (`budget.db`). Records are never mutated; pruning
/// happens only on explicit reset.
pub const SPEND_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS spend_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    amount_usd      REAL NOT NULL,
    model           TEXT NOT NULL,
    daily_window    TEXT NOT NULL,
    hourly_window   TEXT NOT NULL,
    timestamp_ms    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spend_daily ON spend_log(daily_window);
CREATE INDEX IF NOT EXISTS idx_spend_hourly ON spend_log(hourly_window);
"#;

/// Alert history (`alerts.db`).
pub const ALERTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    id              TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    severity        TEXT NOT NULL,
    message         TEXT NOT NULL,
    timestamp_ms    INTEGER NOT NULL,
    data            TEXT NOT NULL DEFAULT '{}',
    delivered       INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts(timestamp_ms);
"#;

/// Response cache index (`cache/index.db`). A row exists iff a non-expired
/// body file exists on disk; the startup sweep enforces this.
pub const CACHE_INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_index (
    key             TEXT PRIMARY KEY,
    model           TEXT NOT NULL,
    task_type       TEXT NOT NULL,
    tokens_in       INTEGER NOT NULL DEFAULT 0,
    tokens_out      INTEGER NOT NULL DEFAULT 0,
    cost_usd        REAL NOT NULL DEFAULT 0.0,
    created_at_ms   INTEGER NOT NULL,
    expires_at_ms   INTEGER NOT NULL,
    hit_count       INTEGER NOT NULL DEFAULT 0,
    size_bytes      INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_index(expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_cache_model ON cache_index(model);
"#;

/// Mesh sync counters (`mesh.db`).
pub const MESH_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mesh_state (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL
);
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
