//! RelayPlane -- local LLM routing proxy.
//!
//! A single-tenant HTTP server that intercepts OpenAI- and Anthropic-shaped
//! chat requests, runs them through a layered policy pipeline (cache, budget,
//! anomaly detection, auto-downgrade, routing, cooldowns, alerting) and
//! forwards them to the upstream provider APIs.

pub mod alerts;
pub mod anomaly;
pub mod api;
pub mod auth;
pub mod budget;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod downgrade;
pub mod envelope;
pub mod error;
pub mod mesh;
pub mod pipeline;
pub mod providers;
pub mod router;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::alerts::AlertManager;
use crate::anomaly::AnomalyDetector;
use crate::budget::{spawn_spend_flusher, BudgetManager};
use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::cooldown::CooldownTracker;
use crate::db::Database;
use crate::mesh::MeshState;
use crate::pipeline::context::RunLog;
use crate::providers::{PricingTable, Upstream};

/// Durable stores backing the subsystems. Any of them may be absent, in
/// which case the owning subsystem degrades to memory-only.
pub struct Stores {
    pub spend: Option<Database>,
    pub alerts: Option<Database>,
    pub mesh: Option<Database>,
    pub cache: ResponseCache,
}

/// All cross-request state, wired explicitly at startup and threaded into
/// the orchestrator. There is no hidden global; tests construct this against
/// in-memory stores.
pub struct Deps {
    pub config: RwLock<ProxyConfig>,
    pub config_path: PathBuf,
    pub cache: ResponseCache,
    pub budget: BudgetManager,
    pub anomaly: AnomalyDetector,
    pub alerts: Arc<AlertManager>,
    pub cooldown: CooldownTracker,
    pub upstream: Arc<dyn Upstream>,
    pub pricing: PricingTable,
    pub runs: RunLog,
    pub mesh: MeshState,
    /// Runtime master switch (`/control/enable` / `/control/disable`). When
    /// off, every request takes the bypass path.
    pub enabled: AtomicBool,
    pub started_at: Instant,
}

/// Shared application state accessible from all handlers.
pub type AppState = Arc<Deps>;

impl Deps {
    /// Wire the full dependency graph and spawn the spend flusher. The
    /// returned handle completes once the flusher has drained, which happens
    /// after the last `Arc<Deps>` is dropped.
    pub fn build(
        config: ProxyConfig,
        config_path: PathBuf,
        upstream: Arc<dyn Upstream>,
        stores: Stores,
    ) -> (AppState, tokio::task::JoinHandle<()>) {
        let (budget, spend_rx) = BudgetManager::new(stores.spend.clone());
        let flusher = spawn_spend_flusher(stores.spend, spend_rx);

        let deps = Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            cache: stores.cache,
            budget,
            anomaly: AnomalyDetector::new(),
            alerts: Arc::new(AlertManager::new(stores.alerts)),
            cooldown: CooldownTracker::new(),
            upstream,
            pricing: PricingTable::new(),
            runs: RunLog::new(),
            mesh: MeshState::new(stores.mesh),
            enabled: AtomicBool::new(true),
            started_at: Instant::now(),
        });
        (deps, flusher)
    }

    /// Fully in-memory wiring for tests and embedders.
    pub fn in_memory(
        config: ProxyConfig,
        upstream: Arc<dyn Upstream>,
    ) -> (AppState, tokio::task::JoinHandle<()>) {
        let max_memory = config.cache.max_memory_bytes;
        Self::build(
            config,
            PathBuf::from("config.json"),
            upstream,
            Stores {
                spend: None,
                alerts: None,
                mesh: None,
                cache: ResponseCache::in_memory(max_memory),
            },
        )
    }
}
