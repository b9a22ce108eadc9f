//! Configuration.
//!
//! A JSON file at `~/.relayplane/config.json` (override with
//! `RELAYPLANE_CONFIG_PATH`), written atomically (`.tmp` then rename) with
//! the previous file kept as `.bak`. Credentials live in a sibling
//! `credentials.json` and survive a config reset. Host/port may be
//! overridden by environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub downgrade: DowngradeConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// -- cache -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Exact,
    Aggressive,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: CacheMode,
    /// Exact mode only: bypass requests with `temperature > 0`.
    #[serde(default = "default_true")]
    pub only_when_deterministic: bool,
    #[serde(default = "default_cache_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Exact-mode TTL.
    #[serde(default = "default_exact_ttl")]
    pub default_ttl_secs: u64,
    /// Aggressive-mode TTL.
    #[serde(default = "default_aggressive_ttl")]
    pub aggressive_ttl_secs: u64,
    /// Per-task-type TTL overrides (keys: "simple" | "moderate" | "complex"),
    /// shadowing the mode default.
    #[serde(default)]
    pub ttl_overrides: HashMap<String, u64>,
    /// Skip caching responses that contain tool calls. Off by default: agent
    /// workloads are dominated by tool calls and identical requests yield
    /// identical tool calls.
    #[serde(default)]
    pub skip_tool_responses: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CacheMode::Exact,
            only_when_deterministic: true,
            max_memory_bytes: default_cache_memory_bytes(),
            default_ttl_secs: default_exact_ttl(),
            aggressive_ttl_secs: default_aggressive_ttl(),
            ttl_overrides: HashMap::new(),
            skip_tool_responses: false,
        }
    }
}

impl CacheConfig {
    /// Effective TTL in seconds for a task type under the current mode.
    pub fn ttl_secs_for(&self, task_type: &str) -> u64 {
        if let Some(ttl) = self.ttl_overrides.get(task_type) {
            return *ttl;
        }
        match self.mode {
            CacheMode::Exact => self.default_ttl_secs,
            CacheMode::Aggressive => self.aggressive_ttl_secs,
        }
    }
}

// -- budget ------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachAction {
    #[default]
    Block,
    Warn,
    Downgrade,
    Alert,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub daily_usd: Option<f64>,
    #[serde(default)]
    pub hourly_usd: Option<f64>,
    #[serde(default)]
    pub per_request_usd: Option<f64>,
    #[serde(default)]
    pub on_breach: BreachAction,
    /// Ascending alert thresholds as percentages of the daily limit.
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<u8>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            daily_usd: None,
            hourly_usd: None,
            per_request_usd: None,
            on_breach: BreachAction::Block,
            thresholds: default_thresholds(),
        }
    }
}

// -- downgrade ---------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DowngradeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Daily budget utilization (percent) at which downgrades begin.
    #[serde(default = "default_downgrade_threshold")]
    pub threshold_percent: u8,
    /// Expensive -> cheaper model rewrites.
    #[serde(default = "default_downgrade_mapping")]
    pub mapping: HashMap<String, String>,
}

impl Default for DowngradeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_percent: default_downgrade_threshold(),
            mapping: default_downgrade_mapping(),
        }
    }
}

fn default_downgrade_mapping() -> HashMap<String, String> {
    let pairs = [
        ("claude-opus-4-6", "claude-sonnet-4-6"),
        ("claude-opus-4-1", "claude-sonnet-4-5"),
        ("claude-sonnet-4-6", "claude-haiku-4-5"),
        ("claude-sonnet-4-5", "claude-haiku-4-5"),
        ("gpt-5.2", "gpt-5-mini"),
        ("gpt-4o", "gpt-4o-mini"),
        ("o3", "o3-mini"),
        ("gemini-2.5-pro", "gemini-2.5-flash"),
    ];
    pairs
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

// -- anomaly -----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_anomaly_window")]
    pub window_secs: u64,
    /// Single-request cost flagged as a token explosion.
    #[serde(default = "default_token_explosion_usd")]
    pub token_explosion_usd: f64,
    /// Absolute in-window request count flagged as a velocity spike.
    #[serde(default = "default_velocity_threshold")]
    pub velocity_threshold: usize,
    /// Identical-shape requests in window flagged as an agent loop.
    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_secs: default_anomaly_window(),
            token_explosion_usd: default_token_explosion_usd(),
            velocity_threshold: default_velocity_threshold(),
            repetition_threshold: default_repetition_threshold(),
        }
    }
}

// -- routing -----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    #[default]
    Passthrough,
    Complexity,
    Cascade,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Complexity => "complexity",
            Self::Cascade => "cascade",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComplexityTiers {
    #[serde(default = "default_simple_model")]
    pub simple: String,
    #[serde(default = "default_moderate_model")]
    pub moderate: String,
    #[serde(default = "default_complex_model")]
    pub complex: String,
}

impl Default for ComplexityTiers {
    fn default() -> Self {
        Self {
            simple: default_simple_model(),
            moderate: default_moderate_model(),
            complex: default_complex_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CascadeConfig {
    /// Cheapest-first escalation ladder.
    #[serde(default = "default_cascade_models")]
    pub models: Vec<String>,
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            models: default_cascade_models(),
            max_escalations: default_max_escalations(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub mode: RoutingMode,
    /// Explicit model rewrites, applied before complexity/cascade logic.
    #[serde(default)]
    pub overrides: HashMap<String, String>,
    #[serde(default)]
    pub complexity: ComplexityTiers,
    #[serde(default)]
    pub cascade: CascadeConfig,
}

// -- cooldown ----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CooldownConfig {
    #[serde(default = "default_allowed_fails")]
    pub allowed_fails: usize,
    #[serde(default = "default_cooldown_window")]
    pub window_seconds: u64,
    #[serde(default = "default_cooldown_duration")]
    pub cooldown_seconds: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            allowed_fails: default_allowed_fails(),
            window_seconds: default_cooldown_window(),
            cooldown_seconds: default_cooldown_duration(),
        }
    }
}

// -- alerts ------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Per-dedup-key cooldown.
    #[serde(default = "default_alert_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_alert_history")]
    pub max_history: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            cooldown_secs: default_alert_cooldown(),
            max_history: default_alert_history(),
        }
    }
}

// -- upstream ----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
        }
    }
}

// -- logging -----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials (never mixed into the main config)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_atomic(path, &serde_json::to_string_pretty(self)?)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `~/.relayplane`, the root of all persisted state.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relayplane")
}

/// Config file path, honoring `RELAYPLANE_CONFIG_PATH`.
pub fn config_path() -> PathBuf {
    std::env::var("RELAYPLANE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("config.json"))
}

pub fn credentials_path() -> PathBuf {
    data_dir().join("credentials.json")
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

impl ProxyConfig {
    /// Load from `path`. On a missing or unparseable primary, restore from
    /// `.bak`; if both fail, write a fresh default config. Credentials are
    /// untouched in every branch.
    pub fn load(path: &Path) -> Self {
        match read_config(path) {
            Ok(config) => return config.with_env_overrides(),
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "Config unreadable, trying backup");
                }
            }
        }

        let bak = backup_path(path);
        if let Ok(config) = read_config(&bak) {
            warn!(path = %bak.display(), "Restored configuration from backup");
            if let Err(e) = config.save(path) {
                warn!(error = %e, "Failed to rewrite primary config from backup");
            }
            return config.with_env_overrides();
        }

        let config = Self::default();
        if let Err(e) = config.save(path) {
            warn!(error = %e, "Failed to write default config");
        }
        config.with_env_overrides()
    }

    /// Atomic save: write `.tmp`, keep the previous file as `.bak`, rename
    /// over the primary.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if path.exists() {
            std::fs::copy(path, backup_path(path))?;
        }
        write_atomic(path, &serde_json::to_string_pretty(self)?)
    }

    /// Apply `RELAYPLANE_PROXY_HOST` / `RELAYPLANE_PROXY_PORT`.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("RELAYPLANE_PROXY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("RELAYPLANE_PROXY_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(port = %port, "Ignoring unparseable RELAYPLANE_PROXY_PORT"),
            }
        }
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn read_config(path: &Path) -> anyhow::Result<ProxyConfig> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_port() -> u16 {
    4100
}
const fn default_true() -> bool {
    true
}
const fn default_cache_memory_bytes() -> u64 {
    100 * 1024 * 1024
}
const fn default_exact_ttl() -> u64 {
    3600
}
const fn default_aggressive_ttl() -> u64 {
    1800
}
fn default_thresholds() -> Vec<u8> {
    vec![50, 80, 95]
}
const fn default_downgrade_threshold() -> u8 {
    80
}
const fn default_anomaly_window() -> u64 {
    300
}
const fn default_token_explosion_usd() -> f64 {
    5.0
}
const fn default_velocity_threshold() -> usize {
    30
}
const fn default_repetition_threshold() -> usize {
    20
}
fn default_simple_model() -> String {
    "claude-haiku-4-5".to_string()
}
fn default_moderate_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_complex_model() -> String {
    "claude-opus-4-6".to_string()
}
fn default_cascade_models() -> Vec<String> {
    vec![
        "claude-haiku-4-5".to_string(),
        "claude-sonnet-4-6".to_string(),
        "claude-opus-4-6".to_string(),
    ]
}
const fn default_max_escalations() -> u32 {
    2
}
const fn default_allowed_fails() -> usize {
    3
}
const fn default_cooldown_window() -> u64 {
    60
}
const fn default_cooldown_duration() -> u64 {
    300
}
const fn default_alert_cooldown() -> u64 {
    300
}
const fn default_alert_history() -> usize {
    500
}
const fn default_upstream_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
