use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::router::classifier::Complexity;

/// Metadata carried alongside a cached response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub model: String,
    pub task_type: Complexity,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub hit_count: u64,
    pub size_bytes: u64,
}

/// How the cache participated in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Bypass => "bypass",
        }
    }
}

/// Running cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub saved_cost_usd: f64,
    pub entries: u64,
    pub size_bytes: u64,
    pub per_model_hits: HashMap<String, u64>,
    pub per_model_entries: HashMap<String, u64>,
    pub per_task_hits: HashMap<String, u64>,
    pub per_task_entries: HashMap<String, u64>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let looked_up = self.hits + self.misses;
        if looked_up == 0 {
            return 0.0;
        }
        self.hits as f64 / looked_up as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
