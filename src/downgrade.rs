//! Auto-downgrade policy.
//!
//! A pure function from (model, budget utilization, config) to a rewrite
//! decision. Downgrades happen only when enabled, above the threshold, and
//! with an explicit mapping entry for the model.

use serde::Serialize;

use crate::config::DowngradeConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DowngradeDecision {
    pub downgraded: bool,
    pub original_model: String,
    pub new_model: String,
    pub reason: String,
}

/// Decide whether `model` should be rewritten given the current daily budget
/// utilization. Referentially transparent: same inputs, same decision.
pub fn check_downgrade(
    model: &str,
    budget_percent: f64,
    cfg: &DowngradeConfig,
) -> DowngradeDecision {
    let passthrough = |reason: &str| DowngradeDecision {
        downgraded: false,
        original_model: model.to_string(),
        new_model: model.to_string(),
        reason: reason.to_string(),
    };

    if !cfg.enabled {
        return passthrough("downgrade disabled");
    }
    if budget_percent < f64::from(cfg.threshold_percent) {
        return passthrough("budget below threshold");
    }
    let Some(cheaper) = cfg.mapping.get(model) else {
        return passthrough("no mapping available");
    };

    DowngradeDecision {
        downgraded: true,
        original_model: model.to_string(),
        new_model: cheaper.clone(),
        reason: format!(
            "budget at {budget_percent:.0}% of daily limit (threshold {}%)",
            cfg.threshold_percent
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
