//! Model routing.
//!
//! Resolution order: aliases first, then routing suffixes (stripped and kept
//! as a preference hint), then explicit overrides. After resolution the
//! routing mode decides the forwarded model: passthrough keeps it,
//! complexity swaps in the per-tier model, cascade walks an escalation
//! ladder.

pub mod cascade;
pub mod classifier;

use serde::Serialize;

use crate::config::{RoutingConfig, RoutingMode};
use crate::router::classifier::Complexity;

// ---------------------------------------------------------------------------
// Aliases and suffixes
// ---------------------------------------------------------------------------

/// Portable model aliases. Resolved before any other routing logic.
const ALIASES: &[(&str, &str)] = &[
    ("rp:best", "claude-opus-4-6"),
    ("rp:fast", "claude-haiku-4-5"),
    ("rp:cheap", "gemini-2.5-flash"),
    ("rp:balanced", "claude-sonnet-4-6"),
    ("relayplane:auto", "claude-sonnet-4-6"),
    ("rp:auto", "claude-sonnet-4-6"),
];

/// Preference hint carried by a routing suffix (`model:cost` etc.). Recorded
/// in the request trace; cascade and complexity routing may consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteHint {
    Cost,
    Fast,
    Quality,
}

pub fn resolve_alias(model: &str) -> Option<&'static str> {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, target)| *target)
}

/// Strip a trailing `:cost` / `:fast` / `:quality` suffix.
pub fn strip_suffix(model: &str) -> (&str, Option<RouteHint>) {
    for (suffix, hint) in [
        (":cost", RouteHint::Cost),
        (":fast", RouteHint::Fast),
        (":quality", RouteHint::Quality),
    ] {
        if let Some(stripped) = model.strip_suffix(suffix) {
            return (stripped, Some(hint));
        }
    }
    (model, None)
}

/// Full name resolution: alias, then suffix strip, then explicit override.
pub fn resolve_model(requested: &str, cfg: &RoutingConfig) -> (String, Option<RouteHint>) {
    let aliased = resolve_alias(requested).unwrap_or(requested);
    let (stripped, hint) = strip_suffix(aliased);
    let resolved = cfg
        .overrides
        .get(stripped)
        .map(String::as_str)
        .unwrap_or(stripped);
    (resolved.to_string(), hint)
}

// ---------------------------------------------------------------------------
// Route selection
// ---------------------------------------------------------------------------

/// What the router decided for this request.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub mode: RoutingMode,
    /// Model to forward first.
    pub model: String,
    /// Remaining escalation ladder (cascade mode only), first model included.
    pub cascade_models: Option<Vec<String>>,
    pub reason: String,
}

/// Pick the forwarded model for an already-resolved name.
pub fn select_route(
    resolved_model: &str,
    complexity: Complexity,
    cfg: &RoutingConfig,
) -> RouteDecision {
    match cfg.mode {
        RoutingMode::Passthrough => RouteDecision {
            mode: RoutingMode::Passthrough,
            model: resolved_model.to_string(),
            cascade_models: None,
            reason: "passthrough".to_string(),
        },
        RoutingMode::Complexity => {
            let tier_model = match complexity {
                Complexity::Simple => &cfg.complexity.simple,
                Complexity::Moderate => &cfg.complexity.moderate,
                Complexity::Complex => &cfg.complexity.complex,
            };
            RouteDecision {
                mode: RoutingMode::Complexity,
                model: tier_model.clone(),
                cascade_models: None,
                reason: format!("classified {complexity}"),
            }
        }
        RoutingMode::Cascade => {
            let models = if cfg.cascade.models.is_empty() {
                vec![resolved_model.to_string()]
            } else {
                cfg.cascade.models.clone()
            };
            RouteDecision {
                mode: RoutingMode::Cascade,
                model: models[0].clone(),
                cascade_models: Some(models),
                reason: "cascade ladder".to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
