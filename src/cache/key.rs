//! Deterministic cache keys.
//!
//! Exact mode hashes a canonical subset of the request; aggressive mode keys
//! on the last user message only and discards earlier turns. Both produce a
//! 64-hex SHA-256 digest over sorted-key JSON (`serde_json` maps are
//! BTree-backed, so serialization is key-sorted at every nesting level).

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::{CacheConfig, CacheMode};
use crate::envelope::Envelope;

/// Compute the cache key for `env` under `mode`.
pub fn compute_key(env: &Envelope, mode: CacheMode) -> String {
    let canonical = match mode {
        CacheMode::Exact => canonical_exact(env),
        CacheMode::Aggressive => canonical_aggressive(env),
    };
    let serialized = canonical.to_string();

    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The exact-mode canonical subset: {max_tokens, messages, model,
/// stop_sequences, system, temperature, tool_choice, tools, top_k, top_p}.
/// Stream flag, provider flags, authorization and unknown fields are
/// excluded. Absent fields are omitted rather than serialized as null.
fn canonical_exact(env: &Envelope) -> Value {
    let mut obj = Map::new();
    if let Some(max) = env.max_tokens {
        obj.insert("max_tokens".into(), json!(max));
    }
    obj.insert("messages".into(), canonical_messages(env));
    obj.insert("model".into(), json!(env.model));
    if let Some(ref stops) = env.stop_sequences {
        obj.insert("stop_sequences".into(), json!(stops));
    }
    if let Some(ref system) = env.system {
        obj.insert("system".into(), json!(system));
    }
    if let Some(t) = env.temperature {
        obj.insert("temperature".into(), json!(t));
    }
    if let Some(ref tc) = env.tool_choice {
        obj.insert("tool_choice".into(), tc.clone());
    }
    if let Some(ref tools) = env.tools {
        obj.insert("tools".into(), Value::Array(tools.clone()));
    }
    if let Some(k) = env.top_k {
        obj.insert("top_k".into(), json!(k));
    }
    if let Some(p) = env.top_p {
        obj.insert("top_p".into(), json!(p));
    }
    Value::Object(obj)
}

/// The aggressive-mode subset: {model, system, tools, last_user_message}.
/// History before the last user message is discarded; temperature and
/// max_tokens are ignored.
fn canonical_aggressive(env: &Envelope) -> Value {
    let mut obj = Map::new();
    obj.insert(
        "last_user_message".into(),
        json!(env.last_user_message().unwrap_or("")),
    );
    obj.insert("model".into(), json!(env.model));
    if let Some(ref system) = env.system {
        obj.insert("system".into(), json!(system));
    }
    if let Some(ref tools) = env.tools {
        obj.insert("tools".into(), Value::Array(tools.clone()));
    }
    Value::Object(obj)
}

fn canonical_messages(env: &Envelope) -> Value {
    Value::Array(
        env.messages
            .iter()
            .map(|m| json!({"content": m.content, "role": m.role.as_str()}))
            .collect(),
    )
}

/// Whether this request bypasses the cache entirely.
///
/// Exact mode bypasses non-deterministic requests (`temperature > 0`) when
/// `only_when_deterministic` is set; aggressive mode bypasses only when the
/// cache is disabled.
pub fn should_bypass(env: &Envelope, cfg: &CacheConfig) -> bool {
    if !cfg.enabled {
        return true;
    }
    // Streaming responses are relayed, never stored.
    if env.stream {
        return true;
    }
    match cfg.mode {
        CacheMode::Exact => {
            cfg.only_when_deterministic && env.temperature.is_some_and(|t| t > 0.0)
        }
        CacheMode::Aggressive => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
