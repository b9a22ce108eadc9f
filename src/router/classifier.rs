//! Complexity classifier.
//!
//! Pure, local scoring over the normalized envelope: message count, total
//! content length, presence of tools, and keyword cues in the last user
//! message (never the system prompt). The output doubles as the cache's
//! task type for TTL overrides and stats.

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Keyword cues suggesting analytical work. Matched case-insensitively
/// against the last user message only.
const COMPLEX_CUES: &[&str] = &[
    "analyze",
    "analyse",
    "compare",
    "evaluate",
    "architect",
    "design",
    "refactor",
    "optimize",
    "prove",
    "step by step",
    "trade-off",
    "tradeoff",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "complex" => Self::Complex,
            "moderate" => Self::Moderate,
            _ => Self::Simple,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score a request. Deterministic, no I/O.
pub fn classify(env: &Envelope) -> Complexity {
    let mut score = 0u32;

    // Conversation depth.
    let message_count = env.messages.len();
    if message_count > 6 {
        score += 2;
    } else if message_count > 2 {
        score += 1;
    }

    // Total content length (system prompt included).
    let total_len: usize = env.system.as_deref().map_or(0, str::len)
        + env.messages.iter().map(|m| m.content.len()).sum::<usize>();
    if total_len > 4000 {
        score += 2;
    } else if total_len > 1000 {
        score += 1;
    }

    // Tool use.
    if env.tools.as_ref().is_some_and(|t| !t.is_empty()) {
        score += 1;
    }

    // Keyword cues, last user message only.
    if let Some(last) = env.last_user_message() {
        let lowered = last.to_lowercase();
        if COMPLEX_CUES.iter().any(|cue| lowered.contains(cue)) {
            score += 2;
        }
    }

    match score {
        0..=1 => Complexity::Simple,
        2..=3 => Complexity::Moderate,
        _ => Complexity::Complex,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
