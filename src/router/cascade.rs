//! Cascade escalation state machine.
//!
//! States: Initial -> Forwarding(i) -> Escalating(i) -> Forwarding(i+1) ...
//! ending in Done (success) or Exhausted (out of models or escalations).
//! Trigger detection is a pure function of the response text and the
//! transport outcome; no stream splicing, cascade applies to buffered
//! responses only.

/// Phrases in a response that suggest the model is out of its depth.
const UNCERTAINTY_CUES: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "i do not know",
    "cannot determine",
    "i'm uncertain",
    "hard to say",
];

/// Refusal phrasing that a larger model frequently handles.
const REFUSAL_CUES: &[&str] = &[
    "i can't help",
    "i cannot help",
    "i'm unable to",
    "i am unable to",
    "i can't assist",
    "i cannot assist",
];

/// Pure trigger check over the response text (lowercased match) and the
/// transport outcome.
pub fn should_escalate(response_text: Option<&str>, transport_error: bool) -> bool {
    if transport_error {
        return true;
    }
    let Some(text) = response_text else {
        return false;
    };
    let lowered = text.to_lowercase();
    UNCERTAINTY_CUES.iter().any(|cue| lowered.contains(cue))
        || REFUSAL_CUES.iter().any(|cue| lowered.contains(cue))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeState {
    Initial,
    Forwarding(usize),
    Escalating(usize),
    Done,
    Exhausted,
}

#[derive(Debug)]
pub struct Cascade {
    models: Vec<String>,
    max_escalations: u32,
    escalations: u32,
    state: CascadeState,
}

impl Cascade {
    pub fn new(models: Vec<String>, max_escalations: u32) -> Self {
        Self {
            models,
            max_escalations,
            escalations: 0,
            state: CascadeState::Initial,
        }
    }

    pub fn state(&self) -> CascadeState {
        self.state
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    /// Initial -> Forwarding(0). Returns the first model, or `None` for an
    /// empty ladder (the cascade is immediately exhausted).
    pub fn start(&mut self) -> Option<&str> {
        match self.state {
            CascadeState::Initial if !self.models.is_empty() => {
                self.state = CascadeState::Forwarding(0);
                Some(&self.models[0])
            }
            _ => {
                self.state = CascadeState::Exhausted;
                None
            }
        }
    }

    /// Forwarding(i) -> Done.
    pub fn on_success(&mut self) {
        if matches!(self.state, CascadeState::Forwarding(_)) {
            self.state = CascadeState::Done;
        }
    }

    /// Forwarding(i) -> Escalating(i) -> Forwarding(i+1), or Exhausted when
    /// the ladder or the escalation budget runs out. Returns the next model
    /// to forward to.
    pub fn on_trigger(&mut self) -> Option<&str> {
        let CascadeState::Forwarding(i) = self.state else {
            return None;
        };
        self.state = CascadeState::Escalating(i);

        let next = i + 1;
        if next < self.models.len() && self.escalations < self.max_escalations {
            self.escalations += 1;
            self.state = CascadeState::Forwarding(next);
            Some(&self.models[next])
        } else {
            self.state = CascadeState::Exhausted;
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<String> {
        vec![
            "claude-haiku-4-5".to_string(),
            "claude-sonnet-4-6".to_string(),
            "claude-opus-4-6".to_string(),
        ]
    }

    #[test]
    fn test_start_forwards_to_first_model() {
        let mut cascade = Cascade::new(ladder(), 2);
        assert_eq!(cascade.state(), CascadeState::Initial);
        assert_eq!(cascade.start(), Some("claude-haiku-4-5"));
        assert_eq!(cascade.state(), CascadeState::Forwarding(0));
    }

    #[test]
    fn test_success_completes() {
        let mut cascade = Cascade::new(ladder(), 2);
        cascade.start();
        cascade.on_success();
        assert_eq!(cascade.state(), CascadeState::Done);
        assert_eq!(cascade.escalations(), 0);
    }

    #[test]
    fn test_trigger_escalates_through_ladder() {
        let mut cascade = Cascade::new(ladder(), 2);
        cascade.start();
        assert_eq!(cascade.on_trigger(), Some("claude-sonnet-4-6"));
        assert_eq!(cascade.state(), CascadeState::Forwarding(1));
        assert_eq!(cascade.on_trigger(), Some("claude-opus-4-6"));
        assert_eq!(cascade.escalations(), 2);
        cascade.on_success();
        assert_eq!(cascade.state(), CascadeState::Done);
    }

    #[test]
    fn test_exhausted_at_end_of_ladder() {
        let mut cascade = Cascade::new(ladder(), 5);
        cascade.start();
        cascade.on_trigger();
        cascade.on_trigger();
        assert_eq!(cascade.on_trigger(), None);
        assert_eq!(cascade.state(), CascadeState::Exhausted);
    }

    #[test]
    fn test_max_escalations_respected() {
        let mut cascade = Cascade::new(ladder(), 1);
        cascade.start();
        assert!(cascade.on_trigger().is_some());
        assert_eq!(cascade.on_trigger(), None);
        assert_eq!(cascade.state(), CascadeState::Exhausted);
        assert_eq!(cascade.escalations(), 1);
    }

    #[test]
    fn test_empty_ladder_is_exhausted() {
        let mut cascade = Cascade::new(Vec::new(), 2);
        assert_eq!(cascade.start(), None);
        assert_eq!(cascade.state(), CascadeState::Exhausted);
    }

    #[test]
    fn test_should_escalate_on_transport_error() {
        assert!(should_escalate(None, true));
        assert!(should_escalate(Some("fine answer"), true));
    }

    #[test]
    fn test_should_escalate_on_uncertainty() {
        assert!(should_escalate(Some("I'm not sure about that."), false));
        assert!(should_escalate(Some("It is hard to say exactly."), false));
    }

    #[test]
    fn test_should_escalate_on_refusal() {
        assert!(should_escalate(Some("I can't help with that request."), false));
    }

    #[test]
    fn test_no_escalation_on_confident_answer() {
        assert!(!should_escalate(Some("The answer is 4."), false));
        assert!(!should_escalate(None, false));
    }
}
