//! Per-session and global mutable state for the gradient transformer.
//!
//! Three kinds of state make up a session: one persisted column
//! (`force_min_layer`, owned by storage), per-session in-memory state
//! (rebuilt from model responses, discarded on process exit), and one
//! process-global calibration value. This module owns the latter two as
//! small structs with well-defined lifecycles rather than free variables,
//! strictly partitioned by session id so worker sessions never mutate
//! parent state.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// The rendered distilled prefix cached across transform calls for one session.
#[derive(Debug, Clone, Default)]
pub struct PrefixCache {
    pub last_distillation_id: Option<String>,
    pub row_count: usize,
    pub cached_text: String,
    pub token_count: u64,
}

/// The pinned first message id of a session's previous raw window.
#[derive(Debug, Clone)]
pub struct RawWindowPin {
    pub first_message_id: String,
}

/// In-memory state for one session, rebuilt from model responses and
/// discarded when the process exits.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub last_known_input: u64,
    pub last_known_ltm: u64,
    pub last_sent_message_count: usize,
    pub last_layer: u8,
    pub last_window_ids: HashSet<String>,
    pub last_transform_estimate: u64,
    pub prefix_cache: Option<PrefixCache>,
    pub raw_window_pin: Option<RawWindowPin>,
    /// Consume-on-read latch set by layers 2/3 when they fire.
    pub needs_urgent_distillation: bool,
}

impl SessionState {
    /// Read and clear the urgent-distillation latch.
    pub fn take_urgent_latch(&mut self) -> bool {
        std::mem::take(&mut self.needs_urgent_distillation)
    }
}

/// Registry of per-session in-memory state, partitioned by session id.
///
/// Worker sessions get their own entries under their own (namespaced) id and
/// are never looked up by a parent session's id, so they cannot perturb the
/// parent's sticky-layer guard or pin.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the state for `session_id`, creating it on first use.
    pub fn with_mut<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        let state = sessions.entry(session_id.to_string()).or_default();
        f(state)
    }

    /// Snapshot the state for `session_id` without creating it.
    pub fn snapshot(&self, session_id: &str) -> Option<SessionState> {
        let sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.get(session_id).cloned()
    }

    /// Drop all state for a session (used by tests simulating a restart).
    pub fn clear(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
        sessions.remove(session_id);
    }
}

/// Process-global overhead calibration, shared by every session of the same
/// model, plus the turn-local LTM token channel: set by the
/// system-prompt hook, consumed by the message-transform hook, reset to 0 if
/// no injection happened this turn.
pub struct GlobalCalibration {
    overhead: Mutex<Option<f64>>,
    ltm_tokens: Mutex<u64>,
}

/// Overhead assumed before any calibration has occurred.
pub const FIRST_TURN_OVERHEAD: u64 = 15_000;

impl Default for GlobalCalibration {
    fn default() -> Self {
        Self {
            overhead: Mutex::new(None),
            ltm_tokens: Mutex::new(0),
        }
    }
}

impl GlobalCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current overhead estimate, or the uncalibrated default.
    pub fn overhead(&self) -> u64 {
        self.overhead
            .lock()
            .expect("calibration lock poisoned")
            .map(|v| v.round() as u64)
            .unwrap_or(FIRST_TURN_OVERHEAD)
    }

    /// Fold a new observation into the EMA. `actual_input` is the provider's
    /// reported token count; `last_transform_estimate` is this transform's
    /// own estimate of the window it produced, not a re-estimate of the full
    /// history.
    pub fn observe(&self, actual_input: u64, last_transform_estimate: u64) {
        let delta = actual_input.saturating_sub(last_transform_estimate) as f64;
        let mut overhead = self.overhead.lock().expect("calibration lock poisoned");
        *overhead = Some(match *overhead {
            None => delta,
            Some(prev) => 0.7 * prev + 0.3 * delta,
        });
    }

    /// Set this turn's LTM token count (called from the system-prompt hook).
    pub fn set_ltm_tokens(&self, tokens: u64) {
        *self.ltm_tokens.lock().expect("ltm channel lock poisoned") = tokens;
    }

    /// Consume this turn's LTM token count, resetting the channel to 0.
    pub fn take_ltm_tokens(&self) -> u64 {
        std::mem::take(&mut *self.ltm_tokens.lock().expect("ltm channel lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_partitions_by_session_id() {
        let registry = SessionRegistry::new();
        registry.with_mut("parent", |s| s.last_layer = 1);
        registry.with_mut("lore-worker:distill:parent", |s| s.last_layer = 0);
        assert_eq!(registry.snapshot("parent").unwrap().last_layer, 1);
        assert_eq!(
            registry.snapshot("lore-worker:distill:parent").unwrap().last_layer,
            0
        );
    }

    #[test]
    fn calibration_seeds_on_first_observation() {
        let cal = GlobalCalibration::new();
        assert_eq!(cal.overhead(), FIRST_TURN_OVERHEAD);
        cal.observe(20_000, 10_000);
        assert_eq!(cal.overhead(), 10_000);
    }

    #[test]
    fn calibration_is_exponentially_weighted_after_first() {
        let cal = GlobalCalibration::new();
        cal.observe(20_000, 10_000); // seeds to 10_000
        cal.observe(20_000, 15_000); // delta = 5_000
        assert_eq!(cal.overhead(), (0.7 * 10_000.0 + 0.3 * 5_000.0).round() as u64);
    }

    #[test]
    fn ltm_channel_resets_on_take() {
        let cal = GlobalCalibration::new();
        cal.set_ltm_tokens(500);
        assert_eq!(cal.take_ltm_tokens(), 500);
        assert_eq!(cal.take_ltm_tokens(), 0);
    }

    #[test]
    fn urgent_latch_is_consume_on_read() {
        let mut state = SessionState::default();
        state.needs_urgent_distillation = true;
        assert!(state.take_urgent_latch());
        assert!(!state.take_urgent_latch());
    }
}
