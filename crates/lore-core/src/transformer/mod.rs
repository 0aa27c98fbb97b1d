//! The gradient context transformer: four-layer window compression with
//! exact-token calibration, a sticky-layer guard, an append-only prefix
//! cache, and lazy raw-window eviction.

mod anchor;

use std::sync::Arc;

use crate::config::Config;
use crate::session::{GlobalCalibration, PrefixCache, RawWindowPin, SessionRegistry};
use crate::storage::{DistillationRecord, Storage, StorageError};
use crate::types::{Message, MessagePart, Role};

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Safety factor applied to an uncalibrated layer-0 estimate: chars/3
/// undercounts the real tokenizer by roughly this much.
const UNCALIBRATED_SAFETY_FACTOR: f64 = 1.5;

/// Fixed per-part/per-message framing overhead.
const FRAMING_OVERHEAD: u64 = MessagePart::FRAMING_OVERHEAD as u64;

/// Placeholder substituted for a stripped tool output.
const STRIPPED_TOOL_PLACEHOLDER: &str = "[tool output omitted]";

/// ceil(chars/3) token estimate for a plain string.
pub fn estimate_tokens_str(s: &str) -> u64 {
    (s.chars().count() as u64).div_ceil(3).max(1)
}

fn estimate_part_tokens(part: &MessagePart) -> u64 {
    let text_tokens = match part {
        MessagePart::Text { text } => estimate_tokens_str(text),
        MessagePart::Reasoning { text } => estimate_tokens_str(text),
        MessagePart::Tool { name, output } => {
            estimate_tokens_str(name) + output.as_deref().map(estimate_tokens_str).unwrap_or(0)
        }
        MessagePart::StepStart | MessagePart::StepFinish => 0,
    };
    text_tokens + FRAMING_OVERHEAD
}

/// Estimate a message's token cost: its parts plus per-message framing.
pub fn estimate_message_tokens(message: &Message) -> u64 {
    message.parts.iter().map(estimate_part_tokens).sum::<u64>() + FRAMING_OVERHEAD
}

fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Model context/output limits for one provider call.
#[derive(Debug, Clone, Copy)]
pub struct ModelLimits {
    pub context: u64,
    pub output: u64,
}

/// The computed token budget for one transform call.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub usable: u64,
    pub max_input: u64,
    pub distilled_budget: u64,
    pub raw_budget: u64,
}

fn compute_budget(limits: ModelLimits, overhead: u64, ltm_tokens: u64, cfg: &Config) -> Budget {
    let max_input = limits.context.saturating_sub(limits.output);
    let usable = limits
        .context
        .saturating_sub(limits.output)
        .saturating_sub(overhead)
        .saturating_sub(ltm_tokens);
    Budget {
        usable,
        max_input,
        distilled_budget: (usable as f64 * cfg.budget.distilled) as u64,
        raw_budget: (usable as f64 * cfg.budget.raw) as u64,
    }
}

/// The safety layer a transform resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    Passthrough = 0,
    LazyEviction = 1,
    OldToolStripping = 2,
    AggressiveStripping = 3,
    Emergency = 4,
}

impl Layer {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_min(min: u8) -> Self {
        match min {
            0 => Layer::Passthrough,
            1 => Layer::LazyEviction,
            2 => Layer::OldToolStripping,
            3 => Layer::AggressiveStripping,
            _ => Layer::Emergency,
        }
    }
}

/// The output of one `transform` call.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub messages: Vec<Message>,
    pub layer: Layer,
    pub distilled_tokens: u64,
    pub raw_tokens: u64,
    pub total_tokens: u64,
}

/// The gradient context transformer.
pub struct Transformer {
    storage: Arc<Storage>,
    sessions: SessionRegistry,
    calibration: GlobalCalibration,
}

impl Transformer {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            sessions: SessionRegistry::new(),
            calibration: GlobalCalibration::new(),
        }
    }

    /// Turn-local channel: set by the system-prompt hook before `transform` runs.
    pub fn set_ltm_tokens(&self, tokens: u64) {
        self.calibration.set_ltm_tokens(tokens);
    }

    /// The current calibrated overhead estimate (or [`crate::session::FIRST_TURN_OVERHEAD`]
    /// when uncalibrated). Exposed so the system-prompt hook can size its own
    /// knowledge-injection budget before a transform
    /// has run this turn.
    pub fn overhead(&self) -> u64 {
        self.calibration.overhead()
    }

    /// One-shot force-escalation, persisted across restarts.
    pub fn set_force_min_layer(&self, session_id: &str, layer: u8) -> Result<()> {
        self.storage.set_force_min_layer(session_id, layer)
    }

    /// Run the transform for one turn.
    pub fn transform(
        &self,
        project_id: &str,
        session_id: &str,
        cfg: &Config,
        limits: ModelLimits,
        messages: &[Message],
    ) -> Result<TransformResult> {
        let ltm_tokens = self.calibration.take_ltm_tokens();
        let overhead = self.calibration.overhead();
        let forced_min_layer = self.storage.consume_force_min_layer(session_id)?;
        let budget = compute_budget(limits, overhead, ltm_tokens, cfg);

        let (calibrated, expected_input, sticky_blocked) = self.sessions.with_mut(session_id, |state| {
            let calibrated = state.last_known_input > 0;
            let expected = if calibrated {
                let current_ids: std::collections::HashSet<&str> =
                    messages.iter().map(|m| m.id.as_str()).collect();
                let new_tokens: u64 = messages
                    .iter()
                    .filter(|m| !state.last_window_ids.contains(m.id.as_str()))
                    .map(estimate_message_tokens)
                    .sum();
                let ltm_delta = ltm_tokens as i64 - state.last_known_ltm as i64;
                let _ = current_ids;
                (state.last_known_input as i64 + new_tokens as i64 + ltm_delta).max(0) as u64
            } else {
                estimate_messages_tokens(messages) + overhead + ltm_tokens
            };

            let sticky_blocked =
                state.last_layer >= 1 && messages.len() >= state.last_sent_message_count;

            (calibrated, expected, sticky_blocked)
        });

        let layer0_allowed = forced_min_layer == 0 && !sticky_blocked;
        if layer0_allowed {
            let check_value = if calibrated {
                expected_input as f64
            } else {
                expected_input as f64 * UNCALIBRATED_SAFETY_FACTOR
            };
            if check_value <= budget.max_input as f64 {
                let total = estimate_messages_tokens(messages);
                self.sessions.with_mut(session_id, |state| {
                    state.last_transform_estimate = total;
                });
                return Ok(TransformResult {
                    messages: messages.to_vec(),
                    layer: Layer::Passthrough,
                    distilled_tokens: 0,
                    raw_tokens: total,
                    total_tokens: total,
                });
            }
        }

        let min_layer = Layer::from_min(forced_min_layer.max(1));
        for layer in [
            Layer::LazyEviction,
            Layer::OldToolStripping,
            Layer::AggressiveStripping,
            Layer::Emergency,
        ] {
            if layer < min_layer {
                continue;
            }
            if let Some(result) = self.try_fit(session_id, layer, &budget, messages)? {
                self.sessions.with_mut(session_id, |state| {
                    // A one-shot forced escalation is an emergency fix, not an
                    // organic compression; it must not engage the sticky-layer
                    // guard for subsequent calls.
                    if forced_min_layer == 0 {
                        state.last_layer = result.layer.as_u8();
                    }
                    state.last_sent_message_count = result.messages.len();
                    state.last_window_ids = result.messages.iter().map(|m| m.id.clone()).collect();
                    state.last_transform_estimate = result.total_tokens;
                });
                return Ok(result);
            }
        }

        unreachable!("layer 4 always fits")
    }

    /// Evaluate one safety layer. Returns `None` if it doesn't fit (only
    /// possible for layers 1-3; layer 4 always returns `Some`).
    fn try_fit(
        &self,
        session_id: &str,
        layer: Layer,
        budget: &Budget,
        messages: &[Message],
    ) -> Result<Option<TransformResult>> {
        let (distilled_budget, raw_budget) = match layer {
            Layer::LazyEviction => (budget.distilled_budget, budget.raw_budget),
            Layer::OldToolStripping => (budget.distilled_budget, (budget.usable as f64 * 0.5) as u64),
            Layer::AggressiveStripping => {
                ((budget.usable as f64 * 0.15) as u64, (budget.usable as f64 * 0.55) as u64)
            }
            Layer::Emergency => (budget.distilled_budget, budget.raw_budget),
            Layer::Passthrough => unreachable!(),
        };

        let distillations = self.prefix_distillations_for(session_id, layer)?;
        let (prefix_messages, distilled_tokens) = self.render_prefix(session_id, layer, &distillations)?;

        let raw_selection = match layer {
            Layer::LazyEviction => self.select_raw_window_pinned(session_id, messages, raw_budget),
            Layer::OldToolStripping => {
                let stripped = strip_old_tool_outputs(messages);
                self.sessions.with_mut(session_id, |s| s.raw_window_pin = None);
                select_raw_window_scan(&stripped, raw_budget)
            }
            Layer::AggressiveStripping => {
                let stripped = strip_all_tool_outputs(messages);
                self.sessions.with_mut(session_id, |s| s.raw_window_pin = None);
                select_raw_window_scan(&stripped, raw_budget)
            }
            Layer::Emergency => {
                let tail = messages.iter().rev().take(3).rev().cloned().collect::<Vec<_>>();
                Some(tail)
            }
            Layer::Passthrough => unreachable!(),
        };

        let Some(raw_window) = raw_selection else {
            return Ok(None);
        };

        let raw_tokens = estimate_messages_tokens(&raw_window);
        if layer != Layer::Emergency && raw_tokens > raw_budget {
            return Ok(None);
        }

        if matches!(layer, Layer::OldToolStripping | Layer::AggressiveStripping) {
            self.sessions.with_mut(session_id, |s| s.needs_urgent_distillation = true);
        }

        let mut out_messages = prefix_messages;
        out_messages.extend(raw_window);
        let total_tokens = distilled_tokens + raw_tokens;

        Ok(Some(TransformResult {
            messages: out_messages,
            layer,
            distilled_tokens,
            raw_tokens,
            total_tokens,
        }))
    }

    fn prefix_distillations_for(&self, session_id: &str, layer: Layer) -> Result<Vec<DistillationRecord>> {
        match layer {
            Layer::LazyEviction | Layer::OldToolStripping => self.storage.distillations_for_session(session_id),
            Layer::AggressiveStripping => self.storage.last_n_distillations(session_id, 5),
            Layer::Emergency => self.storage.last_n_distillations(session_id, 2),
            Layer::Passthrough => unreachable!(),
        }
    }

    /// Render the distilled prefix through the append-only cache, then apply
    /// temporal annotation (a pure function of wall clock, applied after the
    /// cache read so it never affects cache validity).
    fn render_prefix(
        &self,
        session_id: &str,
        layer: Layer,
        distillations: &[DistillationRecord],
    ) -> Result<(Vec<Message>, u64)> {
        // Layers 3/4 use a trimmed, differently-scoped prefix; rebuild from
        // scratch each time rather than sharing layer 1/2's append-only cache.
        let cacheable = matches!(layer, Layer::LazyEviction | Layer::OldToolStripping);

        let raw_text = if cacheable {
            self.sessions.with_mut(session_id, |state| {
                let last_id = distillations.last().map(|d| d.id.clone());
                let same_tail = match (&state.prefix_cache, &last_id) {
                    (Some(cache), _) if cache.row_count == distillations.len() => true,
                    _ => false,
                };

                if same_tail {
                    if let Some(cache) = &state.prefix_cache {
                        return cache.cached_text.clone();
                    }
                }

                let append_only = state
                    .prefix_cache
                    .as_ref()
                    .map(|cache| {
                        if cache.row_count >= distillations.len() {
                            false
                        } else if cache.row_count == 0 {
                            true
                        } else {
                            distillations
                                .get(cache.row_count - 1)
                                .map(|d| Some(d.id.clone()) == cache.last_distillation_id)
                                .unwrap_or(false)
                        }
                    })
                    .unwrap_or(false);

                let text = if append_only {
                    let cache = state.prefix_cache.as_ref().unwrap();
                    let new_rows = &distillations[cache.row_count..];
                    let appended: String = new_rows.iter().map(|d| d.observations.clone()).collect::<Vec<_>>().join("\n\n");
                    format!("{}\n\n{}", cache.cached_text, appended)
                } else {
                    distillations.iter().map(|d| d.observations.clone()).collect::<Vec<_>>().join("\n\n")
                };

                state.prefix_cache = Some(PrefixCache {
                    last_distillation_id: last_id,
                    row_count: distillations.len(),
                    cached_text: text.clone(),
                    token_count: estimate_tokens_str(&text),
                });

                text
            })
        } else {
            distillations
                .iter()
                .map(|d| d.observations.clone())
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        if raw_text.trim().is_empty() {
            return Ok((Vec::new(), 0));
        }

        let annotated = anchor::annotate(&raw_text, chrono::Utc::now());
        let tokens = estimate_tokens_str(&annotated);

        let user_msg = Message {
            id: format!("lore-prefix-user:{session_id}"),
            role: Role::User,
            parts: vec![MessagePart::Text {
                text: format!(
                    "[Memory context follows — do not reference this format in your responses]\n\n{annotated}"
                ),
            }],
            created_at: 0,
        };
        let assistant_msg = Message {
            id: format!("lore-prefix-assistant:{session_id}"),
            role: Role::Assistant,
            parts: vec![MessagePart::Text {
                text: "I'm ready to continue.".to_string(),
            }],
            created_at: 0,
        };

        Ok((vec![user_msg, assistant_msg], tokens))
    }

    /// Layer 1's lazy-eviction raw window pin.
    fn select_raw_window_pinned(
        &self,
        session_id: &str,
        messages: &[Message],
        raw_budget: u64,
    ) -> Option<Vec<Message>> {
        let existing_pin = self.sessions.with_mut(session_id, |s| s.raw_window_pin.clone());

        if let Some(RawWindowPin { first_message_id }) = &existing_pin {
            if let Some(start) = messages.iter().position(|m| &m.id == first_message_id) {
                let window = &messages[start..];
                if protects_current_turn(window, raw_budget) {
                    return Some(window.to_vec());
                }
            }
        }

        let window = select_raw_window_scan(messages, raw_budget)?;
        if let Some(first) = window.first() {
            self.sessions.with_mut(session_id, |s| {
                s.raw_window_pin = Some(RawWindowPin {
                    first_message_id: first.id.clone(),
                });
            });
        }
        Some(window)
    }

    /// Report the provider's actual input-token usage after an assistant
    /// response completes.
    pub fn calibrate(&self, session_id: &str, actual_input: u64, ltm_tokens: u64, compressed_count: usize) {
        let last_estimate = self.sessions.with_mut(session_id, |state| {
            let estimate = state.last_transform_estimate;
            state.last_known_input = actual_input;
            state.last_known_ltm = ltm_tokens;
            state.last_sent_message_count = compressed_count;
            estimate
        });
        self.calibration.observe(actual_input, last_estimate);
    }

    /// Consume the urgent-distillation latch for a session.
    pub fn take_urgent_latch(&self, session_id: &str) -> bool {
        self.sessions.with_mut(session_id, |s| s.take_urgent_latch())
    }

    /// Clear all in-memory state for a session (used when a session is torn down).
    pub fn clear_session(&self, session_id: &str) {
        self.sessions.clear(session_id);
    }
}

/// "Current agentic turn" = the last user message plus everything after it.
/// Always included; if it alone overflows the budget, the layer fails.
fn protects_current_turn(window: &[Message], raw_budget: u64) -> bool {
    estimate_messages_tokens(window) <= raw_budget
}

fn current_turn_start(messages: &[Message]) -> usize {
    messages
        .iter()
        .rposition(|m| m.role == Role::User)
        .unwrap_or(0)
}

/// Backward scan: the current turn is always included; older messages are
/// accumulated backwards into the remaining budget. Returns `None` if even
/// the current turn alone overflows `raw_budget`.
fn select_raw_window_scan(messages: &[Message], raw_budget: u64) -> Option<Vec<Message>> {
    if messages.is_empty() {
        return Some(Vec::new());
    }
    let turn_start = current_turn_start(messages);
    let turn = &messages[turn_start..];
    let turn_tokens = estimate_messages_tokens(turn);
    if turn_tokens > raw_budget {
        return None;
    }

    let mut start = turn_start;
    let mut used = turn_tokens;
    while start > 0 {
        let candidate_tokens = estimate_message_tokens(&messages[start - 1]);
        if used + candidate_tokens > raw_budget {
            break;
        }
        used += candidate_tokens;
        start -= 1;
    }

    Some(messages[start..].to_vec())
}

/// Replace tool outputs in messages outside the last two user turns with a
/// short placeholder (layer 2).
fn strip_old_tool_outputs(messages: &[Message]) -> Vec<Message> {
    let user_positions: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();
    let protect_from = user_positions.iter().rev().nth(1).copied().unwrap_or(0);

    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            if i >= protect_from {
                m.clone()
            } else {
                strip_tool_parts(m)
            }
        })
        .collect()
}

/// Strip every tool output in the history (layer 3).
fn strip_all_tool_outputs(messages: &[Message]) -> Vec<Message> {
    messages.iter().map(strip_tool_parts).collect()
}

fn strip_tool_parts(message: &Message) -> Message {
    let parts = message
        .parts
        .iter()
        .map(|part| match part {
            MessagePart::Tool { name, output: Some(_) } => MessagePart::Tool {
                name: name.clone(),
                output: Some(STRIPPED_TOOL_PLACEHOLDER.to_string()),
            },
            other => other.clone(),
        })
        .collect();
    Message {
        parts,
        ..message.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn small_message(id: &str, role: Role, text: &str, created_at: i64) -> Message {
        Message {
            id: id.to_string(),
            role,
            parts: vec![MessagePart::Text { text: text.to_string() }],
            created_at,
        }
    }

    fn setup() -> (TempDir, Arc<Storage>, String, Transformer) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("lore.db"))).unwrap());
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        let transformer = Transformer::new(storage.clone());
        (dir, storage, project_id, transformer)
    }

    #[test]
    fn happy_path_small_session_stays_at_layer_zero() {
        let (_dir, _storage, project_id, transformer) = setup();
        let cfg = Config::default();
        let limits = ModelLimits {
            context: 200_000,
            output: 32_000,
        };
        let messages: Vec<Message> = (0..6)
            .map(|i| small_message(&format!("m{i}"), Role::User, "short message", i as i64))
            .collect();

        let result = transformer
            .transform(&project_id, "sess1", &cfg, limits, &messages)
            .unwrap();
        assert_eq!(result.layer, Layer::Passthrough);
        assert_eq!(result.messages.len(), messages.len());
    }

    #[test]
    fn large_session_compresses_to_layer_one_with_a_stable_pin() {
        let (_dir, _storage, project_id, transformer) = setup();
        let cfg = Config::default();
        // Chosen so the uncalibrated FIRST_TURN_OVERHEAD dominates enough to
        // fail the layer-0 safety check while still leaving enough of
        // `usable` for the raw window to fit under layer 1's raw budget.
        let limits = ModelLimits {
            context: 32_000,
            output: 2_000,
        };
        let messages: Vec<Message> = (0..32)
            .map(|i| small_message(&format!("m{i}"), if i % 2 == 0 { Role::User } else { Role::Assistant }, &"x".repeat(400), i as i64))
            .collect();

        let first = transformer
            .transform(&project_id, "sess2", &cfg, limits, &messages)
            .unwrap();
        assert_eq!(first.layer, Layer::LazyEviction);
        assert_eq!(first.distilled_tokens, 0);

        let mut extended = messages.clone();
        extended.push(small_message("m60", Role::User, "tiny", 60));
        let second = transformer
            .transform(&project_id, "sess2", &cfg, limits, &extended)
            .unwrap();
        assert_eq!(second.layer, Layer::LazyEviction);
    }

    #[test]
    fn force_escalation_survives_a_simulated_restart() {
        let (_dir, _storage, project_id, transformer) = setup();
        transformer.set_force_min_layer("sess3", 2).unwrap();
        transformer.clear_session("sess3");

        let cfg = Config::default();
        let limits = ModelLimits {
            context: 200_000,
            output: 32_000,
        };
        let messages = vec![small_message("m0", Role::User, "tiny", 0)];
        let result = transformer
            .transform(&project_id, "sess3", &cfg, limits, &messages)
            .unwrap();
        assert!(result.layer >= Layer::OldToolStripping);

        let second = transformer
            .transform(&project_id, "sess3", &cfg, limits, &messages)
            .unwrap();
        assert_eq!(second.layer, Layer::Passthrough);
    }

    #[test]
    fn emergency_layer_always_fits_and_keeps_tool_parts() {
        let (_dir, _storage, project_id, transformer) = setup();
        let cfg = Config::default();
        let limits = ModelLimits { context: 1, output: 0 };
        let messages: Vec<Message> = (0..10)
            .map(|i| small_message(&format!("m{i}"), Role::User, &"x".repeat(10_000), i as i64))
            .collect();
        let result = transformer
            .transform(&project_id, "sess4", &cfg, limits, &messages)
            .unwrap();
        assert_eq!(result.layer, Layer::Emergency);
    }

    #[test]
    fn estimate_uses_ceil_chars_over_three() {
        assert_eq!(estimate_tokens_str("abc"), 1);
        assert_eq!(estimate_tokens_str("abcd"), 2);
    }
}
