//! Distillation pipeline: turns raw temporal messages into dated observation
//! logs, recursively consolidates them, and tracks undistilled work.
//!
//! The distiller/curator model *prompts* are configuration artefacts supplied
//! by the caller, not authored here: callers pass in templates
//! with `{context}`/`{segment}` (segment prompt) or `{segments}` (meta
//! prompt) placeholders, and this module fills them in and dispatches to a
//! [`ModelClient`] under a worker session.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::DistillationConfig;
use crate::ids::now_ms;
use crate::model::{ModelClient, WorkerSessionId};
use crate::storage::{Storage, StorageError, TemporalMessageRecord};
use crate::transformer::{estimate_tokens_str, Transformer};

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Maximum number of urgent-latch-driven rounds per `run` call.
const MAX_ROUNDS: u32 = 3;

/// Sentinel the orchestrator substitutes for a model call that hit its
/// wall-clock deadline; treated identically to an unparseable response.
pub const TIMEOUT_SENTINEL: &str = "[TIMEOUT]";

/// Prompt templates supplied by the caller. Fixed string artefacts; this
/// crate only performs placeholder substitution.
pub struct DistillationPrompts<'a> {
    /// Per-segment distillation prompt. `{context}` is replaced with the most
    /// recent prior observations (any generation); `{segment}` with the
    /// rendered segment transcript.
    pub segment: &'a str,
    /// Meta-distillation (consolidation) prompt. `{segments}` is replaced
    /// with the numbered generation-0 observations being consolidated.
    pub meta: &'a str,
}

/// Summary of one `run` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistillationReport {
    pub rounds: u32,
    pub segments_distilled: u32,
    pub segments_skipped: u32,
    pub meta_runs: u32,
    pub orphans_repaired: u32,
}

/// Entry point: `run(session, force)`.
pub async fn run<M: ModelClient>(
    model: &M,
    storage: &Arc<Storage>,
    transformer: &Transformer,
    project_id: &str,
    session_id: &str,
    cfg: &DistillationConfig,
    prompts: &DistillationPrompts<'_>,
    force: bool,
) -> Result<DistillationReport> {
    let mut report = DistillationReport::default();

    loop {
        report.rounds += 1;
        report.orphans_repaired += repair_orphans(storage, session_id)? as u32;

        let pending = storage.undistilled_messages(session_id)?;
        if pending.len() < cfg.min_messages as usize && !force {
            info!(session_id, pending = pending.len(), "too few undistilled messages, skipping");
        } else {
            let segments = segment_messages(pending, cfg.max_segment as usize);
            for segment in segments {
                match distill_segment(model, storage, project_id, session_id, &segment, prompts.segment).await {
                    Ok(true) => report.segments_distilled += 1,
                    Ok(false) => report.segments_skipped += 1,
                    Err(err) => {
                        warn!(session_id, error = %err, "segment distillation storage error");
                        return Err(err);
                    }
                }
            }

            if maybe_meta_distill(model, storage, project_id, session_id, cfg, prompts.meta).await? {
                report.meta_runs += 1;
            }
        }

        let urgent = transformer.take_urgent_latch(session_id);
        if !urgent || report.rounds >= MAX_ROUNDS {
            break;
        }
    }

    Ok(report)
}

/// Step 1: reset any message marked `distilled=true` whose distillation was
/// since deleted (e.g. a crash mid meta-distillation transaction).
fn repair_orphans(storage: &Storage, session_id: &str) -> Result<usize> {
    let referenced = storage.referenced_source_ids(session_id)?;
    let distilled_ids = storage.distilled_message_ids(session_id)?;
    let orphans: Vec<String> = distilled_ids
        .into_iter()
        .filter(|id| !referenced.contains(id))
        .collect();
    if !orphans.is_empty() {
        warn!(session_id, count = orphans.len(), "repairing orphaned temporal messages");
        storage.reset_distilled(&orphans)?;
    }
    Ok(orphans.len())
}

/// Step 3: group pending messages into segments of at most `max_segment`,
/// merging a trailing segment of fewer than 3 messages into the previous one.
fn segment_messages(
    pending: Vec<TemporalMessageRecord>,
    max_segment: usize,
) -> Vec<Vec<TemporalMessageRecord>> {
    let max_segment = max_segment.max(1);
    let mut segments: Vec<Vec<TemporalMessageRecord>> =
        pending.chunks(max_segment).map(|c| c.to_vec()).collect();

    if segments.len() >= 2 && segments.last().map(|s| s.len()).unwrap_or(0) < 3 {
        let tail = segments.pop().unwrap();
        segments.last_mut().unwrap().extend(tail);
    }
    segments
}

/// Render a segment as a dated transcript for the distillation prompt.
fn render_segment(messages: &[TemporalMessageRecord]) -> String {
    messages
        .iter()
        .map(|m| {
            let dt = chrono::DateTime::<Utc>::from_timestamp_millis(m.created_at).unwrap_or_else(Utc::now);
            format!("Date: {}\n{}: {}", dt.format("%Y-%m-%d"), m.role, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Step 4: distill one segment. Returns `Ok(true)` if a distillation was
/// stored, `Ok(false)` if the model call produced no parseable observation
/// (a no-op for this segment — messages stay undistilled and retry next idle).
async fn distill_segment<M: ModelClient>(
    model: &M,
    storage: &Storage,
    project_id: &str,
    session_id: &str,
    segment: &[TemporalMessageRecord],
    template: &str,
) -> Result<bool> {
    if segment.is_empty() {
        return Ok(false);
    }

    let context = storage
        .latest_distillation(session_id)?
        .map(|d| d.observations)
        .unwrap_or_default();
    let prompt = template
        .replace("{context}", &context)
        .replace("{segment}", &render_segment(segment));

    let worker = WorkerSessionId::for_parent(session_id, "distill");
    let response = model.dispatch(&worker, &prompt).await;

    let observations = match response {
        Ok(text) => parse_observations(&text),
        Err(err) => {
            warn!(session_id, error = %err, "distillation model call failed");
            None
        }
    };

    let Some(observations) = observations else {
        return Ok(false);
    };

    let source_ids: Vec<String> = segment.iter().map(|m| m.id.clone()).collect();
    let token_count = estimate_tokens_str(&observations) as i64;
    storage.insert_distillation(
        project_id,
        session_id,
        &observations,
        &source_ids,
        0,
        token_count,
        now_ms(),
    )?;
    storage.mark_distilled(&source_ids)?;
    Ok(true)
}

/// Step 5: when generation-0 count reaches `meta_threshold`, consolidate all
/// of them into one generation-N+1 row in a single transaction.
async fn maybe_meta_distill<M: ModelClient>(
    model: &M,
    storage: &Storage,
    project_id: &str,
    session_id: &str,
    cfg: &DistillationConfig,
    template: &str,
) -> Result<bool> {
    let gen0 = storage.generation_zero_distillations(session_id)?;
    if gen0.len() < cfg.meta_threshold as usize {
        return Ok(false);
    }

    let numbered: String = gen0
        .iter()
        .enumerate()
        .map(|(i, d)| format!("Segment {}:\n{}", i + 1, d.observations))
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = template.replace("{segments}", &numbered);

    let worker = WorkerSessionId::for_parent(session_id, "meta-distill");
    let response = model.dispatch(&worker, &prompt).await;

    let observations = match response {
        Ok(text) => parse_observations(&text),
        Err(err) => {
            warn!(session_id, error = %err, "meta-distillation model call failed");
            None
        }
    };

    let Some(observations) = observations else {
        return Ok(false);
    };

    let mut union_source_ids = Vec::new();
    let mut seen = HashSet::new();
    for d in &gen0 {
        for id in &d.source_ids {
            if seen.insert(id.clone()) {
                union_source_ids.push(id.clone());
            }
        }
    }

    let next_generation = storage.max_generation(session_id)? + 1;
    let consumed_ids: Vec<String> = gen0.iter().map(|d| d.id.clone()).collect();
    let token_count = estimate_tokens_str(&observations) as i64;

    storage.replace_distillations(
        &consumed_ids,
        project_id,
        session_id,
        &observations,
        &union_source_ids,
        next_generation,
        token_count,
        now_ms(),
    )?;
    info!(session_id, generation = next_generation, consumed = consumed_ids.len(), "meta-distillation complete");
    Ok(true)
}

/// Extract the delimited `<observations>` block, falling back to the whole
/// trimmed text. Empty or timeout-sentinel responses parse to `None`.
fn parse_observations(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == TIMEOUT_SENTINEL {
        return None;
    }

    if let Some(start) = trimmed.find("<observations>") {
        let after = &trimmed[start + "<observations>".len()..];
        if let Some(end) = after.find("</observations>") {
            let inner = after[..end].trim();
            return if inner.is_empty() { None } else { Some(inner.to_string()) };
        }
    }

    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::StubModelClient;
    use std::path::Path;
    use tempfile::TempDir;

    const PROMPTS: DistillationPrompts = DistillationPrompts {
        segment: "context:\n{context}\n\nsegment:\n{segment}",
        meta: "segments:\n{segments}",
    };

    fn setup() -> (TempDir, Arc<Storage>, String, Transformer) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("lore.db"))).unwrap());
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        let transformer = Transformer::new(storage.clone());
        (dir, storage, project_id, transformer)
    }

    #[tokio::test]
    async fn fewer_than_min_messages_without_force_is_a_no_op() {
        let (_dir, storage, project_id, transformer) = setup();
        storage
            .store_temporal_message("m0", &project_id, "sess1", "user", "hi", 2, 1000, None)
            .unwrap();
        let model = StubModelClient::new(vec![]);
        let cfg = DistillationConfig {
            min_messages: 8,
            max_segment: 50,
            meta_threshold: 10,
        };
        let report = run(&model, &storage, &transformer, &project_id, "sess1", &cfg, &PROMPTS, false)
            .await
            .unwrap();
        assert_eq!(report.segments_distilled, 0);
        assert_eq!(storage.undistilled_count("sess1").unwrap(), 1);
    }

    #[tokio::test]
    async fn unparseable_response_leaves_segment_undistilled() {
        let (_dir, storage, project_id, transformer) = setup();
        storage
            .store_temporal_message("m0", &project_id, "sess1", "user", "hi", 2, 1000, None)
            .unwrap();
        let model = StubModelClient::new(vec!["   ".to_string()]);
        let cfg = DistillationConfig { min_messages: 1, max_segment: 50, meta_threshold: 10 };
        let report = run(&model, &storage, &transformer, &project_id, "sess1", &cfg, &PROMPTS, true)
            .await
            .unwrap();
        assert_eq!(report.segments_distilled, 0);
        assert_eq!(report.segments_skipped, 1);
        assert_eq!(storage.undistilled_count("sess1").unwrap(), 1);
    }

    #[tokio::test]
    async fn successful_distillation_marks_segment_distilled() {
        let (_dir, storage, project_id, transformer) = setup();
        storage
            .store_temporal_message("m0", &project_id, "sess1", "user", "hi", 2, 1000, None)
            .unwrap();
        storage
            .store_temporal_message("m1", &project_id, "sess1", "assistant", "hello back", 2, 1001, None)
            .unwrap();
        let model = StubModelClient::new(vec!["<observations>did a thing</observations>".to_string()]);
        let cfg = DistillationConfig { min_messages: 1, max_segment: 50, meta_threshold: 10 };
        let report = run(&model, &storage, &transformer, &project_id, "sess1", &cfg, &PROMPTS, true)
            .await
            .unwrap();
        assert_eq!(report.segments_distilled, 1);
        assert_eq!(storage.undistilled_count("sess1").unwrap(), 0);

        let latest = storage.latest_distillation("sess1").unwrap().unwrap();
        assert_eq!(latest.observations, "did a thing");
        assert_eq!(latest.source_ids, vec!["m0".to_string(), "m1".to_string()]);
    }

    #[tokio::test]
    async fn meta_threshold_triggers_consolidation_and_deletes_gen0() {
        let (_dir, storage, project_id, transformer) = setup();
        // Seed 3 generation-0 rows directly (each from its own fake segment).
        for i in 0..3 {
            let mid = format!("m{i}");
            storage
                .store_temporal_message(&mid, &project_id, "sess1", "user", "x", 1, 1000 + i, None)
                .unwrap();
            storage
                .insert_distillation(&project_id, "sess1", &format!("obs {i}"), &[mid.clone()], 0, 5, 1000 + i)
                .unwrap();
            storage.mark_distilled(&[mid]).unwrap();
        }
        let model = StubModelClient::new(vec!["<observations>consolidated</observations>".to_string()]);
        let cfg = DistillationConfig { min_messages: 100, max_segment: 50, meta_threshold: 3 };
        let report = run(&model, &storage, &transformer, &project_id, "sess1", &cfg, &PROMPTS, false)
            .await
            .unwrap();
        assert_eq!(report.meta_runs, 1);

        let remaining = storage.generation_zero_distillations("sess1").unwrap();
        assert!(remaining.is_empty());
        let latest = storage.latest_distillation("sess1").unwrap().unwrap();
        assert_eq!(latest.generation, 1);
        assert_eq!(latest.observations, "consolidated");
    }

    #[test]
    fn segmenting_merges_small_trailing_segment() {
        let msgs: Vec<TemporalMessageRecord> = (0..12)
            .map(|i| TemporalMessageRecord {
                id: format!("m{i}"),
                project_id: "p".to_string(),
                session_id: "s".to_string(),
                role: "user".to_string(),
                content: "x".to_string(),
                tokens: 1,
                distilled: false,
                created_at: i,
                metadata: None,
            })
            .collect();
        let segments = segment_messages(msgs, 5);
        // 12 = 5 + 5 + 2; trailing 2 merges into previous -> [5, 7]
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 5);
        assert_eq!(segments[1].len(), 7);
    }

    #[test]
    fn parse_observations_extracts_delimited_block() {
        assert_eq!(
            parse_observations("preamble <observations>the real thing</observations> trailer"),
            Some("the real thing".to_string())
        );
        assert_eq!(parse_observations("no tags here"), Some("no tags here".to_string()));
        assert_eq!(parse_observations(""), None);
        assert_eq!(parse_observations(TIMEOUT_SENTINEL), None);
    }
}
