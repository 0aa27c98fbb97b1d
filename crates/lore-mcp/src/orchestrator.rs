//! Idle-triggered background work: distillation, curation, pruning, and the
//! agents-file round-trip. The host signals idleness through the
//! `session.error`/`message.updated`/`session.idle` event hook; this module
//! is what actually runs once that signal arrives.
//!
//! Distillation and curation are each debounced to at most one in-flight run
//! per process at a time: a new trigger that arrives while one is already
//! running is dropped, not queued.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use lore_core::distill::{self, DistillationPrompts};
use lore_core::curator::{self, CuratorPrompts};

use crate::server::AppState;

/// Substrings matched against a host-reported error message to decide
/// whether it indicates the model's context window was exceeded. A named,
/// extendable list rather than one hardcoded string.
pub const CONTEXT_WINDOW_ERROR_SUBSTRINGS: &[&str] = &[
    "prompt is too long",
    "context length exceeded",
    "maximum context length",
    "too many tokens",
    "ContextWindowExceededError",
];

/// True if `error_text` matches any known context-window-exceeded signature.
pub fn is_context_window_error(error_text: &str) -> bool {
    CONTEXT_WINDOW_ERROR_SUBSTRINGS.iter().any(|needle| error_text.contains(needle))
}

/// A debounced single-task guard: `try_acquire` returns `false` if a run is
/// already in flight, rather than blocking the caller.
#[derive(Clone, Default)]
pub struct TaskGuard(Arc<AtomicBool>);

impl TaskGuard {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Try to start a run. On success, returns a handle that releases the
    /// guard when dropped (including on panic/early-return).
    pub fn try_acquire(&self) -> Option<TaskGuardHandle> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TaskGuardHandle(self.0.clone()))
    }
}

pub struct TaskGuardHandle(Arc<AtomicBool>);

impl Drop for TaskGuardHandle {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Run distillation, then curation, then pruning and the agents-file
/// round-trip, for one project/session pair. Skips whichever stage its
/// `TaskGuard` says is already running.
pub async fn run_idle(state: Arc<AppState>, project_path: PathBuf, session_id: String) {
    let project_id = match state.ensure_project(&project_path).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "idle task: failed to resolve project");
            return;
        }
    };
    let cfg = state.config_for(&project_path);

    if let Some(guard) = state.distill_guard.try_acquire() {
        let prompts = DistillationPrompts {
            segment: &state.prompts.segment,
            meta: &state.prompts.meta,
        };
        match distill::run(
            state.model.as_ref(),
            &state.storage,
            state.transformer.as_ref(),
            &project_id,
            &session_id,
            &cfg.distillation,
            &prompts,
            false,
        )
        .await
        {
            Ok(report) => info!(?report, session_id = %session_id, "distillation complete"),
            Err(e) => warn!(error = %e, session_id = %session_id, "distillation failed"),
        }
        drop(guard);
    } else {
        info!(session_id = %session_id, "distillation already running, skipping trigger");
    }

    if cfg.curator.enabled && cfg.curator.on_idle {
        if let Some(guard) = state.curator_guard.try_acquire() {
            let prompts = CuratorPrompts {
                curate: &state.prompts.curate,
                consolidate: &state.prompts.consolidate,
            };
            match curator::run(
                state.model.as_ref(),
                state.storage.as_ref(),
                state.knowledge.as_ref(),
                state.temporal.as_ref(),
                &project_id,
                &session_id,
                &cfg.curator,
                &prompts,
            )
            .await
            {
                Ok(report) => info!(?report, session_id = %session_id, "curation complete"),
                Err(e) => warn!(error = %e, session_id = %session_id, "curation failed"),
            }
            drop(guard);
        } else {
            info!(session_id = %session_id, "curation already running, skipping trigger");
        }
    }

    if let Err(e) = state.temporal.prune(&project_id, cfg.pruning.retention as i64, cfg.pruning.max_storage as u64) {
        warn!(error = %e, "temporal prune failed");
    }

    if cfg.agents_file.enabled {
        if let Err(e) = sync_agents_file(&state, &project_path, &project_id, &cfg.agents_file.path) {
            warn!(error = %e, "agents-file sync failed");
        }
    }
}

/// Force a distillation pass regardless of `min_messages`.
pub async fn run_forced_distillation(state: Arc<AppState>, project_id: String, session_id: String) {
    let Some(guard) = state.distill_guard.try_acquire() else {
        info!(session_id = %session_id, "distillation already running, skipping forced trigger");
        return;
    };
    let cfg = Default::default();
    let prompts = DistillationPrompts {
        segment: &state.prompts.segment,
        meta: &state.prompts.meta,
    };
    match distill::run(state.model.as_ref(), &state.storage, state.transformer.as_ref(), &project_id, &session_id, &cfg, &prompts, true).await {
        Ok(report) => info!(?report, session_id = %session_id, "forced distillation complete"),
        Err(e) => warn!(error = %e, session_id = %session_id, "forced distillation failed"),
    }
    drop(guard);
}

/// Export current project-specific knowledge into the project's agents file,
/// or import hand-written edits back, whichever `lore_core::markdown`'s
/// `should_import` decides.
pub(crate) fn sync_agents_file(state: &AppState, project_path: &Path, project_id: &str, file_name: &str) -> Result<(), lore_core::StorageError> {
    let file_path = project_path.join(file_name);
    let existing = std::fs::read_to_string(&file_path).ok();

    let entries = state.knowledge.project_specific(project_id)?;
    let rows: Vec<(String, String, String, String)> =
        entries.iter().map(|e| (e.id.clone(), e.category.clone(), e.title.clone(), e.content.clone())).collect();

    if lore_core::markdown::should_import(existing.as_deref(), &rows) {
        if let Some(file) = &existing {
            let parsed = lore_core::markdown::import(file);
            let report = state.knowledge.apply_import(project_id, &parsed)?;
            info!(?report, project_id = %project_id, "agents-file import complete");
        }
    }

    let refreshed = state.knowledge.project_specific(project_id)?;
    let refreshed_rows: Vec<(String, String, String, String)> =
        refreshed.iter().map(|e| (e.id.clone(), e.category.clone(), e.title.clone(), e.content.clone())).collect();
    let rendered = lore_core::markdown::export(existing.as_deref(), &refreshed_rows);
    std::fs::write(&file_path, rendered).map_err(lore_core::StorageError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_guard_blocks_concurrent_acquisition() {
        let guard = TaskGuard::new();
        let first = guard.try_acquire();
        assert!(first.is_some());
        assert!(guard.try_acquire().is_none());
        drop(first);
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn context_window_errors_are_recognised() {
        assert!(is_context_window_error("Error: prompt is too long for this model"));
        assert!(is_context_window_error("ContextWindowExceededError: nope"));
        assert!(!is_context_window_error("some unrelated failure"));
    }
}
