//! Knowledge curation: turns a session's recent activity into long-term
//! knowledge entries, and consolidates a project's entries once they pile up.
//!
//! As with [`crate::distill`], the curator/consolidation prompts are
//! configuration artefacts supplied by the caller — this module only fills in
//! placeholders and dispatches to a [`ModelClient`].

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::CuratorConfig;
use crate::knowledge::KnowledgeStore;
use crate::model::{ModelClient, WorkerSessionId};
use crate::storage::{Storage, StorageError};
use crate::temporal::TemporalStore;

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Number of recent raw messages folded into the curation context.
const CONTEXT_MESSAGE_COUNT: u32 = 20;

/// Prompt templates supplied by the caller.
pub struct CuratorPrompts<'a> {
    /// Regular curation pass. `{context}` is replaced with recent session activity.
    pub curate: &'a str,
    /// Consolidation pass, run once a project's entry count reaches
    /// `max_entries`. `{entries}` is replaced with a listing of every
    /// current project entry.
    pub consolidate: &'a str,
}

/// One operation returned by the model, in either pass. Same vocabulary for
/// both: a bare entry (no `op` or `op: "update"`) upserts; `op: "delete"`
/// requires `id` and removes that entry.
#[derive(Debug, Deserialize)]
struct CuratedOp {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    cross_project: bool,
}

/// Summary of one curation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurationReport {
    pub upserted: u32,
    pub deleted: u32,
    pub consolidated: bool,
}

/// Default confidence assigned to a curated entry that doesn't specify one.
const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Run one curation pass for a session, then consolidate the project's
/// entries if they've reached `max_entries`. A no-op (via `cfg.enabled`) is
/// the caller's responsibility to gate before calling this; by the time
/// `run` is invoked, the decision to curate has already been made.
#[allow(clippy::too_many_arguments)]
pub async fn run<M: ModelClient>(
    model: &M,
    storage: &Storage,
    knowledge: &KnowledgeStore,
    temporal: &TemporalStore,
    project_id: &str,
    session_id: &str,
    cfg: &CuratorConfig,
    prompts: &CuratorPrompts<'_>,
) -> Result<CurationReport> {
    let mut report = CurationReport::default();

    let context = build_context(storage, temporal, session_id)?;
    let prompt = prompts.curate.replace("{context}", &context);
    let worker = WorkerSessionId::for_parent(session_id, "curate");
    let response = model.dispatch(&worker, &prompt).await;

    let ops = match response {
        Ok(text) => parse_ops(&text),
        Err(err) => {
            warn!(session_id, error = %err, "curation model call failed");
            None
        }
    };

    if let Some(ops) = ops {
        apply_ops(knowledge, Some(project_id), session_id, &ops, &mut report)?;
    }

    if maybe_consolidate(model, knowledge, project_id, session_id, cfg, prompts.consolidate).await? {
        report.consolidated = true;
    }

    Ok(report)
}

/// Build the curation context: the latest distillation's observations plus
/// the most recent raw messages.
fn build_context(storage: &Storage, temporal: &TemporalStore, session_id: &str) -> Result<String> {
    let mut parts = Vec::new();
    if let Some(d) = storage.latest_distillation(session_id)? {
        parts.push(d.observations);
    }
    for message in temporal.recent(session_id, CONTEXT_MESSAGE_COUNT)? {
        parts.push(message.content);
    }
    Ok(parts.join("\n"))
}

/// Once a project's visible entry count reaches `max_entries`, run a second
/// pass over the *full* current set so the model can merge/retire duplicates
/// using the same update/delete vocabulary as regular curation.
async fn maybe_consolidate<M: ModelClient>(
    model: &M,
    knowledge: &KnowledgeStore,
    project_id: &str,
    session_id: &str,
    cfg: &CuratorConfig,
    template: &str,
) -> Result<bool> {
    let entries = knowledge.for_project(project_id, false)?;
    if entries.len() < cfg.max_entries as usize {
        return Ok(false);
    }

    let listing = entries
        .iter()
        .map(|e| {
            format!(
                "id: {}\ncategory: {}\ntitle: {}\nconfidence: {:.2}\ncontent: {}",
                e.id, e.category, e.title, e.confidence, e.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = template.replace("{entries}", &listing);

    let worker = WorkerSessionId::for_parent(session_id, "consolidate");
    let response = model.dispatch(&worker, &prompt).await;

    let ops = match response {
        Ok(text) => parse_ops(&text),
        Err(err) => {
            warn!(session_id, error = %err, "consolidation model call failed");
            None
        }
    };

    let Some(ops) = ops else {
        return Ok(false);
    };

    let mut report = CurationReport::default();
    apply_ops(knowledge, Some(project_id), session_id, &ops, &mut report)?;
    info!(
        session_id,
        upserted = report.upserted,
        deleted = report.deleted,
        "consolidation complete"
    );
    Ok(true)
}

fn apply_ops(
    knowledge: &KnowledgeStore,
    project_id: Option<&str>,
    session_id: &str,
    ops: &[CuratedOp],
    report: &mut CurationReport,
) -> Result<()> {
    for op in ops {
        match op.op.as_deref() {
            Some("delete") => {
                let Some(id) = &op.id else {
                    continue; // delete without an id: ignore, not a parse error
                };
                knowledge.delete(id)?;
                report.deleted += 1;
            }
            _ => {
                let (Some(category), Some(title), Some(content)) =
                    (op.category.as_deref(), op.title.as_deref(), op.content.as_deref())
                else {
                    continue; // incomplete entry: skip rather than store garbage
                };
                knowledge.upsert(
                    project_id,
                    category,
                    title,
                    content,
                    Some(session_id),
                    op.cross_project,
                    op.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                )?;
                report.upserted += 1;
            }
        }
    }
    Ok(())
}

/// Extract a JSON array of ops from the model's raw response, tolerating
/// surrounding prose or a markdown code fence. `None` on any parse failure —
/// the caller treats that as a no-op for this round.
fn parse_ops(text: &str) -> Option<Vec<CuratedOp>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::StubModelClient;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    const PROMPTS: CuratorPrompts = CuratorPrompts {
        curate: "context:\n{context}",
        consolidate: "entries:\n{entries}",
    };

    fn setup() -> (TempDir, Arc<Storage>, String, KnowledgeStore, TemporalStore) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("lore.db"))).unwrap());
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        let knowledge = KnowledgeStore::new(storage.clone());
        let temporal = TemporalStore::new(storage.clone());
        (dir, storage, project_id, knowledge, temporal)
    }

    fn cfg(max_entries: u32) -> CuratorConfig {
        CuratorConfig {
            enabled: true,
            on_idle: true,
            after_turns: 10,
            max_entries,
        }
    }

    #[tokio::test]
    async fn curation_upserts_parsed_entries() {
        let (_dir, storage, project_id, knowledge, temporal) = setup();
        let model = StubModelClient::new(vec![
            r#"[{"category":"style","title":"Uses tabs","content":"the team prefers tabs","confidence":0.8}]"#
                .to_string(),
        ]);
        let report = run(&model, &storage, &knowledge, &temporal, &project_id, "sess1", &cfg(100), &PROMPTS)
            .await
            .unwrap();
        assert_eq!(report.upserted, 1);
        let entries = knowledge.for_project(&project_id, false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Uses tabs");
        assert_eq!(entries[0].confidence, 0.8);
    }

    #[tokio::test]
    async fn delete_op_removes_an_existing_entry() {
        let (_dir, storage, project_id, knowledge, temporal) = setup();
        let id = knowledge
            .upsert(Some(&project_id), "style", "old", "stale info", None, false, 0.5)
            .unwrap();
        let model = StubModelClient::new(vec![format!(r#"[{{"op":"delete","id":"{id}"}}]"#)]);
        let report = run(&model, &storage, &knowledge, &temporal, &project_id, "sess1", &cfg(100), &PROMPTS)
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert!(knowledge.get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn unparseable_response_is_a_no_op() {
        let (_dir, storage, project_id, knowledge, temporal) = setup();
        let model = StubModelClient::new(vec!["not json at all".to_string()]);
        let report = run(&model, &storage, &knowledge, &temporal, &project_id, "sess1", &cfg(100), &PROMPTS)
            .await
            .unwrap();
        assert_eq!(report.upserted, 0);
        assert!(knowledge.for_project(&project_id, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn consolidation_runs_once_max_entries_is_reached() {
        let (_dir, storage, project_id, knowledge, temporal) = setup();
        for i in 0..3 {
            knowledge
                .upsert(Some(&project_id), "notes", &format!("entry{i}"), "body", None, false, 0.5)
                .unwrap();
        }
        let model = StubModelClient::new(vec![
            r#"[{"category":"notes","title":"curated","content":"new"}]"#.to_string(),
            r#"[{"category":"notes","title":"merged","content":"one entry to rule them all"}]"#.to_string(),
        ]);
        let report = run(&model, &storage, &knowledge, &temporal, &project_id, "sess1", &cfg(4), &PROMPTS)
            .await
            .unwrap();
        assert!(report.consolidated);
    }

    #[test]
    fn parse_ops_tolerates_a_markdown_code_fence() {
        let text = "```json\n[{\"category\":\"a\",\"title\":\"b\",\"content\":\"c\"}]\n```";
        let ops = parse_ops(text).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].title.as_deref(), Some("b"));
    }
}
