//! The unified recall read operation exposed to the host as a single tool:
//! one query, fanned out across long-term knowledge, distilled history, and
//! raw message matches, merged into one markdown block.

use serde::Deserialize;

use crate::knowledge::KnowledgeStore;
use crate::storage::{Storage, StorageError};

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// How far a recall query reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallScope {
    /// Every section, every source.
    All,
    /// Distilled history and raw messages restricted to the current session;
    /// knowledge is unrestricted (it is never session-scoped).
    Session,
    /// Raw messages and knowledge restricted to the current project; distilled
    /// history is always session-scoped (distillation has no cross-session
    /// notion to search — see DESIGN.md).
    Project,
    /// Long-term knowledge only.
    Knowledge,
}

/// A recall request.
#[derive(Debug, Clone, Deserialize)]
pub struct RecallQuery {
    pub query: String,
    pub scope: RecallScope,
}

/// Results per section before the final section-count cap is applied.
const CANDIDATE_FANOUT: u32 = 30;

/// Results actually rendered per section.
const MAX_RESULTS_PER_SECTION: usize = 10;

/// Raw message content is previewed, not quoted in full.
const RAW_PREVIEW_LEN: usize = 500;

fn wants_knowledge(scope: RecallScope) -> bool {
    matches!(scope, RecallScope::All | RecallScope::Project | RecallScope::Knowledge)
}

fn wants_distillations(scope: RecallScope) -> bool {
    matches!(scope, RecallScope::All | RecallScope::Session | RecallScope::Project)
}

fn wants_raw(scope: RecallScope) -> bool {
    matches!(scope, RecallScope::All | RecallScope::Session | RecallScope::Project)
}

/// Run a recall query and render the merged markdown result.
pub fn recall(
    storage: &Storage,
    knowledge: &KnowledgeStore,
    project_id: &str,
    session_id: &str,
    query: &RecallQuery,
) -> Result<String> {
    let mut sections = Vec::new();

    if wants_knowledge(query.scope) {
        if let Some(section) = knowledge_section(knowledge, project_id, query)? {
            sections.push(section);
        }
    }

    if wants_distillations(query.scope) {
        if let Some(section) = distillation_section(storage, session_id, query)? {
            sections.push(section);
        }
    }

    if wants_raw(query.scope) {
        if let Some(section) = raw_section(storage, project_id, session_id, query)? {
            sections.push(section);
        }
    }

    if sections.is_empty() {
        return Ok(format!("No memory matches for \"{}\".", query.query));
    }
    Ok(sections.join("\n\n"))
}

fn knowledge_section(
    knowledge: &KnowledgeStore,
    project_id: &str,
    query: &RecallQuery,
) -> Result<Option<String>> {
    let rows = knowledge.search(&query.query, CANDIDATE_FANOUT)?;
    let scoped: Vec<_> = if query.scope == RecallScope::Knowledge {
        rows
    } else {
        rows.into_iter()
            .filter(|r| r.project_id.as_deref() == Some(project_id) || r.cross_project)
            .collect()
    };

    if scoped.is_empty() {
        return Ok(None);
    }
    let body = scoped
        .into_iter()
        .take(MAX_RESULTS_PER_SECTION)
        .map(|e| format!("- **{}**: {}", e.title, e.content))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Some(format!("## Long-term Knowledge\n{body}")))
}

fn distillation_section(
    storage: &Storage,
    session_id: &str,
    query: &RecallQuery,
) -> Result<Option<String>> {
    let rows = storage.search_distillations(session_id, &query.query)?;
    if rows.is_empty() {
        return Ok(None);
    }
    let body = rows
        .into_iter()
        .take(MAX_RESULTS_PER_SECTION)
        .map(|d| d.observations)
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(Some(format!("## Distilled History\n{body}")))
}

fn raw_section(
    storage: &Storage,
    project_id: &str,
    session_id: &str,
    query: &RecallQuery,
) -> Result<Option<String>> {
    let session_filter = (query.scope == RecallScope::Session).then_some(session_id);
    let rows = storage.search_temporal(&query.query, session_filter, CANDIDATE_FANOUT)?;
    let scoped: Vec<_> = if query.scope == RecallScope::Project {
        rows.into_iter().filter(|m| m.project_id == project_id).collect()
    } else {
        rows
    };

    if scoped.is_empty() {
        return Ok(None);
    }
    let body = scoped
        .into_iter()
        .take(MAX_RESULTS_PER_SECTION)
        .map(|m| format!("- [{}] {}", m.role, preview(&m.content)))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Some(format!("## Raw Message Matches\n{body}")))
}

/// Truncate to `RAW_PREVIEW_LEN` chars on a char boundary, with an ellipsis.
fn preview(content: &str) -> String {
    if content.chars().count() <= RAW_PREVIEW_LEN {
        return content.to_string();
    }
    let truncated: String = content.chars().take(RAW_PREVIEW_LEN).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Storage>, String, KnowledgeStore) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("lore.db"))).unwrap());
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        let knowledge = KnowledgeStore::new(storage.clone());
        (dir, storage, project_id, knowledge)
    }

    #[test]
    fn empty_results_render_a_single_short_line() {
        let (_dir, storage, project_id, knowledge) = setup();
        let query = RecallQuery { query: "nonexistent".to_string(), scope: RecallScope::All };
        let out = recall(&storage, &knowledge, &project_id, "sess1", &query).unwrap();
        assert_eq!(out, "No memory matches for \"nonexistent\".");
    }

    #[test]
    fn knowledge_scope_only_renders_the_knowledge_section() {
        let (_dir, storage, project_id, knowledge) = setup();
        knowledge
            .upsert(Some(&project_id), "style", "tabs", "team uses tabs for indentation", None, false, 0.8)
            .unwrap();
        storage
            .store_temporal_message("m0", &project_id, "sess1", "user", "tabs or spaces?", 3, 1000, None)
            .unwrap();
        let query = RecallQuery { query: "tabs".to_string(), scope: RecallScope::Knowledge };
        let out = recall(&storage, &knowledge, &project_id, "sess1", &query).unwrap();
        assert!(out.contains("Long-term Knowledge"));
        assert!(!out.contains("Raw Message Matches"));
    }

    #[test]
    fn raw_preview_truncates_long_content() {
        let long = "x".repeat(RAW_PREVIEW_LEN + 50);
        let preview = super::preview(&long);
        assert_eq!(preview.chars().count(), RAW_PREVIEW_LEN + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn session_scope_excludes_other_sessions_raw_matches() {
        let (_dir, storage, project_id, knowledge) = setup();
        storage
            .store_temporal_message("m0", &project_id, "sess1", "user", "findable marker text", 3, 1000, None)
            .unwrap();
        storage
            .store_temporal_message("m1", &project_id, "sess2", "user", "findable marker text", 3, 1000, None)
            .unwrap();
        let query = RecallQuery { query: "findable marker".to_string(), scope: RecallScope::Session };
        let out = recall(&storage, &knowledge, &project_id, "sess1", &query).unwrap();
        assert_eq!(out.matches("findable marker").count(), 1);
    }
}
