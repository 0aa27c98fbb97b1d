//! Long-term knowledge store (LTM): curated, confidence-weighted, scoped
//! entries with relevance ranking and token-budget packing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::markdown::AgentsFileEntry;
use crate::storage::{KnowledgeRecord, Storage, StorageError};
use crate::temporal::TemporalStore;
use crate::transformer::estimate_tokens_str;

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Content length above which an entry is soft-retired by `pruneOversized`.
pub const OVERSIZED_CONTENT_LEN: usize = 2000;

/// Minimum length of a session-context string before term extraction runs;
/// shorter contexts are treated as "empty".
const MIN_CONTEXT_LEN_FOR_TERMS: usize = 20;

/// Number of most-frequent terms extracted from the session context.
const MAX_QUERY_TERMS: usize = 30;

/// Safety-net size: top-N unmatched project rows included regardless of score.
const SAFETY_NET_SIZE: usize = 5;

/// Fallback size per pool when the session context is empty.
const EMPTY_CONTEXT_FALLBACK_SIZE: usize = 10;

/// Confidence assigned to an entry created purely from an agents-file import
/// (no curator-assigned confidence to carry over).
const AGENTS_FILE_IMPORT_CONFIDENCE: f64 = 0.7;

/// Summary of one [`KnowledgeStore::apply_import`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
}

/// A knowledge entry scored for inclusion in a live prompt.
#[derive(Debug, Clone)]
struct Scored {
    entry: KnowledgeRecord,
    score: f64,
}

/// Long-term knowledge store.
pub struct KnowledgeStore {
    storage: Arc<Storage>,
}

impl KnowledgeStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Create or update-in-place an entry (dedup by `(project_id, lower(title))`).
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        project_id: Option<&str>,
        category: &str,
        title: &str,
        content: &str,
        source_session: Option<&str>,
        cross_project: bool,
        confidence: f64,
    ) -> Result<String> {
        self.storage.upsert_knowledge(
            project_id,
            category,
            title,
            content,
            source_session,
            cross_project,
            confidence.clamp(0.0, 1.0),
        )
    }

    pub fn get(&self, id: &str) -> Result<Option<KnowledgeRecord>> {
        self.storage.get_knowledge(id)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.storage.delete_knowledge(id)
    }

    /// Unconditional dump: all visible rows for a project (+ cross-project if asked).
    pub fn for_project(&self, project_id: &str, include_cross: bool) -> Result<Vec<KnowledgeRecord>> {
        self.storage.knowledge_for_project(project_id, include_cross)
    }

    /// Every project-specific row regardless of confidence, the set the
    /// agents-file round-trip owns — a soft-retired entry still round-trips
    /// rather than silently vanishing from the human file.
    pub fn project_specific(&self, project_id: &str) -> Result<Vec<KnowledgeRecord>> {
        self.storage.project_specific_knowledge(project_id)
    }

    /// Full-text search across visible entries.
    pub fn search(&self, query: &str, limit: u32) -> Result<Vec<KnowledgeRecord>> {
        self.storage.search_knowledge(query, limit)
    }

    /// Soft-retire oversized entries (content longer than `OVERSIZED_CONTENT_LEN`).
    pub fn prune_oversized(&self) -> Result<u64> {
        self.storage.prune_oversized_knowledge(OVERSIZED_CONTENT_LEN)
    }

    /// The live-prompt path: score, apply the project safety net, and
    /// greedy-pack into `max_tokens`.
    pub fn for_session(
        &self,
        project_id: &str,
        session_id: &str,
        temporal: &TemporalStore,
        max_tokens: u64,
    ) -> Result<Vec<KnowledgeRecord>> {
        let project_rows = self.storage.knowledge_for_project(project_id, false)?;
        let cross_rows = self.storage.cross_project_knowledge()?;

        let context = self.session_context(session_id, temporal)?;
        let query_terms = if context.len() >= MIN_CONTEXT_LEN_FOR_TERMS {
            top_terms(&context, MAX_QUERY_TERMS)
        } else {
            Vec::new()
        };

        let context_is_empty = query_terms.is_empty();

        let mut pool: Vec<Scored> = Vec::new();
        let mut matched_project_ids = std::collections::HashSet::new();

        if context_is_empty {
            pool.extend(top_by_confidence(&project_rows, EMPTY_CONTEXT_FALLBACK_SIZE));
            pool.extend(top_by_confidence(&cross_rows, EMPTY_CONTEXT_FALLBACK_SIZE));
        } else {
            for entry in &project_rows {
                let relevance = relevance_score(entry, &query_terms);
                if relevance > 0.0 {
                    matched_project_ids.insert(entry.id.clone());
                    pool.push(Scored {
                        score: relevance * entry.confidence,
                        entry: entry.clone(),
                    });
                }
            }
            for entry in &cross_rows {
                let relevance = relevance_score(entry, &query_terms);
                if relevance > 0.0 {
                    pool.push(Scored {
                        score: relevance * entry.confidence,
                        entry: entry.clone(),
                    });
                }
            }

            // Project safety net: top-5 unmatched project rows by confidence,
            // tagged with a tiny score so coarse term-overlap can't drop them.
            let mut unmatched: Vec<&KnowledgeRecord> = project_rows
                .iter()
                .filter(|e| !matched_project_ids.contains(&e.id))
                .collect();
            unmatched.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
            for entry in unmatched.into_iter().take(SAFETY_NET_SIZE) {
                pool.push(Scored {
                    score: 0.001 * entry.confidence,
                    entry: entry.clone(),
                });
            }
        }

        pool.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        Ok(greedy_pack(pool, max_tokens))
    }

    /// Merge agents-file entries parsed by [`crate::markdown::import`] into
    /// the store, per entry:
    /// - known id, content unchanged: no-op.
    /// - known id, content differs: update in place (a human edit).
    /// - unknown id (present in the file but not in the store, e.g. written
    ///   on another machine): create with that exact id.
    /// - no id: create with a fresh id, but skip if an entry with the same
    ///   (case-insensitive) title already exists for the project.
    pub fn apply_import(&self, project_id: &str, entries: &[AgentsFileEntry]) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for entry in entries {
            match &entry.id {
                Some(id) => match self.storage.get_knowledge(id)? {
                    Some(existing) => {
                        if existing.content != entry.content || existing.title != entry.title || existing.category != entry.category {
                            self.storage.insert_knowledge_with_id(
                                id,
                                Some(project_id),
                                &entry.category,
                                &entry.title,
                                &entry.content,
                                existing.source_session.as_deref(),
                                existing.cross_project,
                                existing.confidence,
                            )?;
                            report.updated += 1;
                        }
                    }
                    None => {
                        self.storage.insert_knowledge_with_id(
                            id,
                            Some(project_id),
                            &entry.category,
                            &entry.title,
                            &entry.content,
                            None,
                            false,
                            AGENTS_FILE_IMPORT_CONFIDENCE,
                        )?;
                        report.created += 1;
                    }
                },
                None => {
                    if self.storage.find_knowledge_by_title(Some(project_id), &entry.title)?.is_some() {
                        report.skipped += 1;
                        continue;
                    }
                    self.storage.upsert_knowledge(
                        Some(project_id),
                        &entry.category,
                        &entry.title,
                        &entry.content,
                        None,
                        false,
                        AGENTS_FILE_IMPORT_CONFIDENCE,
                    )?;
                    report.created += 1;
                }
            }
        }
        Ok(report)
    }

    /// Build the session-context string: the most recent distillation's
    /// observations plus the 10 most recent raw messages.
    fn session_context(&self, session_id: &str, temporal: &TemporalStore) -> Result<String> {
        let latest = self.storage.latest_distillation(session_id)?;
        let mut parts = Vec::new();
        if let Some(d) = latest {
            parts.push(d.observations);
        }
        for message in temporal.recent(session_id, 10)? {
            parts.push(message.content);
        }
        Ok(parts.join("\n"))
    }
}

/// Fraction of `query_terms` present in `lower(title + " " + content)`.
fn relevance_score(entry: &KnowledgeRecord, query_terms: &[String]) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let haystack = format!("{} {}", entry.title, entry.content).to_lowercase();
    let hits = query_terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f64 / query_terms.len() as f64
}

fn top_by_confidence(rows: &[KnowledgeRecord], n: usize) -> Vec<Scored> {
    let mut sorted: Vec<&KnowledgeRecord> = rows.iter().collect();
    sorted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
    sorted
        .into_iter()
        .take(n)
        .map(|entry| Scored {
            score: entry.confidence,
            entry: entry.clone(),
        })
        .collect()
}

/// Extract the top-`n` term-frequency words longer than 3 characters, after
/// punctuation stripping and lowercasing.
fn top_terms(text: &str, n: usize) -> Vec<String> {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in cleaned.split_whitespace() {
        let lower = word.to_lowercase();
        if lower.chars().count() > 3 {
            *counts.entry(lower).or_insert(0) += 1;
        }
    }

    let mut terms: Vec<(String, usize)> = counts.into_iter().collect();
    terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    terms.into_iter().take(n).map(|(t, _)| t).collect()
}

/// Greedy-pack scored entries into `max_tokens`: skip entries that don't fit,
/// but keep trying smaller later ones until the budget is exhausted.
fn greedy_pack(scored: Vec<Scored>, max_tokens: u64) -> Vec<KnowledgeRecord> {
    let mut remaining = max_tokens;
    let mut packed = Vec::new();
    for item in scored {
        let cost = estimate_tokens_str(&item.entry.content) + estimate_tokens_str(&item.entry.title);
        if cost <= remaining {
            remaining -= cost;
            packed.push(item.entry);
        }
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Storage>, String, TemporalStore) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("lore.db"))).unwrap());
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        let temporal = TemporalStore::new(storage.clone());
        (dir, storage, project_id, temporal)
    }

    #[test]
    fn oversized_entries_are_soft_retired_not_deleted() {
        let (_dir, storage, project_id, _temporal) = setup();
        let store = KnowledgeStore::new(storage.clone());
        let long_content = "x".repeat(OVERSIZED_CONTENT_LEN + 1);
        let id = store
            .upsert(Some(&project_id), "notes", "big", &long_content, None, false, 0.9)
            .unwrap();

        let changed = store.prune_oversized().unwrap();
        assert_eq!(changed, 1);

        let entry = store.get(&id).unwrap().unwrap();
        assert_eq!(entry.confidence, 0.0);
    }

    #[test]
    fn for_session_falls_back_to_confidence_when_context_empty() {
        let (_dir, storage, project_id, temporal) = setup();
        let store = KnowledgeStore::new(storage.clone());
        store
            .upsert(Some(&project_id), "style", "a", "alpha", None, false, 0.9)
            .unwrap();
        store
            .upsert(Some(&project_id), "style", "b", "beta", None, false, 0.5)
            .unwrap();

        let packed = store
            .for_session(&project_id, "sess-empty", &temporal, 10_000)
            .unwrap();
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0].title, "a");
    }

    #[test]
    fn greedy_pack_skips_entries_that_overflow_budget() {
        let scored = vec![
            Scored {
                entry: fake_entry("a", "x".repeat(100)),
                score: 1.0,
            },
            Scored {
                entry: fake_entry("b", "y".repeat(5)),
                score: 0.5,
            },
        ];
        let packed = greedy_pack(scored, 10);
        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].title, "b");
    }

    fn fake_entry(title: &str, content: String) -> KnowledgeRecord {
        KnowledgeRecord {
            id: title.to_string(),
            project_id: None,
            category: "test".to_string(),
            title: title.to_string(),
            content,
            source_session: None,
            cross_project: false,
            confidence: 0.8,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn top_terms_filters_short_words_and_ranks_by_frequency() {
        let terms = top_terms("the cat sat on the mat near the cathedral", 5);
        assert!(terms.contains(&"cathedral".to_string()));
        assert!(!terms.iter().any(|t| t == "the" || t == "sat" || t == "mat"));
    }

    #[test]
    fn apply_import_creates_updates_and_skips_per_spec() {
        let (_dir, storage, project_id, _temporal) = setup();
        let store = KnowledgeStore::new(storage.clone());

        let existing_id = store
            .upsert(Some(&project_id), "style", "Existing", "old body", None, false, 0.6)
            .unwrap();
        store
            .upsert(Some(&project_id), "style", "Has A Title", "first writer wins", None, false, 0.6)
            .unwrap();

        let foreign_id = uuid::Uuid::now_v7().to_string();
        let entries = vec![
            // known id, content differs -> update in place
            AgentsFileEntry {
                id: Some(existing_id.clone()),
                category: "style".to_string(),
                title: "Existing".to_string(),
                content: "new body".to_string(),
            },
            // unknown id (from another machine) -> created with that exact id
            AgentsFileEntry {
                id: Some(foreign_id.clone()),
                category: "notes".to_string(),
                title: "From another machine".to_string(),
                content: "hello".to_string(),
            },
            // no id, title already exists for the project -> skipped
            AgentsFileEntry {
                id: None,
                category: "style".to_string(),
                title: "Has A Title".to_string(),
                content: "a hand edit that should not land".to_string(),
            },
            // no id, fresh title -> created with a fresh id
            AgentsFileEntry {
                id: None,
                category: "notes".to_string(),
                title: "Brand New".to_string(),
                content: "content".to_string(),
            },
        ];

        let report = store.apply_import(&project_id, &entries).unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped, 1);

        let updated = store.get(&existing_id).unwrap().unwrap();
        assert_eq!(updated.content, "new body");
        assert_eq!(updated.confidence, 0.6); // confidence untouched by a human content edit

        let foreign = store.get(&foreign_id).unwrap().unwrap();
        assert_eq!(foreign.title, "From another machine");

        let unchanged = store.storage.find_knowledge_by_title(Some(&project_id), "Has A Title").unwrap().unwrap();
        assert_eq!(unchanged.content, "first writer wins");
    }

    #[test]
    fn apply_import_is_a_no_op_when_content_is_unchanged() {
        let (_dir, storage, project_id, _temporal) = setup();
        let store = KnowledgeStore::new(storage.clone());
        let id = store
            .upsert(Some(&project_id), "style", "Same", "body", None, false, 0.9)
            .unwrap();

        let entries = vec![AgentsFileEntry {
            id: Some(id.clone()),
            category: "style".to_string(),
            title: "Same".to_string(),
            content: "body".to_string(),
        }];
        let report = store.apply_import(&project_id, &entries).unwrap();
        assert_eq!(report, ImportReport::default());
    }
}
