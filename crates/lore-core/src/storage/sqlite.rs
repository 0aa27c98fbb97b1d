//! SQLite storage implementation.
//!
//! Two connections — one writer, one reader — guarded by separate mutexes so
//! reads never block behind a held writer lock any longer than SQLite's own
//! WAL semantics require. All methods take `&self`, making `Storage`
//! `Send + Sync` so callers hold it behind a plain `Arc`.

use chrono::Utc;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::ids::new_id;

// ============================================================================
// ERRORS
// ============================================================================

/// Storage error type.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// I/O error (data directory creation, permissions).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Could not resolve the platform data directory.
    #[error("initialization error: {0}")]
    Init(String),
    /// JSON (de)serialization of a stored column failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage result type.
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// RECORDS
// ============================================================================

/// A row from `temporal_messages`.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalMessageRecord {
    pub id: String,
    pub project_id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tokens: i64,
    pub distilled: bool,
    pub created_at: i64,
    pub metadata: Option<String>,
}

/// A row from `distillations`.
#[derive(Debug, Clone, PartialEq)]
pub struct DistillationRecord {
    pub id: String,
    pub project_id: String,
    pub session_id: String,
    pub observations: String,
    pub source_ids: Vec<String>,
    pub generation: i64,
    pub token_count: i64,
    pub created_at: i64,
}

/// A row from `knowledge`.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeRecord {
    pub id: String,
    pub project_id: Option<String>,
    pub category: String,
    pub title: String,
    pub content: String,
    pub source_session: Option<String>,
    pub cross_project: bool,
    pub confidence: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Result of a `prune` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub ttl_deleted: u64,
    pub cap_deleted: u64,
}

// ============================================================================
// FTS QUERY SANITISER
// ============================================================================

/// Sentinel FTS5 query that matches nothing, used for empty input.
const MATCH_NOTHING: &str = "\"\"";

/// Strip punctuation the FTS5 dialect treats as an operator (hyphens, dots,
/// quotes), split on whitespace, and suffix each token with `*` for prefix
/// matching. Empty input (or input that sanitises to nothing) yields a
/// match-nothing sentinel.
pub fn sanitize_fts5_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .map(|c| match c {
            '-' | '.' | '"' | '\'' => ' ',
            other => other,
        })
        .collect();

    let tokens: Vec<String> = cleaned
        .split_whitespace()
        .filter(|t| !t.is_empty())
        .map(|t| format!("{t}*"))
        .collect();

    if tokens.is_empty() {
        MATCH_NOTHING.to_string()
    } else {
        tokens.join(" ")
    }
}

// ============================================================================
// STORAGE
// ============================================================================

/// Main storage handle.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Storage {
    /// Apply PRAGMAs common to both connections.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    /// Resolve the default database path: `$XDG_DATA_HOME/opencode-lore/lore.db`
    /// (falling back to `$HOME/.local/share/opencode-lore/lore.db`).
    fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "opencode-lore")
            .ok_or_else(|| StorageError::Init("could not determine data directory".to_string()))?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = std::fs::set_permissions(data_dir, perms);
        }

        Ok(data_dir.join("lore.db"))
    }

    /// Open (creating if necessary) the database at `db_path`, or the default
    /// path when `None`. Applies migrations on the writer connection.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => Self::default_db_path()?,
        };

        let writer_conn = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    /// Incremental auto-vacuum step; reclaims freed pages back to the OS.
    /// Safe to call opportunistically (e.g. after a prune).
    pub fn incremental_vacuum(&self) -> Result<()> {
        let writer = self.writer.lock().expect("writer lock poisoned");
        writer.execute_batch("PRAGMA incremental_vacuum;")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    /// Look up or create the project row for `path`, returning its id.
    pub fn ensure_project(&self, path: &Path, name: &str) -> Result<String> {
        let path_str = path.to_string_lossy().to_string();
        let writer = self.writer.lock().expect("writer lock poisoned");

        let existing: Option<String> = writer
            .query_row(
                "SELECT id FROM projects WHERE path = ?1",
                params![path_str],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let id = new_id();
        writer.execute(
            "INSERT INTO projects (id, path, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, path_str, name, Utc::now().timestamp_millis()],
        )?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Temporal store
    // ------------------------------------------------------------------

    /// Insert a new temporal message, or update content/tokens/metadata of an
    /// existing one (never touching `created_at` or `distilled`).
    pub fn store_temporal_message(
        &self,
        id: &str,
        project_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
        tokens: i64,
        created_at: i64,
        metadata: Option<&str>,
    ) -> Result<()> {
        let writer = self.writer.lock().expect("writer lock poisoned");
        writer.execute(
            "INSERT INTO temporal_messages
                (id, project_id, session_id, role, content, tokens, distilled, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                tokens = excluded.tokens,
                metadata = excluded.metadata",
            params![id, project_id, session_id, role, content, tokens, created_at, metadata],
        )?;
        Ok(())
    }

    fn row_to_temporal(row: &rusqlite::Row<'_>) -> rusqlite::Result<TemporalMessageRecord> {
        Ok(TemporalMessageRecord {
            id: row.get(0)?,
            project_id: row.get(1)?,
            session_id: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            tokens: row.get(5)?,
            distilled: row.get::<_, i64>(6)? != 0,
            created_at: row.get(7)?,
            metadata: row.get(8)?,
        })
    }

    const TEMPORAL_COLUMNS: &'static str =
        "id, project_id, session_id, role, content, tokens, distilled, created_at, metadata";

    /// Undistilled messages for a session, ordered by `created_at`.
    pub fn undistilled_messages(&self, session_id: &str) -> Result<Vec<TemporalMessageRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM temporal_messages WHERE session_id = ?1 AND distilled = 0 ORDER BY created_at ASC",
            Self::TEMPORAL_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_temporal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All messages for a session, ordered by `created_at`.
    pub fn messages_by_session(&self, session_id: &str) -> Result<Vec<TemporalMessageRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM temporal_messages WHERE session_id = ?1 ORDER BY created_at ASC",
            Self::TEMPORAL_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_temporal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The most recent `limit` messages for a session, newest first.
    pub fn recent_messages(&self, session_id: &str, limit: u32) -> Result<Vec<TemporalMessageRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM temporal_messages WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            Self::TEMPORAL_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![session_id, limit], Self::row_to_temporal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mark a batch of message ids as distilled.
    pub fn mark_distilled(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer.lock().expect("writer lock poisoned");
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("UPDATE temporal_messages SET distilled = 1 WHERE id IN ({placeholders})");
        let params = rusqlite::params_from_iter(ids.iter());
        writer.execute(&sql, params)?;
        Ok(())
    }

    /// Reset a batch of message ids to undistilled (orphan repair).
    pub fn reset_distilled(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer.lock().expect("writer lock poisoned");
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("UPDATE temporal_messages SET distilled = 0 WHERE id IN ({placeholders})");
        let params = rusqlite::params_from_iter(ids.iter());
        writer.execute(&sql, params)?;
        Ok(())
    }

    /// Ids of every message currently marked `distilled = true` for a session.
    pub fn distilled_message_ids(&self, session_id: &str) -> Result<Vec<String>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let mut stmt = reader.prepare(
            "SELECT id FROM temporal_messages WHERE session_id = ?1 AND distilled = 1",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }

    /// Full-text search over temporal message content, optionally scoped to
    /// one session. Falls back to a case-insensitive substring search if the
    /// FTS engine rejects the sanitised query.
    pub fn search_temporal(
        &self,
        query: &str,
        session_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TemporalMessageRecord>> {
        let sanitized = sanitize_fts5_query(query);
        let reader = self.reader.lock().expect("reader lock poisoned");

        let fts_result: rusqlite::Result<Vec<TemporalMessageRecord>> = (|| {
            let sql = format!(
                "SELECT {cols} FROM temporal_messages
                 WHERE id IN (SELECT id FROM temporal_messages_fts WHERE temporal_messages_fts MATCH ?1)
                 {session_clause}
                 ORDER BY created_at DESC LIMIT ?2",
                cols = Self::TEMPORAL_COLUMNS,
                session_clause = if session_id.is_some() {
                    "AND session_id = ?3"
                } else {
                    ""
                }
            );
            let mut stmt = reader.prepare(&sql)?;
            let rows = if let Some(sid) = session_id {
                stmt.query_map(params![sanitized, limit, sid], Self::row_to_temporal)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            } else {
                stmt.query_map(params![sanitized, limit], Self::row_to_temporal)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            Ok(rows)
        })();

        match fts_result {
            Ok(rows) => Ok(rows),
            Err(_) => {
                let like = format!("%{}%", query.replace('%', ""));
                let sql = format!(
                    "SELECT {cols} FROM temporal_messages WHERE content LIKE ?1 COLLATE NOCASE
                     {session_clause} ORDER BY created_at DESC LIMIT ?2",
                    cols = Self::TEMPORAL_COLUMNS,
                    session_clause = if session_id.is_some() {
                        "AND session_id = ?3"
                    } else {
                        ""
                    }
                );
                let mut stmt = reader.prepare(&sql)?;
                let rows = if let Some(sid) = session_id {
                    stmt.query_map(params![like, limit, sid], Self::row_to_temporal)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                } else {
                    stmt.query_map(params![like, limit], Self::row_to_temporal)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };
                Ok(rows)
            }
        }
    }

    /// Total temporal message count for a session.
    pub fn count_temporal(&self, session_id: &str) -> Result<u64> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM temporal_messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Undistilled temporal message count for a session.
    pub fn undistilled_count(&self, session_id: &str) -> Result<u64> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM temporal_messages WHERE session_id = ?1 AND distilled = 0",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Two-pass prune: TTL-expired distilled rows, then a
    /// size-cap pass if the project's stored content still exceeds
    /// `max_storage_mb`. Undistilled rows are never touched. Counts are taken
    /// before deletion since trigger-driven FTS side effects inflate the
    /// engine's own reported change count.
    pub fn prune(&self, project_id: &str, retention_days: i64, max_storage_mb: u64) -> Result<PruneReport> {
        let writer = self.writer.lock().expect("writer lock poisoned");
        let cutoff = Utc::now().timestamp_millis() - retention_days * 24 * 60 * 60 * 1000;

        let ttl_ids: Vec<String> = {
            let mut stmt = writer.prepare(
                "SELECT id FROM temporal_messages
                 WHERE project_id = ?1 AND distilled = 1 AND created_at < ?2",
            )?;
            stmt.query_map(params![project_id, cutoff], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let ttl_deleted = ttl_ids.len() as u64;
        if !ttl_ids.is_empty() {
            let placeholders = ttl_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM temporal_messages WHERE id IN ({placeholders})");
            writer.execute(&sql, rusqlite::params_from_iter(ttl_ids.iter()))?;
        }

        let max_bytes = max_storage_mb as i64 * 1024 * 1024;
        let total_bytes: i64 = writer.query_row(
            "SELECT COALESCE(SUM(LENGTH(content)), 0) FROM temporal_messages WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;

        let mut cap_deleted = 0u64;
        if total_bytes > max_bytes {
            let mut excess = total_bytes - max_bytes;
            let mut stmt = writer.prepare(
                "SELECT id, LENGTH(content) FROM temporal_messages
                 WHERE project_id = ?1 AND distilled = 1 ORDER BY created_at ASC",
            )?;
            let candidates = stmt
                .query_map(params![project_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            let mut to_delete = Vec::new();
            for (id, size) in candidates {
                if excess <= 0 {
                    break;
                }
                excess -= size;
                to_delete.push(id);
            }
            cap_deleted = to_delete.len() as u64;
            if !to_delete.is_empty() {
                let placeholders = to_delete.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!("DELETE FROM temporal_messages WHERE id IN ({placeholders})");
                writer.execute(&sql, rusqlite::params_from_iter(to_delete.iter()))?;
            }
        }

        Ok(PruneReport {
            ttl_deleted,
            cap_deleted,
        })
    }

    // ------------------------------------------------------------------
    // Distillations
    // ------------------------------------------------------------------

    const DISTILLATION_COLUMNS: &'static str =
        "id, project_id, session_id, observations, source_ids, generation, token_count, created_at";

    fn row_to_distillation(row: &rusqlite::Row<'_>) -> rusqlite::Result<DistillationRecord> {
        let source_ids_raw: String = row.get(4)?;
        let source_ids: Vec<String> = serde_json::from_str(&source_ids_raw).unwrap_or_default();
        Ok(DistillationRecord {
            id: row.get(0)?,
            project_id: row.get(1)?,
            session_id: row.get(2)?,
            observations: row.get(3)?,
            source_ids,
            generation: row.get(5)?,
            token_count: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    /// Insert a new distillation row.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_distillation(
        &self,
        project_id: &str,
        session_id: &str,
        observations: &str,
        source_ids: &[String],
        generation: i64,
        token_count: i64,
        created_at: i64,
    ) -> Result<String> {
        let id = new_id();
        let source_ids_json = serde_json::to_string(source_ids)?;
        let writer = self.writer.lock().expect("writer lock poisoned");
        writer.execute(
            "INSERT INTO distillations
                (id, project_id, session_id, observations, source_ids, generation, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, project_id, session_id, observations, source_ids_json, generation, token_count, created_at],
        )?;
        Ok(id)
    }

    /// Delete a batch of distillation rows (meta-distillation consumption).
    /// Callers run this in the same transaction as the replacement insert.
    pub fn delete_distillations(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let writer = self.writer.lock().expect("writer lock poisoned");
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM distillations WHERE id IN ({placeholders})");
        writer.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Atomically replace a batch of generation-N rows with one new
    /// meta-distillation row.
    pub fn replace_distillations(
        &self,
        consumed_ids: &[String],
        project_id: &str,
        session_id: &str,
        observations: &str,
        source_ids: &[String],
        generation: i64,
        token_count: i64,
        created_at: i64,
    ) -> Result<String> {
        let id = new_id();
        let source_ids_json = serde_json::to_string(source_ids)?;
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        let tx = writer.transaction()?;

        if !consumed_ids.is_empty() {
            let placeholders = consumed_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("DELETE FROM distillations WHERE id IN ({placeholders})");
            tx.execute(&sql, rusqlite::params_from_iter(consumed_ids.iter()))?;
        }

        tx.execute(
            "INSERT INTO distillations
                (id, project_id, session_id, observations, source_ids, generation, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, project_id, session_id, observations, source_ids_json, generation, token_count, created_at],
        )?;

        tx.commit()?;
        Ok(id)
    }

    /// All generation-0 distillations for a session, oldest first.
    pub fn generation_zero_distillations(&self, session_id: &str) -> Result<Vec<DistillationRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM distillations WHERE session_id = ?1 AND generation = 0 ORDER BY created_at ASC",
            Self::DISTILLATION_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_distillation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Highest generation number currently stored for a session (0 if none).
    pub fn max_generation(&self, session_id: &str) -> Result<i64> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let max: Option<i64> = reader.query_row(
            "SELECT MAX(generation) FROM distillations WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    /// Most recent distillation (any generation) for a session.
    pub fn latest_distillation(&self, session_id: &str) -> Result<Option<DistillationRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM distillations WHERE session_id = ?1 ORDER BY created_at DESC LIMIT 1",
            Self::DISTILLATION_COLUMNS
        );
        reader
            .query_row(&sql, params![session_id], Self::row_to_distillation)
            .optional()
            .map_err(StorageError::from)
    }

    /// Every distillation for a session, ordered oldest first (prefix cache rebuild).
    pub fn distillations_for_session(&self, session_id: &str) -> Result<Vec<DistillationRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM distillations WHERE session_id = ?1 ORDER BY created_at ASC",
            Self::DISTILLATION_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_distillation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Last `n` distillations for a session, oldest first (layers 3/4 prefix).
    pub fn last_n_distillations(&self, session_id: &str, n: u32) -> Result<Vec<DistillationRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM distillations WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            Self::DISTILLATION_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let mut rows = stmt
            .query_map(params![session_id, n], Self::row_to_distillation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Every `source_id` referenced by any distillation belonging to a session
    /// (used by orphan repair).
    pub fn referenced_source_ids(&self, session_id: &str) -> Result<std::collections::HashSet<String>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let mut stmt = reader
            .prepare("SELECT source_ids FROM distillations WHERE session_id = ?1")?;
        let mut set = std::collections::HashSet::new();
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for raw in rows {
            if let Ok(ids) = serde_json::from_str::<Vec<String>>(&raw) {
                set.extend(ids);
            }
        }
        Ok(set)
    }

    /// Case-insensitive term-AND match over distillation observations for a session.
    pub fn search_distillations(&self, session_id: &str, query: &str) -> Result<Vec<DistillationRecord>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.distillations_for_session(session_id)?;
        Ok(candidates
            .into_iter()
            .filter(|d| {
                let lower = d.observations.to_lowercase();
                terms.iter().all(|t| lower.contains(t.as_str()))
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Knowledge store
    // ------------------------------------------------------------------

    const KNOWLEDGE_COLUMNS: &'static str =
        "id, project_id, category, title, content, source_session, cross_project, confidence, created_at, updated_at";

    fn row_to_knowledge(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeRecord> {
        Ok(KnowledgeRecord {
            id: row.get(0)?,
            project_id: row.get(1)?,
            category: row.get(2)?,
            title: row.get(3)?,
            content: row.get(4)?,
            source_session: row.get(5)?,
            cross_project: row.get::<_, i64>(6)? != 0,
            confidence: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    /// Find an existing row for `(project_id, lower(title))`.
    pub fn find_knowledge_by_title(
        &self,
        project_id: Option<&str>,
        title: &str,
    ) -> Result<Option<KnowledgeRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM knowledge WHERE lower(title) = lower(?1) AND
             ((?2 IS NULL AND project_id IS NULL) OR project_id = ?2) LIMIT 1",
            Self::KNOWLEDGE_COLUMNS
        );
        reader
            .query_row(&sql, params![title, project_id], Self::row_to_knowledge)
            .optional()
            .map_err(StorageError::from)
    }

    /// Create a knowledge entry, or update-in-place if one with the same
    /// `(project_id, lower(title))` already exists.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_knowledge(
        &self,
        project_id: Option<&str>,
        category: &str,
        title: &str,
        content: &str,
        source_session: Option<&str>,
        cross_project: bool,
        confidence: f64,
    ) -> Result<String> {
        let now = Utc::now().timestamp_millis();

        if let Some(existing) = self.find_knowledge_by_title(project_id, title)? {
            let writer = self.writer.lock().expect("writer lock poisoned");
            writer.execute(
                "UPDATE knowledge SET content = ?1, source_session = ?2, cross_project = ?3,
                 confidence = ?4, updated_at = ?5 WHERE id = ?6",
                params![content, source_session, cross_project as i64, confidence, now, existing.id],
            )?;
            return Ok(existing.id);
        }

        let id = new_id();
        let writer = self.writer.lock().expect("writer lock poisoned");
        writer.execute(
            "INSERT INTO knowledge
                (id, project_id, category, title, content, source_session, cross_project, confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![id, project_id, category, title, content, source_session, cross_project as i64, confidence, now],
        )?;
        Ok(id)
    }

    /// Create a knowledge entry with a caller-supplied id (an id originating
    /// on another machine, round-tripped through the agents file).
    #[allow(clippy::too_many_arguments)]
    pub fn insert_knowledge_with_id(
        &self,
        id: &str,
        project_id: Option<&str>,
        category: &str,
        title: &str,
        content: &str,
        source_session: Option<&str>,
        cross_project: bool,
        confidence: f64,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let writer = self.writer.lock().expect("writer lock poisoned");
        writer.execute(
            "INSERT INTO knowledge
                (id, project_id, category, title, content, source_session, cross_project, confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content, category = excluded.category,
                title = excluded.title, confidence = excluded.confidence, updated_at = excluded.updated_at",
            params![id, project_id, category, title, content, source_session, cross_project as i64, confidence, now],
        )?;
        Ok(())
    }

    /// Fetch one entry by id.
    pub fn get_knowledge(&self, id: &str) -> Result<Option<KnowledgeRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!("SELECT {} FROM knowledge WHERE id = ?1", Self::KNOWLEDGE_COLUMNS);
        reader
            .query_row(&sql, params![id], Self::row_to_knowledge)
            .optional()
            .map_err(StorageError::from)
    }

    /// Delete an entry by id.
    pub fn delete_knowledge(&self, id: &str) -> Result<()> {
        let writer = self.writer.lock().expect("writer lock poisoned");
        writer.execute("DELETE FROM knowledge WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// All rows visible (`confidence > 0.2`) for a project, optionally
    /// including global/cross-project rows, ordered by confidence desc then
    /// `updated_at` desc.
    pub fn knowledge_for_project(
        &self,
        project_id: &str,
        include_cross: bool,
    ) -> Result<Vec<KnowledgeRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {cols} FROM knowledge
             WHERE confidence > 0.2 AND (project_id = ?1 {cross_clause})
             ORDER BY confidence DESC, updated_at DESC",
            cols = Self::KNOWLEDGE_COLUMNS,
            cross_clause = if include_cross {
                "OR (cross_project = 1)"
            } else {
                ""
            }
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![project_id], Self::row_to_knowledge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Project-specific rows only (`cross_project = 0`), any confidence —
    /// used by markdown export, which owns the full history of an entry
    /// regardless of its current visibility.
    pub fn project_specific_knowledge(&self, project_id: &str) -> Result<Vec<KnowledgeRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM knowledge WHERE project_id = ?1 AND cross_project = 0 ORDER BY category, title",
            Self::KNOWLEDGE_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(params![project_id], Self::row_to_knowledge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Cross-project (global) visible rows.
    pub fn cross_project_knowledge(&self) -> Result<Vec<KnowledgeRecord>> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let sql = format!(
            "SELECT {} FROM knowledge WHERE confidence > 0.2 AND cross_project = 1",
            Self::KNOWLEDGE_COLUMNS
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_knowledge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// FTS search over knowledge title+content, falling back to substring `LIKE`.
    pub fn search_knowledge(&self, query: &str, limit: u32) -> Result<Vec<KnowledgeRecord>> {
        let sanitized = sanitize_fts5_query(query);
        let reader = self.reader.lock().expect("reader lock poisoned");

        let fts_result: rusqlite::Result<Vec<KnowledgeRecord>> = (|| {
            let sql = format!(
                "SELECT {cols} FROM knowledge
                 WHERE confidence > 0.2 AND id IN
                    (SELECT id FROM knowledge_fts WHERE knowledge_fts MATCH ?1)
                 ORDER BY confidence DESC LIMIT ?2",
                cols = Self::KNOWLEDGE_COLUMNS
            );
            let mut stmt = reader.prepare(&sql)?;
            let rows = stmt
                .query_map(params![sanitized, limit], Self::row_to_knowledge)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })();

        match fts_result {
            Ok(rows) => Ok(rows),
            Err(_) => {
                let like = format!("%{}%", query.replace('%', ""));
                let sql = format!(
                    "SELECT {} FROM knowledge
                     WHERE confidence > 0.2 AND (title LIKE ?1 COLLATE NOCASE OR content LIKE ?1 COLLATE NOCASE)
                     ORDER BY confidence DESC LIMIT ?2",
                    Self::KNOWLEDGE_COLUMNS
                );
                let mut stmt = reader.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![like, limit], Self::row_to_knowledge)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            }
        }
    }

    /// Soft-retire (`confidence = 0`) every entry whose content exceeds `max_len`.
    pub fn prune_oversized_knowledge(&self, max_len: usize) -> Result<u64> {
        let writer = self.writer.lock().expect("writer lock poisoned");
        let changed = writer.execute(
            "UPDATE knowledge SET confidence = 0, updated_at = ?1 WHERE LENGTH(content) > ?2 AND confidence != 0",
            params![Utc::now().timestamp_millis(), max_len as i64],
        )?;
        Ok(changed as u64)
    }

    // ------------------------------------------------------------------
    // Session state
    // ------------------------------------------------------------------

    /// The persisted one-shot force-escalation layer for a session (0 if unset).
    pub fn force_min_layer(&self, session_id: &str) -> Result<u8> {
        let reader = self.reader.lock().expect("reader lock poisoned");
        let layer: Option<i64> = reader
            .query_row(
                "SELECT force_min_layer FROM session_state WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(layer.unwrap_or(0) as u8)
    }

    /// Persist a force-escalation layer for a session, set by the provider
    /// error handler.
    pub fn set_force_min_layer(&self, session_id: &str, layer: u8) -> Result<()> {
        let writer = self.writer.lock().expect("writer lock poisoned");
        writer.execute(
            "INSERT INTO session_state (session_id, force_min_layer, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET force_min_layer = excluded.force_min_layer, updated_at = excluded.updated_at",
            params![session_id, layer as i64, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Read and clear the persisted force-escalation layer in one step.
    pub fn consume_force_min_layer(&self, session_id: &str) -> Result<u8> {
        let layer = self.force_min_layer(session_id)?;
        if layer != 0 {
            self.set_force_min_layer(session_id, 0)?;
        }
        Ok(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_test_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lore.db");
        let storage = Storage::new(Some(path)).unwrap();
        (dir, storage)
    }

    #[test]
    fn sanitizer_strips_operators_and_suffixes_prefix_star() {
        assert_eq!(sanitize_fts5_query("foo-bar.baz \"quoted\""), "foo*bar*baz* quoted*");
        assert_eq!(sanitize_fts5_query("   "), MATCH_NOTHING);
        assert_eq!(sanitize_fts5_query(""), MATCH_NOTHING);
    }

    #[test]
    fn store_and_retrieve_temporal_message() {
        let (_dir, storage) = open_test_storage();
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        storage
            .store_temporal_message("m1", &project_id, "sess1", "user", "hello", 2, 1000, None)
            .unwrap();
        let undistilled = storage.undistilled_messages("sess1").unwrap();
        assert_eq!(undistilled.len(), 1);
        assert_eq!(undistilled[0].content, "hello");
        assert!(!undistilled[0].distilled);
    }

    #[test]
    fn restoring_existing_message_preserves_created_at_and_distilled() {
        let (_dir, storage) = open_test_storage();
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        storage
            .store_temporal_message("m1", &project_id, "sess1", "user", "hello", 2, 1000, None)
            .unwrap();
        storage.mark_distilled(&["m1".to_string()]).unwrap();
        storage
            .store_temporal_message("m1", &project_id, "sess1", "user", "hello world", 3, 9999, None)
            .unwrap();

        let all = storage.messages_by_session("sess1").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "hello world");
        assert_eq!(all[0].created_at, 1000);
        assert!(all[0].distilled);
    }

    #[test]
    fn prune_never_deletes_undistilled_rows() {
        let (_dir, storage) = open_test_storage();
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        let old = Utc::now().timestamp_millis() - 200 * 24 * 60 * 60 * 1000;

        storage
            .store_temporal_message("d1", &project_id, "sess1", "user", "old distilled", 5, old, None)
            .unwrap();
        storage.mark_distilled(&["d1".to_string()]).unwrap();

        storage
            .store_temporal_message("u1", &project_id, "sess1", "user", "old undistilled", 5, old, None)
            .unwrap();

        let report = storage.prune(&project_id, 120, 1024).unwrap();
        assert_eq!(report.ttl_deleted, 1);

        let remaining = storage.messages_by_session("sess1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "u1");
        assert!(!remaining[0].distilled);
    }

    #[test]
    fn knowledge_upsert_dedups_by_case_insensitive_title() {
        let (_dir, storage) = open_test_storage();
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();

        let id1 = storage
            .upsert_knowledge(Some(&project_id), "style", "Uses Tabs", "yes", None, false, 0.8)
            .unwrap();
        let id2 = storage
            .upsert_knowledge(Some(&project_id), "style", "uses tabs", "actually spaces", None, false, 0.9)
            .unwrap();

        assert_eq!(id1, id2);
        let rows = storage.knowledge_for_project(&project_id, false).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "actually spaces");
    }

    #[test]
    fn knowledge_below_threshold_is_invisible() {
        let (_dir, storage) = open_test_storage();
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        storage
            .upsert_knowledge(Some(&project_id), "style", "low conf", "x", None, false, 0.2)
            .unwrap();
        let rows = storage.knowledge_for_project(&project_id, false).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn force_min_layer_round_trips_and_consumes() {
        let (_dir, storage) = open_test_storage();
        storage.set_force_min_layer("sess1", 2).unwrap();
        assert_eq!(storage.force_min_layer("sess1").unwrap(), 2);
        assert_eq!(storage.consume_force_min_layer("sess1").unwrap(), 2);
        assert_eq!(storage.force_min_layer("sess1").unwrap(), 0);
    }

    #[test]
    fn meta_distillation_replace_is_atomic() {
        let (_dir, storage) = open_test_storage();
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        let gen0a = storage
            .insert_distillation(&project_id, "sess1", "obs a", &["m1".to_string()], 0, 10, 1000)
            .unwrap();
        let gen0b = storage
            .insert_distillation(&project_id, "sess1", "obs b", &["m2".to_string()], 0, 10, 2000)
            .unwrap();

        storage
            .replace_distillations(
                &[gen0a.clone(), gen0b.clone()],
                &project_id,
                "sess1",
                "merged",
                &["m1".to_string(), "m2".to_string()],
                1,
                20,
                3000,
            )
            .unwrap();

        let remaining = storage.distillations_for_session("sess1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].generation, 1);
        assert_eq!(remaining[0].source_ids, vec!["m1".to_string(), "m2".to_string()]);
    }
}
