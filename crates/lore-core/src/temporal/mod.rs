//! Temporal store: the append-only, full-text-indexed record of every
//! conversation message.

use std::sync::Arc;

use crate::storage::{PruneReport, Storage, StorageError, TemporalMessageRecord};
use crate::types::Message;

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Characters-per-token divisor used for the stored `tokens` column.
///
/// The gradient transformer centralises on `chars/3` for budget estimates;
/// this column is informational only and keeps a separate `chars/4` divisor
/// since nothing downstream depends on its exact value.
pub const STORED_TOKENS_DIVISOR: usize = 4;

/// Estimate a stored-column token count from character length.
pub fn estimate_stored_tokens(content: &str) -> i64 {
    content.chars().count().div_ceil(STORED_TOKENS_DIVISOR).max(1) as i64
}

/// Append-only temporal message log for one project.
pub struct TemporalStore {
    storage: Arc<Storage>,
}

impl TemporalStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Store a message: flattens its parts, drops it if empty, and never
    /// changes `created_at`/`distilled` on re-store.
    pub fn store(&self, project_id: &str, session_id: &str, message: &Message) -> Result<()> {
        let Some(content) = message.flatten_content() else {
            return Ok(());
        };
        let tokens = estimate_stored_tokens(&content);
        let role = match message.role {
            crate::types::Role::User => "user",
            crate::types::Role::Assistant => "assistant",
        };
        self.storage.store_temporal_message(
            &message.id,
            project_id,
            session_id,
            role,
            &content,
            tokens,
            message.created_at,
            None,
        )
    }

    /// Undistilled messages for a session, oldest first.
    pub fn undistilled(&self, session_id: &str) -> Result<Vec<TemporalMessageRecord>> {
        self.storage.undistilled_messages(session_id)
    }

    /// All messages for a session, oldest first.
    pub fn by_session(&self, session_id: &str) -> Result<Vec<TemporalMessageRecord>> {
        self.storage.messages_by_session(session_id)
    }

    /// Most recent `limit` messages for a session, newest first.
    pub fn recent(&self, session_id: &str, limit: u32) -> Result<Vec<TemporalMessageRecord>> {
        self.storage.recent_messages(session_id, limit)
    }

    /// Mark message ids as distilled.
    pub fn mark_distilled(&self, ids: &[String]) -> Result<()> {
        self.storage.mark_distilled(ids)
    }

    /// Full-text search, optionally scoped to a session.
    pub fn search(
        &self,
        query: &str,
        session_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<TemporalMessageRecord>> {
        self.storage.search_temporal(query, session_id, limit)
    }

    /// Total message count for a session.
    pub fn count(&self, session_id: &str) -> Result<u64> {
        self.storage.count_temporal(session_id)
    }

    /// Undistilled message count for a session.
    pub fn undistilled_count(&self, session_id: &str) -> Result<u64> {
        self.storage.undistilled_count(session_id)
    }

    /// Two-pass prune: TTL-expired then size-cap, never touching undistilled rows.
    pub fn prune(&self, project_id: &str, retention_days: i64, max_storage_mb: u64) -> Result<PruneReport> {
        self.storage.prune(project_id, retention_days, max_storage_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessagePart, Role};
    use std::path::Path;
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<Storage>, String) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("lore.db"))).unwrap());
        let project_id = storage.ensure_project(Path::new("/tmp/proj"), "proj").unwrap();
        (dir, storage, project_id)
    }

    #[test]
    fn storing_an_empty_message_is_a_no_op() {
        let (_dir, storage, project_id) = store();
        let temporal = TemporalStore::new(storage);
        let message = Message {
            id: "m1".to_string(),
            role: Role::User,
            parts: vec![MessagePart::StepStart],
            created_at: 1000,
        };
        temporal.store(&project_id, "sess1", &message).unwrap();
        assert_eq!(temporal.count("sess1").unwrap(), 0);
    }

    #[test]
    fn stored_message_is_undistilled_until_marked() {
        let (_dir, storage, project_id) = store();
        let temporal = TemporalStore::new(storage);
        let message = Message {
            id: "m1".to_string(),
            role: Role::User,
            parts: vec![MessagePart::Text {
                text: "hello there".to_string(),
            }],
            created_at: 1000,
        };
        temporal.store(&project_id, "sess1", &message).unwrap();
        assert_eq!(temporal.undistilled_count("sess1").unwrap(), 1);
        temporal.mark_distilled(&["m1".to_string()]).unwrap();
        assert_eq!(temporal.undistilled_count("sess1").unwrap(), 0);
    }

    #[test]
    fn stored_tokens_use_chars_over_four() {
        assert_eq!(estimate_stored_tokens("abcd"), 1);
        assert_eq!(estimate_stored_tokens("abcdefgh"), 2);
        assert_eq!(estimate_stored_tokens(""), 1);
    }
}
