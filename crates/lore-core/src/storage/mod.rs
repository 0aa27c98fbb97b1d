//! Storage module
//!
//! SQLite-based persistent substrate: WAL mode, foreign keys, incremental
//! auto-vacuum, ordered migrations, and FTS5 full-text search kept in sync
//! via triggers.

mod migrations;
mod sqlite;

pub use migrations::{apply_migrations, get_current_version, Migration, MIGRATIONS};
pub use sqlite::{
    DistillationRecord, KnowledgeRecord, PruneReport, Result, Storage, StorageError,
    TemporalMessageRecord,
};
