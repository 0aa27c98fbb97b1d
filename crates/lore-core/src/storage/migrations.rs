//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions, applied in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: projects, temporal messages, distillations, knowledge, session state",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Switch to incremental auto-vacuum (reclaims pages to the OS on delete)",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number.
    pub version: u32,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply. For the vacuum migration this is an empty marker —
    /// `apply_migrations` special-cases that version since `VACUUM` cannot
    /// run inside the implicit statement batch.
    pub up: &'static str,
}

/// V1: base schema.
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS temporal_messages (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tokens INTEGER NOT NULL DEFAULT 0,
    distilled INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_temporal_project ON temporal_messages(project_id);
CREATE INDEX IF NOT EXISTS idx_temporal_session ON temporal_messages(session_id);
CREATE INDEX IF NOT EXISTS idx_temporal_distilled ON temporal_messages(distilled);
CREATE INDEX IF NOT EXISTS idx_temporal_created ON temporal_messages(created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS temporal_messages_fts USING fts5(
    id UNINDEXED,
    content,
    content='temporal_messages',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS temporal_messages_ai AFTER INSERT ON temporal_messages BEGIN
    INSERT INTO temporal_messages_fts(rowid, id, content) VALUES (NEW.rowid, NEW.id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS temporal_messages_ad AFTER DELETE ON temporal_messages BEGIN
    INSERT INTO temporal_messages_fts(temporal_messages_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS temporal_messages_au AFTER UPDATE ON temporal_messages BEGIN
    INSERT INTO temporal_messages_fts(temporal_messages_fts, rowid, id, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content);
    INSERT INTO temporal_messages_fts(rowid, id, content) VALUES (NEW.rowid, NEW.id, NEW.content);
END;

CREATE TABLE IF NOT EXISTS distillations (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    session_id TEXT NOT NULL,
    observations TEXT NOT NULL,
    source_ids TEXT NOT NULL DEFAULT '[]',
    generation INTEGER NOT NULL DEFAULT 0,
    token_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_distillations_project ON distillations(project_id);
CREATE INDEX IF NOT EXISTS idx_distillations_session ON distillations(session_id);
CREATE INDEX IF NOT EXISTS idx_distillations_generation ON distillations(generation);
CREATE INDEX IF NOT EXISTS idx_distillations_created ON distillations(created_at);

CREATE TABLE IF NOT EXISTS knowledge (
    id TEXT PRIMARY KEY,
    project_id TEXT REFERENCES projects(id) ON DELETE CASCADE,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    source_session TEXT,
    cross_project INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_project ON knowledge(project_id);
CREATE INDEX IF NOT EXISTS idx_knowledge_category ON knowledge(category);
CREATE INDEX IF NOT EXISTS idx_knowledge_confidence ON knowledge(confidence);

CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts USING fts5(
    id UNINDEXED,
    title,
    content,
    content='knowledge',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS knowledge_ai AFTER INSERT ON knowledge BEGIN
    INSERT INTO knowledge_fts(rowid, id, title, content) VALUES (NEW.rowid, NEW.id, NEW.title, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_ad AFTER DELETE ON knowledge BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, id, title, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.title, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_au AFTER UPDATE ON knowledge BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, id, title, content)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.title, OLD.content);
    INSERT INTO knowledge_fts(rowid, id, title, content) VALUES (NEW.rowid, NEW.id, NEW.title, NEW.content);
END;

CREATE TABLE IF NOT EXISTS session_state (
    session_id TEXT PRIMARY KEY,
    force_min_layer INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: marker only — `apply_migrations` special-cases this version to flip
/// `auto_vacuum` to incremental mode and run the one-time `VACUUM` that
/// makes the switch take effect, outside any transaction.
const MIGRATION_V2_UP: &str = r#"
UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database.
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations.
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );

            conn.execute_batch(migration.up)?;

            // Incremental auto-vacuum only takes effect for a non-empty database
            // after a VACUUM, which cannot run inside the batch above.
            if migration.version == 2 {
                conn.pragma_update(None, "auto_vacuum", "incremental")?;
                conn.execute_batch("VACUUM;")?;
                tracing::info!("database switched to incremental auto-vacuum via VACUUM");
            }

            applied += 1;
        }
    }

    Ok(applied)
}
