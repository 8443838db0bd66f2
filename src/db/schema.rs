//! SQL DDL for all Strata tables.
//!
//! Defines `memories`, `memories_fts` (FTS5), `memories_vec` (vec0),
//! `memory_relations`, `leases`, `memory_log`, and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Core memory storage
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    tier TEXT NOT NULL CHECK(tier IN ('working','short_term','long_term')),
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance >= 0.0 AND importance <= 1.0),
    embedding BLOB,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    accessed_at TEXT,
    decay_score REAL CHECK(decay_score IS NULL OR (decay_score >= 0.0 AND decay_score <= 1.0)),
    is_archived INTEGER NOT NULL DEFAULT 0,
    category TEXT,
    episode_id TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_memories_owner_tier ON memories(owner_id, tier, is_archived);
CREATE INDEX IF NOT EXISTS idx_memories_hash ON memories(owner_id, content_hash);

-- Full-text search (BM25)
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    id UNINDEXED,
    content='memories',
    content_rowid='rowid'
);

-- Relationship graph between memories
CREATE TABLE IF NOT EXISTS memory_relations (
    source_id TEXT NOT NULL REFERENCES memories(id),
    target_id TEXT NOT NULL REFERENCES memories(id),
    relation TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, relation)
);

CREATE INDEX IF NOT EXISTS idx_relations_target ON memory_relations(target_id);

-- Leases (distributed mutex)
CREATE TABLE IF NOT EXISTS leases (
    key TEXT PRIMARY KEY,
    expires_at_ms INTEGER NOT NULL
);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// DDL for the KNN index. Partitioned by owner; holds live records only.
pub(crate) fn vec_table_sql(embedding_dim: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(\
            id TEXT PRIMARY KEY, \
            owner_id TEXT PARTITION KEY, \
            embedding FLOAT[{embedding_dim}]\
        );"
    )
}

/// Initialize all schema tables. Idempotent.
///
/// The vec0 table is sized to `embedding_dim`; the dimension is recorded in
/// `schema_meta` on first initialization.
pub fn init_schema(conn: &Connection, embedding_dim: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // vec0 must be created separately (sqlite-vec syntax).
    conn.execute_batch(&vec_table_sql(embedding_dim))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dim', ?1)",
        [embedding_dim.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in ["memories", "memory_relations", "leases", "memory_log", "schema_meta"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 8).unwrap();
        init_schema(&conn, 8).unwrap();
    }

    #[test]
    fn schema_records_embedding_dim() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn, 16).unwrap();
        let dim: String = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(dim, "16");
    }
}
