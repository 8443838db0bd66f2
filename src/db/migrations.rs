//! Forward-only schema migration framework.
//!
//! Tracks the schema version in `schema_meta` and runs sequential migrations
//! to bring the database up to [`CURRENT_SCHEMA_VERSION`].

use rusqlite::{params, Connection};

use crate::embedding::normalize;
use crate::memory::{bytes_to_embedding, embedding_to_bytes};

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

fn update_schema_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE schema_meta SET value = ?1 WHERE key = 'schema_version'",
        [version.to_string()],
    )?;
    Ok(())
}

/// Get the embedding dimension the vector table was created with, if recorded.
pub fn get_embedding_dim(conn: &Connection) -> rusqlite::Result<Option<usize>> {
    match conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
        [],
        |row| row.get::<_, String>(0),
    ) {
        Ok(val) => Ok(val.parse::<usize>().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Run any pending forward-only migrations. Each migration runs in a transaction.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let mut version = get_schema_version(conn)?;
    tracing::debug!(schema_version = version, target = CURRENT_SCHEMA_VERSION, "checking migrations");

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "running migration");

        let tx = conn.transaction()?;
        match next {
            2 => migrate_v1_to_v2(&tx)?,
            3 => migrate_v2_to_v3(&tx)?,
            _ => {
                tracing::error!(version = next, "unknown migration target");
                break;
            }
        }
        update_schema_version(&tx, next)?;
        tx.commit()?;
        version = next;
    }

    Ok(())
}

/// Migration v1 → v2: index the audit log by memory and leases by expiry.
fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_log_memory ON memory_log(memory_id);
         CREATE INDEX IF NOT EXISTS idx_leases_expiry ON leases(expires_at_ms);",
    )
}

/// Migration v2 → v3: rebuild the KNN index partitioned by owner, holding only
/// live records.
fn migrate_v2_to_v3(conn: &Connection) -> rusqlite::Result<()> {
    let dim = get_embedding_dim(conn)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    conn.execute_batch("DROP TABLE IF EXISTS memories_vec;")?;
    conn.execute_batch(&super::schema::vec_table_sql(dim))?;

    let rows: Vec<(String, String, Vec<u8>)> = conn
        .prepare(
            "SELECT id, owner_id, embedding FROM memories \
             WHERE is_archived = 0 AND embedding IS NOT NULL",
        )?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut insert =
        conn.prepare("INSERT INTO memories_vec (id, owner_id, embedding) VALUES (?1, ?2, ?3)")?;
    let mut indexed = 0usize;
    for (id, owner_id, blob) in rows {
        let embedding = bytes_to_embedding(&blob);
        if embedding.len() != dim {
            tracing::warn!(%id, len = embedding.len(), dim, "skipping embedding with wrong dimension");
            continue;
        }
        if let Some(unit) = normalize(&embedding) {
            insert.execute(params![id, owner_id, embedding_to_bytes(&unit)])?;
            indexed += 1;
        }
    }
    tracing::info!(indexed, "rebuilt vector index");
    Ok(())
}
