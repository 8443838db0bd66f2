pub mod migrations;
pub mod schema;
pub mod store;

pub use store::SqliteStore;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the Strata database at the given path, with all extensions
/// loaded, schema initialized, and migrations applied.
///
/// Fails if the database was created with a different embedding dimension.
pub fn open_database(path: impl AsRef<Path>, embedding_dim: usize) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // WAL lets the lifecycle job and searches from other processes interleave.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    schema::init_schema(&conn, embedding_dim).context("failed to initialize schema")?;
    check_embedding_dim(&conn, embedding_dim)?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), embedding_dim, "database initialized");
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database(embedding_dim: usize) -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn, embedding_dim).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;
    Ok(conn)
}

fn check_embedding_dim(conn: &Connection, expected: usize) -> Result<()> {
    match migrations::get_embedding_dim(conn)? {
        Some(stored) if stored != expected => bail!(
            "database was created with embedding dimension {stored}, configured {expected}"
        ),
        _ => Ok(()),
    }
}
