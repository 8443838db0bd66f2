//! SQLite implementation of [`MemoryStore`].
//!
//! Records live in `memories`; the FTS5 index and the vec0 KNN index are kept in
//! sync on every write. The KNN index is partitioned by owner and holds live
//! records only, so archived or foreign vectors never displace live neighbours.
//! All calls run on the blocking pool against a single shared connection.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::embedding::{cosine_similarity, normalize};
use crate::error::{ensure_unit_interval, MemoryError, Result};
use crate::memory::store::{MemoryStore, SearchFilters};
use crate::memory::types::{Memory, ScoredMemory, Tier};
use crate::memory::{bytes_to_embedding, embedding_to_bytes, l2_distance_to_cosine};

const MEMORY_COLUMNS: &str = "m.id, m.owner_id, m.content, m.content_hash, m.tier, m.importance, \
     m.embedding, m.access_count, m.created_at, m.updated_at, m.accessed_at, m.decay_score, \
     m.is_archived, m.category, m.episode_id, m.tags, m.metadata";
const MEMORY_COLUMN_COUNT: usize = 17;

/// KNN candidates fetched per requested hit, before tier/exclusion filtering.
const KNN_OVERFETCH: usize = 8;
const KNN_MIN_CANDIDATES: usize = 64;
/// sqlite-vec rejects larger `k`.
const KNN_MAX_CANDIDATES: usize = 4096;
const KNN_GROWTH: usize = 4;

/// A [`MemoryStore`] backed by SQLite, FTS5, and sqlite-vec.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    embedding_dim: usize,
}

impl SqliteStore {
    /// Wrap an already-initialized connection.
    pub fn new(conn: Connection, embedding_dim: usize) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            embedding_dim,
        }
    }

    /// Open (or create) an on-disk store.
    pub fn open(path: impl AsRef<Path>, embedding_dim: usize) -> anyhow::Result<Self> {
        let conn = super::open_database(path, embedding_dim)?;
        Ok(Self::new(conn, embedding_dim))
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(embedding_dim: usize) -> anyhow::Result<Self> {
        let conn = super::open_memory_database(embedding_dim)?;
        Ok(Self::new(conn, embedding_dim))
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MemoryError::store("connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await?
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.embedding_dim {
            return Err(MemoryError::validation(format!(
                "embedding has {} dimensions, store expects {}",
                embedding.len(),
                self.embedding_dim
            )));
        }
        Ok(())
    }

    fn validate_record(&self, memory: &Memory) -> Result<()> {
        ensure_unit_interval("importance", memory.importance)?;
        if let Some(score) = memory.decay_score {
            ensure_unit_interval("decay_score", score)?;
        }
        if let Some(ref embedding) = memory.embedding {
            self.check_dim(embedding)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn create(&self, memory: &Memory) -> Result<String> {
        self.validate_record(memory)?;
        let memory = memory.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            insert_memory(&tx, &memory)?;
            write_audit_log(&tx, "create", &memory.id, None)?;
            tx.commit()?;
            Ok(memory.id)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Memory>> {
        let id = id.to_string();
        self.with_conn(move |conn| fetch_memory(conn, &id)).await
    }

    async fn update(&self, memory: &Memory) -> Result<()> {
        self.validate_record(memory)?;
        let memory = memory.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            update_memory(&tx, &memory)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn search_by_vector(
        &self,
        embedding: &[f32],
        owner_id: &str,
        top_k: usize,
        min_similarity: f64,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredMemory>> {
        self.check_dim(embedding)?;
        ensure_unit_interval("min_similarity", min_similarity)?;
        let Some(query) = normalize(embedding) else {
            return Ok(Vec::new());
        };
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let owner_id = owner_id.to_string();
        let filters = filters.clone();

        self.with_conn(move |conn| {
            if filters.include_archived {
                return scan_by_vector(conn, &query, &owner_id, top_k, min_similarity, &filters);
            }

            let query = embedding_to_bytes(&query);
            let mut k = top_k
                .saturating_add(filters.exclude_ids.len())
                .saturating_mul(KNN_OVERFETCH)
                .clamp(KNN_MIN_CANDIDATES, KNN_MAX_CANDIDATES);

            // Tier and exclusion filters apply after the KNN; widen k until
            // enough survive or the owner's partition is exhausted.
            loop {
                let neighbors = knn(conn, &query, &owner_id, k)?;
                let ids: Vec<&str> = neighbors.iter().map(|(id, _)| id.as_str()).collect();
                let mut hydrated = fetch_filtered(conn, &ids, &owner_id, &filters)?;

                let mut results = Vec::new();
                let mut below_floor = false;
                for (id, distance) in &neighbors {
                    let similarity = l2_distance_to_cosine(*distance);
                    // Ordered by distance: everything after this is less similar.
                    if similarity < min_similarity {
                        below_floor = true;
                        break;
                    }
                    if let Some(memory) = hydrated.remove(id) {
                        results.push(ScoredMemory {
                            memory,
                            score: similarity,
                        });
                        if results.len() >= top_k {
                            break;
                        }
                    }
                }

                let exhausted = neighbors.len() < k || k >= KNN_MAX_CANDIDATES;
                if results.len() >= top_k || below_floor || exhausted {
                    return Ok(results);
                }
                k = k.saturating_mul(KNN_GROWTH).min(KNN_MAX_CANDIDATES);
                tracing::debug!(k, found = results.len(), top_k, "widening vector search");
            }
        })
        .await
    }

    async fn search_by_text(
        &self,
        query: &str,
        owner_id: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredMemory>> {
        let match_expr = escape_fts_query(query);
        if match_expr.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let owner_id = owner_id.to_string();
        let filters = filters.clone();

        self.with_conn(move |conn| {
            let mut values = vec![Value::Text(match_expr), Value::Text(owner_id)];
            let clause = filter_clause(&filters, &mut values);
            values.push(Value::Integer(sql_limit(top_k)));
            let limit_idx = values.len();

            let sql = format!(
                "SELECT {MEMORY_COLUMNS}, memories_fts.rank \
                 FROM memories_fts JOIN memories m ON m.rowid = memories_fts.rowid \
                 WHERE memories_fts MATCH ?1 AND m.owner_id = ?2{clause} \
                 ORDER BY memories_fts.rank LIMIT ?{limit_idx}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let results = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    let memory = row_to_memory(row)?;
                    let rank: f64 = row.get(MEMORY_COLUMN_COUNT)?;
                    // FTS5 rank is negative BM25: more negative is better.
                    Ok(ScoredMemory {
                        memory,
                        score: -rank,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(results)
        })
        .await
    }

    async fn list_by_tier(&self, owner_id: &str, tier: Tier, limit: usize) -> Result<Vec<Memory>> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m \
                 WHERE m.owner_id = ?1 AND m.tier = ?2 AND m.is_archived = 0 \
                 ORDER BY m.created_at ASC, m.id ASC LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![owner_id, tier.as_str(), sql_limit(limit)],
                    row_to_memory,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn count_by_tier(&self, owner_id: &str, tier: Tier) -> Result<usize> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memories \
                 WHERE owner_id = ?1 AND tier = ?2 AND is_archived = 0",
                params![owner_id, tier.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn find_by_hash(&self, content_hash: &str, owner_id: &str) -> Result<Vec<String>> {
        let content_hash = content_hash.to_string();
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM memories \
                 WHERE owner_id = ?1 AND content_hash = ?2 AND is_archived = 0 \
                 ORDER BY created_at ASC, id ASC",
            )?;
            let ids = stmt
                .query_map(params![owner_id, content_hash], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn related_ids(&self, id: &str, limit: usize) -> Result<Vec<String>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT target_id FROM memory_relations WHERE source_id = ?1 \
                 UNION \
                 SELECT source_id FROM memory_relations WHERE target_id = ?1 \
                 LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![id, sql_limit(limit)], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn add_relation(&self, source_id: &str, target_id: &str, relation: &str) -> Result<()> {
        let source_id = source_id.to_string();
        let target_id = target_id.to_string();
        let relation = relation.to_string();
        self.with_conn(move |conn| {
            for id in [&source_id, &target_id] {
                let exists: bool = conn.query_row(
                    "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(MemoryError::NotFound(id.clone()));
                }
            }
            conn.execute(
                "INSERT OR IGNORE INTO memory_relations (source_id, target_id, relation, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![source_id, target_id, relation, format_timestamp(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_access(&self, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE memories SET access_count = access_count + 1, accessed_at = ?1 \
                     WHERE id = ?2",
                )?;
                let at = format_timestamp(at);
                for id in &ids {
                    stmt.execute(params![at, id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn commit_consolidation(
        &self,
        consolidated: &Memory,
        members: &[Memory],
    ) -> Result<String> {
        self.validate_record(consolidated)?;
        for member in members {
            self.validate_record(member)?;
        }
        let consolidated = consolidated.clone();
        let members = members.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            insert_memory(&tx, &consolidated)?;
            for member in &members {
                update_memory(&tx, member)?;
            }
            let member_ids: Vec<&str> = members.iter().map(|m| m.id.as_str()).collect();
            write_audit_log(
                &tx,
                "consolidate",
                &consolidated.id,
                Some(&serde_json::json!({ "members": member_ids })),
            )?;
            tx.commit()?;
            Ok(consolidated.id)
        })
        .await
    }

    async fn commit_merge(&self, target: &Memory, source: &Memory) -> Result<()> {
        self.validate_record(target)?;
        self.validate_record(source)?;
        let target = target.clone();
        let source = source.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            update_memory(&tx, &target)?;
            update_memory(&tx, &source)?;
            write_audit_log(
                &tx,
                "merge",
                &target.id,
                Some(&serde_json::json!({
                    "source": source.id,
                    "access_count": target.access_count,
                })),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_lease(&self, key: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO leases (key, expires_at_ms) VALUES (?1, ?2)",
                params![key, expires_at.timestamp_millis()],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn delete_lease(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM leases WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn delete_expired_lease(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM leases WHERE key = ?1 AND expires_at_ms <= ?2",
                params![key, now.timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_log(
        &self,
        operation: &str,
        memory_id: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<()> {
        let operation = operation.to_string();
        let memory_id = memory_id.to_string();
        let details = details.cloned();
        self.with_conn(move |conn| write_audit_log(conn, &operation, &memory_id, details.as_ref()))
            .await
    }
}

// ── Row helpers ──────────────────────────────────────────────────────────────

/// Clamp a caller-supplied count into SQLite's integer range.
fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Fixed-width UTC timestamps so lexical order equals chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {raw:?}: {e}")))
}

fn conversion_error(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into().into(),
    )
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let tier: String = row.get(4)?;
    let embedding: Option<Vec<u8>> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let accessed_at: Option<String> = row.get(10)?;
    let tags: String = row.get(15)?;
    let metadata: String = row.get(16)?;

    Ok(Memory {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        content: row.get(2)?,
        content_hash: row.get(3)?,
        tier: tier.parse().map_err(|e: String| conversion_error(4, e))?,
        importance: row.get(5)?,
        embedding: embedding.map(|bytes| bytes_to_embedding(&bytes)),
        access_count: row.get(7)?,
        created_at: parse_timestamp(8, &created_at)?,
        updated_at: parse_timestamp(9, &updated_at)?,
        accessed_at: accessed_at
            .map(|raw| parse_timestamp(10, &raw))
            .transpose()?,
        decay_score: row.get(11)?,
        is_archived: row.get(12)?,
        category: row.get(13)?,
        episode_id: row.get(14)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(15, e.to_string()))?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| conversion_error(16, e.to_string()))?,
    })
}

fn fetch_memory(conn: &Connection, id: &str) -> Result<Option<Memory>> {
    let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?1");
    Ok(conn.query_row(&sql, params![id], row_to_memory).optional()?)
}

/// Batch-fetch records by id that belong to `owner_id` and pass `filters`.
fn fetch_filtered(
    conn: &Connection,
    ids: &[&str],
    owner_id: &str,
    filters: &SearchFilters,
) -> Result<HashMap<String, Memory>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut values: Vec<Value> = ids.iter().map(|id| Value::Text(id.to_string())).collect();
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    values.push(Value::Text(owner_id.to_string()));
    let owner_idx = values.len();
    let clause = filter_clause(filters, &mut values);

    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m \
         WHERE m.id IN ({}) AND m.owner_id = ?{owner_idx}{clause}",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), row_to_memory)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows.into_iter().map(|m| (m.id.clone(), m)).collect())
}

/// The `k` nearest live vectors in `owner_id`'s partition, nearest first.
fn knn(conn: &Connection, query: &[u8], owner_id: &str, k: usize) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM memories_vec \
         WHERE embedding MATCH ?1 AND owner_id = ?2 AND k = ?3 \
         ORDER BY distance",
    )?;
    let rows = stmt
        .query_map(params![query, owner_id, sql_limit(k)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Exhaustive cosine scan over stored embeddings. Used when archived records
/// are requested, since the KNN index does not hold them.
fn scan_by_vector(
    conn: &Connection,
    query: &[f32],
    owner_id: &str,
    top_k: usize,
    min_similarity: f64,
    filters: &SearchFilters,
) -> Result<Vec<ScoredMemory>> {
    let mut values = vec![Value::Text(owner_id.to_string())];
    let clause = filter_clause(filters, &mut values);
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m \
         WHERE m.owner_id = ?1 AND m.embedding IS NOT NULL{clause}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), row_to_memory)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut results: Vec<ScoredMemory> = rows
        .into_iter()
        .filter_map(|memory| {
            let score = cosine_similarity(query, memory.embedding.as_deref()?);
            (score >= min_similarity).then_some(ScoredMemory { memory, score })
        })
        .collect();
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(top_k);
    Ok(results)
}

/// Build ` AND ...` conditions for `filters`, appending bound values.
fn filter_clause(filters: &SearchFilters, values: &mut Vec<Value>) -> String {
    let mut clause = String::new();
    if !filters.include_archived {
        clause.push_str(" AND m.is_archived = 0");
    }
    if !filters.tiers.is_empty() {
        let placeholders: Vec<String> = filters
            .tiers
            .iter()
            .map(|tier| {
                values.push(Value::Text(tier.as_str().to_string()));
                format!("?{}", values.len())
            })
            .collect();
        clause.push_str(&format!(" AND m.tier IN ({})", placeholders.join(", ")));
    }
    if !filters.exclude_ids.is_empty() {
        let placeholders: Vec<String> = filters
            .exclude_ids
            .iter()
            .map(|id| {
                values.push(Value::Text(id.clone()));
                format!("?{}", values.len())
            })
            .collect();
        clause.push_str(&format!(" AND m.id NOT IN ({})", placeholders.join(", ")));
    }
    clause
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Each whitespace-delimited word is quoted and the words are OR-joined, so
/// BM25 ranks documents matching more terms higher without requiring all.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ── Write helpers ────────────────────────────────────────────────────────────

fn insert_memory(conn: &Connection, memory: &Memory) -> Result<()> {
    let embedding_blob = memory.embedding.as_deref().map(embedding_to_bytes);
    conn.execute(
        "INSERT INTO memories (id, owner_id, content, content_hash, tier, importance, embedding, \
         access_count, created_at, updated_at, accessed_at, decay_score, is_archived, category, \
         episode_id, tags, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            memory.id,
            memory.owner_id,
            memory.content,
            memory.content_hash,
            memory.tier.as_str(),
            memory.importance,
            embedding_blob,
            memory.access_count,
            format_timestamp(memory.created_at),
            format_timestamp(memory.updated_at),
            memory.accessed_at.map(format_timestamp),
            memory.decay_score,
            memory.is_archived,
            memory.category,
            memory.episode_id,
            serde_json::to_string(&memory.tags)?,
            serde_json::to_string(&memory.metadata)?,
        ],
    )?;
    let rowid = conn.last_insert_rowid();

    // FTS5 external content: must reuse the memories rowid.
    conn.execute(
        "INSERT INTO memories_fts (rowid, content, id) VALUES (?1, ?2, ?3)",
        params![rowid, memory.content, memory.id],
    )?;
    insert_vec(conn, memory)?;
    Ok(())
}

fn update_memory(conn: &Connection, memory: &Memory) -> Result<()> {
    let previous: Option<(i64, String, Option<Vec<u8>>, String, bool)> = conn
        .query_row(
            "SELECT rowid, content, embedding, owner_id, is_archived FROM memories WHERE id = ?1",
            params![memory.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    let Some((rowid, old_content, old_embedding, old_owner, was_archived)) = previous else {
        return Err(MemoryError::NotFound(memory.id.clone()));
    };

    let embedding_blob = memory.embedding.as_deref().map(embedding_to_bytes);
    conn.execute(
        "UPDATE memories SET owner_id = ?2, content = ?3, content_hash = ?4, tier = ?5, \
         importance = ?6, embedding = ?7, access_count = ?8, created_at = ?9, updated_at = ?10, \
         accessed_at = ?11, decay_score = ?12, is_archived = ?13, category = ?14, \
         episode_id = ?15, tags = ?16, metadata = ?17 \
         WHERE id = ?1",
        params![
            memory.id,
            memory.owner_id,
            memory.content,
            memory.content_hash,
            memory.tier.as_str(),
            memory.importance,
            embedding_blob,
            memory.access_count,
            format_timestamp(memory.created_at),
            format_timestamp(memory.updated_at),
            memory.accessed_at.map(format_timestamp),
            memory.decay_score,
            memory.is_archived,
            memory.category,
            memory.episode_id,
            serde_json::to_string(&memory.tags)?,
            serde_json::to_string(&memory.metadata)?,
        ],
    )?;

    if old_content != memory.content {
        // External content tables need the old values to delete.
        conn.execute(
            "INSERT INTO memories_fts (memories_fts, rowid, content, id) VALUES ('delete', ?1, ?2, ?3)",
            params![rowid, old_content, memory.id],
        )?;
        conn.execute(
            "INSERT INTO memories_fts (rowid, content, id) VALUES (?1, ?2, ?3)",
            params![rowid, memory.content, memory.id],
        )?;
    }

    if old_embedding != embedding_blob
        || old_owner != memory.owner_id
        || was_archived != memory.is_archived
    {
        conn.execute("DELETE FROM memories_vec WHERE id = ?1", params![memory.id])?;
        insert_vec(conn, memory)?;
    }
    Ok(())
}

/// Index a normalized copy of a live record's embedding. Archived records and
/// zero vectors are not indexed.
fn insert_vec(conn: &Connection, memory: &Memory) -> Result<()> {
    if memory.is_archived {
        return Ok(());
    }
    if let Some(unit) = memory.embedding.as_deref().and_then(normalize) {
        conn.execute(
            "INSERT INTO memories_vec (id, owner_id, embedding) VALUES (?1, ?2, ?3)",
            params![memory.id, memory.owner_id, embedding_to_bytes(&unit)],
        )?;
    }
    Ok(())
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, format_timestamp(Utc::now())],
    )?;
    Ok(())
}
