//! The storage contract the lifecycle and retrieval core is written against.
//!
//! [`MemoryStore`] is the only shared mutable resource in the system. The core
//! never reaches past this trait; [`crate::db::SqliteStore`] is the bundled
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{Memory, ScoredMemory, Tier};
use crate::error::Result;

/// Optional constraints applied by the search methods.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Restrict hits to these tiers. Empty means all tiers.
    pub tiers: Vec<Tier>,
    /// Include archived records (excluded by default).
    pub include_archived: bool,
    /// Never return these ids.
    pub exclude_ids: Vec<String>,
}

impl SearchFilters {
    pub fn excluding(id: impl Into<String>) -> Self {
        Self {
            exclude_ids: vec![id.into()],
            ..Self::default()
        }
    }

    /// Whether a record passes these filters (owner scoping is the caller's job).
    pub fn admits(&self, memory: &Memory) -> bool {
        if memory.is_archived && !self.include_archived {
            return false;
        }
        if !self.tiers.is_empty() && !self.tiers.contains(&memory.tier) {
            return false;
        }
        !self.exclude_ids.iter().any(|id| id == &memory.id)
    }
}

/// Persistence contract for memory records, relations, leases, and audit entries.
///
/// Every method is scoped to one owner where the signature names one. Archived
/// records are excluded from listings, counts, hash lookups, and searches unless
/// [`SearchFilters::include_archived`] says otherwise.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert a new record. Returns its id.
    async fn create(&self, memory: &Memory) -> Result<String>;

    async fn get(&self, id: &str) -> Result<Option<Memory>>;

    /// Overwrite an existing record. `NotFound` if the id is unknown.
    async fn update(&self, memory: &Memory) -> Result<()>;

    /// Nearest neighbours by cosine similarity, best first, all `>= min_similarity`.
    async fn search_by_vector(
        &self,
        embedding: &[f32],
        owner_id: &str,
        top_k: usize,
        min_similarity: f64,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredMemory>>;

    /// Full-text matches, best first.
    async fn search_by_text(
        &self,
        query: &str,
        owner_id: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredMemory>>;

    /// Non-archived records of one tier, oldest first.
    async fn list_by_tier(&self, owner_id: &str, tier: Tier, limit: usize) -> Result<Vec<Memory>>;

    /// Number of non-archived records in one tier.
    async fn count_by_tier(&self, owner_id: &str, tier: Tier) -> Result<usize>;

    /// Ids of non-archived records carrying `content_hash`, oldest first.
    async fn find_by_hash(&self, content_hash: &str, owner_id: &str) -> Result<Vec<String>>;

    /// Ids directly related to `id` in either direction.
    async fn related_ids(&self, id: &str, limit: usize) -> Result<Vec<String>>;

    /// Record a directed relation. Storing the same triple twice is a no-op.
    async fn add_relation(&self, source_id: &str, target_id: &str, relation: &str) -> Result<()>;

    /// Bump `access_count` and set `accessed_at` for each id.
    async fn record_access(&self, ids: &[String], at: DateTime<Utc>) -> Result<()>;

    /// Atomically insert `consolidated` and overwrite every record in `members`.
    ///
    /// Either all writes land or none do.
    async fn commit_consolidation(&self, consolidated: &Memory, members: &[Memory])
        -> Result<String>;

    /// Atomically overwrite a merge `target` and its archived `source`, and log
    /// the merge against the target.
    ///
    /// Either both records change or neither does.
    async fn commit_merge(&self, target: &Memory, source: &Memory) -> Result<()>;

    /// Create a lease iff none exists under `key`. Returns `false` on conflict.
    async fn create_lease(&self, key: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Delete the lease under `key`, if any.
    async fn delete_lease(&self, key: &str) -> Result<()>;

    /// Delete the lease under `key` only if it expired at or before `now`.
    async fn delete_expired_lease(&self, key: &str, now: DateTime<Utc>) -> Result<()>;

    /// Append an audit entry.
    async fn append_log(
        &self,
        operation: &str,
        memory_id: &str,
        details: Option<&serde_json::Value>,
    ) -> Result<()>;
}
