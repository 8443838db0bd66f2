//! Exact and semantic duplicate detection, and merging.
//!
//! Decision order for a single record:
//!
//! | Step | Check                               | Outcome                     |
//! |------|-------------------------------------|-----------------------------|
//! | 1    | same `(content, owner)` hash        | exact duplicate, sim = 1.0  |
//! | 2    | has embedding, top-1 sim ≥ threshold| semantic duplicate          |
//! | 3    | otherwise                           | unique                      |
//!
//! A record is never a duplicate of itself, and archived records are never
//! matched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::lifecycle::mark_archived;
use super::store::{MemoryStore, SearchFilters};
use super::types::{Memory, Tier, META_DUPLICATE_OF, META_MERGED_FROM};
use crate::config::DedupConfig;
use crate::embedding::cosine_similarity;
use crate::error::{ensure_unit_interval, MemoryError, Result};

/// SHA-256 of `content || 0x00 || owner_id`, lower-hex.
pub fn compute_hash(content: &str, owner_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update([0u8]);
    hasher.update(owner_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether `similarity` counts as a duplicate at `threshold`. Inclusive.
pub fn meets_threshold(similarity: f64, threshold: f64) -> bool {
    similarity >= threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    Exact,
    Semantic,
}

/// An existing record the candidate duplicates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub id: String,
    pub similarity: f64,
    pub kind: DuplicateKind,
}

/// Counters from one batch dedup pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DedupReport {
    pub checked: usize,
    pub merged: usize,
    pub errors: usize,
}

impl DedupReport {
    fn absorb(&mut self, other: DedupReport) {
        self.checked += other.checked;
        self.merged += other.merged;
        self.errors += other.errors;
    }
}

/// Fold `source` into `target` and archive `source`.
///
/// Access counts add, tags union, metadata keys missing on `target` are copied,
/// `merged_from` accumulates, and `target.updated_at` advances to the later of
/// the two. Self-merges, cross-owner merges, and archived parties are rejected.
pub fn apply_merge(target: &mut Memory, source: &mut Memory, now: DateTime<Utc>) -> Result<()> {
    if target.id == source.id {
        return Err(MemoryError::invalid_transition(
            &source.id,
            source.tier,
            "cannot merge a memory into itself",
        ));
    }
    if target.owner_id != source.owner_id {
        return Err(MemoryError::invalid_transition(
            &source.id,
            source.tier,
            format!("cannot merge across owners ({} into {})", source.owner_id, target.owner_id),
        ));
    }
    for party in [&*target, &*source] {
        if party.is_archived {
            return Err(MemoryError::invalid_transition(
                &party.id,
                party.tier,
                "archived memories cannot take part in a merge",
            ));
        }
    }

    target.access_count = target.access_count.saturating_add(source.access_count);
    for tag in &source.tags {
        target.add_tag(tag.clone());
    }
    for (key, value) in &source.metadata {
        if key != META_MERGED_FROM && !target.metadata.contains_key(key) {
            target.metadata.insert(key.clone(), value.clone());
        }
    }

    let mut merged_from = merged_ids(target);
    for id in merged_ids(source).into_iter().chain([source.id.clone()]) {
        if !merged_from.contains(&id) {
            merged_from.push(id);
        }
    }
    target
        .metadata
        .insert(META_MERGED_FROM.to_string(), serde_json::json!(merged_from));
    target.updated_at = target.updated_at.max(source.updated_at);

    mark_archived(source, now);
    source.metadata.insert(
        META_DUPLICATE_OF.to_string(),
        serde_json::Value::String(target.id.clone()),
    );
    Ok(())
}

fn merged_ids(memory: &Memory) -> Vec<String> {
    memory
        .metadata
        .get(META_MERGED_FROM)
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub struct DedupEngine {
    store: Arc<dyn MemoryStore>,
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn MemoryStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// First non-archived record of `owner_id` with `content_hash`, skipping `exclude_id`.
    pub async fn check_exact_duplicate(
        &self,
        content_hash: &str,
        owner_id: &str,
        exclude_id: Option<&str>,
    ) -> Result<Option<String>> {
        let ids = self.store.find_by_hash(content_hash, owner_id).await?;
        Ok(ids.into_iter().find(|id| Some(id.as_str()) != exclude_id))
    }

    /// Nearest non-archived neighbour with similarity `>= threshold`, if any.
    pub async fn check_semantic_duplicate(
        &self,
        embedding: &[f32],
        owner_id: &str,
        threshold: f64,
        exclude_id: Option<&str>,
    ) -> Result<Option<DuplicateMatch>> {
        ensure_unit_interval("threshold", threshold)?;
        let filters = match exclude_id {
            Some(id) => SearchFilters::excluding(id),
            None => SearchFilters::default(),
        };
        let hits = self
            .store
            .search_by_vector(embedding, owner_id, 1, threshold, &filters)
            .await?;

        Ok(hits
            .into_iter()
            .find(|hit| meets_threshold(hit.score, threshold))
            .map(|hit| DuplicateMatch {
                id: hit.memory.id,
                similarity: hit.score,
                kind: DuplicateKind::Semantic,
            }))
    }

    /// Exact check first; semantic check (global threshold) only if that misses.
    pub async fn check_duplicate(&self, memory: &Memory) -> Result<Option<DuplicateMatch>> {
        if let Some(id) = self
            .check_exact_duplicate(&memory.content_hash, &memory.owner_id, Some(&memory.id))
            .await?
        {
            return Ok(Some(DuplicateMatch {
                id,
                similarity: 1.0,
                kind: DuplicateKind::Exact,
            }));
        }

        match memory.embedding {
            Some(ref embedding) => {
                self.check_semantic_duplicate(
                    embedding,
                    &memory.owner_id,
                    self.config.global_threshold,
                    Some(&memory.id),
                )
                .await
            }
            None => Ok(None),
        }
    }

    /// Load both records, merge `source_id` into `target_id`, and persist.
    pub async fn merge(&self, target_id: &str, source_id: &str) -> Result<Memory> {
        let mut target = self.load(target_id).await?;
        let mut source = self.load(source_id).await?;
        self.merge_records(&mut target, &mut source).await?;
        Ok(target)
    }

    async fn merge_records(&self, target: &mut Memory, source: &mut Memory) -> Result<()> {
        apply_merge(target, source, Utc::now())?;
        self.store.commit_merge(target, source).await?;
        tracing::debug!(target = %target.id, source = %source.id, "merged duplicate");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Memory> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    /// Batch dedup over the oldest `batch_window` records of one tier.
    ///
    /// Each record is compared only with the records after it; the older record
    /// is always the merge target.
    pub async fn dedup_tier_window(&self, owner_id: &str, tier: Tier) -> Result<DedupReport> {
        let mut window = self
            .store
            .list_by_tier(owner_id, tier, self.config.batch_window)
            .await?;
        let mut report = DedupReport {
            checked: window.len(),
            ..DedupReport::default()
        };

        for i in 0..window.len() {
            for j in (i + 1)..window.len() {
                if window[i].is_archived || window[j].is_archived {
                    continue;
                }
                if !self.is_batch_duplicate(&window[i], &window[j]) {
                    continue;
                }

                let (head, tail) = window.split_at_mut(j);
                let (target, source) = (&mut head[i], &mut tail[0]);
                let (target_before, source_before) = (target.clone(), source.clone());
                match self.merge_records(target, source).await {
                    Ok(()) => report.merged += 1,
                    Err(e) => {
                        tracing::warn!(
                            owner = owner_id,
                            target = %target.id,
                            source = %source.id,
                            error = %e,
                            "batch merge failed, skipping pair"
                        );
                        *target = target_before;
                        *source = source_before;
                        report.errors += 1;
                    }
                }
            }
        }

        tracing::debug!(owner = owner_id, %tier, merged = report.merged, "tier dedup pass done");
        Ok(report)
    }

    /// Batch dedup over every tier of one owner.
    pub async fn dedup_owner(&self, owner_id: &str) -> Result<DedupReport> {
        let mut report = DedupReport::default();
        for tier in Tier::ALL {
            report.absorb(self.dedup_tier_window(owner_id, tier).await?);
        }
        Ok(report)
    }

    fn is_batch_duplicate(&self, older: &Memory, newer: &Memory) -> bool {
        if older.content_hash == newer.content_hash {
            return true;
        }
        match (&older.embedding, &newer.embedding) {
            (Some(a), Some(b)) => meets_threshold(cosine_similarity(a, b), self.config.batch_threshold),
            _ => false,
        }
    }
}
