//! Tier lifecycle: promotion, decay, archival, and the per-owner job.
//!
//! | From        | To          | Rule (defaults)                                        |
//! |-------------|-------------|--------------------------------------------------------|
//! | `Working`   | `ShortTerm` | age > 30 min, access_count > 5, importance > 0.8       |
//! | `ShortTerm` | `LongTerm`  | importance > 0.9                                       |
//! | `LongTerm`  | -           | terminal                                               |
//! | any         | archived    | no access, importance < 0.3, and age > 90 d or decay < 0.1 |
//!
//! Transitions are single-step and never downgrade. Asking for a transition a
//! record is not eligible for is an [`MemoryError::InvalidTransition`].

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::consolidation::ConsolidationEngine;
use super::dedup::DedupEngine;
use super::lease::LeaseLock;
use super::store::MemoryStore;
use super::types::{clamp_unit, Memory, Tier};
use crate::config::{LifecycleConfig, StrataConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::generation::TextGenerator;

/// `importance * exp(-age_days / half_life_days)`, clamped to `[0, 1]`.
pub fn compute_decay(importance: f64, age_days: f64, half_life_days: f64) -> f64 {
    clamp_unit(importance * (-age_days.max(0.0) / half_life_days).exp())
}

/// Flag a record archived. Callers decide whether the predicate applies.
pub(crate) fn mark_archived(memory: &mut Memory, now: DateTime<Utc>) {
    memory.is_archived = true;
    memory.updated_at = now;
}

/// Per-stage counters from [`LifecycleManager::run_lifecycle_job`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct LifecycleReport {
    pub promoted: usize,
    pub decayed: usize,
    pub archived: usize,
    pub deduplicated: usize,
    pub consolidated: usize,
    pub created: usize,
    /// Consolidation was skipped because another holder had the lease.
    pub consolidation_skipped: bool,
    /// Absorbed failures, one line each.
    pub errors: Vec<String>,
}

pub struct LifecycleManager {
    store: Arc<dyn MemoryStore>,
    dedup: DedupEngine,
    consolidation: ConsolidationEngine,
    lease: LeaseLock,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        generator: Arc<dyn TextGenerator>,
        config: &StrataConfig,
    ) -> Self {
        Self {
            dedup: DedupEngine::new(store.clone(), config.dedup.clone()),
            consolidation: ConsolidationEngine::new(
                store.clone(),
                generator,
                config.consolidation.clone(),
            ),
            lease: LeaseLock::new(store.clone()),
            config: config.lifecycle.clone(),
            store,
        }
    }

    /// Embed consolidated records with `embedder`.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.consolidation = self.consolidation.with_embedder(embedder);
        self
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn consolidation(&self) -> &ConsolidationEngine {
        &self.consolidation
    }

    pub fn lease(&self) -> &LeaseLock {
        &self.lease
    }

    // ── Promotion ────────────────────────────────────────────────────────────

    /// Whether `memory` may move one tier up at `now`.
    pub fn should_promote(&self, memory: &Memory, now: DateTime<Utc>) -> bool {
        if memory.is_archived {
            return false;
        }
        match memory.tier {
            Tier::Working => {
                memory.age(now) > Duration::minutes(self.config.working_min_age_minutes)
                    && memory.access_count > self.config.working_min_access
                    && memory.importance > self.config.working_min_importance
            }
            Tier::ShortTerm => memory.importance > self.config.short_term_min_importance,
            Tier::LongTerm => false,
        }
    }

    /// Move `memory` one tier up in place. Returns the new tier.
    pub fn promote_record(&self, memory: &mut Memory, now: DateTime<Utc>) -> Result<Tier> {
        if memory.is_archived {
            return Err(MemoryError::invalid_transition(
                &memory.id,
                memory.tier,
                "archived memories cannot be promoted",
            ));
        }
        let Some(next) = memory.tier.next() else {
            return Err(MemoryError::invalid_transition(
                &memory.id,
                memory.tier,
                "long_term is the terminal tier",
            ));
        };
        if !self.should_promote(memory, now) {
            return Err(MemoryError::invalid_transition(
                &memory.id,
                memory.tier,
                format!(
                    "not eligible for promotion (age {}m, access_count {}, importance {:.3})",
                    memory.age(now).num_minutes(),
                    memory.access_count,
                    memory.importance
                ),
            ));
        }
        memory.tier = next;
        memory.updated_at = now;
        Ok(next)
    }

    /// Load, promote, and persist one record.
    pub async fn promote(&self, id: &str) -> Result<Memory> {
        let mut memory = self.load(id).await?;
        let from = memory.tier;
        let to = self.promote_record(&mut memory, Utc::now())?;
        self.store.update(&memory).await?;
        self.audit("promote", id, serde_json::json!({ "from": from, "to": to }))
            .await;
        tracing::debug!(id, %from, %to, "memory promoted");
        Ok(memory)
    }

    // ── Decay and archival ───────────────────────────────────────────────────

    pub fn compute_decay(&self, memory: &Memory, now: DateTime<Utc>) -> f64 {
        compute_decay(memory.importance, memory.age_days(now), self.config.half_life_days)
    }

    /// Recompute and cache `decay_score` on `memory`.
    pub fn refresh_decay(&self, memory: &mut Memory, now: DateTime<Utc>) -> f64 {
        let decay = self.compute_decay(memory, now);
        memory.set_decay_score(decay);
        decay
    }

    /// Archival predicate over the cached decay score.
    ///
    /// Unused, unimportant records qualify once they are old or decayed. A
    /// record without a cached score only qualifies through age.
    pub fn should_archive(&self, memory: &Memory, now: DateTime<Utc>) -> bool {
        if memory.is_archived
            || memory.access_count != 0
            || memory.importance >= self.config.archive_max_importance
        {
            return false;
        }
        let old = memory.age(now) > Duration::days(self.config.archive_age_days);
        let decayed = memory
            .decay_score
            .is_some_and(|score| score < self.config.archive_decay_floor);
        old || decayed
    }

    /// Archive one record. Without `force`, decay is refreshed and the
    /// archival predicate must hold. Archiving an archived record is a no-op.
    pub async fn archive(&self, id: &str, force: bool) -> Result<Memory> {
        let mut memory = self.load(id).await?;
        if memory.is_archived {
            return Ok(memory);
        }

        let now = Utc::now();
        if !force {
            let decay = self.refresh_decay(&mut memory, now);
            if !self.should_archive(&memory, now) {
                return Err(MemoryError::invalid_transition(
                    &memory.id,
                    memory.tier,
                    format!(
                        "not eligible for archival (age {}d, access_count {}, importance {:.3}, decay {:.3})",
                        memory.age(now).num_days(),
                        memory.access_count,
                        memory.importance,
                        decay
                    ),
                ));
            }
        }

        mark_archived(&mut memory, now);
        self.store.update(&memory).await?;
        self.audit("archive", id, serde_json::json!({ "force": force })).await;
        Ok(memory)
    }

    // ── Lifecycle job ────────────────────────────────────────────────────────

    /// Promote, decay and archive, deduplicate, then consolidate under the
    /// owner's lease.
    ///
    /// Every stage runs even when an earlier one failed; failures land in
    /// [`LifecycleReport::errors`].
    pub async fn run_lifecycle_job(&self, owner_id: &str) -> Result<LifecycleReport> {
        let mut report = LifecycleReport::default();

        if let Err(e) = self.promote_sweep(owner_id, &mut report).await {
            record_error(&mut report, owner_id, "promote", e);
        }
        if let Err(e) = self.decay_sweep(owner_id, &mut report).await {
            record_error(&mut report, owner_id, "decay", e);
        }

        match self.dedup.dedup_owner(owner_id).await {
            Ok(dedup) => {
                report.deduplicated = dedup.merged;
                if dedup.errors > 0 {
                    report
                        .errors
                        .push(format!("dedup: {} merge(s) failed", dedup.errors));
                }
            }
            Err(e) => record_error(&mut report, owner_id, "dedup", e),
        }

        match self.consolidation.run_guarded(owner_id, false, &self.lease).await {
            Ok(consolidation) => {
                report.consolidated = consolidation.consolidated;
                report.created = consolidation.created;
                report.consolidation_skipped = consolidation.lease_conflict;
                if consolidation.failed_groups > 0 {
                    report.errors.push(format!(
                        "consolidate: {} group(s) failed",
                        consolidation.failed_groups
                    ));
                }
            }
            Err(e) => record_error(&mut report, owner_id, "consolidate", e),
        }

        tracing::info!(
            owner = owner_id,
            promoted = report.promoted,
            decayed = report.decayed,
            archived = report.archived,
            deduplicated = report.deduplicated,
            consolidated = report.consolidated,
            created = report.created,
            errors = report.errors.len(),
            "lifecycle job finished"
        );
        Ok(report)
    }

    /// Promote eligible `Working` then `ShortTerm` records, one step each.
    async fn promote_sweep(&self, owner_id: &str, report: &mut LifecycleReport) -> Result<()> {
        let now = Utc::now();
        let mut promoted: HashSet<String> = HashSet::new();

        for tier in [Tier::Working, Tier::ShortTerm] {
            let records = self
                .store
                .list_by_tier(owner_id, tier, self.config.sweep_limit)
                .await?;
            for mut memory in records {
                if promoted.contains(&memory.id) || !self.should_promote(&memory, now) {
                    continue;
                }
                let from = memory.tier;
                let step = match self.promote_record(&mut memory, now) {
                    Ok(to) => self.store.update(&memory).await.map(|()| to),
                    Err(e) => Err(e),
                };
                match step {
                    Ok(to) => {
                        self.audit("promote", &memory.id, serde_json::json!({ "from": from, "to": to }))
                            .await;
                        promoted.insert(memory.id);
                        report.promoted += 1;
                    }
                    Err(e) => record_error(report, owner_id, "promote", e),
                }
            }
        }
        Ok(())
    }

    /// Refresh decay on every active record, archiving those that qualify.
    async fn decay_sweep(&self, owner_id: &str, report: &mut LifecycleReport) -> Result<()> {
        let now = Utc::now();
        for tier in Tier::ALL {
            let records = self
                .store
                .list_by_tier(owner_id, tier, self.config.sweep_limit)
                .await?;
            for mut memory in records {
                self.refresh_decay(&mut memory, now);
                let archive = self.should_archive(&memory, now);
                if archive {
                    mark_archived(&mut memory, now);
                }
                match self.store.update(&memory).await {
                    Ok(()) => {
                        report.decayed += 1;
                        if archive {
                            report.archived += 1;
                            self.audit(
                                "archive",
                                &memory.id,
                                serde_json::json!({ "force": false, "decay_score": memory.decay_score }),
                            )
                            .await;
                        }
                    }
                    Err(e) => record_error(report, owner_id, "decay", e),
                }
            }
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Memory> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    async fn audit(&self, operation: &str, id: &str, details: serde_json::Value) {
        if let Err(e) = self.store.append_log(operation, id, Some(&details)).await {
            tracing::warn!(operation, id, error = %e, "failed to write audit entry");
        }
    }
}

fn record_error(report: &mut LifecycleReport, owner_id: &str, stage: &str, err: MemoryError) {
    tracing::warn!(owner = owner_id, stage, error = %err, "lifecycle stage failure absorbed");
    report.errors.push(format!("{stage}: {err}"));
}
