//! Consolidation: merge groups of short-term records into long-term summaries.
//!
//! Each group is all-or-nothing. The generator is called once per group, its
//! output must pass [`parse_merge_response`], and the new record plus the
//! archival of every member are committed in one store transaction. A failed
//! group leaves no trace.
//!
//! Groups run concurrently, capped by a semaphore shared across calls on the
//! same engine. Callers serialize per owner with a lease; see [`run_guarded`].
//!
//! [`run_guarded`]: ConsolidationEngine::run_guarded

use chrono::{DateTime, Duration, Timelike, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::lease::{consolidation_key, LeaseLock, LeaseOutcome};
use super::lifecycle::mark_archived;
use super::store::MemoryStore;
use super::types::{Memory, Tier, META_CONSOLIDATED_FROM, META_CONSOLIDATED_INTO};
use crate::config::ConsolidationConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::generation::{build_merge_prompt, parse_merge_response, TextGenerator};

/// Counters from one consolidation run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsolidationReport {
    /// Short-term population seen when the run started.
    pub population: usize,
    /// Groups of two or more records that were attempted.
    pub groups: usize,
    /// Records archived into a consolidated record.
    pub consolidated: usize,
    /// New long-term records.
    pub created: usize,
    pub failed_groups: usize,
    /// The volume/window trigger did not fire.
    pub not_triggered: bool,
    /// Another process held the owner's consolidation lease.
    pub lease_conflict: bool,
    pub created_ids: Vec<String>,
}

/// Partition by `category`, uncategorized records last, then split each
/// partition into consecutive chunks of at most `max_group_size`.
///
/// Partitions keep first-seen order. Chunks of one record are dropped.
pub fn group_for_consolidation(records: Vec<Memory>, max_group_size: usize) -> Vec<Vec<Memory>> {
    let max_group_size = max_group_size.max(2);
    let mut order: Vec<String> = Vec::new();
    let mut by_category: HashMap<String, Vec<Memory>> = HashMap::new();
    let mut residual: Vec<Memory> = Vec::new();

    for record in records {
        match record.category.clone() {
            Some(category) => {
                if !by_category.contains_key(&category) {
                    order.push(category.clone());
                }
                by_category.entry(category).or_default().push(record);
            }
            None => residual.push(record),
        }
    }

    let mut partitions: Vec<Vec<Memory>> = order
        .into_iter()
        .filter_map(|category| by_category.remove(&category))
        .collect();
    partitions.push(residual);

    let mut groups = Vec::new();
    for partition in partitions {
        let mut rest = partition;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(max_group_size));
            if rest.len() > 1 {
                groups.push(rest);
            }
            rest = tail;
        }
    }
    groups
}

/// Whether `hour` (UTC) falls in the `[start, end)` window, wrapping past midnight.
pub fn in_maintenance_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

pub struct ConsolidationEngine {
    store: Arc<dyn MemoryStore>,
    generator: Arc<dyn TextGenerator>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: ConsolidationConfig,
    semaphore: Arc<Semaphore>,
}

impl ConsolidationEngine {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        generator: Arc<dyn TextGenerator>,
        config: ConsolidationConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            store,
            generator,
            embedder: None,
            config,
            semaphore,
        }
    }

    /// Embed consolidated records so they stay reachable by vector search.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Volume trigger, or the maintenance window with a smaller minimum.
    pub fn should_trigger(&self, population: usize, now: DateTime<Utc>) -> bool {
        if population > self.config.volume_trigger {
            return true;
        }
        in_maintenance_window(
            now.hour(),
            self.config.window_start_hour,
            self.config.window_end_hour,
        ) && population >= self.config.window_min_volume
    }

    /// Merge one group. Returns the new record's id, or `None` for groups of
    /// fewer than two records.
    pub async fn consolidate_group(&self, group: Vec<Memory>) -> Result<Option<String>> {
        if group.len() <= 1 {
            return Ok(None);
        }
        let owner_id = group[0].owner_id.clone();
        for member in &group {
            if member.owner_id != owner_id {
                return Err(MemoryError::invalid_transition(
                    &member.id,
                    member.tier,
                    "consolidation group spans owners",
                ));
            }
            if member.is_archived {
                return Err(MemoryError::invalid_transition(
                    &member.id,
                    member.tier,
                    "archived memories cannot be consolidated",
                ));
            }
        }

        let contents: Vec<&str> = group.iter().map(|m| m.content.as_str()).collect();
        let raw = self.generator.generate(&build_merge_prompt(&contents)).await?;
        let merged = parse_merge_response(&raw)?;

        let now = Utc::now();
        let member_ids: Vec<String> = group.iter().map(|m| m.id.clone()).collect();
        let mut consolidated = Memory::new(&owner_id, merged)
            .with_tier(Tier::LongTerm)
            .with_importance(self.config.importance)
            .with_created_at(now);
        consolidated.category = shared_category(&group);
        for member in &group {
            for tag in &member.tags {
                consolidated.add_tag(tag.clone());
            }
        }
        consolidated.metadata.insert(
            META_CONSOLIDATED_FROM.to_string(),
            serde_json::json!(member_ids),
        );
        consolidated.embedding = self.embed(&consolidated.content).await;

        let members: Vec<Memory> = group
            .into_iter()
            .map(|mut member| {
                mark_archived(&mut member, now);
                member.metadata.insert(
                    META_CONSOLIDATED_INTO.to_string(),
                    serde_json::Value::String(consolidated.id.clone()),
                );
                member
            })
            .collect();

        let id = self.store.commit_consolidation(&consolidated, &members).await?;
        tracing::debug!(owner = %owner_id, id = %id, members = members.len(), "group consolidated");
        Ok(Some(id))
    }

    async fn embed(&self, content: &str) -> Option<Vec<f32>> {
        let embedder = Arc::clone(self.embedder.as_ref()?);
        let text = content.to_string();
        match tokio::task::spawn_blocking(move || embedder.embed(&text)).await {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to embed consolidated memory");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding task failed");
                None
            }
        }
    }

    /// Consolidate the owner's short-term population.
    ///
    /// Unless `force` is set, nothing happens when the trigger does not fire.
    /// Group failures are counted and skipped.
    pub async fn consolidate_memories(
        &self,
        owner_id: &str,
        force: bool,
    ) -> Result<ConsolidationReport> {
        let population = self.store.count_by_tier(owner_id, Tier::ShortTerm).await?;
        let mut report = ConsolidationReport {
            population,
            ..ConsolidationReport::default()
        };

        if !force && !self.should_trigger(population, Utc::now()) {
            tracing::debug!(owner = owner_id, population, "consolidation not triggered");
            report.not_triggered = true;
            return Ok(report);
        }

        let records = self
            .store
            .list_by_tier(owner_id, Tier::ShortTerm, self.config.fetch_limit)
            .await?;
        let groups = group_for_consolidation(records, self.config.max_group_size);
        report.groups = groups.len();

        let runs = groups.into_iter().map(|group| {
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MemoryError::store("consolidation semaphore closed"))?;
                let size = group.len();
                self.consolidate_group(group).await.map(|id| (id, size))
            }
        });

        for outcome in join_all(runs).await {
            match outcome {
                Ok((Some(id), size)) => {
                    report.created += 1;
                    report.consolidated += size;
                    report.created_ids.push(id);
                }
                Ok((None, _)) => {}
                Err(e) => {
                    tracing::warn!(owner = owner_id, error = %e, "consolidation group failed, skipping");
                    report.failed_groups += 1;
                }
            }
        }

        tracing::info!(
            owner = owner_id,
            population,
            groups = report.groups,
            consolidated = report.consolidated,
            created = report.created,
            failed = report.failed_groups,
            "consolidation finished"
        );
        Ok(report)
    }

    /// [`consolidate_memories`](Self::consolidate_memories) under the owner's
    /// lease. A held lease skips the run; the lease is always released.
    pub async fn run_guarded(
        &self,
        owner_id: &str,
        force: bool,
        lease: &LeaseLock,
    ) -> Result<ConsolidationReport> {
        let key = consolidation_key(owner_id);
        let ttl = Duration::seconds(self.config.lease_ttl_secs);
        if let LeaseOutcome::Conflict = lease.acquire(&key, ttl).await? {
            tracing::info!(owner = owner_id, "consolidation lease held elsewhere, skipping cycle");
            return Ok(ConsolidationReport {
                lease_conflict: true,
                ..ConsolidationReport::default()
            });
        }

        let result = self.consolidate_memories(owner_id, force).await;
        if let Err(e) = lease.release(&key).await {
            tracing::warn!(owner = owner_id, error = %e, "failed to release consolidation lease");
        }
        result
    }
}

fn shared_category(group: &[Memory]) -> Option<String> {
    let first = group.first()?.category.as_ref()?;
    group
        .iter()
        .all(|m| m.category.as_ref() == Some(first))
        .then(|| first.clone())
}
