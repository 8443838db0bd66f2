//! Hybrid retrieval: vector KNN + full-text BM25 → weighted RRF → rerank.
//!
//! Every query variant gets one vector fetch and one full-text fetch, all run
//! concurrently. Each (variant, channel) result is its own ranked list; the
//! lists are fused with weighted Reciprocal Rank Fusion, boosted by
//! [`rerank`](super::rerank), and truncated. A failing channel contributes an
//! empty list and is reported in [`SearchResponse::degraded`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::cache::EmbeddingCache;
use super::intent::{classify_intent, QueryIntent};
use super::rerank::{rerank, RerankContext};
use super::store::{MemoryStore, SearchFilters};
use super::types::{Memory, ScoredMemory};
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{ensure_unit_interval, MemoryError, Result};

// ── Public types ──────────────────────────────────────────────────────────────

/// Produces alternative phrasings of a query.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, query: &str) -> anyhow::Result<Vec<String>>;
}

/// Per-channel RRF weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelWeights {
    pub vector: f64,
    pub text: f64,
}

impl ChannelWeights {
    pub fn new(vector: f64, text: f64) -> Self {
        Self { vector, text }
    }

    fn validate(&self) -> Result<()> {
        for (name, w) in [("vector", self.vector), ("text", self.text)] {
            if !(w >= 0.0 && w.is_finite()) {
                return Err(MemoryError::validation(format!(
                    "{name} weight must be a non-negative number, got {w}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub filters: SearchFilters,
    /// Ask the configured [`QueryExpander`] for variants.
    pub expand_query: bool,
    pub rerank: bool,
    /// Anchor for the temporal boost. Defaults to now.
    pub reference_time: Option<DateTime<Utc>>,
    /// Floor applied by the vector channel.
    pub min_similarity: f64,
    /// Bump `access_count`/`accessed_at` on returned records.
    pub track_access: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            filters: SearchFilters::default(),
            expand_query: false,
            rerank: true,
            reference_time: None,
            min_similarity: 0.0,
            track_access: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub owner_id: String,
    /// `None` lets the intent profile (or the configured default) decide.
    pub top_k: Option<usize>,
    /// `None` lets the intent profile (or the configured weights) decide.
    pub weights: Option<ChannelWeights>,
    pub options: SearchOptions,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            owner_id: owner_id.into(),
            top_k: None,
            weights: None,
            options: SearchOptions::default(),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_weights(mut self, weights: ChannelWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }
}

/// One retrieved record.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub memory: Memory,
    /// `fused_score + boost`.
    pub score: f64,
    pub fused_score: f64,
    pub boost: f64,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub intent: QueryIntent,
    pub weights: ChannelWeights,
    pub top_k: usize,
    /// Query variants searched, original first.
    pub variants: Vec<String>,
    /// Channels that failed and were treated as empty.
    pub degraded: Vec<String>,
}

/// One ranked candidate list and the weight of its channel.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub weight: f64,
    pub ids: Vec<String>,
}

// ── Fusion ────────────────────────────────────────────────────────────────────

/// Weighted Reciprocal Rank Fusion.
///
/// Each list contributes `weight / (k + rank + 1)` per id (rank 0-based);
/// repeats within one list only count the first time. Contributions are summed
/// and sorted descending, ties in first-encountered order.
pub fn rrf_fuse(lists: &[RankedList], k: f64) -> Vec<(String, f64)> {
    let mut order: Vec<String> = Vec::new();
    let mut scores: HashMap<String, f64> = HashMap::new();

    for list in lists {
        let mut seen: HashSet<&str> = HashSet::new();
        let ranked = list.ids.iter().filter(|id| seen.insert(id.as_str()));
        for (rank, id) in ranked.enumerate() {
            let contribution = list.weight / (k + rank as f64 + 1.0);
            match scores.get_mut(id) {
                Some(score) => *score += contribution,
                None => {
                    order.push(id.clone());
                    scores.insert(id.clone(), contribution);
                }
            }
        }
    }

    let mut fused: Vec<(String, f64)> = order
        .into_iter()
        .map(|id| {
            let score = scores[&id];
            (id, score)
        })
        .collect();
    // Stable: equal scores keep first-encountered order.
    fused.sort_by(|a, b| b.1.total_cmp(&a.1));
    fused
}

// ── Retriever ─────────────────────────────────────────────────────────────────

pub struct HybridRetriever {
    store: Arc<dyn MemoryStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    expander: Option<Arc<dyn QueryExpander>>,
    cache: Option<Arc<EmbeddingCache>>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(store: Arc<dyn MemoryStore>, config: RetrievalConfig) -> Self {
        Self {
            store,
            embedder: None,
            expander: None,
            cache: None,
            config,
        }
    }

    /// Without an embedder only the full-text channel runs.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if request.top_k == Some(0) {
            return Err(MemoryError::validation("top_k must be greater than 0"));
        }
        if let Some(weights) = request.weights {
            weights.validate()?;
        }
        ensure_unit_interval("min_similarity", request.options.min_similarity)?;

        let intent = classify_intent(&request.query);
        let adaptive = self.config.adaptive_intent;
        let profile = intent.profile();
        let weights = request.weights.unwrap_or(if adaptive {
            ChannelWeights::new(profile.vector_weight, profile.text_weight)
        } else {
            ChannelWeights::new(self.config.vector_weight, self.config.text_weight)
        });
        let top_k = request.top_k.unwrap_or(match (adaptive, profile.top_k) {
            (true, Some(k)) => k,
            _ => self.config.default_top_k,
        });
        let use_graph = adaptive && profile.use_graph;

        let mut response = SearchResponse {
            results: Vec::new(),
            intent,
            weights,
            top_k,
            variants: Vec::new(),
            degraded: Vec::new(),
        };
        if request.query.trim().is_empty() {
            return Ok(response);
        }

        response.variants = self.variants(request).await;
        let fetch = top_k.saturating_mul(2);
        let owner_id = request.owner_id.as_str();
        let options = &request.options;

        let vector_runs = response.variants.iter().map(|variant| async move {
            let Some(embedding) = self.embed_query(variant).await? else {
                return Ok(Vec::new());
            };
            let hits = self
                .store
                .search_by_vector(&embedding, owner_id, fetch, options.min_similarity, &options.filters)
                .await?;
            anyhow::Ok(hits)
        });
        let text_runs = response.variants.iter().map(|variant| async move {
            let hits = self
                .store
                .search_by_text(variant, owner_id, fetch, &options.filters)
                .await?;
            anyhow::Ok(hits)
        });
        let (vector_lists, text_lists) = futures::join!(join_all(vector_runs), join_all(text_runs));

        let mut memories: HashMap<String, Memory> = HashMap::new();
        let mut lists: Vec<RankedList> = Vec::new();
        for (i, (vector, text)) in vector_lists.into_iter().zip(text_lists).enumerate() {
            for (channel, weight, outcome) in [("vector", weights.vector, vector), ("text", weights.text, text)] {
                let hits = match outcome {
                    Ok(hits) => hits,
                    Err(e) => {
                        tracing::warn!(owner = owner_id, channel, variant = i, error = %e, "search channel failed, treating as empty");
                        response.degraded.push(format!("{channel}[{i}]: {e}"));
                        Vec::new()
                    }
                };
                lists.push(collect_list(weight, hits, &mut memories));
            }
        }

        let fused = rrf_fuse(&lists, self.config.rrf_k as f64);
        let mut results: Vec<SearchResult> = fused
            .into_iter()
            .filter_map(|(id, fused_score)| {
                memories.remove(&id).map(|memory| SearchResult {
                    memory,
                    score: fused_score,
                    fused_score,
                    boost: 0.0,
                })
            })
            .collect();

        if options.rerank && !results.is_empty() {
            let graph_neighbors = if use_graph {
                self.neighbors(&results[0].memory.id).await
            } else {
                HashSet::new()
            };
            let ctx = RerankContext {
                query: &request.query,
                reference_time: options.reference_time.unwrap_or_else(Utc::now),
                proximity_window: self.config.proximity_window,
                graph_neighbors,
            };
            results = rerank(results, &ctx);
        }
        results.truncate(top_k);

        if options.track_access && !results.is_empty() {
            let ids: Vec<String> = results.iter().map(|r| r.memory.id.clone()).collect();
            if let Err(e) = self.store.record_access(&ids, Utc::now()).await {
                tracing::warn!(owner = owner_id, error = %e, "failed to record access");
            }
        }

        tracing::debug!(
            owner = owner_id,
            ?intent,
            top_k,
            variants = response.variants.len(),
            results = results.len(),
            degraded = response.degraded.len(),
            "hybrid search done"
        );
        response.results = results;
        Ok(response)
    }

    /// The original query first, then distinct expansions up to the variant cap.
    async fn variants(&self, request: &SearchRequest) -> Vec<String> {
        let mut variants = vec![request.query.clone()];
        let Some(expander) = self.expander.as_ref().filter(|_| request.options.expand_query) else {
            return variants;
        };
        match expander.expand(&request.query).await {
            Ok(expanded) => {
                for variant in expanded {
                    if variants.len() >= self.config.max_query_variants {
                        break;
                    }
                    let variant = variant.trim().to_string();
                    if !variant.is_empty() && !variants.contains(&variant) {
                        variants.push(variant);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "query expansion failed, searching original only");
            }
        }
        variants
    }

    /// Embed a query through the cache. `None` when no embedder is configured.
    ///
    /// The cache is the only thing sharing embed calls between variants: variants
    /// run concurrently, so with a cold or disabled cache each one embeds on its own.
    async fn embed_query(&self, text: &str) -> anyhow::Result<Option<Vec<f32>>> {
        let Some(embedder) = self.embedder.clone() else {
            return Ok(None);
        };
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(text)) {
            return Ok(Some(hit));
        }

        let owned = text.to_string();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&owned)).await??;
        if let Some(cache) = &self.cache {
            cache.insert(text, embedding.clone());
        }
        Ok(Some(embedding))
    }

    async fn neighbors(&self, id: &str) -> HashSet<String> {
        match self.store.related_ids(id, self.config.neighbor_limit).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                tracing::warn!(id, error = %e, "graph neighbour lookup failed");
                HashSet::new()
            }
        }
    }
}

/// Turn one channel's hits into a ranked id list, keeping the first copy of
/// each record.
fn collect_list(
    weight: f64,
    hits: Vec<ScoredMemory>,
    memories: &mut HashMap<String, Memory>,
) -> RankedList {
    let ids = hits
        .into_iter()
        .map(|hit| {
            let id = hit.memory.id.clone();
            memories.entry(id.clone()).or_insert(hit.memory);
            id
        })
        .collect();
    RankedList { weight, ids }
}
