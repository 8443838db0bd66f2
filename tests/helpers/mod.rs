#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata::config::StrataConfig;
use strata::embedding::EmbeddingProvider;
use strata::generation::{GenerationError, TextGenerator};
use strata::memory::types::ScoredMemory;
use strata::{Memory, MemoryError, MemoryStore, SearchFilters, SqliteStore, Tier};

/// Embedding width used by every integration test.
pub const DIM: usize = 8;

/// Fresh in-memory store with the full schema.
pub fn test_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory(DIM).expect("in-memory store"))
}

/// Default config with consolidation only firing on volume.
///
/// An empty maintenance window keeps results independent of the wall clock.
pub fn test_config() -> StrataConfig {
    let mut config = StrataConfig::default();
    config.storage.embedding_dim = DIM;
    config.consolidation.window_start_hour = 0;
    config.consolidation.window_end_hour = 0;
    config
}

/// Unit vector along axis `i % DIM`.
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i % DIM] = 1.0;
    v
}

/// Axis `i` tilted slightly toward axis `i + 1`.
pub fn near_axis(i: usize, tilt: f32) -> Vec<f32> {
    let mut v = axis(i);
    v[(i + 1) % DIM] = tilt;
    v
}

/// Store a record and return it as written.
pub async fn insert(store: &SqliteStore, memory: Memory) -> Memory {
    store.create(&memory).await.expect("create");
    memory
}

pub async fn fetch(store: &SqliteStore, id: &str) -> Memory {
    store.get(id).await.expect("get").expect("record exists")
}

// ── Embedder ────────────────────────────────────────────────────────────────

/// Bag-of-words embedder: each lowercase word adds 1.0 to bucket
/// `sum(bytes) % DIM`. Deterministic, so texts sharing words share direction.
#[derive(Default)]
pub struct BucketEmbedder {
    pub calls: AtomicUsize,
}

impl BucketEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn bucket_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let bucket = word.bytes().map(usize::from).sum::<usize>() % DIM;
        v[bucket] += 1.0;
    }
    v
}

impl EmbeddingProvider for BucketEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(bucket_embedding(text))
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

pub struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("embedding backend offline")
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

// ── Generator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorMode {
    /// "summary N of K memories", numbered per call.
    Summarize,
    Fail,
    /// Opens a code fence and never closes it.
    Malformed,
}

/// Scripted merge generator that counts calls and peak concurrency.
pub struct MockGenerator {
    mode: GeneratorMode,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockGenerator {
    pub fn new(mode: GeneratorMode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn summarizing() -> Arc<Self> {
        Arc::new(Self::new(GeneratorMode::Summarize))
    }

    /// Hold each call open for `delay` so overlapping calls are observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.mode {
            GeneratorMode::Summarize => {
                let members = prompt
                    .lines()
                    .filter(|l| l.split_once(". ").is_some_and(|(n, _)| n.parse::<usize>().is_ok()))
                    .count();
                Ok(format!("summary {n} of {members} memories"))
            }
            GeneratorMode::Fail => Err(GenerationError::Backend("model unavailable".into())),
            GeneratorMode::Malformed => Ok("```text\nhalf an answer".into()),
        }
    }
}

// ── Store wrapper ───────────────────────────────────────────────────────────

/// Delegates to a [`SqliteStore`] but can fail either search channel.
pub struct FlakyStore {
    pub inner: Arc<SqliteStore>,
    pub fail_vector: AtomicBool,
    pub fail_text: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_vector: AtomicBool::new(false),
            fail_text: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MemoryStore for FlakyStore {
    async fn create(&self, memory: &Memory) -> strata::Result<String> {
        self.inner.create(memory).await
    }

    async fn get(&self, id: &str) -> strata::Result<Option<Memory>> {
        self.inner.get(id).await
    }

    async fn update(&self, memory: &Memory) -> strata::Result<()> {
        self.inner.update(memory).await
    }

    async fn search_by_vector(
        &self,
        embedding: &[f32],
        owner_id: &str,
        top_k: usize,
        min_similarity: f64,
        filters: &SearchFilters,
    ) -> strata::Result<Vec<ScoredMemory>> {
        if self.fail_vector.load(Ordering::SeqCst) {
            return Err(MemoryError::store("vector index unavailable"));
        }
        self.inner
            .search_by_vector(embedding, owner_id, top_k, min_similarity, filters)
            .await
    }

    async fn search_by_text(
        &self,
        query: &str,
        owner_id: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> strata::Result<Vec<ScoredMemory>> {
        if self.fail_text.load(Ordering::SeqCst) {
            return Err(MemoryError::store("fts index unavailable"));
        }
        self.inner.search_by_text(query, owner_id, top_k, filters).await
    }

    async fn list_by_tier(
        &self,
        owner_id: &str,
        tier: Tier,
        limit: usize,
    ) -> strata::Result<Vec<Memory>> {
        self.inner.list_by_tier(owner_id, tier, limit).await
    }

    async fn count_by_tier(&self, owner_id: &str, tier: Tier) -> strata::Result<usize> {
        self.inner.count_by_tier(owner_id, tier).await
    }

    async fn find_by_hash(&self, content_hash: &str, owner_id: &str) -> strata::Result<Vec<String>> {
        self.inner.find_by_hash(content_hash, owner_id).await
    }

    async fn related_ids(&self, id: &str, limit: usize) -> strata::Result<Vec<String>> {
        self.inner.related_ids(id, limit).await
    }

    async fn add_relation(
        &self,
        source_id: &str,
        target_id: &str,
        relation: &str,
    ) -> strata::Result<()> {
        self.inner.add_relation(source_id, target_id, relation).await
    }

    async fn record_access(&self, ids: &[String], at: DateTime<Utc>) -> strata::Result<()> {
        self.inner.record_access(ids, at).await
    }

    async fn commit_consolidation(
        &self,
        consolidated: &Memory,
        members: &[Memory],
    ) -> strata::Result<String> {
        self.inner.commit_consolidation(consolidated, members).await
    }

    async fn commit_merge(&self, target: &Memory, source: &Memory) -> strata::Result<()> {
        self.inner.commit_merge(target, source).await
    }

    async fn create_lease(&self, key: &str, expires_at: DateTime<Utc>) -> strata::Result<bool> {
        self.inner.create_lease(key, expires_at).await
    }

    async fn delete_lease(&self, key: &str) -> strata::Result<()> {
        self.inner.delete_lease(key).await
    }

    async fn delete_expired_lease(&self, key: &str, now: DateTime<Utc>) -> strata::Result<()> {
        self.inner.delete_expired_lease(key, now).await
    }

    async fn append_log(
        &self,
        operation: &str,
        memory_id: &str,
        details: Option<&serde_json::Value>,
    ) -> strata::Result<()> {
        self.inner.append_log(operation, memory_id, details).await
    }
}
