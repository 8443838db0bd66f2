//! Tiered memory lifecycle, consolidation, and hybrid retrieval for AI agents.
//!
//! Strata decides which memories an agent keeps, how they age and merge, and
//! how they are ranked on recall. Records move through three tiers:
//!
//! | Tier | Holds | Leaves by |
//! |------|-------|-----------|
//! | **Working** | Fresh content from the current interaction | Promotion (age, use, importance) |
//! | **ShortTerm** | Content that earned retention | Promotion (importance) or consolidation |
//! | **LongTerm** | Durable knowledge and consolidated summaries | Archival only |
//!
//! Nothing is physically deleted: archival sets a terminal flag and provenance
//! lives in each record's metadata.
//!
//! # Architecture
//!
//! - **Storage**: the [`MemoryStore`] trait; [`SqliteStore`] implements it with
//!   FTS5 for keyword search and [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for vector search
//! - **Lifecycle**: promotion, exponential decay, archival, batch dedup, and
//!   lease-guarded LLM consolidation, run per owner by [`LifecycleManager`]
//! - **Search**: parallel vector + BM25 fetches per query variant, merged via
//!   weighted Reciprocal Rank Fusion, then intent-aware reranking in
//!   [`HybridRetriever`]
//!
//! # Modules
//!
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and the bundled store
//! - [`embedding`]: the embedding provider contract and vector math
//! - [`error`]: the [`MemoryError`] taxonomy
//! - [`generation`]: the text generator contract and merge prompt handling
//! - [`logging`]: tracing subscriber setup
//! - [`memory`]: the lifecycle and retrieval core

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod logging;
pub mod memory;

pub use config::StrataConfig;
pub use db::SqliteStore;
pub use embedding::EmbeddingProvider;
pub use error::{MemoryError, Result};
pub use generation::{GenerationError, TextGenerator};
pub use memory::lifecycle::{LifecycleManager, LifecycleReport};
pub use memory::search::{HybridRetriever, SearchRequest, SearchResponse};
pub use memory::store::{MemoryStore, SearchFilters};
pub use memory::types::{Memory, Tier};
