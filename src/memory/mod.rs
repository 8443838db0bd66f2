//! The memory lifecycle and retrieval core.
//!
//! - [`types`]: records, tiers, leases
//! - [`store`]: the [`MemoryStore`](store::MemoryStore) contract
//! - [`lease`]: store-backed mutual exclusion
//! - [`dedup`]: exact and semantic duplicate detection and merge
//! - [`consolidation`]: LLM-driven merging of short-term groups
//! - [`lifecycle`]: promotion, decay, archival, and the per-owner job
//! - [`search`]: hybrid vector + full-text retrieval with RRF fusion
//! - [`intent`], [`rerank`], [`cache`]: retrieval helpers

pub mod cache;
pub mod consolidation;
pub mod dedup;
pub mod intent;
pub mod lease;
pub mod lifecycle;
pub mod rerank;
pub mod search;
pub mod store;
pub mod types;

/// Serialize an embedding as little-endian f32 bytes (the sqlite-vec wire format).
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`embedding_to_bytes`]. Trailing partial floats are ignored.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity from the L2 distance between two unit vectors.
///
/// For unit vectors: L2² = 2(1 − cos), so cos = 1 − L2²/2.
pub fn l2_distance_to_cosine(distance: f64) -> f64 {
    (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0)
}
