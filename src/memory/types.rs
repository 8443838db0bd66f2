//! Core memory type definitions.
//!
//! Defines [`Tier`] (the three lifecycle stages), [`Memory`] (a full record),
//! [`ScoredMemory`] (a search hit), and [`Lease`] (a time-bounded exclusive claim).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dedup::compute_hash;

/// Metadata key pointing an archived duplicate at the record it was merged into.
pub const META_DUPLICATE_OF: &str = "duplicate_of";
/// Metadata key pointing an archived member at the record consolidating it.
pub const META_CONSOLIDATED_INTO: &str = "consolidated_into";
/// Metadata key listing the members a consolidated record was built from.
pub const META_CONSOLIDATED_FROM: &str = "consolidated_from";
/// Metadata key listing the sources merged into a dedup target.
pub const META_MERGED_FROM: &str = "merged_from";

/// Lifecycle tier. Strictly ordered `Working < ShortTerm < LongTerm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fresh, unproven content from the current interaction.
    Working,
    /// Content that earned retention through use and importance.
    ShortTerm,
    /// Terminal tier: durable knowledge and consolidated summaries.
    LongTerm,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Working, Tier::ShortTerm, Tier::LongTerm];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
        }
    }

    /// The single tier above this one, or `None` for the terminal tier.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Self::Working => Some(Self::ShortTerm),
            Self::ShortTerm => Some(Self::LongTerm),
            Self::LongTerm => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(Self::Working),
            "short_term" => Ok(Self::ShortTerm),
            "long_term" => Ok(Self::LongTerm),
            _ => Err(format!("unknown tier: {s}")),
        }
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key. Immutable.
    pub id: String,
    /// Owner namespace. Tier and dedup operations never cross owners.
    pub owner_id: String,
    /// The full text content.
    pub content: String,
    /// Fingerprint of `(content, owner_id)` used for exact-duplicate lookup.
    pub content_hash: String,
    pub tier: Tier,
    /// Importance in `[0.0, 1.0]`.
    pub importance: f64,
    /// Optional embedding. `None` disables semantic dedup and vector search.
    pub embedding: Option<Vec<f32>>,
    pub access_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last recall time, or `None` if never accessed.
    pub accessed_at: Option<DateTime<Utc>>,
    /// Cached decay score in `[0.0, 1.0]`; only refreshed by the decay sweep.
    pub decay_score: Option<f64>,
    /// Terminal flag. Archived records drop out of tier listings and search.
    pub is_archived: bool,
    /// Consolidation grouping key.
    pub category: Option<String>,
    /// Interaction session this record came from.
    pub episode_id: Option<String>,
    pub tags: Vec<String>,
    /// Provenance map (`duplicate_of`, `consolidated_into`, ...).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Memory {
    /// Build a fresh `Working` record with importance 0.5.
    pub fn new(owner_id: impl Into<String>, content: impl Into<String>) -> Self {
        let owner_id = owner_id.into();
        let content = content.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            content_hash: compute_hash(&content, &owner_id),
            owner_id,
            content,
            tier: Tier::Working,
            importance: 0.5,
            embedding: None,
            access_count: 0,
            created_at: now,
            updated_at: now,
            accessed_at: None,
            decay_score: None,
            is_archived: false,
            category: None,
            episode_id: None,
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Set importance, clamped to `[0.0, 1.0]`.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.set_importance(importance);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_episode(mut self, episode_id: impl Into<String>) -> Self {
        self.episode_id = Some(episode_id.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.add_tag(tag);
        }
        self
    }

    pub fn with_access_count(mut self, access_count: u32) -> Self {
        self.access_count = access_count;
        self
    }

    /// Backdate creation (and last update) to `created_at`.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    pub fn set_importance(&mut self, importance: f64) {
        self.importance = clamp_unit(importance);
    }

    pub fn set_decay_score(&mut self, score: f64) {
        self.decay_score = Some(clamp_unit(score));
    }

    /// Append a tag unless already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Age of the record at `now`, never negative.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }

    /// Age in fractional days.
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        self.age(now).num_milliseconds() as f64 / 86_400_000.0
    }

    /// String value of a metadata key, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A memory returned from a store search, with the channel's score attached.
///
/// For vector search the score is cosine similarity; for full-text search it is
/// the negated BM25 rank (higher is better).
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f64,
}

/// A time-bounded exclusive claim on a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Clamp to `[0.0, 1.0]`, mapping NaN to 0.
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
