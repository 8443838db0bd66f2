//! Secondary reranking applied after RRF fusion.
//!
//! Four additive boosts, computed per candidate:
//!
//! | Signal    | Boost                                                  |
//! |-----------|--------------------------------------------------------|
//! | temporal  | +0.2 within 1 h of the reference time, +0.1 within 1 d |
//! | episode   | +0.15 when sharing the top candidate's episode         |
//! | graph     | +0.10 when directly related to the top candidate       |
//! | proximity | up to +0.3 when query terms occur close together       |
//!
//! Candidates are then stable-sorted by boost, so fused order breaks ties.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use super::search::SearchResult;

pub const TEMPORAL_HOUR_BOOST: f64 = 0.2;
pub const TEMPORAL_DAY_BOOST: f64 = 0.1;
pub const EPISODE_BOOST: f64 = 0.15;
pub const GRAPH_BOOST: f64 = 0.10;
pub const PROXIMITY_MAX_BOOST: f64 = 0.3;

/// Average characters per word used to turn character gaps into word gaps.
const CHARS_PER_WORD: f64 = 6.0;

/// Everything the boosts need besides the candidates themselves.
#[derive(Debug, Clone)]
pub struct RerankContext<'a> {
    pub query: &'a str,
    pub reference_time: DateTime<Utc>,
    /// Max word distance that still earns a proximity boost.
    pub proximity_window: f64,
    /// Ids related to the top fused candidate. Empty disables the graph boost.
    pub graph_neighbors: HashSet<String>,
}

pub fn temporal_boost(created_at: DateTime<Utc>, reference: DateTime<Utc>) -> f64 {
    let gap = (created_at - reference).abs();
    if gap <= Duration::hours(1) {
        TEMPORAL_HOUR_BOOST
    } else if gap <= Duration::days(1) {
        TEMPORAL_DAY_BOOST
    } else {
        0.0
    }
}

/// Lowercased query terms longer than two characters, first occurrence order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
    {
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }
    terms
}

/// Lowercased alphanumeric runs of `text` with their starting char offsets.
///
/// Splits exactly like [`query_terms`], so tokens compare equal to terms.
fn word_tokens(text: &str) -> Vec<(usize, String)> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut start = 0;
    for (offset, c) in text.to_lowercase().chars().enumerate() {
        if c.is_alphanumeric() {
            if current.is_empty() {
                start = offset;
            }
            current.push(c);
        } else if !current.is_empty() {
            tokens.push((start, std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        tokens.push((start, current));
    }
    tokens
}

/// Closest pair of distinct query terms in `content`, as a boost in `[0, 0.3]`.
///
/// Only whole words count, so a term never matches inside a longer word.
pub fn proximity_boost(content: &str, query: &str, window: f64) -> f64 {
    let terms = query_terms(query);
    if terms.len() < 2 || window <= 0.0 {
        return 0.0;
    }

    // Single sweep: the nearest earlier occurrence of each other term.
    let mut last_seen: Vec<Option<usize>> = vec![None; terms.len()];
    let mut closest: Option<usize> = None;
    for (offset, token) in word_tokens(content) {
        let Some(t) = terms.iter().position(|term| *term == token) else {
            continue;
        };
        for (other, seen) in last_seen.iter().enumerate() {
            if other == t {
                continue;
            }
            if let Some(prev) = *seen {
                let gap = offset - prev;
                closest = Some(closest.map_or(gap, |c| c.min(gap)));
            }
        }
        last_seen[t] = Some(offset);
    }

    match closest {
        Some(chars) => {
            let words = chars as f64 / CHARS_PER_WORD;
            if words <= window {
                PROXIMITY_MAX_BOOST * (1.0 - words / window)
            } else {
                0.0
            }
        }
        None => 0.0,
    }
}

/// Apply all boosts and reorder. `results` must be in fused order.
pub fn rerank(mut results: Vec<SearchResult>, ctx: &RerankContext<'_>) -> Vec<SearchResult> {
    let Some(top) = results.first() else {
        return results;
    };
    let top_episode = top.memory.episode_id.clone();

    for result in &mut results {
        let memory = &result.memory;
        let mut boost = temporal_boost(memory.created_at, ctx.reference_time);
        if top_episode.is_some() && memory.episode_id == top_episode {
            boost += EPISODE_BOOST;
        }
        if ctx.graph_neighbors.contains(&memory.id) {
            boost += GRAPH_BOOST;
        }
        boost += proximity_boost(&memory.content, ctx.query, ctx.proximity_window);

        result.boost = boost;
        result.score = result.fused_score + boost;
    }

    // Vec::sort_by is stable.
    results.sort_by(|a, b| b.boost.total_cmp(&a.boost));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Memory;

    fn hit(content: &str, fused: f64) -> SearchResult {
        SearchResult {
            memory: Memory::new("u1", content),
            score: fused,
            fused_score: fused,
            boost: 0.0,
        }
    }

    fn ctx<'a>(query: &'a str, reference: DateTime<Utc>) -> RerankContext<'a> {
        RerankContext {
            query,
            reference_time: reference,
            proximity_window: 10.0,
            graph_neighbors: HashSet::new(),
        }
    }

    #[test]
    fn test_temporal_boost_bands() {
        let now = Utc::now();
        assert_eq!(temporal_boost(now - Duration::minutes(30), now), 0.2);
        assert_eq!(temporal_boost(now + Duration::minutes(59), now), 0.2);
        assert_eq!(temporal_boost(now - Duration::hours(5), now), 0.1);
        assert_eq!(temporal_boost(now - Duration::days(2), now), 0.0);
    }

    #[test]
    fn test_query_terms_drop_short_and_repeated() {
        assert_eq!(
            query_terms("Is the DB on fire? the db!"),
            vec!["the".to_string(), "fire".to_string()]
        );
    }

    #[test]
    fn test_proximity_adjacent_terms() {
        // "rust" at 0, "memory" at 5: 5 chars → 0.833 words.
        let boost = proximity_boost("rust memory safety", "rust memory", 10.0);
        let expected = 0.3 * (1.0 - (5.0 / 6.0) / 10.0);
        assert!((boost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_proximity_far_or_missing_terms() {
        let far = format!("rust {} memory", "x".repeat(100));
        assert_eq!(proximity_boost(&far, "rust memory", 10.0), 0.0);
        assert_eq!(proximity_boost("only rust here", "rust memory", 10.0), 0.0);
        assert_eq!(proximity_boost("rust memory", "rust", 10.0), 0.0);
    }

    #[test]
    fn test_proximity_ignores_terms_inside_longer_words() {
        assert_eq!(proximity_boost("trust the process", "rust trust", 10.0), 0.0);
        assert_eq!(proximity_boost("we filed a report yesterday", "port report", 10.0), 0.0);
        // Whole words still match through punctuation and case.
        let boost = proximity_boost("Report: the PORT is closed", "port report", 10.0);
        let expected = 0.3 * (1.0 - (12.0 / 6.0) / 10.0);
        assert!((boost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_word_tokens_carry_char_offsets() {
        let tokens = word_tokens("Zoë's café, ok");
        let words: Vec<(usize, &str)> = tokens.iter().map(|(o, w)| (*o, w.as_str())).collect();
        assert_eq!(words, vec![(0, "zoë"), (4, "s"), (6, "café"), (12, "ok")]);
    }

    #[test]
    fn test_episode_boost_includes_top() {
        let reference = Utc::now() - Duration::days(10);
        let mut a = hit("alpha", 0.03);
        a.memory.episode_id = Some("ep".into());
        let b = hit("beta", 0.02);
        let mut c = hit("gamma", 0.01);
        c.memory.episode_id = Some("ep".into());

        let out = rerank(vec![a, b, c], &ctx("zzz", reference));
        let contents: Vec<&str> = out.iter().map(|r| r.memory.content.as_str()).collect();
        assert_eq!(contents, vec!["alpha", "gamma", "beta"]);
        assert!((out[0].boost - EPISODE_BOOST).abs() < 1e-12);
        assert!((out[0].score - (0.03 + EPISODE_BOOST)).abs() < 1e-12);
    }

    #[test]
    fn test_graph_boost_and_stable_ties() {
        let reference = Utc::now() - Duration::days(10);
        let a = hit("alpha", 0.03);
        let b = hit("beta", 0.02);
        let c = hit("gamma", 0.01);
        let mut context = ctx("zzz", reference);
        context.graph_neighbors.insert(c.memory.id.clone());

        let out = rerank(vec![a, b, c], &context);
        let contents: Vec<&str> = out.iter().map(|r| r.memory.content.as_str()).collect();
        assert_eq!(contents, vec!["gamma", "alpha", "beta"]);
    }

    #[test]
    fn test_rerank_empty() {
        assert!(rerank(Vec::new(), &ctx("q", Utc::now())).is_empty());
    }
}
