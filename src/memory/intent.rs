//! Query intent classification and the retrieval profile each intent selects.
//!
//! Keyword heuristics only: fast, deterministic, no model.
//!   "What is the staging port?"        → Factual  → heavy full-text, small topK
//!   "Why did the deploy fail?"         → Analysis → heavy vector, graph rerank
//!   "Brainstorm names for the project" → Creative → almost all vector

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Factual,
    Analysis,
    Creative,
    General,
}

/// Channel weights, topK, and graph use for one intent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentProfile {
    pub vector_weight: f64,
    pub text_weight: f64,
    /// `None` keeps the caller's / configured default.
    pub top_k: Option<usize>,
    pub use_graph: bool,
}

impl QueryIntent {
    pub fn profile(&self) -> IntentProfile {
        match self {
            Self::Factual => IntentProfile {
                vector_weight: 0.5,
                text_weight: 1.5,
                top_k: Some(5),
                use_graph: false,
            },
            Self::Analysis => IntentProfile {
                vector_weight: 1.5,
                text_weight: 0.5,
                top_k: Some(20),
                use_graph: true,
            },
            Self::Creative => IntentProfile {
                vector_weight: 1.8,
                text_weight: 0.2,
                top_k: Some(15),
                use_graph: false,
            },
            Self::General => IntentProfile {
                vector_weight: 1.0,
                text_weight: 1.0,
                top_k: None,
                use_graph: false,
            },
        }
    }
}

/// Minimum signal for a non-general classification.
const MIN_SIGNAL: f32 = 0.3;

/// Classify a query. Ties and weak signals fall back to [`QueryIntent::General`].
pub fn classify_intent(query: &str) -> QueryIntent {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return QueryIntent::General;
    }

    let mut factual = 0.0_f32;
    let mut analysis = 0.0_f32;
    let mut creative = 0.0_f32;

    // ── Factual signals ──────────────────────────────────────────────────
    if starts_with_any(&q, &[
        "what is ", "what's ", "what was ", "who is ", "who was ", "when is ", "when was ",
        "when did ", "where is ", "where was ", "which ", "define ",
    ]) {
        factual += 0.6;
    }
    if contains_any(&q, &["how many", "how much", "what version", "what port", "name of", "value of"]) {
        factual += 0.5;
    }

    // ── Analysis signals ─────────────────────────────────────────────────
    if starts_with_any(&q, &["why ", "how does ", "how do ", "explain "]) {
        analysis += 0.6;
    }
    if contains_any(&q, &[
        "compare", "difference between", "pros and cons", "tradeoff", "trade-off",
        "analyze", "analyse", "impact of", "root cause", "relationship between",
        "what caused", "implications",
    ]) {
        analysis += 0.5;
    }

    // ── Creative signals ─────────────────────────────────────────────────
    if starts_with_any(&q, &["imagine ", "brainstorm ", "write a ", "invent ", "come up with "]) {
        creative += 0.7;
    }
    if contains_any(&q, &[
        "ideas for", "brainstorm", "what if", "story", "poem", "creative", "suggest names",
        "alternatives to",
    ]) {
        creative += 0.5;
    }

    let ranked = [
        (QueryIntent::Factual, factual),
        (QueryIntent::Analysis, analysis),
        (QueryIntent::Creative, creative),
    ];
    let best = ranked.iter().map(|(_, s)| *s).fold(0.0_f32, f32::max);
    if best < MIN_SIGNAL {
        return QueryIntent::General;
    }
    let mut winners = ranked.iter().filter(|(_, s)| *s == best);
    match (winners.next(), winners.next()) {
        (Some((intent, _)), None) => *intent,
        _ => QueryIntent::General,
    }
}

fn starts_with_any(q: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| q.starts_with(p))
}

fn contains_any(q: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| q.contains(n))
}
