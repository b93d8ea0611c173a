//! Second-stage scoring of coarse vector candidates.

use std::collections::BTreeSet;

/// Scores recall candidates against a query. Must be deterministic and
/// return exactly one score per candidate, higher meaning more relevant.
pub trait Reranker: Send + Sync {
    fn score(&self, query: &str, candidates: &[String]) -> Vec<f64>;
}

/// Lowercase alphanumeric tokens of `text`, in order
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Lexical overlap reranker.
///
/// `score = 0.8 * coverage + 0.2 * jaccard`, where coverage is the share of
/// distinct query tokens found in the candidate. Both terms lie in [0, 1].
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalReranker;

const COVERAGE_WEIGHT: f64 = 0.8;
const JACCARD_WEIGHT: f64 = 0.2;

impl Reranker for LexicalReranker {
    fn score(&self, query: &str, candidates: &[String]) -> Vec<f64> {
        let query_tokens: BTreeSet<String> = tokenize(query).into_iter().collect();
        candidates
            .iter()
            .map(|candidate| {
                if query_tokens.is_empty() {
                    return 0.0;
                }
                let tokens: BTreeSet<String> = tokenize(candidate).into_iter().collect();
                let shared = query_tokens.intersection(&tokens).count() as f64;
                let union = query_tokens.union(&tokens).count() as f64;
                let coverage = shared / query_tokens.len() as f64;
                let jaccard = if union > 0.0 { shared / union } else { 0.0 };
                COVERAGE_WEIGHT * coverage + JACCARD_WEIGHT * jaccard
            })
            .collect()
    }
}
