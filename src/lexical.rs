//! Term-overlap scoring used when vector ranking cannot be trusted.

use std::collections::HashSet;

use crate::chunk_source::ChunkId;

/// Lowercased whitespace-separated terms of `text`, deduplicated.
pub fn terms(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Fraction of `query_terms` that appear in `text`.
pub fn overlap_score(query_terms: &HashSet<String>, text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let candidate = terms(text);
    let shared = query_terms.intersection(&candidate).count();
    shared as f32 / query_terms.len() as f32
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalMatch {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub text: String,
}

/// Score every candidate against `query` and keep the best `k` with a
/// positive score.
///
/// Candidates with equal scores keep their input order.
pub fn rank(
    query: &str,
    candidates: impl IntoIterator<Item = (ChunkId, String)>,
    k: usize,
) -> Vec<LexicalMatch> {
    let query_terms = terms(query);
    if query_terms.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut matches: Vec<LexicalMatch> = candidates
        .into_iter()
        .filter_map(|(chunk_id, text)| {
            let score = overlap_score(&query_terms, &text);
            (score > 0.0).then_some(LexicalMatch {
                chunk_id,
                score,
                text,
            })
        })
        .collect();

    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    matches.truncate(k);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_are_case_insensitive() {
        let t = terms("Cats  and\tCATS dogs");
        assert_eq!(t.len(), 3);
        assert!(t.contains("cats"));
    }

    #[test]
    fn overlap_is_fraction_of_query_terms() {
        let query = terms("cats quantum");
        assert_eq!(overlap_score(&query, "cats and dogs"), 0.5);
        assert_eq!(overlap_score(&query, "Quantum cats"), 1.0);
        assert_eq!(overlap_score(&query, "birds"), 0.0);
    }

    #[test]
    fn rank_drops_zero_scores_and_sorts() {
        let candidates = vec![
            (1, "quantum physics".to_string()),
            (2, "cats and dogs".to_string()),
            (3, "cats and quantum cats".to_string()),
        ];

        let ranked = rank("cats quantum", candidates, 10);
        let ids: Vec<_> = ranked.iter().map(|m| m.chunk_id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(ranked[0].score, 1.0);
    }

    #[test]
    fn rank_ties_keep_input_order() {
        let candidates = vec![
            (9, "cats".to_string()),
            (4, "more cats".to_string()),
        ];
        let ranked = rank("cats", candidates, 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk_id, 9);
    }

    #[test]
    fn empty_query_matches_nothing() {
        assert!(rank("   ", vec![(1, "anything".to_string())], 5).is_empty());
    }
}
