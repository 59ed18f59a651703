//! Fuzzy company-name similarity and its mapping to match confidence.
//!
//! Similarity combines two signals over already-normalized names:
//!
//! - **Jaro-Winkler** on the whole string (typos, prefix agreement)
//! - **Soft token overlap**: the share of tokens of the shorter name that
//!   have a close counterpart (Jaro-Winkler >= [`TOKEN_MATCH`]) in the other
//!
//! ```text
//! similarity = 0.5 × jaro_winkler + 0.5 × token_overlap
//! confidence = 0.6 + 0.3 × (similarity − 0.5) / 0.5     for similarity ≥ 0.5
//! ```
//!
//! Confidence therefore always lands in `[0.6, 0.9]`, strictly below the
//! fixed confidences of exact matches.

use strsim::jaro_winkler;

/// Lowest confidence a fuzzy candidate can carry.
pub const FUZZY_CONFIDENCE_MIN: f64 = 0.6;
/// Highest confidence a fuzzy candidate can carry.
pub const FUZZY_CONFIDENCE_MAX: f64 = 0.9;
/// Similarity below which a name is not a candidate at all.
pub const SIMILARITY_FLOOR: f64 = 0.5;
/// Per-token Jaro-Winkler needed for two tokens to count as the same word.
pub const TOKEN_MATCH: f64 = 0.9;

/// Similarity of two normalized names in `[0, 1]`.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    0.5 * jaro_winkler(a, b) + 0.5 * token_overlap(a, b)
}

/// Map a similarity onto the fuzzy confidence band, or `None` when the
/// similarity is below [`SIMILARITY_FLOOR`].
pub fn similarity_to_confidence(similarity: f64) -> Option<f64> {
    if !(SIMILARITY_FLOOR..=1.0).contains(&similarity) {
        return None;
    }
    let span = FUZZY_CONFIDENCE_MAX - FUZZY_CONFIDENCE_MIN;
    let scaled = (similarity - SIMILARITY_FLOOR) / (1.0 - SIMILARITY_FLOOR);
    Some((FUZZY_CONFIDENCE_MIN + span * scaled).clamp(FUZZY_CONFIDENCE_MIN, FUZZY_CONFIDENCE_MAX))
}

/// Confidence of `candidate` for `query`, both normalized.
pub fn name_confidence(query: &str, candidate: &str) -> Option<f64> {
    similarity_to_confidence(name_similarity(query, candidate))
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    let (short, long) = if ta.len() <= tb.len() { (ta, tb) } else { (tb, ta) };
    if short.is_empty() {
        return 0.0;
    }

    let matched: f64 = short
        .iter()
        .map(|s| {
            long.iter()
                .map(|l| jaro_winkler(s, l))
                .fold(0.0_f64, f64::max)
        })
        .filter(|best| *best >= TOKEN_MATCH)
        .sum();

    matched / short.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_names_hit_band_ceiling() {
        assert_eq!(name_similarity("acme", "acme"), 1.0);
        assert_eq!(name_confidence("acme", "acme"), Some(FUZZY_CONFIDENCE_MAX));
    }

    #[test]
    fn extra_words_still_match() {
        let c = name_confidence("acme", "acme trading").unwrap();
        assert!(c > 0.75 && c < FUZZY_CONFIDENCE_MAX, "confidence {}", c);
    }

    #[test]
    fn typos_match_with_lower_confidence() {
        let exactish = name_confidence("nordic parts", "nordic parts").unwrap();
        let typo = name_confidence("nordic prats", "nordic parts").unwrap();
        assert!(typo < exactish);
        assert!(typo >= FUZZY_CONFIDENCE_MIN);
    }

    #[test]
    fn unrelated_names_are_not_candidates() {
        assert_eq!(name_confidence("acme", "zeta logistics"), None);
        assert_eq!(name_confidence("acme", "acne"), None);
    }

    #[test]
    fn empty_names_never_match() {
        assert_eq!(name_similarity("", "acme"), 0.0);
        assert_eq!(name_confidence("", ""), None);
    }

    #[test]
    fn confidence_band_is_respected() {
        for s in [0.5, 0.6, 0.75, 0.99, 1.0] {
            let c = similarity_to_confidence(s).unwrap();
            assert!((FUZZY_CONFIDENCE_MIN..=FUZZY_CONFIDENCE_MAX).contains(&c));
        }
        assert_eq!(similarity_to_confidence(0.49), None);
    }
}
