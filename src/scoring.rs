//! Scoring functions shared by the match cascade and diagnostics.
//!
//! This module contains:
//! - The duration tolerance check
//! - Token-set similarity for fuzzy title/artist matching
//! - The combined fuzzy score

use std::collections::BTreeSet;

use crate::normalize::tokens;

// ============================================================================
// Constants
// ============================================================================

/// Default duration tolerance floor in seconds
pub const DEFAULT_TOLERANCE_SECS: u32 = 3;

/// Default proportional duration tolerance (percent of the longer duration)
pub const DEFAULT_TOLERANCE_PCT: f64 = 2.0;

/// Two tokens of at least this length count as the same word above this similarity
/// ("beatels" vs "beatles").
const TOKEN_TYPO_SIMILARITY: f64 = 0.8;
const TOKEN_TYPO_MIN_LEN: usize = 4;

/// Scores closer than this are considered tied.
pub const SCORE_EPSILON: f64 = 1e-9;

// ============================================================================
// Duration Tolerance
// ============================================================================

/// Duration check: accepted when `|a - b| <= max(floor, pct% of the longer duration)`.
/// Basing the proportional bound on the longer side keeps the check symmetric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationTolerance {
    pub floor_secs: u32,
    pub percent: f64,
}

impl Default for DurationTolerance {
    fn default() -> Self {
        Self {
            floor_secs: DEFAULT_TOLERANCE_SECS,
            percent: DEFAULT_TOLERANCE_PCT,
        }
    }
}

impl DurationTolerance {
    /// Largest accepted difference for this pair, in seconds.
    pub fn allowed_delta(&self, a: u32, b: u32) -> f64 {
        let proportional = a.max(b) as f64 * self.percent.max(0.0) / 100.0;
        (self.floor_secs as f64).max(proportional)
    }

    pub fn accepts(&self, a: u32, b: u32) -> bool {
        (a.abs_diff(b) as f64) <= self.allowed_delta(a, b)
    }

    /// Check with an optional request duration. Unknown duration -> allow.
    pub fn accepts_optional(&self, request: Option<u32>, candidate: u32) -> bool {
        request.map_or(true, |r| self.accepts(r, candidate))
    }
}

/// Signed duration delta (candidate - request), None when the request has no duration.
pub fn duration_delta(request: Option<u32>, candidate: u32) -> Option<i64> {
    request.map(|r| candidate as i64 - r as i64)
}

// ============================================================================
// Token-set Similarity
// ============================================================================

/// Order-independent token overlap of two normalized strings (0.0 to 1.0).
///
/// Sørensen–Dice over token sets, where a token without an exact counterpart may
/// still pair with a near-identical one (normalized Damerau-Levenshtein >= 0.8) for
/// partial credit. Strings sharing nothing score 0.0.
pub fn token_set_similarity(a: &str, b: &str) -> f64 {
    let set_a: BTreeSet<&str> = tokens(a).into_iter().collect();
    let set_b: BTreeSet<&str> = tokens(b).into_iter().collect();

    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    if set_a == set_b {
        return 1.0;
    }

    let (small, large) = if set_a.len() <= set_b.len() {
        (&set_a, &set_b)
    } else {
        (&set_b, &set_a)
    };

    let mut unused: Vec<&str> = large.difference(small).copied().collect();
    let mut matched = 0.0;

    for token in small.iter() {
        if large.contains(token) {
            matched += 1.0;
            continue;
        }
        if token.len() < TOKEN_TYPO_MIN_LEN {
            continue;
        }
        let best = unused
            .iter()
            .enumerate()
            .filter(|(_, other)| other.len() >= TOKEN_TYPO_MIN_LEN)
            .map(|(i, other)| (i, strsim::normalized_damerau_levenshtein(token, other)))
            .filter(|(_, sim)| *sim >= TOKEN_TYPO_SIMILARITY)
            .max_by(|x, y| x.1.total_cmp(&y.1));
        if let Some((i, sim)) = best {
            matched += sim;
            unused.swap_remove(i);
        }
    }

    (2.0 * matched / (set_a.len() + set_b.len()) as f64).clamp(0.0, 1.0)
}

/// Weighted fuzzy score of a request against a library item (normalized inputs).
///
/// The artist side takes the better of the full artist strings and the primary
/// artists, so "drake feat. rihanna" still scores fully against "drake".
pub fn fuzzy_score(
    request_title: &str,
    request_artist: &str,
    request_primary: &str,
    item_title: &str,
    item_artist: &str,
    item_primary: &str,
    title_weight: f64,
) -> f64 {
    let title_weight = title_weight.clamp(0.0, 1.0);
    let title_sim = token_set_similarity(request_title, item_title);
    let artist_sim = if !request_primary.is_empty() && request_primary == item_primary {
        1.0
    } else {
        token_set_similarity(request_artist, item_artist)
    };
    title_weight * title_sim + (1.0 - title_weight) * artist_sim
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_floor() {
        let tol = DurationTolerance::default();
        assert!(tol.accepts(125, 126));
        assert!(tol.accepts(125, 128));
        assert!(!tol.accepts(125, 129));
        assert!(!tol.accepts(126, 180));
    }

    #[test]
    fn test_duration_proportional_dominates_long_tracks() {
        let tol = DurationTolerance::default();
        // 2% of 600s = 12s
        assert_eq!(tol.allowed_delta(600, 590), 12.0);
        assert!(tol.accepts(600, 589));
        assert!(!tol.accepts(600, 587));
    }

    #[test]
    fn test_duration_unknown_request_allowed() {
        let tol = DurationTolerance::default();
        assert!(tol.accepts_optional(None, 999));
        assert!(!tol.accepts_optional(Some(10), 999));
        assert_eq!(duration_delta(None, 5), None);
        assert_eq!(duration_delta(Some(126), 125), Some(-1));
    }

    #[test]
    fn test_duration_check_is_symmetric() {
        let tol = DurationTolerance {
            floor_secs: 3,
            percent: 2.0,
        };
        for a in (0..900).step_by(7) {
            for b in (0..900).step_by(11) {
                assert_eq!(tol.accepts(a, b), tol.accepts(b, a), "asymmetric for {} {}", a, b);
            }
        }
    }

    #[test]
    fn test_duration_check_is_tolerance_monotonic() {
        let narrow = DurationTolerance {
            floor_secs: 2,
            percent: 1.0,
        };
        let wider = [
            DurationTolerance { floor_secs: 3, percent: 1.0 },
            DurationTolerance { floor_secs: 2, percent: 5.0 },
            DurationTolerance { floor_secs: 10, percent: 10.0 },
        ];
        for a in (0..900).step_by(13) {
            for b in (0..900).step_by(5) {
                if narrow.accepts(a, b) {
                    for w in &wider {
                        assert!(w.accepts(a, b), "widening rejected {} {}", a, b);
                    }
                }
            }
        }
    }

    #[test]
    fn test_token_set_similarity_basics() {
        assert_eq!(token_set_similarity("yesterday", "yesterday"), 1.0);
        assert_eq!(token_set_similarity("let it be", "be it let"), 1.0);
        assert_eq!(token_set_similarity("yesterday", "hey jude"), 0.0);
        assert_eq!(token_set_similarity("", "hey jude"), 0.0);
        // 2 * 1 / (2 + 1)
        let s = token_set_similarity("yesterday song", "yesterday");
        assert!((s - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_token_set_similarity_typo_partial_credit() {
        let typo = token_set_similarity("the beatels", "the beatles");
        assert!(typo > 0.8 && typo < 1.0, "got {}", typo);
        // Short tokens never get typo credit
        assert_eq!(token_set_similarity("abc", "abd"), 0.0);
    }

    #[test]
    fn test_fuzzy_score_weights() {
        let full = fuzzy_score("yesterday", "the beatles", "the beatles", "yesterday", "the beatles", "the beatles", 0.7);
        assert!((full - 1.0).abs() < 1e-12);
        let title_only = fuzzy_score("yesterday", "x", "x", "yesterday", "the beatles", "the beatles", 0.7);
        assert!((title_only - 0.7).abs() < 1e-12);
        let primary = fuzzy_score("yesterday", "drake, rihanna", "drake", "yesterday", "drake", "drake", 0.7);
        assert!((primary - 1.0).abs() < 1e-12);
    }
}
