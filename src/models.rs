//! Core data models for playlist reconciliation.
//!
//! This module contains the catalog records, the match result with its
//! evidence trail, and the run statistics used throughout the pipeline.

use serde::Serialize;
use std::path::PathBuf;

// ============================================================================
// Type Aliases
// ============================================================================

/// Position of an item in `LibraryIndex::items()`. Stable for one index lifetime.
pub type ItemId = usize;

// ============================================================================
// Catalog Models
// ============================================================================

/// Raw library record as read from the catalog export, before validation.
#[derive(Clone, Debug, Default)]
pub struct LibraryRecord {
    pub persistent_id: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub duration_ms: Option<u64>,
    pub location: Option<PathBuf>,
    pub identifier: Option<String>,
}

/// One validated entry of the local library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryItem {
    pub persistent_id: String,
    pub title: String,
    pub artist: String,
    pub album: String, // empty when the catalog has none
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub duration_secs: u32,
    pub location: PathBuf,
    pub identifier: Option<String>, // ISRC, when the catalog export carries one
}

/// One row of a request catalog (an exported playlist).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestItem {
    pub row: usize, // 0-based data row, preserves input order
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub disc_number: Option<u32>,
    pub track_number: Option<u32>,
    pub identifier: Option<String>,
}

/// One request catalog: a named, ordered list of request rows.
#[derive(Clone, Debug, Default)]
pub struct RequestList {
    pub name: String,
    pub items: Vec<RequestItem>,
    pub malformed_rows: usize,
}

// ============================================================================
// Strategy Tags
// ============================================================================

/// Match strategies in cascade priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Identifier,
    Structural,
    NormalizedKey,
    QualifierStripped,
    Fuzzy,
}

impl Strategy {
    pub fn label(self) -> &'static str {
        match self {
            Strategy::Identifier => "identifier",
            Strategy::Structural => "structural",
            Strategy::NormalizedKey => "normalized-key",
            Strategy::QualifierStripped => "qualifier-stripped",
            Strategy::Fuzzy => "fuzzy",
        }
    }
}

// ============================================================================
// Evidence Trail
// ============================================================================

/// One candidate seen by a strategy stage, with its intermediate signals.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CandidateEvidence {
    pub item: ItemId,
    pub persistent_id: String,
    pub label: String, // "Artist - Title" for display
    pub duration_secs: u32,
    pub duration_delta: Option<i64>, // candidate - request, None if request duration unknown
    pub within_tolerance: bool,
    pub similarity: Option<f64>, // fuzzy score, only set by the fuzzy strategy
}

/// One lookup performed by a strategy (e.g. the `artist|title` key).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageEvidence {
    pub stage: &'static str,
    pub key: String,
    pub candidate_count: usize,
    pub candidates: Vec<CandidateEvidence>, // may be truncated, candidate_count is exact
}

/// How a strategy ended.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyOutcome {
    /// Strategy not applicable to this request (or disabled)
    Skipped { reason: &'static str },
    /// No stage produced any candidate
    NoCandidates,
    /// Candidates found but none passed the duration check
    DurationRejected { candidates: usize },
    /// More than one candidate survived every tie-break
    Ambiguous { survivors: usize },
    /// Fuzzy only: best score did not reach the acceptance threshold
    BelowThreshold { best_score: f64, threshold: f64 },
    Matched { item: ItemId, stage: &'static str, confidence: f64 },
}

impl StrategyOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, StrategyOutcome::Matched { .. })
    }
}

/// Everything one strategy attempt observed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StrategyEvidence {
    pub strategy: Strategy,
    pub stages: Vec<StageEvidence>,
    pub outcome: StrategyOutcome,
}

impl StrategyEvidence {
    pub fn skipped(strategy: Strategy, reason: &'static str) -> Self {
        Self {
            strategy,
            stages: Vec::new(),
            outcome: StrategyOutcome::Skipped { reason },
        }
    }

    /// Total candidates across all stages of this attempt.
    pub fn candidate_count(&self) -> usize {
        self.stages.iter().map(|s| s.candidate_count).sum()
    }
}

/// Ordered record of every strategy attempted for one request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EvidenceTrail {
    pub request_label: String,
    pub request_duration: Option<u32>,
    pub attempts: Vec<StrategyEvidence>,
}

impl EvidenceTrail {
    pub fn attempt(&self, strategy: Strategy) -> Option<&StrategyEvidence> {
        self.attempts.iter().find(|a| a.strategy == strategy)
    }
}

// ============================================================================
// Match Result
// ============================================================================

/// Outcome of running one request through the cascade.
#[derive(Clone, Debug)]
pub struct MatchResult<'a> {
    pub request: &'a RequestItem,
    pub item: Option<&'a LibraryItem>,
    pub strategy: Option<Strategy>,
    pub confidence: f64,
    pub evidence: EvidenceTrail,
}

impl MatchResult<'_> {
    pub fn is_matched(&self) -> bool {
        self.item.is_some()
    }

    /// True when some strategy ended with surviving-but-tied candidates.
    pub fn is_ambiguous(&self) -> bool {
        !self.is_matched()
            && self
                .evidence
                .attempts
                .iter()
                .any(|a| matches!(a.outcome, StrategyOutcome::Ambiguous { .. }))
    }

    /// Duration delta of the winning candidate, if known.
    pub fn winning_delta(&self) -> Option<i64> {
        let item = self.item?;
        let request = self.request.duration_secs?;
        Some(item.duration_secs as i64 - request as i64)
    }
}

// ============================================================================
// Statistics (Instrumentation)
// ============================================================================

/// Counts produced while building the library index.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub records_seen: usize,
    pub indexed: usize,
    pub malformed_skipped: usize, // missing title, duration or persistent id
    pub remote_skipped: usize,    // no file location (streaming-only content)
    pub duplicate_ids_skipped: usize,
    pub catalog_identifiers: usize,
}

/// Per-run matching statistics.
#[derive(Default, Debug, Clone, Serialize)]
pub struct RunStats {
    pub index: IndexStats,

    // Prefetch
    pub prefetch_selected: usize,
    pub prefetch_read: usize,
    pub prefetch_updated: usize,
    pub prefetch_failures: usize,

    // Per-strategy wins
    pub identifier_matches: usize,
    pub structural_matches: usize,
    pub normalized_matches: usize,
    pub stripped_matches: usize,
    pub fuzzy_matches: usize,

    // Unmatched breakdown
    pub ambiguous: usize,
    pub unmatched: usize,
    pub malformed_request_rows: usize,
    pub skipped_request_files: usize,

    // Duration statistics (winning candidate vs request)
    pub duration_delta_0: usize,
    pub duration_delta_1_to_2: usize,
    pub duration_delta_3_to_5: usize,
    pub duration_delta_6_plus: usize,
    pub duration_unknown: usize,

    // Final totals
    pub playlists: usize,
    pub playlists_written: usize,
    pub total_requests: usize,
    pub total_matches: usize,

    // Timing
    pub elapsed_seconds: f64,
}

impl RunStats {
    /// Calculate match rate as a percentage
    pub fn match_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            100.0 * self.total_matches as f64 / self.total_requests as f64
        }
    }

    /// Fold one match result into the counters.
    pub fn record(&mut self, result: &MatchResult<'_>) {
        self.total_requests += 1;
        match result.strategy {
            Some(strategy) => {
                self.total_matches += 1;
                match strategy {
                    Strategy::Identifier => self.identifier_matches += 1,
                    Strategy::Structural => self.structural_matches += 1,
                    Strategy::NormalizedKey => self.normalized_matches += 1,
                    Strategy::QualifierStripped => self.stripped_matches += 1,
                    Strategy::Fuzzy => self.fuzzy_matches += 1,
                }
                self.record_duration_bucket(result.winning_delta());
            }
            None => {
                if result.is_ambiguous() {
                    self.ambiguous += 1;
                }
                self.unmatched += 1;
            }
        }
    }

    /// Record duration bucket for a match based on duration diff in seconds
    pub fn record_duration_bucket(&mut self, delta: Option<i64>) {
        match delta.map(i64::abs) {
            None => self.duration_unknown += 1,
            Some(0) => self.duration_delta_0 += 1,
            Some(1..=2) => self.duration_delta_1_to_2 += 1,
            Some(3..=5) => self.duration_delta_3_to_5 += 1,
            Some(_) => self.duration_delta_6_plus += 1,
        }
    }

    /// Log stats to stderr in JSON format
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            eprintln!("[STATS:{}]\n{}", phase, json);
        }
    }

    /// Write stats to a JSON file
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_buckets() {
        let mut stats = RunStats::default();
        stats.record_duration_bucket(Some(0));
        stats.record_duration_bucket(Some(-2));
        stats.record_duration_bucket(Some(4));
        stats.record_duration_bucket(Some(-30));
        stats.record_duration_bucket(None);
        assert_eq!(stats.duration_delta_0, 1);
        assert_eq!(stats.duration_delta_1_to_2, 1);
        assert_eq!(stats.duration_delta_3_to_5, 1);
        assert_eq!(stats.duration_delta_6_plus, 1);
        assert_eq!(stats.duration_unknown, 1);
    }

    #[test]
    fn test_match_rate() {
        let mut stats = RunStats::default();
        assert_eq!(stats.match_rate(), 0.0);
        stats.total_requests = 4;
        stats.total_matches = 3;
        assert_eq!(stats.match_rate(), 75.0);
    }

    #[test]
    fn test_strategy_order() {
        assert!(Strategy::Identifier < Strategy::Structural);
        assert!(Strategy::QualifierStripped < Strategy::Fuzzy);
        assert_eq!(Strategy::NormalizedKey.label(), "normalized-key");
    }
}
