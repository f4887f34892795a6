//! Human-readable explanations built from a match result's evidence trail.
//!
//! Everything here is a pure function of the [`MatchResult`]; nothing touches
//! the index again.

use std::fmt::Write;

use crate::models::{CandidateEvidence, MatchResult, Strategy, StrategyEvidence, StrategyOutcome};

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    /// Unmatched requests explained per run
    pub max_failures: usize,
    /// Near-miss candidates listed per explanation
    pub max_suggestions: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 25,
            max_suggestions: 3,
        }
    }
}

fn format_delta(delta: Option<i64>) -> String {
    match delta {
        Some(d) => format!("{:+}s", d),
        None => "?s".to_string(),
    }
}

fn describe_outcome(outcome: &StrategyOutcome) -> String {
    match outcome {
        StrategyOutcome::Skipped { reason } => format!("skipped ({})", reason),
        StrategyOutcome::NoCandidates => "no candidates".to_string(),
        StrategyOutcome::DurationRejected { candidates } => {
            format!("{} candidate(s), none within duration tolerance", candidates)
        }
        StrategyOutcome::Ambiguous { survivors } => {
            format!("ambiguous, {} candidates tied after tie-breaks", survivors)
        }
        StrategyOutcome::BelowThreshold { best_score, threshold } => {
            format!("best score {:.3} below threshold {:.3}", best_score, threshold)
        }
        StrategyOutcome::Matched { stage, confidence, .. } => {
            format!("matched on {} (confidence {:.2})", stage, confidence)
        }
    }
}

fn describe_attempt(attempt: &StrategyEvidence) -> String {
    let stages: Vec<String> = attempt
        .stages
        .iter()
        .map(|s| format!("{}={}", s.stage, s.candidate_count))
        .collect();
    if stages.is_empty() {
        format!("{}: {}", attempt.strategy.label(), describe_outcome(&attempt.outcome))
    } else {
        format!(
            "{}: [{}] {}",
            attempt.strategy.label(),
            stages.join(", "),
            describe_outcome(&attempt.outcome)
        )
    }
}

/// True when stripped keys found candidates but plain keys found none.
pub fn qualifier_mismatch_likely(result: &MatchResult<'_>) -> bool {
    let count = |s| result.evidence.attempt(s).map_or(0, StrategyEvidence::candidate_count);
    count(Strategy::NormalizedKey) == 0 && count(Strategy::QualifierStripped) > 0
}

/// Whether stripping qualifiers produced a hit, and what it found otherwise.
pub fn stripping_verdict(result: &MatchResult<'_>) -> String {
    let Some(attempt) = result.evidence.attempt(Strategy::QualifierStripped) else {
        return "not attempted".to_string();
    };
    match &attempt.outcome {
        StrategyOutcome::Matched { stage, .. } => format!("produced a hit on {}", stage),
        StrategyOutcome::Skipped { reason } => format!("skipped ({})", reason),
        outcome => match attempt.candidate_count() {
            0 => "no hit, stripped keys found no candidates".to_string(),
            n => format!("no hit ({} key hit(s); {})", n, describe_outcome(outcome)),
        },
    }
}

/// Closest candidates seen anywhere in the trail: fuzzy ranking first, then
/// key-stage candidates ordered by duration distance.
pub fn suggestions<'r>(result: &'r MatchResult<'_>, max: usize) -> Vec<&'r CandidateEvidence> {
    let mut picked: Vec<&CandidateEvidence> = Vec::new();
    let push = |c: &'r CandidateEvidence, picked: &mut Vec<&'r CandidateEvidence>| {
        if !picked.iter().any(|p| p.item == c.item) {
            picked.push(c);
        }
    };

    if let Some(fuzzy) = result.evidence.attempt(Strategy::Fuzzy) {
        for c in fuzzy.stages.iter().flat_map(|s| s.candidates.iter()) {
            push(c, &mut picked);
        }
    }

    let mut keyed: Vec<&CandidateEvidence> = result
        .evidence
        .attempts
        .iter()
        .filter(|a| a.strategy != Strategy::Fuzzy)
        .flat_map(|a| a.stages.iter())
        .flat_map(|s| s.candidates.iter())
        .collect();
    keyed.sort_by_key(|c| (c.duration_delta.map_or(i64::MAX, i64::abs), c.item));
    for c in keyed {
        push(c, &mut picked);
    }

    picked.truncate(max);
    picked
}

/// Full explanation of how a request was (or was not) matched.
pub fn explain(result: &MatchResult<'_>, config: &DiagnosticsConfig) -> String {
    let mut out = String::new();
    let duration = result
        .evidence
        .request_duration
        .map_or_else(|| "unknown duration".to_string(), |d| format!("{}s", d));

    match (result.item, result.strategy) {
        (Some(item), Some(strategy)) => {
            let _ = writeln!(
                out,
                "MATCHED {} [{}] -> {} - {} [{}s] via {} (confidence {:.2})",
                result.evidence.request_label,
                duration,
                item.artist,
                item.title,
                item.duration_secs,
                strategy.label(),
                result.confidence
            );
        }
        _ => {
            let _ = writeln!(out, "UNMATCHED {} [{}]", result.evidence.request_label, duration);
        }
    }

    for (i, attempt) in result.evidence.attempts.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}", i + 1, describe_attempt(attempt));
    }

    if result.is_matched() {
        return out;
    }

    let _ = writeln!(out, "  stripping: {}", stripping_verdict(result));
    if qualifier_mismatch_likely(result) {
        let _ = writeln!(
            out,
            "  note: stripped keys found candidates where plain keys found none (title qualifier mismatch likely)"
        );
    }

    let near = suggestions(result, config.max_suggestions);
    if !near.is_empty() {
        let _ = writeln!(out, "  closest candidates:");
        for c in near {
            let score = c.similarity.map(|s| format!("score {:.3}, ", s)).unwrap_or_default();
            let _ = writeln!(
                out,
                "    - {} [{}s] ({}delta {}{})",
                c.label,
                c.duration_secs,
                score,
                format_delta(c.duration_delta),
                if c.within_tolerance { "" } else { ", outside tolerance" }
            );
        }
    }
    out
}

/// One-line reason for the unmatched report.
pub fn summary(result: &MatchResult<'_>) -> String {
    if let Some(strategy) = result.strategy {
        return format!("matched via {}", strategy.label());
    }

    let attempts = &result.evidence.attempts;
    if let Some(a) = attempts
        .iter()
        .find(|a| matches!(a.outcome, StrategyOutcome::Ambiguous { .. }))
    {
        if let StrategyOutcome::Ambiguous { survivors } = a.outcome {
            return format!("ambiguous: {} candidates tied ({})", survivors, a.strategy.label());
        }
    }

    if attempts
        .iter()
        .any(|a| matches!(a.outcome, StrategyOutcome::DurationRejected { .. }))
    {
        let nearest = suggestions(result, usize::MAX)
            .into_iter()
            .filter_map(|c| c.duration_delta)
            .min_by_key(|d| d.abs());
        return match nearest {
            Some(d) => format!("duration mismatch: nearest candidate {}", format_delta(Some(d))),
            None => "duration mismatch".to_string(),
        };
    }

    if let Some(StrategyOutcome::BelowThreshold { best_score, threshold }) =
        result.evidence.attempt(Strategy::Fuzzy).map(|a| &a.outcome)
    {
        let hint = if qualifier_mismatch_likely(result) {
            ", title qualifier mismatch likely"
        } else {
            ""
        };
        return format!("no confident match: best fuzzy score {:.2} < {:.2}{}", best_score, threshold, hint);
    }

    "no candidates in library".to_string()
}
