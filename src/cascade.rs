//! Layered match cascade.
//!
//! A request runs through an ordered list of [`Matcher`]s. The first one that
//! ends with a unique, duration-consistent candidate wins; every attempt is
//! recorded in the evidence trail whether it matched or not.
//!
//! Strategies, in order:
//! 1. Identifier (ISRC): catalog identifiers plus cache-resolved ones
//! 2. Structural: `album|disc|track`
//! 3. Normalized keys: `artist|title|album`, `artist|title`, `primary_artist|title`
//! 4. Qualifier-stripped versions of the keys in (3)
//! 5. Fuzzy token-set similarity over title and artist
//!
//! Tie-breaks for 2-5, in order: duration check, album narrowing (3-5),
//! unique smallest duration delta. Anything still tied is ambiguous and falls
//! through; the cascade never guesses.

use rustc_hash::FxHashSet;

use crate::cache::IdentifierLookup;
use crate::index::{KeyKind, LibraryIndex, NormalizedFields};
use crate::models::{
    CandidateEvidence, EvidenceTrail, ItemId, MatchResult, RequestItem, StageEvidence, Strategy,
    StrategyEvidence, StrategyOutcome,
};
use crate::normalize::{normalize_identifier, tokens};
use crate::scoring::{duration_delta, fuzzy_score, DurationTolerance, SCORE_EPSILON};

// ============================================================================
// Configuration
// ============================================================================

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.85;
pub const DEFAULT_ALBUM_WEIGHT: f64 = 0.05;
pub const DEFAULT_TITLE_WEIGHT: f64 = 0.7;

/// Candidates kept per stage in the evidence trail (counts stay exact).
const MAX_STAGE_CANDIDATES: usize = 10;

const CONFIDENCE_IDENTIFIER: f64 = 1.0;
const CONFIDENCE_STRUCTURAL: f64 = 0.95;
const CONFIDENCE_NORMALIZED: [f64; 3] = [0.90, 0.85, 0.80];
const CONFIDENCE_STRIPPED: [f64; 3] = [0.75, 0.70, 0.65];
const CONFIDENCE_FUZZY_MAX: f64 = 0.6;

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub tolerance: DurationTolerance,
    /// Album keys, album narrowing and the fuzzy album bonus (strategies 3-5).
    /// Identifier and structural matching always run.
    pub use_album: bool,
    pub use_identifiers: bool,
    pub fuzzy_threshold: f64,
    /// Ranking bonus for same-album fuzzy candidates; never counts toward the threshold
    pub album_weight: f64,
    pub title_weight: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tolerance: DurationTolerance::default(),
            use_album: true,
            use_identifiers: true,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            album_weight: DEFAULT_ALBUM_WEIGHT,
            title_weight: DEFAULT_TITLE_WEIGHT,
        }
    }
}

// ============================================================================
// Matcher Contract
// ============================================================================

/// Everything a matcher may read. Shared across threads while matching.
#[derive(Clone, Copy)]
pub struct MatchContext<'a> {
    pub index: &'a LibraryIndex,
    /// None when the identifier cache could not be opened
    pub identifiers: Option<&'a (dyn IdentifierLookup + Sync)>,
    pub config: &'a MatchConfig,
}

/// A request with its normalized fields computed once.
pub struct PreparedRequest<'r> {
    pub request: &'r RequestItem,
    pub fields: NormalizedFields,
    pub identifier: Option<String>,
}

impl<'r> PreparedRequest<'r> {
    pub fn new(request: &'r RequestItem) -> Self {
        Self {
            request,
            fields: NormalizedFields::new(
                &request.title,
                &request.artist,
                request.album.as_deref(),
                request.disc_number,
                request.track_number,
            ),
            identifier: request.identifier.as_deref().and_then(normalize_identifier),
        }
    }

    fn has_album(&self) -> bool {
        !self.fields.album.is_empty()
    }
}

/// One strategy of the cascade.
pub trait Matcher: Send + Sync {
    fn strategy(&self) -> Strategy;
    fn attempt(&self, ctx: &MatchContext<'_>, request: &PreparedRequest<'_>) -> StrategyEvidence;
}

// ============================================================================
// Cascade
// ============================================================================

pub struct Cascade {
    matchers: Vec<Box<dyn Matcher>>,
}

impl Default for Cascade {
    fn default() -> Self {
        Self::new(vec![
            Box::new(IdentifierMatcher),
            Box::new(StructuralMatcher),
            Box::new(KeyMatcher { stripped: false }),
            Box::new(KeyMatcher { stripped: true }),
            Box::new(FuzzyMatcher),
        ])
    }
}

impl Cascade {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }

    pub fn strategies(&self) -> Vec<Strategy> {
        self.matchers.iter().map(|m| m.strategy()).collect()
    }

    /// Run one request through every matcher until one matches.
    pub fn run<'a>(
        &self,
        request: &'a RequestItem,
        index: &'a LibraryIndex,
        identifiers: Option<&(dyn IdentifierLookup + Sync)>,
        config: &MatchConfig,
    ) -> MatchResult<'a> {
        let ctx = MatchContext {
            index,
            identifiers,
            config,
        };
        let prepared = PreparedRequest::new(request);
        let mut evidence = EvidenceTrail {
            request_label: format!("{} - {}", request.artist, request.title),
            request_duration: request.duration_secs,
            attempts: Vec::with_capacity(self.matchers.len()),
        };

        for matcher in &self.matchers {
            let attempt = matcher.attempt(&ctx, &prepared);
            let won = match attempt.outcome {
                StrategyOutcome::Matched { item, confidence, .. } => Some((item, confidence)),
                _ => None,
            };
            evidence.attempts.push(attempt);
            if let Some((item, confidence)) = won {
                return MatchResult {
                    request,
                    item: Some(index.item(item)),
                    strategy: Some(matcher.strategy()),
                    confidence,
                    evidence,
                };
            }
        }

        MatchResult {
            request,
            item: None,
            strategy: None,
            confidence: 0.0,
            evidence,
        }
    }
}

/// Match one request with the standard cascade.
pub fn match_request<'a>(
    request: &'a RequestItem,
    index: &'a LibraryIndex,
    identifiers: Option<&(dyn IdentifierLookup + Sync)>,
    config: &MatchConfig,
) -> MatchResult<'a> {
    Cascade::default().run(request, index, identifiers, config)
}

// ============================================================================
// Shared Selection
// ============================================================================

enum Pick {
    Unique(ItemId),
    DurationRejected(usize),
    Ambiguous(usize),
}

/// Apply the tie-break chain to a candidate set.
fn pick(ctx: &MatchContext<'_>, request: &PreparedRequest<'_>, candidates: &[ItemId], narrow_by_album: bool) -> Pick {
    let tolerance = &ctx.config.tolerance;
    let requested = request.request.duration_secs;

    let mut survivors: Vec<ItemId> = candidates
        .iter()
        .copied()
        .filter(|&id| tolerance.accepts_optional(requested, ctx.index.item(id).duration_secs))
        .collect();
    if survivors.is_empty() {
        return Pick::DurationRejected(candidates.len());
    }
    if survivors.len() == 1 {
        return Pick::Unique(survivors[0]);
    }

    if narrow_by_album && ctx.config.use_album && request.has_album() {
        let narrowed: Vec<ItemId> = survivors
            .iter()
            .copied()
            .filter(|&id| ctx.index.fields(id).same_album(&request.fields))
            .collect();
        if !narrowed.is_empty() {
            survivors = narrowed;
        }
        if survivors.len() == 1 {
            return Pick::Unique(survivors[0]);
        }
    }

    if let Some(requested) = requested {
        let delta = |id: ItemId| ctx.index.item(id).duration_secs.abs_diff(requested);
        let best = survivors.iter().map(|&id| delta(id)).min().unwrap_or(0);
        survivors.retain(|&id| delta(id) == best);
        if survivors.len() == 1 {
            return Pick::Unique(survivors[0]);
        }
    }

    Pick::Ambiguous(survivors.len())
}

fn candidate_evidence(ctx: &MatchContext<'_>, request: &PreparedRequest<'_>, id: ItemId, similarity: Option<f64>) -> CandidateEvidence {
    let item = ctx.index.item(id);
    CandidateEvidence {
        item: id,
        persistent_id: item.persistent_id.clone(),
        label: ctx.index.display_label(id),
        duration_secs: item.duration_secs,
        duration_delta: duration_delta(request.request.duration_secs, item.duration_secs),
        within_tolerance: ctx
            .config
            .tolerance
            .accepts_optional(request.request.duration_secs, item.duration_secs),
        similarity,
    }
}

fn stage_evidence(
    ctx: &MatchContext<'_>,
    request: &PreparedRequest<'_>,
    stage: &'static str,
    key: String,
    candidates: &[ItemId],
) -> StageEvidence {
    StageEvidence {
        stage,
        key,
        candidate_count: candidates.len(),
        candidates: candidates
            .iter()
            .take(MAX_STAGE_CANDIDATES)
            .map(|&id| candidate_evidence(ctx, request, id, None))
            .collect(),
    }
}

/// Worst-to-best folding of per-stage failures: ambiguity beats a duration
/// rejection, which beats finding nothing.
fn fold_failure(current: StrategyOutcome, next: StrategyOutcome) -> StrategyOutcome {
    fn rank(o: &StrategyOutcome) -> u8 {
        match o {
            StrategyOutcome::Ambiguous { .. } => 3,
            StrategyOutcome::DurationRejected { .. } => 2,
            StrategyOutcome::BelowThreshold { .. } => 1,
            _ => 0,
        }
    }
    if rank(&next) > rank(&current) {
        next
    } else {
        current
    }
}

fn pick_outcome(pick: Pick, stage: &'static str, confidence: f64) -> StrategyOutcome {
    match pick {
        Pick::Unique(item) => StrategyOutcome::Matched {
            item,
            stage,
            confidence,
        },
        Pick::DurationRejected(candidates) => StrategyOutcome::DurationRejected { candidates },
        Pick::Ambiguous(survivors) => StrategyOutcome::Ambiguous { survivors },
    }
}

// ============================================================================
// Strategy 1: Identifier
// ============================================================================

pub struct IdentifierMatcher;

impl IdentifierMatcher {
    /// Items whose identifier may be known to the cache: album members,
    /// structural hits and every normalized or stripped key hit.
    fn candidate_pool(ctx: &MatchContext<'_>, request: &PreparedRequest<'_>) -> Vec<ItemId> {
        let mut pool: Vec<ItemId> = Vec::new();
        if request.has_album() {
            pool.extend_from_slice(ctx.index.album_members(&request.fields.album));
        }
        for kind in [KeyKind::AlbumDiscTrack]
            .into_iter()
            .chain(KeyKind::NORMALIZED)
            .chain(KeyKind::STRIPPED)
        {
            if let Some(key) = kind.key_for(&request.fields) {
                pool.extend_from_slice(ctx.index.lookup(kind, &key));
            }
        }
        pool.sort_unstable();
        pool.dedup();
        pool
    }
}

impl Matcher for IdentifierMatcher {
    fn strategy(&self) -> Strategy {
        Strategy::Identifier
    }

    fn attempt(&self, ctx: &MatchContext<'_>, request: &PreparedRequest<'_>) -> StrategyEvidence {
        if !ctx.config.use_identifiers {
            return StrategyEvidence::skipped(Strategy::Identifier, "identifier matching disabled");
        }
        let Some(cache) = ctx.identifiers else {
            return StrategyEvidence::skipped(Strategy::Identifier, "identifier cache unavailable");
        };
        let Some(identifier) = request.identifier.as_deref() else {
            return StrategyEvidence::skipped(Strategy::Identifier, "request has no identifier");
        };

        let catalog_hits = ctx.index.by_identifier(identifier);
        let cache_hits: Vec<ItemId> = Self::candidate_pool(ctx, request)
            .into_iter()
            .filter(|&id| ctx.index.item(id).identifier.is_none())
            .filter(|&id| cache.status(&ctx.index.item(id).location).identifier() == Some(identifier))
            .collect();

        let stages = vec![
            stage_evidence(ctx, request, "catalog", identifier.to_string(), catalog_hits),
            stage_evidence(ctx, request, "cache", identifier.to_string(), &cache_hits),
        ];

        let mut hits: Vec<ItemId> = catalog_hits.iter().chain(cache_hits.iter()).copied().collect();
        hits.sort_unstable();
        hits.dedup();

        // Same identifier on several items (album + compilation): album decides
        if hits.len() > 1 && request.has_album() {
            let on_album: Vec<ItemId> = hits
                .iter()
                .copied()
                .filter(|&id| ctx.index.fields(id).same_album(&request.fields))
                .collect();
            if !on_album.is_empty() {
                hits = on_album;
            }
        }

        let outcome = match hits.as_slice() {
            [] => StrategyOutcome::NoCandidates,
            [only] => StrategyOutcome::Matched {
                item: *only,
                stage: if catalog_hits.contains(only) { "catalog" } else { "cache" },
                confidence: CONFIDENCE_IDENTIFIER,
            },
            many => StrategyOutcome::Ambiguous { survivors: many.len() },
        };

        StrategyEvidence {
            strategy: Strategy::Identifier,
            stages,
            outcome,
        }
    }
}

// ============================================================================
// Strategy 2: Structural
// ============================================================================

pub struct StructuralMatcher;

impl Matcher for StructuralMatcher {
    fn strategy(&self) -> Strategy {
        Strategy::Structural
    }

    fn attempt(&self, ctx: &MatchContext<'_>, request: &PreparedRequest<'_>) -> StrategyEvidence {
        let Some(key) = KeyKind::AlbumDiscTrack.key_for(&request.fields) else {
            return StrategyEvidence::skipped(Strategy::Structural, "request has no album and track number");
        };

        let candidates = ctx.index.lookup(KeyKind::AlbumDiscTrack, &key);
        let stage = KeyKind::AlbumDiscTrack.label();
        let outcome = if candidates.is_empty() {
            StrategyOutcome::NoCandidates
        } else {
            pick_outcome(pick(ctx, request, candidates, false), stage, CONFIDENCE_STRUCTURAL)
        };

        StrategyEvidence {
            strategy: Strategy::Structural,
            stages: vec![stage_evidence(ctx, request, stage, key, candidates)],
            outcome,
        }
    }
}

// ============================================================================
// Strategies 3 and 4: Normalized / Qualifier-stripped keys
// ============================================================================

/// Walks the three string keys in order. `stripped` selects the
/// qualifier-stripped variants.
pub struct KeyMatcher {
    pub stripped: bool,
}

impl Matcher for KeyMatcher {
    fn strategy(&self) -> Strategy {
        if self.stripped {
            Strategy::QualifierStripped
        } else {
            Strategy::NormalizedKey
        }
    }

    fn attempt(&self, ctx: &MatchContext<'_>, request: &PreparedRequest<'_>) -> StrategyEvidence {
        let (kinds, confidences) = if self.stripped {
            (KeyKind::STRIPPED, CONFIDENCE_STRIPPED)
        } else {
            (KeyKind::NORMALIZED, CONFIDENCE_NORMALIZED)
        };

        let mut stages = Vec::with_capacity(kinds.len());
        let mut outcome = StrategyOutcome::NoCandidates;

        for (kind, confidence) in kinds.into_iter().zip(confidences) {
            let uses_album = matches!(kind, KeyKind::ArtistTitleAlbum | KeyKind::StrippedArtistTitleAlbum);
            if uses_album && !ctx.config.use_album {
                continue;
            }
            let Some(key) = kind.key_for(&request.fields) else {
                continue;
            };

            let candidates = ctx.index.lookup(kind, &key);
            stages.push(stage_evidence(ctx, request, kind.label(), key, candidates));
            if candidates.is_empty() {
                continue;
            }

            match pick_outcome(pick(ctx, request, candidates, true), kind.label(), confidence) {
                matched @ StrategyOutcome::Matched { .. } => {
                    outcome = matched;
                    break;
                }
                failure => outcome = fold_failure(outcome, failure),
            }
        }

        StrategyEvidence {
            strategy: self.strategy(),
            stages,
            outcome,
        }
    }
}

// ============================================================================
// Strategy 5: Fuzzy
// ============================================================================

pub struct FuzzyMatcher;

struct Scored {
    id: ItemId,
    score: f64,
    rank: f64,
    within_tolerance: bool,
}

impl Matcher for FuzzyMatcher {
    fn strategy(&self) -> Strategy {
        Strategy::Fuzzy
    }

    fn attempt(&self, ctx: &MatchContext<'_>, request: &PreparedRequest<'_>) -> StrategyEvidence {
        let config = ctx.config;
        let f = &request.fields;

        let mut seen: FxHashSet<ItemId> = FxHashSet::default();
        let mut candidates: Vec<ItemId> = Vec::new();
        for token in tokens(&f.title).into_iter().chain(tokens(&f.stripped_title)) {
            for &id in ctx.index.by_title_token(token) {
                if seen.insert(id) {
                    candidates.push(id);
                }
            }
        }
        candidates.sort_unstable();

        let mut scored: Vec<Scored> = candidates
            .iter()
            .map(|&id| {
                let item = ctx.index.fields(id);
                let plain = fuzzy_score(
                    &f.title,
                    &f.artist,
                    &f.primary_artist,
                    &item.title,
                    &item.artist,
                    &item.primary_artist,
                    config.title_weight,
                );
                let stripped = fuzzy_score(
                    &f.stripped_title,
                    &f.artist,
                    &f.primary_artist,
                    &item.stripped_title,
                    &item.artist,
                    &item.primary_artist,
                    config.title_weight,
                );
                let score = plain.max(stripped);
                let bonus = if config.use_album && item.same_album(f) {
                    config.album_weight
                } else {
                    0.0
                };
                Scored {
                    id,
                    score,
                    rank: score + bonus,
                    within_tolerance: config
                        .tolerance
                        .accepts_optional(request.request.duration_secs, ctx.index.item(id).duration_secs),
                }
            })
            .collect();
        scored.sort_by(|a, b| b.rank.total_cmp(&a.rank).then(a.id.cmp(&b.id)));

        let stage = StageEvidence {
            stage: "token-set",
            key: f.title.clone(),
            candidate_count: scored.len(),
            candidates: scored
                .iter()
                .take(MAX_STAGE_CANDIDATES)
                .map(|s| candidate_evidence(ctx, request, s.id, Some(s.score)))
                .collect(),
        };

        let outcome = Self::decide(ctx, request, &scored);
        StrategyEvidence {
            strategy: Strategy::Fuzzy,
            stages: vec![stage],
            outcome,
        }
    }
}

impl FuzzyMatcher {
    fn decide(ctx: &MatchContext<'_>, request: &PreparedRequest<'_>, scored: &[Scored]) -> StrategyOutcome {
        let threshold = ctx.config.fuzzy_threshold;
        if scored.is_empty() {
            return StrategyOutcome::NoCandidates;
        }

        let above: Vec<&Scored> = scored
            .iter()
            .filter(|s| s.score + SCORE_EPSILON >= threshold)
            .collect();
        if above.is_empty() {
            let best_score = scored.iter().map(|s| s.score).fold(0.0, f64::max);
            return StrategyOutcome::BelowThreshold { best_score, threshold };
        }

        // Only the top-ranked tier may match; a weaker candidate never stands in
        // for a best candidate that fails the duration check
        let best_rank = above[0].rank;
        let top: Vec<&Scored> = above
            .iter()
            .copied()
            .filter(|s| (best_rank - s.rank).abs() <= SCORE_EPSILON)
            .collect();
        let tied: Vec<ItemId> = top.iter().filter(|s| s.within_tolerance).map(|s| s.id).collect();
        if tied.is_empty() {
            return StrategyOutcome::DurationRejected { candidates: top.len() };
        }

        let winner = match pick(ctx, request, &tied, true) {
            Pick::Unique(id) => id,
            Pick::Ambiguous(n) => return StrategyOutcome::Ambiguous { survivors: n },
            Pick::DurationRejected(n) => return StrategyOutcome::DurationRejected { candidates: n },
        };

        let score = top
            .iter()
            .find(|s| s.id == winner)
            .map_or(above[0].score, |s| s.score);
        StrategyOutcome::Matched {
            item: winner,
            stage: "token-set",
            confidence: (CONFIDENCE_FUZZY_MAX * score).min(CONFIDENCE_FUZZY_MAX),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
