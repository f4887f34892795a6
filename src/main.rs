use anyhow::{bail, Context, Result};
use clap::Parser;
use rayon::prelude::*;
use signal_hook::consts::SIGINT;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use playlist_reconcile::cache::{CacheSnapshot, IdentifierCache, IdentifierLookup};
use playlist_reconcile::cascade::{Cascade, MatchConfig};
use playlist_reconcile::catalog::{load_library, load_requests};
use playlist_reconcile::diagnostics::{explain, summary, DiagnosticsConfig};
use playlist_reconcile::index::LibraryIndex;
use playlist_reconcile::models::{LibraryItem, MatchResult, RequestItem, RequestList, RunStats};
use playlist_reconcile::prefetch::{prefetch, PrefetchConfig, PrefetchScope};
use playlist_reconcile::progress::{format_duration, set_log_only, PhaseProgress};
use playlist_reconcile::report::{write_playlist, write_unmatched, UnmatchedRow};
use playlist_reconcile::safety::{playlist_file_name, validate_output_dir, validate_output_path};
use playlist_reconcile::scoring::DurationTolerance;
use playlist_reconcile::tags::SymphoniaReader;

#[derive(Parser)]
#[command(name = "playlist-reconcile")]
#[command(about = "Match exported playlists against a local Music.app library")]
struct Args {
    /// Music.app Library.xml export
    library: PathBuf,

    /// Playlist CSV file, or a directory of CSV files
    requests: PathBuf,

    #[arg(long, default_value = "music_playlists_xml")]
    output_dir: PathBuf,

    /// Duration tolerance floor in seconds
    #[arg(long, default_value = "3")]
    tolerance_secs: u32,

    /// Duration tolerance as a percentage of the longer duration
    #[arg(long, default_value = "2.0")]
    tolerance_pct: f64,

    /// Drop album keys and album tie-breaks from strategies 3-5
    #[arg(long)]
    no_album: bool,

    /// Skip identifier (ISRC) matching and prefetch
    #[arg(long)]
    no_identifiers: bool,

    #[arg(long, default_value = "0.85")]
    fuzzy_threshold: f64,

    /// Ranking bonus for same-album fuzzy candidates
    #[arg(long, default_value = "0.05")]
    album_weight: f64,

    #[arg(long, value_enum, default_value = "matching-albums")]
    prefetch: PrefetchScope,

    /// Worker threads (0 = all cores)
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Maximum audio files read per run
    #[arg(long, default_value = "2000")]
    read_budget: usize,

    #[arg(long, default_value = "5000")]
    read_timeout_ms: u64,

    #[arg(long, default_value = "identifier_cache.sqlite3")]
    cache: PathBuf,

    #[arg(long)]
    no_diagnostics: bool,

    /// Unmatched requests explained on stderr
    #[arg(long, default_value = "25")]
    max_failures: usize,

    #[arg(long, default_value = "3")]
    max_suggestions: usize,

    /// Write run statistics as JSON
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Disable progress bars, print periodic progress lines instead
    #[arg(long)]
    log_only: bool,
}

impl Args {
    fn match_config(&self) -> MatchConfig {
        MatchConfig {
            tolerance: DurationTolerance {
                floor_secs: self.tolerance_secs,
                percent: self.tolerance_pct,
            },
            use_album: !self.no_album,
            use_identifiers: !self.no_identifiers,
            fuzzy_threshold: self.fuzzy_threshold,
            album_weight: self.album_weight,
            ..Default::default()
        }
    }

    fn prefetch_config(&self) -> PrefetchConfig {
        PrefetchConfig {
            scope: self.prefetch,
            workers: self.workers,
            read_budget: self.read_budget,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            ..Default::default()
        }
    }

    fn diagnostics_config(&self) -> DiagnosticsConfig {
        DiagnosticsConfig {
            enabled: !self.no_diagnostics,
            max_failures: self.max_failures,
            max_suggestions: self.max_suggestions,
        }
    }
}

// ============================================================================
// Phases
// ============================================================================

fn build_index(path: &Path, stats: &mut RunStats) -> Result<LibraryIndex> {
    let spinner = PhaseProgress::spinner("LIBRARY", "Reading library catalog");
    let records = load_library(path)?;
    let index = LibraryIndex::build(records);
    let s = index.stats();
    spinner.finish(&format!(
        "Indexed {} of {} records ({} malformed, {} remote, {} duplicate ids skipped)",
        s.indexed, s.records_seen, s.malformed_skipped, s.remote_skipped, s.duplicate_ids_skipped
    ));
    stats.index = s.clone();
    Ok(index)
}

/// Open the cache, run prefetch and freeze the result for matching.
///
/// Any cache failure degrades to matching without identifiers.
fn resolve_identifiers(
    args: &Args,
    index: &LibraryIndex,
    playlists: &[RequestList],
    interrupted: &AtomicBool,
    stats: &mut RunStats,
) -> Option<CacheSnapshot> {
    if args.no_identifiers {
        return None;
    }
    let cache = match IdentifierCache::open(&args.cache) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Warning: identifier cache unavailable ({:#}); identifier matching disabled", e);
            return None;
        }
    };

    if args.prefetch != PrefetchScope::None {
        let requests: Vec<&RequestItem> = playlists.iter().flat_map(|p| p.items.iter()).collect();
        match prefetch(
            index,
            &requests,
            &cache,
            &args.prefetch_config(),
            Arc::new(SymphoniaReader),
            interrupted,
        ) {
            Ok(report) => {
                stats.prefetch_selected = report.selected;
                stats.prefetch_read = report.read;
                stats.prefetch_updated = report.updated;
                stats.prefetch_failures = report.failures;
                if report.selected > report.dispatched && !report.aborted {
                    eprintln!(
                        "[PREFETCH] {} items left for later runs (read budget {})",
                        report.selected - report.dispatched,
                        args.read_budget
                    );
                }
            }
            Err(e) => eprintln!("Warning: prefetch failed ({:#}); continuing with cached identifiers", e),
        }
    }

    match cache.snapshot() {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            eprintln!("Warning: identifier cache unreadable ({:#}); identifier matching disabled", e);
            None
        }
    }
}

fn match_playlists<'a>(
    playlists: &'a [RequestList],
    index: &'a LibraryIndex,
    identifiers: Option<&(dyn IdentifierLookup + Sync)>,
    config: &MatchConfig,
) -> Vec<Vec<MatchResult<'a>>> {
    let total: usize = playlists.iter().map(|p| p.items.len()).sum();
    let progress = PhaseProgress::new("MATCH", total as u64, "Matching requests");
    let cascade = Cascade::default();

    let results: Vec<Vec<MatchResult<'a>>> = playlists
        .iter()
        .map(|playlist| {
            playlist
                .items
                .par_iter()
                .map(|request| {
                    let result = cascade.run(request, index, identifiers, config);
                    progress.inc(1);
                    result
                })
                .collect()
        })
        .collect();

    let matched = results.iter().flatten().filter(|r| r.is_matched()).count();
    progress.finish(&format!("Matched {}/{} requests", matched, total));
    results
}

fn write_outputs(
    args: &Args,
    playlists: &[RequestList],
    results: &[Vec<MatchResult<'_>>],
    stats: &mut RunStats,
) -> Result<()> {
    let sources: [&Path; 3] = [&args.library, &args.requests, &args.cache];
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create output directory {}", args.output_dir.display()))?;

    let diagnostics = args.diagnostics_config();
    let mut explained = 0usize;
    let mut unmatched_rows: Vec<UnmatchedRow> = Vec::new();

    for (playlist, playlist_results) in playlists.iter().zip(results) {
        stats.playlists += 1;
        stats.malformed_request_rows += playlist.malformed_rows;

        let mut matched: Vec<&LibraryItem> = Vec::with_capacity(playlist_results.len());
        for result in playlist_results {
            stats.record(result);
            match result.item {
                Some(item) => matched.push(item),
                None => {
                    if diagnostics.enabled && explained < diagnostics.max_failures {
                        eprint!("{}", explain(result, &diagnostics));
                        explained += 1;
                    }
                    unmatched_rows.push(UnmatchedRow {
                        playlist: playlist.name.clone(),
                        row: result.request.row,
                        artist: result.request.artist.clone(),
                        track: result.request.title.clone(),
                        album: result.request.album.clone().unwrap_or_default(),
                        reason: summary(result),
                    });
                }
            }
        }

        let unmatched = playlist_results.len() - matched.len();
        if matched.is_empty() {
            println!("✗ {}: No matches found", playlist.name);
            continue;
        }
        let path = args.output_dir.join(playlist_file_name(&playlist.name));
        validate_output_path(&path, &sources)?;
        write_playlist(&path, &playlist.name, &matched)?;
        stats.playlists_written += 1;
        println!("✓ {}: {} tracks matched ({} unmatched)", playlist.name, matched.len(), unmatched);
    }

    if diagnostics.enabled && stats.unmatched > explained {
        eprintln!("... {} more unmatched requests not explained", stats.unmatched - explained);
    }

    if !unmatched_rows.is_empty() {
        let path = args.output_dir.join("_unmatched.tsv");
        validate_output_path(&path, &sources)?;
        write_unmatched(&path, &unmatched_rows)?;
        println!("Unmatched tracks written to {}", path.display());
    }
    Ok(())
}

/// First Ctrl-C sets the flag; a second one exits immediately.
fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register_conditional_shutdown(SIGINT, 130, Arc::clone(&interrupted))
        .context("Failed to install interrupt handler")?;
    signal_hook::flag::register(SIGINT, Arc::clone(&interrupted))
        .context("Failed to install interrupt handler")?;
    Ok(interrupted)
}

fn main() -> Result<()> {
    let args = Args::parse();
    set_log_only(args.log_only);
    let interrupted = install_interrupt_handler()?;

    if args.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build_global()
            .context("Failed to set thread pool size")?;
    }

    let sources: [&Path; 3] = [&args.library, &args.requests, &args.cache];
    validate_output_dir(&args.output_dir, &sources)?;
    if let Some(ref stats_path) = args.stats {
        validate_output_path(stats_path, &sources)?;
    }

    let start = Instant::now();
    let mut stats = RunStats::default();

    let index = build_index(&args.library, &mut stats)?;
    if index.is_empty() {
        eprintln!("Warning: library contains no local tracks; every request will be unmatched");
    }

    let catalog = load_requests(&args.requests)?;
    stats.skipped_request_files = catalog.skipped_files;
    let playlists = &catalog.playlists;
    let request_count: usize = playlists.iter().map(|p| p.items.len()).sum();
    eprintln!(
        "[REQUESTS] {} playlists, {} requests ({} unreadable files skipped)",
        playlists.len(),
        request_count,
        catalog.skipped_files
    );

    let snapshot = resolve_identifiers(&args, &index, playlists, &interrupted, &mut stats);
    if interrupted.load(Ordering::Relaxed) {
        bail!("Interrupted; {} identifier cache entries were committed", stats.prefetch_updated);
    }
    let identifiers = snapshot.as_ref().map(|s| s as &(dyn IdentifierLookup + Sync));

    let config = args.match_config();
    let results = match_playlists(playlists, &index, identifiers, &config);
    if interrupted.load(Ordering::Relaxed) {
        bail!("Interrupted before writing playlists");
    }
    write_outputs(&args, playlists, &results, &mut stats)?;

    stats.elapsed_seconds = start.elapsed().as_secs_f64();
    stats.log_phase("final");
    if let Some(ref stats_path) = args.stats {
        stats.write_to_file(stats_path)?;
    }

    println!("\n{:=<60}", "");
    println!("Reconcile complete!");
    println!("  Playlists: {} ({} written)", stats.playlists, stats.playlists_written);
    println!(
        "  Matched: {}/{} ({:.1}%)",
        stats.total_matches,
        stats.total_requests,
        stats.match_rate()
    );
    println!("  Ambiguous: {}", stats.ambiguous);
    println!("  Output: {}", args.output_dir.display());
    println!("  Elapsed: {}", format_duration(start.elapsed()));
    println!("{:=<60}", "");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_sets_abort_flag() {
        let interrupted = install_interrupt_handler().unwrap();
        assert!(!interrupted.load(Ordering::SeqCst));
        // First Ctrl-C only raises the flag; the process keeps running
        signal_hook::low_level::raise(SIGINT).unwrap();
        assert!(interrupted.load(Ordering::SeqCst));
    }
}
