//! Explain how a single request resolves against the library.
//!
//! Usage: explain-request <Library.xml> --title "Yesterday" --artist "The Beatles" [--duration 125]

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use playlist_reconcile::cache::{CacheSnapshot, IdentifierCache, IdentifierLookup};
use playlist_reconcile::cascade::{match_request, MatchConfig};
use playlist_reconcile::catalog::load_library;
use playlist_reconcile::diagnostics::{explain, summary, DiagnosticsConfig};
use playlist_reconcile::index::LibraryIndex;
use playlist_reconcile::models::RequestItem;
use playlist_reconcile::normalize::normalize_identifier;
use playlist_reconcile::scoring::DurationTolerance;

#[derive(Parser)]
#[command(name = "explain-request")]
#[command(about = "Show the match evidence for one playlist entry")]
struct Args {
    library: PathBuf,

    #[arg(long)]
    title: String,

    #[arg(long, default_value = "")]
    artist: String,

    #[arg(long)]
    album: Option<String>,

    /// Request duration in seconds
    #[arg(long)]
    duration: Option<u32>,

    #[arg(long)]
    isrc: Option<String>,

    #[arg(long)]
    disc: Option<u32>,

    #[arg(long)]
    track: Option<u32>,

    /// Identifier cache to consult (never written)
    #[arg(long)]
    cache: Option<PathBuf>,

    #[arg(long, default_value = "3")]
    tolerance_secs: u32,

    #[arg(long, default_value = "2.0")]
    tolerance_pct: f64,

    #[arg(long)]
    no_album: bool,

    #[arg(long, default_value = "0.85")]
    fuzzy_threshold: f64,

    #[arg(long, default_value = "5")]
    max_suggestions: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let index = LibraryIndex::build(load_library(&args.library)?);
    eprintln!("Indexed {} library items", index.len());

    let snapshot = match &args.cache {
        Some(path) if path.exists() => match IdentifierCache::open(path).and_then(|c| c.snapshot()) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                eprintln!("Warning: identifier cache unavailable ({:#})", e);
                None
            }
        },
        Some(path) => {
            eprintln!("Warning: no identifier cache at {}", path.display());
            None
        }
        None => Some(CacheSnapshot::default()),
    };
    let identifiers = snapshot.as_ref().map(|s| s as &(dyn IdentifierLookup + Sync));

    let request = RequestItem {
        title: args.title.clone(),
        artist: args.artist.clone(),
        album: args.album.clone().filter(|a| !a.trim().is_empty()),
        duration_secs: args.duration,
        disc_number: args.disc,
        track_number: args.track,
        identifier: args.isrc.as_deref().and_then(normalize_identifier),
        ..Default::default()
    };

    let config = MatchConfig {
        tolerance: DurationTolerance {
            floor_secs: args.tolerance_secs,
            percent: args.tolerance_pct,
        },
        use_album: !args.no_album,
        fuzzy_threshold: args.fuzzy_threshold,
        ..Default::default()
    };

    let result = match_request(&request, &index, identifiers, &config);
    print!(
        "{}",
        explain(
            &result,
            &DiagnosticsConfig {
                max_suggestions: args.max_suggestions,
                ..Default::default()
            }
        )
    );
    println!("{}", summary(&result));
    Ok(())
}
