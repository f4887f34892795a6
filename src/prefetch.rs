//! Identifier prefetch.
//!
//! Reads embedded identifiers for the library items most likely to matter
//! this run and commits them to the cache. Pipeline:
//!
//! ```text
//! dispatcher --(bounded jobs)--> N readers --(results)--> 1 writer --> SQLite
//! ```
//!
//! The dispatcher stops after `read_budget` jobs or when the abort flag is set.
//! Readers never touch the store; the writer commits in batched transactions.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheEntry, CacheStatus, Fingerprint, IdentifierCache};
use crate::index::LibraryIndex;
use crate::models::{ItemId, RequestItem};
use crate::normalize::normalize;
use crate::progress::PhaseProgress;
use crate::tags::IdentifierReader;

pub const DEFAULT_READ_BUDGET: usize = 2000;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(5000);
const COMMIT_BATCH: usize = 1000;
const COMMIT_EVERY: Duration = Duration::from_millis(750);

/// Which library items prefetch considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PrefetchScope {
    /// Skip prefetch entirely
    None,
    /// Items on an album referenced by a request carrying an identifier
    #[default]
    MatchingAlbums,
    /// Every item without a valid cache entry
    All,
}

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub scope: PrefetchScope,
    pub workers: usize, // 0 = available parallelism
    pub read_budget: usize,
    pub read_timeout: Duration,
    pub commit_batch: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            scope: PrefetchScope::default(),
            workers: 0,
            read_budget: DEFAULT_READ_BUDGET,
            read_timeout: DEFAULT_READ_TIMEOUT,
            commit_batch: COMMIT_BATCH,
        }
    }
}

impl PrefetchConfig {
    fn worker_count(&self, jobs: usize) -> usize {
        let configured = if self.workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8)
        } else {
            self.workers
        };
        configured.clamp(1, jobs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Items in scope still lacking a valid cache entry
    pub selected: usize,
    /// Reads started (never above the read budget)
    pub dispatched: usize,
    /// Files read successfully
    pub read: usize,
    pub with_identifier: usize,
    /// Unreadable, corrupt or timed-out files
    pub failures: usize,
    pub timeouts: usize,
    /// Entries committed to the cache
    pub updated: usize,
    pub aborted: bool,
}

/// Result of reading one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Read(Option<String>),
    Failed(String),
    TimedOut,
}

struct Job {
    path: PathBuf,
}

struct Outcome {
    path: PathBuf,
    fingerprint: Option<Fingerprint>,
    result: ReadOutcome,
}

// ============================================================================
// Selection
// ============================================================================

/// Items in scope that carry no catalog identifier and have no valid cache
/// entry, in catalog order.
pub fn select_targets(
    index: &LibraryIndex,
    requests: &[&RequestItem],
    cache: &IdentifierCache,
    scope: PrefetchScope,
) -> Vec<ItemId> {
    let albums: Option<FxHashSet<String>> = match scope {
        PrefetchScope::None => return Vec::new(),
        PrefetchScope::All => None,
        PrefetchScope::MatchingAlbums => Some(
            requests
                .iter()
                .filter(|r| r.identifier.is_some())
                .filter_map(|r| r.album.as_deref())
                .map(normalize)
                .filter(|a| !a.is_empty())
                .collect(),
        ),
    };

    let in_scope: Vec<ItemId> = match &albums {
        None => (0..index.len()).collect(),
        Some(albums) => {
            let mut ids: Vec<ItemId> = albums
                .iter()
                .flat_map(|album| index.album_members(album).iter().copied())
                .collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        }
    };

    in_scope
        .into_iter()
        .filter(|&id| index.item(id).identifier.is_none())
        .filter(|&id| {
            let status = cache.status(&index.item(id).location).unwrap_or(CacheStatus::Missing);
            !status.is_fresh()
        })
        .collect()
}

// ============================================================================
// Pipeline
// ============================================================================

/// Read identifiers for the selected items and commit them to the cache.
///
/// Per-file failures are counted as misses and never retried in the run.
/// Only a failure of the writer itself is returned as an error.
pub fn prefetch(
    index: &LibraryIndex,
    requests: &[&RequestItem],
    cache: &IdentifierCache,
    config: &PrefetchConfig,
    reader: Arc<dyn IdentifierReader>,
    abort: &AtomicBool,
) -> Result<PrefetchReport> {
    let targets = select_targets(index, requests, cache, config.scope);
    let mut report = PrefetchReport {
        selected: targets.len(),
        ..Default::default()
    };
    if targets.is_empty() || config.read_budget == 0 {
        return Ok(report);
    }

    let planned = targets.len().min(config.read_budget);
    let workers = config.worker_count(planned);
    let progress = PhaseProgress::new("PREFETCH", planned as u64, "Reading identifiers");

    // Job queue holds one job per worker so an abort stops distribution promptly
    let (job_tx, job_rx) = bounded::<Job>(workers);
    let (out_tx, out_rx) = bounded::<Outcome>(planned);
    let (entry_tx, entry_rx) = bounded::<CacheEntry>(planned);

    // Writer opens its own connection; the caller's stays read-only here
    let writer = {
        let db_path = cache.path().to_path_buf();
        let batch_size = config.commit_batch.max(1);
        std::thread::spawn(move || -> Result<usize> {
            let mut conn = IdentifierCache::open(&db_path)?;
            writer_loop(&mut conn, entry_rx, batch_size)
        })
    };

    std::thread::scope(|s| {
        for _ in 0..workers {
            let rx = job_rx.clone();
            let tx = out_tx.clone();
            let reader = Arc::clone(&reader);
            let timeout = config.read_timeout;
            s.spawn(move || worker_loop(rx, tx, reader, timeout, abort));
        }
        drop(job_rx);
        drop(out_tx);

        for &id in targets.iter().take(planned) {
            if abort.load(Ordering::Relaxed) {
                report.aborted = true;
                break;
            }
            let job = Job {
                path: index.item(id).location.clone(),
            };
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        // Fold reader outcomes; successful reads go on to the writer
        for outcome in out_rx.iter() {
            progress.inc(1);
            report.dispatched += 1;
            match outcome.result {
                ReadOutcome::Read(identifier) => {
                    report.read += 1;
                    if identifier.is_some() {
                        report.with_identifier += 1;
                    }
                    if let Some(fingerprint) = outcome.fingerprint {
                        let _ = entry_tx.send(CacheEntry {
                            path: outcome.path,
                            fingerprint,
                            identifier,
                        });
                    }
                }
                ReadOutcome::Failed(_) => report.failures += 1,
                ReadOutcome::TimedOut => {
                    report.failures += 1;
                    report.timeouts += 1;
                }
            }
        }
    });
    drop(entry_tx);
    if abort.load(Ordering::Relaxed) {
        report.aborted = true;
    }

    report.updated = match writer.join() {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(anyhow!("Cache writer thread panicked")),
    };

    progress.finish(&format!(
        "read {} of {} selected, {} identifiers, {} failures, {} committed{}",
        report.read,
        report.selected,
        report.with_identifier,
        report.failures,
        report.updated,
        if report.aborted { " (aborted)" } else { "" }
    ));
    Ok(report)
}

/// Queued jobs are dropped unread once `abort` is set.
fn worker_loop(
    rx: Receiver<Job>,
    tx: Sender<Outcome>,
    reader: Arc<dyn IdentifierReader>,
    timeout: Duration,
    abort: &AtomicBool,
) {
    while let Ok(job) = rx.recv() {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        // Fingerprint before reading so a file modified mid-read is stale next run
        let (fingerprint, result) = match Fingerprint::of(&job.path) {
            Ok(fp) => (Some(fp), read_with_timeout(&reader, &job.path, timeout)),
            Err(e) => (None, ReadOutcome::Failed(format!("{:#}", e))),
        };
        let _ = tx.send(Outcome {
            path: job.path,
            fingerprint,
            result,
        });
    }
}

/// Run one read on a helper thread and give up after `timeout`.
/// A read that never returns leaves its helper thread detached.
pub fn read_with_timeout(
    reader: &Arc<dyn IdentifierReader>,
    path: &Path,
    timeout: Duration,
) -> ReadOutcome {
    let (tx, rx) = bounded(1);
    let reader = Arc::clone(reader);
    let path = path.to_path_buf();
    std::thread::spawn(move || {
        let _ = tx.send(reader.read_identifier(&path));
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(identifier)) => ReadOutcome::Read(identifier),
        Ok(Err(e)) => ReadOutcome::Failed(format!("{:#}", e)),
        Err(RecvTimeoutError::Timeout) => ReadOutcome::TimedOut,
        Err(RecvTimeoutError::Disconnected) => ReadOutcome::Failed("reader thread panicked".to_string()),
    }
}

fn writer_loop(cache: &mut IdentifierCache, rx: Receiver<CacheEntry>, batch_size: usize) -> Result<usize> {
    let mut batch: Vec<CacheEntry> = Vec::with_capacity(batch_size.min(COMMIT_BATCH));
    let mut last_flush = Instant::now();
    let mut committed = 0usize;

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(entry) => {
                batch.push(entry);
                if batch.len() >= batch_size || last_flush.elapsed() >= COMMIT_EVERY {
                    committed += flush_batch(cache, &mut batch)?;
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && last_flush.elapsed() >= COMMIT_EVERY {
                    committed += flush_batch(cache, &mut batch)?;
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if !batch.is_empty() {
                    committed += flush_batch(cache, &mut batch)?;
                }
                break;
            }
        }
    }
    Ok(committed)
}

fn flush_batch(cache: &mut IdentifierCache, batch: &mut Vec<CacheEntry>) -> Result<usize> {
    let n = cache.upsert_batch(batch)?;
    batch.clear();
    Ok(n)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::index::tests::record;
    use crate::models::LibraryRecord;
    use anyhow::bail;
    use rustc_hash::FxHashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Reader that serves identifiers from a map and counts reads.
    #[derive(Default)]
    pub(crate) struct FakeReader {
        pub identifiers: FxHashMap<PathBuf, String>,
        pub failing: FxHashMap<PathBuf, String>,
        pub slow: Option<(PathBuf, Duration)>,
        pub reads: AtomicUsize,
        pub seen: Mutex<Vec<PathBuf>>,
    }

    impl IdentifierReader for FakeReader {
        fn read_identifier(&self, path: &Path) -> Result<Option<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(path.to_path_buf());
            }
            if let Some((slow, delay)) = &self.slow {
                if slow == path {
                    std::thread::sleep(*delay);
                }
            }
            if let Some(msg) = self.failing.get(path) {
                bail!("{}", msg);
            }
            Ok(self.identifiers.get(path).cloned())
        }
    }

    /// Library of `n` real files on one album, all without catalog identifiers.
    pub(crate) fn library_on_disk(dir: &Path, album: &str, n: usize) -> (LibraryIndex, Vec<PathBuf>) {
        let mut records = Vec::new();
        let mut paths = Vec::new();
        for i in 0..n {
            let path = dir.join(format!("track{:03}.m4a", i));
            std::fs::write(&path, format!("audio {}", i)).unwrap();
            let mut rec = record(&format!("P{:03}", i), &format!("Song {}", i), "Artist", album, 200, Some((1, i as u32 + 1)));
            rec.location = Some(path.clone());
            records.push(rec);
            paths.push(path);
        }
        (LibraryIndex::build(records), paths)
    }

    fn request(album: Option<&str>, identifier: Option<&str>) -> RequestItem {
        RequestItem {
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            album: album.map(str::to_string),
            identifier: identifier.map(str::to_string),
            ..Default::default()
        }
    }

    fn config(scope: PrefetchScope, budget: usize) -> PrefetchConfig {
        PrefetchConfig {
            scope,
            workers: 4,
            read_budget: budget,
            read_timeout: Duration::from_secs(5),
            commit_batch: 3,
        }
    }

    #[test]
    fn test_prefetch_respects_read_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = library_on_disk(dir.path(), "Album", 20);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        let reader = Arc::new(FakeReader::default());
        let req = request(Some("Album"), Some("GBUM71029604"));
        let abort = AtomicBool::new(false);

        let report = prefetch(&index, &[&req], &cache, &config(PrefetchScope::All, 7), reader.clone(), &abort).unwrap();

        assert_eq!(report.selected, 20);
        assert_eq!(report.dispatched, 7);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 7);
        assert_eq!(report.read, 7);
        assert_eq!(report.updated, 7);
        assert_eq!(cache.row_count().unwrap(), 7);
    }

    #[test]
    fn test_second_run_skips_cached_items() {
        let dir = tempfile::tempdir().unwrap();
        let (index, paths) = library_on_disk(dir.path(), "Album", 5);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        let mut fake = FakeReader::default();
        fake.identifiers.insert(paths[2].clone(), "GBUM71029604".to_string());
        let reader = Arc::new(fake);
        let req = request(Some("Album"), Some("GBUM71029604"));
        let abort = AtomicBool::new(false);
        let cfg = config(PrefetchScope::MatchingAlbums, 100);

        let first = prefetch(&index, &[&req], &cache, &cfg, reader.clone(), &abort).unwrap();
        assert_eq!(first.updated, 5);
        assert_eq!(first.with_identifier, 1);
        // Negative entries count as valid, so nothing is read again
        let second = prefetch(&index, &[&req], &cache, &cfg, reader.clone(), &abort).unwrap();
        assert_eq!(second.selected, 0);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 5);
        assert_eq!(cache.status(&paths[2]).unwrap(), CacheStatus::Hit("GBUM71029604".to_string()));
        assert_eq!(cache.status(&paths[0]).unwrap(), CacheStatus::NoIdentifier);
    }

    #[test]
    fn test_matching_albums_scope() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<LibraryRecord> = [("W1", "Wanted"), ("W2", "Wanted"), ("U1", "Unrelated"), ("W3", "Wanted")]
            .iter()
            .map(|(pid, album)| {
                let path = dir.path().join(format!("{}.m4a", pid));
                std::fs::write(&path, pid.as_bytes()).unwrap();
                let mut rec = record(pid, &format!("Song {}", pid), "Artist", album, 200, None);
                rec.location = Some(path);
                rec
            })
            .collect();
        let index = LibraryIndex::build(records);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        let with_id = request(Some("wanted"), Some("GBUM71029604"));
        let without_id = request(Some("Unrelated"), None);

        // Only albums of requests that can use an identifier are read
        let targets = select_targets(&index, &[&with_id, &without_id], &cache, PrefetchScope::MatchingAlbums);
        assert_eq!(targets, vec![0, 1, 3]);
        assert_eq!(select_targets(&index, &[&with_id], &cache, PrefetchScope::All).len(), 4);
        assert!(select_targets(&index, &[&with_id], &cache, PrefetchScope::None).is_empty());
    }

    #[test]
    fn test_catalog_identifiers_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known.m4a");
        std::fs::write(&path, b"x").unwrap();
        let mut rec = record("K1", "Known", "Artist", "Album", 200, None);
        rec.location = Some(path);
        rec.identifier = Some("USRC17607839".to_string());
        let index = LibraryIndex::build(vec![rec]);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        assert!(select_targets(&index, &[], &cache, PrefetchScope::All).is_empty());
    }

    #[test]
    fn test_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (index, paths) = library_on_disk(dir.path(), "Album", 6);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        let mut fake = FakeReader::default();
        fake.failing.insert(paths[1].clone(), "corrupt metadata".to_string());
        fake.identifiers.insert(paths[4].clone(), "GBUM71029604".to_string());
        let reader = Arc::new(fake);
        let abort = AtomicBool::new(false);

        // One file vanishes between selection and read
        std::fs::remove_file(&paths[3]).unwrap();
        let report = prefetch(&index, &[], &cache, &config(PrefetchScope::All, 100), reader, &abort).unwrap();

        assert_eq!(report.dispatched, 6);
        assert_eq!(report.failures, 2);
        assert_eq!(report.read, 4);
        assert_eq!(report.updated, 4);
        assert_eq!(cache.status(&paths[1]).unwrap(), CacheStatus::Missing);
        assert_eq!(cache.lookup(&paths[4]).unwrap().as_deref(), Some("GBUM71029604"));
    }

    #[test]
    fn test_read_timeout_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (index, paths) = library_on_disk(dir.path(), "Album", 2);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        let fake = FakeReader {
            slow: Some((paths[0].clone(), Duration::from_millis(500))),
            ..Default::default()
        };
        let abort = AtomicBool::new(false);
        let mut cfg = config(PrefetchScope::All, 100);
        cfg.read_timeout = Duration::from_millis(50);

        let report = prefetch(&index, &[], &cache, &cfg, Arc::new(fake), &abort).unwrap();
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(cache.status(&paths[0]).unwrap(), CacheStatus::Missing);
    }

    #[test]
    fn test_abort_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = library_on_disk(dir.path(), "Album", 10);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        let reader = Arc::new(FakeReader::default());
        let abort = AtomicBool::new(true);

        let report = prefetch(&index, &[], &cache, &config(PrefetchScope::All, 100), reader.clone(), &abort).unwrap();
        assert!(report.aborted);
        assert_eq!(report.dispatched, 0);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
        assert_eq!(report.updated, 0);
    }

    /// Reader that raises the abort flag from inside its first read.
    struct InterruptingReader {
        abort: Arc<AtomicBool>,
        reads: AtomicUsize,
    }

    impl IdentifierReader for InterruptingReader {
        fn read_identifier(&self, _path: &Path) -> Result<Option<String>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.abort.store(true, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn test_abort_during_read_stops_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (index, _) = library_on_disk(dir.path(), "Album", 20);
        let cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        let abort = Arc::new(AtomicBool::new(false));
        let reader = Arc::new(InterruptingReader {
            abort: Arc::clone(&abort),
            reads: AtomicUsize::new(0),
        });
        let mut cfg = config(PrefetchScope::All, 100);
        cfg.workers = 1;

        let report = prefetch(&index, &[], &cache, &cfg, reader.clone(), &abort).unwrap();
        assert!(report.aborted);
        assert_eq!(reader.reads.load(Ordering::SeqCst), 1);
        assert_eq!(report.dispatched, 1);
        // The read that finished before the abort is still committed
        assert_eq!(report.updated, 1);
        assert_eq!(cache.row_count().unwrap(), 1);
    }
}
