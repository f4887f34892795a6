//! Persistent identifier cache.
//!
//! Maps a local file path to the ISRC read from its tags, keyed by a
//! (size, mtime) fingerprint. A row is only trusted while the file on disk
//! still has the recorded fingerprint; anything else reads as a miss.
//! Rows with a NULL identifier are negative entries: the file was read
//! successfully and carries no ISRC.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Size and modification time of a file, used to detect stale cache rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: i64,
    pub mtime_ns: i64,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let md = fs::metadata(path).with_context(|| format!("Stat {}", path.display()))?;
        let mtime_ns = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
            .unwrap_or(0);
        Ok(Self {
            size: md.len().min(i64::MAX as u64) as i64,
            mtime_ns,
        })
    }
}

/// What the cache knows about a file right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh row with an identifier
    Hit(String),
    /// Fresh negative row: the file has no identifier
    NoIdentifier,
    /// No row, stale row, or the file is gone
    Missing,
}

impl CacheStatus {
    pub fn is_fresh(&self) -> bool {
        !matches!(self, CacheStatus::Missing)
    }

    pub fn identifier(&self) -> Option<&str> {
        match self {
            CacheStatus::Hit(id) => Some(id),
            _ => None,
        }
    }
}

/// One row to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub identifier: Option<String>,
}

/// Read-only identifier lookups used by the match cascade.
pub trait IdentifierLookup {
    fn status(&self, path: &Path) -> CacheStatus;
}

// ============================================================================
// SQLite-backed cache
// ============================================================================

pub struct IdentifierCache {
    conn: Connection,
    path: PathBuf,
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;

        CREATE TABLE IF NOT EXISTS identifier_cache (
          file_path   TEXT PRIMARY KEY,
          file_size   INTEGER NOT NULL,
          file_mtime  INTEGER NOT NULL,
          identifier  TEXT,
          updated_at  INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

impl IdentifierCache {
    /// Open (or create) the cache database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open identifier cache {}", path.display()))?;
        init_db(&conn).with_context(|| format!("Failed to initialize {}", path.display()))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw stored row for a path, without checking freshness.
    pub fn stored(&self, path: &Path) -> Result<Option<(Fingerprint, Option<String>)>> {
        let row = self
            .conn
            .query_row(
                "SELECT file_size, file_mtime, identifier FROM identifier_cache WHERE file_path=?1",
                params![path_key(path)],
                |row| {
                    Ok((
                        Fingerprint {
                            size: row.get(0)?,
                            mtime_ns: row.get(1)?,
                        },
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Freshness-checked status of a path.
    pub fn status(&self, path: &Path) -> Result<CacheStatus> {
        let Some((stored, identifier)) = self.stored(path)? else {
            return Ok(CacheStatus::Missing);
        };
        let Ok(current) = Fingerprint::of(path) else {
            return Ok(CacheStatus::Missing);
        };
        Ok(classify(stored, current, identifier))
    }

    /// Identifier for a path, only while its fingerprint is unchanged.
    pub fn lookup(&self, path: &Path) -> Result<Option<String>> {
        Ok(match self.status(path)? {
            CacheStatus::Hit(id) => Some(id),
            _ => None,
        })
    }

    /// Insert or replace rows in one transaction. Returns rows written.
    pub fn upsert_batch(&mut self, entries: &[CacheEntry]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO identifier_cache (file_path,file_size,file_mtime,identifier,updated_at)
                VALUES (?1,?2,?3,?4,?5)
                ON CONFLICT(file_path) DO UPDATE SET
                  file_size=excluded.file_size,
                  file_mtime=excluded.file_mtime,
                  identifier=excluded.identifier,
                  updated_at=excluded.updated_at
                "#,
            )?;
            let now = now_unix();
            for entry in entries {
                stmt.execute(params![
                    path_key(&entry.path),
                    entry.fingerprint.size,
                    entry.fingerprint.mtime_ns,
                    entry.identifier,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// Number of stored rows (fresh or not).
    pub fn row_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM identifier_cache", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Load every fresh row into memory for parallel matching.
    /// Rows whose file changed or disappeared are left out.
    pub fn snapshot(&self) -> Result<CacheSnapshot> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_path, file_size, file_mtime, identifier FROM identifier_cache")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Fingerprint {
                    size: row.get(1)?,
                    mtime_ns: row.get(2)?,
                },
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut entries = FxHashMap::default();
        for row in rows {
            let (path, stored, identifier) = row?;
            let path = PathBuf::from(path);
            let Ok(current) = Fingerprint::of(&path) else {
                continue;
            };
            match classify(stored, current, identifier) {
                CacheStatus::Missing => {}
                status => {
                    entries.insert(path, status);
                }
            }
        }
        Ok(CacheSnapshot { entries })
    }
}

impl IdentifierLookup for IdentifierCache {
    fn status(&self, path: &Path) -> CacheStatus {
        IdentifierCache::status(self, path).unwrap_or(CacheStatus::Missing)
    }
}

fn classify(stored: Fingerprint, current: Fingerprint, identifier: Option<String>) -> CacheStatus {
    if stored != current {
        return CacheStatus::Missing;
    }
    match identifier {
        Some(id) => CacheStatus::Hit(id),
        None => CacheStatus::NoIdentifier,
    }
}

// ============================================================================
// In-memory snapshot
// ============================================================================

/// Fresh cache rows held in memory. Shareable across matching threads.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    entries: FxHashMap<PathBuf, CacheStatus>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifier for a path, if a fresh positive row was present.
    pub fn lookup(&self, path: &Path) -> Option<&str> {
        self.entries.get(path).and_then(CacheStatus::identifier)
    }
}

impl IdentifierLookup for CacheSnapshot {
    fn status(&self, path: &Path) -> CacheStatus {
        self.entries.get(path).cloned().unwrap_or(CacheStatus::Missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
        f.sync_all().unwrap();
    }

    fn entry(path: &Path, identifier: Option<&str>) -> CacheEntry {
        CacheEntry {
            path: path.to_path_buf(),
            fingerprint: Fingerprint::of(path).unwrap(),
            identifier: identifier.map(str::to_string),
        }
    }

    #[test]
    fn test_hit_and_negative_entries() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("song.m4a");
        let plain = dir.path().join("plain.mp3");
        write_file(&song, b"audio");
        write_file(&plain, b"other audio");

        let mut cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        assert_eq!(cache.status(&song).unwrap(), CacheStatus::Missing);

        let written = cache
            .upsert_batch(&[entry(&song, Some("GBUM71029604")), entry(&plain, None)])
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(cache.status(&song).unwrap(), CacheStatus::Hit("GBUM71029604".to_string()));
        assert_eq!(cache.status(&plain).unwrap(), CacheStatus::NoIdentifier);
        assert_eq!(cache.lookup(&song).unwrap().as_deref(), Some("GBUM71029604"));
        assert_eq!(cache.lookup(&plain).unwrap(), None);
        assert_eq!(cache.row_count().unwrap(), 2);
    }

    #[test]
    fn test_stale_fingerprint_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("song.flac");
        write_file(&song, b"audio");

        let mut cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        cache.upsert_batch(&[entry(&song, Some("USRC17607839"))]).unwrap();

        // Size changes, so the fingerprint no longer matches
        write_file(&song, b"re-tagged audio file");
        assert_eq!(cache.status(&song).unwrap(), CacheStatus::Missing);
        assert!(cache.stored(&song).unwrap().is_some());
        assert_eq!(cache.lookup(&song).unwrap(), None);
        assert!(cache.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_deleted_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("gone.mp3");
        write_file(&song, b"audio");

        let mut cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        cache.upsert_batch(&[entry(&song, Some("USRC17607839"))]).unwrap();
        fs::remove_file(&song).unwrap();
        assert_eq!(cache.status(&song).unwrap(), CacheStatus::Missing);
    }

    #[test]
    fn test_upsert_replaces_row() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("song.m4a");
        write_file(&song, b"audio");

        let mut cache = IdentifierCache::open(&dir.path().join("cache.sqlite3")).unwrap();
        cache.upsert_batch(&[entry(&song, None)]).unwrap();
        cache.upsert_batch(&[entry(&song, Some("GBUM71029604"))]).unwrap();
        assert_eq!(cache.row_count().unwrap(), 1);
        assert_eq!(cache.status(&song).unwrap().identifier(), Some("GBUM71029604"));
    }

    #[test]
    fn test_cache_survives_reopen_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cache.sqlite3");
        let song = dir.path().join("song.m4a");
        write_file(&song, b"audio");

        {
            let mut cache = IdentifierCache::open(&db).unwrap();
            cache.upsert_batch(&[entry(&song, Some("GBUM71029604"))]).unwrap();
        }

        let cache = IdentifierCache::open(&db).unwrap();
        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            IdentifierLookup::status(&snapshot, &song),
            CacheStatus::Hit("GBUM71029604".to_string())
        );
        assert_eq!(
            IdentifierLookup::status(&snapshot, &dir.path().join("other.mp3")),
            CacheStatus::Missing
        );
    }
}
