//! Catalog loading: the Music.app library export and request CSVs.
//!
//! This module contains:
//! - A minimal Apple plist reader (quick-xml events -> [`PlistValue`])
//! - `Library.xml` track extraction into [`LibraryRecord`]s
//! - Exportify-style CSV reading into [`RequestList`]s

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::models::{LibraryRecord, RequestItem, RequestList};
use crate::normalize::normalize_identifier;

// ============================================================================
// Plist Values
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    Dict(Vec<(String, PlistValue)>),
    Array(Vec<PlistValue>),
    String(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Date(String),
    Data(String),
}

impl PlistValue {
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        match self {
            PlistValue::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PlistValue::Integer(n) => Some(*n),
            PlistValue::Real(f) => Some(f.round() as i64),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(String, PlistValue)]> {
        match self {
            PlistValue::Dict(entries) => Some(entries),
            _ => None,
        }
    }
}

// ============================================================================
// Plist Reader
// ============================================================================

enum Frame {
    Dict {
        entries: Vec<(String, PlistValue)>,
        key: Option<String>,
    },
    Array(Vec<PlistValue>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Key,
    String,
    Integer,
    Real,
    Date,
    Data,
}

impl Scalar {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        Some(match tag {
            b"key" => Scalar::Key,
            b"string" => Scalar::String,
            b"integer" => Scalar::Integer,
            b"real" => Scalar::Real,
            b"date" => Scalar::Date,
            b"data" => Scalar::Data,
            _ => return None,
        })
    }
}

struct PlistBuilder {
    stack: Vec<Frame>,
    root: Option<PlistValue>,
}

impl PlistBuilder {
    fn attach(&mut self, value: PlistValue) -> Result<()> {
        match self.stack.last_mut() {
            None => {
                if self.root.is_some() {
                    bail!("plist has more than one top-level value");
                }
                self.root = Some(value);
            }
            Some(Frame::Array(items)) => items.push(value),
            Some(Frame::Dict { entries, key }) => {
                let key = key.take().ok_or_else(|| anyhow!("plist dict value without a key"))?;
                entries.push((key, value));
            }
        }
        Ok(())
    }

    fn set_key(&mut self, key: String) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Dict { key: slot, .. }) => {
                *slot = Some(key);
                Ok(())
            }
            _ => bail!("plist <key> outside of a dict"),
        }
    }

    fn close(&mut self) -> Result<()> {
        let value = match self.stack.pop() {
            Some(Frame::Dict { entries, .. }) => PlistValue::Dict(entries),
            Some(Frame::Array(items)) => PlistValue::Array(items),
            None => bail!("unbalanced plist container"),
        };
        self.attach(value)
    }

    fn finish_scalar(&mut self, kind: Scalar, text: String) -> Result<()> {
        let value = match kind {
            Scalar::Key => return self.set_key(text),
            Scalar::String => PlistValue::String(text),
            Scalar::Integer => PlistValue::Integer(
                text.trim()
                    .parse()
                    .with_context(|| format!("invalid plist integer {:?}", text))?,
            ),
            Scalar::Real => PlistValue::Real(
                text.trim()
                    .parse()
                    .with_context(|| format!("invalid plist real {:?}", text))?,
            ),
            Scalar::Date => PlistValue::Date(text.trim().to_string()),
            Scalar::Data => PlistValue::Data(text.split_whitespace().collect()),
        };
        self.attach(value)
    }
}

/// Parse an XML property list.
pub fn parse_plist<R: BufRead>(input: R) -> Result<PlistValue> {
    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();
    let mut builder = PlistBuilder {
        stack: Vec::new(),
        root: None,
    };
    let mut scalar: Option<(Scalar, String)> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .with_context(|| format!("XML error at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"plist" => {}
                b"dict" => builder.stack.push(Frame::Dict {
                    entries: Vec::new(),
                    key: None,
                }),
                b"array" => builder.stack.push(Frame::Array(Vec::new())),
                tag => {
                    let kind = Scalar::from_tag(tag).ok_or_else(|| {
                        anyhow!("unsupported plist element <{}>", String::from_utf8_lossy(tag))
                    })?;
                    scalar = Some((kind, String::new()));
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"true" => builder.attach(PlistValue::Bool(true))?,
                b"false" => builder.attach(PlistValue::Bool(false))?,
                b"dict" => builder.attach(PlistValue::Dict(Vec::new()))?,
                b"array" => builder.attach(PlistValue::Array(Vec::new()))?,
                tag => {
                    if let Some(kind) = Scalar::from_tag(tag) {
                        builder.finish_scalar(kind, String::new())?;
                    }
                }
            },
            Event::Text(t) => {
                if let Some((_, text)) = scalar.as_mut() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let Some((_, text)) = scalar.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"plist" => {}
                b"dict" | b"array" => builder.close()?,
                _ => {
                    if let Some((kind, text)) = scalar.take() {
                        builder.finish_scalar(kind, text)?;
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !builder.stack.is_empty() {
        bail!("plist ended inside an open container");
    }
    builder.root.ok_or_else(|| anyhow!("plist has no value"))
}

// ============================================================================
// Library Catalog (Music.app Library.xml)
// ============================================================================

/// Resolve a `Location` value to a local path. Non-file URLs yield None.
pub fn decode_location(value: &str) -> Option<PathBuf> {
    if value.starts_with("file://") {
        return url::Url::parse(value)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok());
    }
    if value.is_empty() || value.contains("://") {
        return None;
    }
    Some(PathBuf::from(value))
}

fn non_empty(value: Option<&PlistValue>) -> Option<String> {
    value
        .and_then(PlistValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn positive_u32(value: Option<&PlistValue>) -> Option<u32> {
    value
        .and_then(PlistValue::as_i64)
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
}

fn track_record(track: &PlistValue) -> LibraryRecord {
    let persistent_id = non_empty(track.get("Persistent ID"))
        .or_else(|| track.get("Track ID").and_then(PlistValue::as_i64).map(|n| n.to_string()));
    LibraryRecord {
        persistent_id,
        title: non_empty(track.get("Name")),
        artist: non_empty(track.get("Artist")).or_else(|| non_empty(track.get("Album Artist"))),
        album: non_empty(track.get("Album")),
        track_number: positive_u32(track.get("Track Number")),
        disc_number: positive_u32(track.get("Disc Number")),
        duration_ms: track
            .get("Total Time")
            .and_then(PlistValue::as_i64)
            .and_then(|n| u64::try_from(n).ok()),
        location: track.get("Location").and_then(PlistValue::as_str).and_then(decode_location),
        identifier: non_empty(track.get("ISRC")),
    }
}

/// Extract raw track records from a parsed library plist, in file order.
pub fn library_records(root: &PlistValue) -> Result<Vec<LibraryRecord>> {
    let tracks = root
        .get("Tracks")
        .and_then(PlistValue::as_dict)
        .ok_or_else(|| anyhow!("library plist has no Tracks dict"))?;
    Ok(tracks.iter().map(|(_, track)| track_record(track)).collect())
}

/// Load the library catalog from a Music.app XML export.
pub fn load_library(path: &Path) -> Result<Vec<LibraryRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open library {}", path.display()))?;
    let root = parse_plist(BufReader::with_capacity(1024 * 1024, file))
        .with_context(|| format!("Failed to parse library {}", path.display()))?;
    library_records(&root).with_context(|| format!("Invalid library {}", path.display()))
}

// ============================================================================
// Request Catalog (CSV)
// ============================================================================

const TITLE_HEADERS: &[&str] = &["Track Name", "track_name", "Track", "track", "title"];
const ARTIST_HEADERS: &[&str] = &["Artist Name(s)", "Artist Name", "Artist", "artist"];
const ALBUM_HEADERS: &[&str] = &["Album Name", "album"];
const DURATION_HEADERS: &[&str] = &["Duration (ms)", "duration_ms", "Duration"];
const IDENTIFIER_HEADERS: &[&str] = &["ISRC", "isrc"];
const DISC_HEADERS: &[&str] = &["Disc Number"];
const TRACK_NUMBER_HEADERS: &[&str] = &["Track Number"];

struct Columns {
    title: usize,
    artist: Option<usize>,
    album: Option<usize>,
    duration: Option<usize>,
    identifier: Option<usize>,
    disc: Option<usize>,
    track: Option<usize>,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self> {
        let names: Vec<&str> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim())
            .collect();
        // First alias present wins
        let find = |aliases: &[&str]| {
            aliases
                .iter()
                .find_map(|alias| names.iter().position(|n| n == alias))
        };
        let title = match find(TITLE_HEADERS) {
            Some(i) => i,
            None => bail!("no title column (expected one of {:?})", TITLE_HEADERS),
        };
        Ok(Self {
            title,
            artist: find(ARTIST_HEADERS),
            album: find(ALBUM_HEADERS),
            duration: find(DURATION_HEADERS),
            identifier: find(IDENTIFIER_HEADERS),
            disc: find(DISC_HEADERS),
            track: find(TRACK_NUMBER_HEADERS),
        })
    }
}

/// Duration cell to whole seconds: milliseconds, or `m:ss`.
fn parse_duration(cell: &str) -> Option<u32> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    if let Some((mins, secs)) = cell.split_once(':') {
        let mins: u32 = mins.trim().parse().ok()?;
        let secs: u32 = secs.trim().parse().ok()?;
        return mins.checked_mul(60)?.checked_add(secs);
    }
    let ms: f64 = cell.parse().ok()?;
    if !ms.is_finite() || ms < 0.0 {
        return None;
    }
    let secs = (ms / 1000.0).round();
    (secs <= u32::MAX as f64).then_some(secs as u32)
}

fn parse_number(cell: &str) -> Option<u32> {
    // "3/12" style track numbers keep the first part
    cell.split('/').next()?.trim().parse().ok().filter(|n| *n > 0)
}

/// Read one request list from CSV. Rows without a title are counted as malformed.
pub fn read_request_csv<R: Read>(name: &str, input: R) -> Result<RequestList> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(input);
    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let columns = Columns::resolve(&headers)?;

    let mut list = RequestList {
        name: name.to_string(),
        ..Default::default()
    };
    for (row, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(_) => {
                list.malformed_rows += 1;
                continue;
            }
        };
        let cell = |col: Option<usize>| col.and_then(|c| record.get(c)).map(str::trim).unwrap_or("");
        let title = cell(Some(columns.title));
        if title.is_empty() {
            list.malformed_rows += 1;
            continue;
        }
        let album = cell(columns.album);
        list.items.push(RequestItem {
            row,
            title: title.to_string(),
            artist: cell(columns.artist).to_string(),
            album: (!album.is_empty()).then(|| album.to_string()),
            duration_secs: parse_duration(cell(columns.duration)),
            disc_number: parse_number(cell(columns.disc)),
            track_number: parse_number(cell(columns.track)),
            identifier: normalize_identifier(cell(columns.identifier)),
        });
    }
    Ok(list)
}

fn playlist_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "playlist".to_string())
}

/// Request lists loaded for one run.
#[derive(Debug, Default)]
pub struct RequestCatalog {
    pub playlists: Vec<RequestList>,
    /// Files in a request directory that could not be read (no title column, unreadable)
    pub skipped_files: usize,
}

fn read_request_file(file: &Path) -> Result<RequestList> {
    let f = File::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
    read_request_csv(&playlist_name(file), f).with_context(|| format!("Failed to read {}", file.display()))
}

/// Load one CSV file, or every `*.csv` in a directory (sorted by file name).
///
/// A single file that cannot be read is an error. In a directory, a bad file
/// is reported on stderr and skipped so the other playlists still run.
pub fn load_requests(path: &Path) -> Result<RequestCatalog> {
    if !path.is_dir() {
        return Ok(RequestCatalog {
            playlists: vec![read_request_file(path)?],
            skipped_files: 0,
        });
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to list {}", path.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();

    let mut catalog = RequestCatalog::default();
    for file in &files {
        match read_request_file(file) {
            Ok(list) => catalog.playlists.push(list),
            Err(e) => {
                eprintln!("Warning: skipping request file ({:#})", e);
                catalog.skipped_files += 1;
            }
        }
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Major Version</key><integer>1</integer>
	<key>Show Content Ratings</key><true/>
	<key>Tracks</key>
	<dict>
		<key>101</key>
		<dict>
			<key>Track ID</key><integer>101</integer>
			<key>Name</key><string>Yesterday</string>
			<key>Artist</key><string>The Beatles</string>
			<key>Album</key><string>Help!</string>
			<key>Disc Number</key><integer>1</integer>
			<key>Track Number</key><integer>13</integer>
			<key>Total Time</key><integer>125600</integer>
			<key>Persistent ID</key><string>ABCDEF0123456789</string>
			<key>Location</key><string>file:///Users/me/Music/The%20Beatles/Help!/13%20Yesterday.m4a</string>
		</dict>
		<key>102</key>
		<dict>
			<key>Track ID</key><integer>102</integer>
			<key>Name</key><string>Rock &amp; Roll</string>
			<key>Album Artist</key><string>Led Zeppelin</string>
			<key>Total Time</key><integer>220000</integer>
			<key>ISRC</key><string>GBAHT7100012</string>
			<key>Location</key><string>file:///Users/me/Music/rock.mp3</string>
		</dict>
		<key>103</key>
		<dict>
			<key>Track ID</key><integer>103</integer>
			<key>Name</key><string>Streamed</string>
			<key>Artist</key><string>Cloud</string>
			<key>Total Time</key><integer>180000</integer>
			<key>Persistent ID</key><string>FFFF000011112222</string>
		</dict>
	</dict>
	<key>Playlists</key>
	<array/>
</dict>
</plist>
"#;

    #[test]
    fn test_parse_plist_structure() {
        let root = parse_plist(LIBRARY.as_bytes()).unwrap();
        assert_eq!(root.get("Major Version"), Some(&PlistValue::Integer(1)));
        assert_eq!(root.get("Show Content Ratings"), Some(&PlistValue::Bool(true)));
        assert_eq!(root.get("Playlists"), Some(&PlistValue::Array(Vec::new())));
        assert_eq!(root.get("Tracks").and_then(PlistValue::as_dict).map(|d| d.len()), Some(3));
    }

    #[test]
    fn test_library_records_and_fallbacks() {
        let root = parse_plist(LIBRARY.as_bytes()).unwrap();
        let records = library_records(&root).unwrap();
        assert_eq!(records.len(), 3);

        let yesterday = &records[0];
        assert_eq!(yesterday.persistent_id.as_deref(), Some("ABCDEF0123456789"));
        assert_eq!(yesterday.duration_ms, Some(125_600));
        assert_eq!((yesterday.disc_number, yesterday.track_number), (Some(1), Some(13)));
        assert_eq!(
            yesterday.location.as_deref(),
            Some(Path::new("/Users/me/Music/The Beatles/Help!/13 Yesterday.m4a"))
        );

        // Track ID stands in for a missing Persistent ID; Album Artist for Artist
        let rock = &records[1];
        assert_eq!(rock.persistent_id.as_deref(), Some("102"));
        assert_eq!(rock.title.as_deref(), Some("Rock & Roll"));
        assert_eq!(rock.artist.as_deref(), Some("Led Zeppelin"));
        assert_eq!(rock.identifier.as_deref(), Some("GBAHT7100012"));

        assert_eq!(records[2].location, None);
    }

    #[test]
    fn test_malformed_plist_is_error() {
        assert!(parse_plist("<plist><dict><key>a</key>".as_bytes()).is_err());
        assert!(parse_plist("<plist><dict><integer>5</integer></dict></plist>".as_bytes()).is_err());
        assert!(parse_plist("<plist><dict><key>n</key><integer>x</integer></dict></plist>".as_bytes()).is_err());
        let root = parse_plist("<plist><dict></dict></plist>".as_bytes()).unwrap();
        assert!(library_records(&root).is_err());
    }

    #[test]
    fn test_decode_location() {
        assert_eq!(decode_location("file:///tmp/a%20b.mp3"), Some(PathBuf::from("/tmp/a b.mp3")));
        assert_eq!(decode_location("http://example.com/a.mp3"), None);
        assert_eq!(decode_location(""), None);
        assert_eq!(decode_location("/plain/path.m4a"), Some(PathBuf::from("/plain/path.m4a")));
    }

    #[test]
    fn test_read_exportify_csv() {
        let csv = "\u{feff}Track URI,Track Name,Artist Name(s),Album Name,Disc Number,Track Number,Duration (ms),ISRC\n\
                   spotify:track:1,Yesterday - Remastered 2009,The Beatles,Help! (Remastered),1,13,125400,GBAYE0601477\n\
                   spotify:track:2,,Nobody,Nothing,1,1,1000,\n\
                   spotify:track:3,Umbrella,\"Rihanna,JAY-Z\",Good Girl Gone Bad,,,275986,usum70744444\n";
        let list = read_request_csv("Road Trip", csv.as_bytes()).unwrap();
        assert_eq!(list.name, "Road Trip");
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.malformed_rows, 1);

        let first = &list.items[0];
        assert_eq!(first.row, 0);
        assert_eq!(first.title, "Yesterday - Remastered 2009");
        assert_eq!(first.album.as_deref(), Some("Help! (Remastered)"));
        assert_eq!(first.duration_secs, Some(125));
        assert_eq!((first.disc_number, first.track_number), (Some(1), Some(13)));
        assert_eq!(first.identifier.as_deref(), Some("GBAYE0601477"));

        let umbrella = &list.items[1];
        assert_eq!(umbrella.row, 2);
        assert_eq!(umbrella.artist, "Rihanna,JAY-Z");
        assert_eq!(umbrella.track_number, None);
        assert_eq!(umbrella.identifier.as_deref(), Some("USUM70744444"));
    }

    #[test]
    fn test_read_csv_header_aliases() {
        let csv = "track,artist,album,Duration\nHey Jude,The Beatles,,431000\nSolo,Someone,,\n";
        let list = read_request_csv("x", csv.as_bytes()).unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].album, None);
        assert_eq!(list.items[0].duration_secs, Some(431));
        assert_eq!(list.items[1].duration_secs, None);

        assert!(read_request_csv("x", "Artist,Album\na,b\n".as_bytes()).is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("125600"), Some(126));
        assert_eq!(parse_duration("3:25"), Some(205));
        assert_eq!(parse_duration("-5"), None);
        assert_eq!(parse_duration("abc"), None);
        // Out-of-range values are malformed, never wrapped
        assert_eq!(parse_duration("99999999:00"), None);
        assert_eq!(parse_duration("1e300"), None);
        assert_eq!(parse_number("3/12"), Some(3));
        assert_eq!(parse_number("0"), None);
    }

    #[test]
    fn test_load_requests_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b_second.csv"), "Track Name,Artist Name(s)\nB,Artist\n").unwrap();
        fs::write(dir.path().join("a_first.CSV"), "Track Name,Artist Name(s)\nA,Artist\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = load_requests(dir.path()).unwrap();
        let names: Vec<&str> = catalog.playlists.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a_first", "b_second"]);
        assert_eq!(catalog.skipped_files, 0);

        let single = load_requests(&dir.path().join("b_second.csv")).unwrap();
        assert_eq!(single.playlists.len(), 1);
        assert_eq!(single.playlists[0].items[0].title, "B");
    }

    #[test]
    fn test_bad_file_in_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.csv"), "Track Name,Artist Name(s)\nGood,Artist\n").unwrap();
        fs::write(dir.path().join("headless.csv"), "Foo,Bar\n1,2\n").unwrap();

        let catalog = load_requests(dir.path()).unwrap();
        assert_eq!(catalog.playlists.len(), 1);
        assert_eq!(catalog.playlists[0].name, "good");
        assert_eq!(catalog.skipped_files, 1);

        // Given directly, the same file is an error
        assert!(load_requests(&dir.path().join("headless.csv")).is_err());
    }

    #[test]
    fn test_overflowing_duration_row_is_kept_without_duration() {
        let csv = "Track Name,Artist Name(s),Duration\nYesterday,The Beatles,99999999:00\nHelp!,The Beatles,2:19\n";
        let list = read_request_csv("Mix", csv.as_bytes()).unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].duration_secs, None);
        assert_eq!(list.items[1].duration_secs, Some(139));
    }
}
