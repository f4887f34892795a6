//! Output writers: Music.app playlist plists and the unmatched report.

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rustc_hash::FxHashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::models::LibraryItem;

const PLIST_DOCTYPE: &str =
    r#"plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd""#;

// ============================================================================
// Plist Writer
// ============================================================================

struct PlistWriter<W: Write> {
    xml: Writer<W>,
}

impl<W: Write> PlistWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            xml: Writer::new_with_indent(inner, b'\t', 1),
        }
    }

    fn header(&mut self) -> Result<()> {
        self.xml
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        self.xml
            .write_event(Event::DocType(BytesText::from_escaped(PLIST_DOCTYPE)))?;
        self.xml
            .write_event(Event::Start(BytesStart::new("plist").with_attributes([("version", "1.0")])))?;
        Ok(())
    }

    fn open(&mut self, tag: &str) -> Result<()> {
        self.xml.write_event(Event::Start(BytesStart::new(tag)))?;
        Ok(())
    }

    fn close(&mut self, tag: &str) -> Result<()> {
        self.xml.write_event(Event::End(BytesEnd::new(tag)))?;
        Ok(())
    }

    fn text_element(&mut self, tag: &str, text: &str) -> Result<()> {
        self.xml.create_element(tag).write_text_content(BytesText::new(text))?;
        Ok(())
    }

    fn string(&mut self, key: &str, value: &str) -> Result<()> {
        self.text_element("key", key)?;
        self.text_element("string", value)
    }

    fn integer(&mut self, key: &str, value: i64) -> Result<()> {
        self.text_element("key", key)?;
        self.text_element("integer", &value.to_string())
    }

    fn boolean(&mut self, key: &str, value: bool) -> Result<()> {
        self.text_element("key", key)?;
        self.xml
            .create_element(if value { "true" } else { "false" })
            .write_empty()?;
        Ok(())
    }

    fn finish(mut self) -> Result<W> {
        self.close("plist")?;
        let mut inner = self.xml.into_inner();
        inner.write_all(b"\n")?;
        Ok(inner)
    }
}

fn file_url(path: &Path) -> Option<String> {
    url::Url::from_file_path(path).ok().map(|u| u.to_string())
}

/// Render a single-playlist library plist.
///
/// Matched items become `Tracks` entries with sequential Track IDs (repeats
/// share one entry); playlist items reference them in request order.
pub fn render_playlist<W: Write>(out: W, name: &str, items: &[&LibraryItem]) -> Result<W> {
    let mut track_ids: FxHashMap<&str, i64> = FxHashMap::default();
    let mut unique: Vec<(i64, &LibraryItem)> = Vec::new();
    let mut order: Vec<i64> = Vec::with_capacity(items.len());
    for item in items {
        let next = unique.len() as i64 + 1;
        let id = *track_ids.entry(item.persistent_id.as_str()).or_insert_with(|| {
            unique.push((next, item));
            next
        });
        order.push(id);
    }

    let mut w = PlistWriter::new(out);
    w.header()?;
    w.open("dict")?;
    w.integer("Major Version", 1)?;
    w.integer("Minor Version", 1)?;
    w.string("Application Version", "13.0")?;
    w.integer("Features", 5)?;
    w.boolean("Show Content Ratings", true)?;

    w.text_element("key", "Tracks")?;
    w.open("dict")?;
    for (id, item) in &unique {
        w.text_element("key", &id.to_string())?;
        w.open("dict")?;
        w.integer("Track ID", *id)?;
        w.string("Name", &item.title)?;
        if !item.artist.is_empty() {
            w.string("Artist", &item.artist)?;
        }
        if !item.album.is_empty() {
            w.string("Album", &item.album)?;
        }
        w.integer("Total Time", item.duration_secs as i64 * 1000)?;
        w.string("Persistent ID", &item.persistent_id)?;
        if let Some(location) = file_url(&item.location) {
            w.string("Location", &location)?;
        }
        w.close("dict")?;
    }
    w.close("dict")?;

    w.text_element("key", "Playlists")?;
    w.open("array")?;
    w.open("dict")?;
    w.string("Name", name)?;
    w.integer("Playlist ID", 1)?;
    w.string("Playlist Persistent ID", "0000000000000001")?;
    w.boolean("All Items", true)?;
    w.text_element("key", "Playlist Items")?;
    w.open("array")?;
    for id in order {
        w.open("dict")?;
        w.integer("Track ID", id)?;
        w.close("dict")?;
    }
    w.close("array")?;
    w.close("dict")?;
    w.close("array")?;

    w.close("dict")?;
    w.finish()
}

// ============================================================================
// File Output
// ============================================================================

/// Write through a sibling temp file and rename into place.
fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(BufWriter<fs::File>) -> Result<BufWriter<fs::File>>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp_name);
    {
        let f = fs::File::create(&tmp).with_context(|| format!("Create {}", tmp.display()))?;
        let mut w = fill(BufWriter::with_capacity(256 * 1024, f))?;
        w.flush()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("Rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Write one playlist file.
pub fn write_playlist(path: &Path, name: &str, items: &[&LibraryItem]) -> Result<()> {
    write_atomic(path, |w| render_playlist(w, name, items))
        .with_context(|| format!("Failed to write playlist {}", path.display()))
}

/// One row of `_unmatched.tsv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedRow {
    pub playlist: String,
    pub row: usize,
    pub artist: String,
    pub track: String,
    pub album: String,
    pub reason: String,
}

fn tsv_field(s: &str) -> String {
    s.replace(['\t', '\n', '\r'], " ")
}

/// Write the unmatched report (header plus one line per unresolved request).
pub fn write_unmatched(path: &Path, rows: &[UnmatchedRow]) -> Result<()> {
    write_atomic(path, |mut w| {
        writeln!(w, "Playlist\tRow\tArtist\tTrack\tAlbum\tReason")?;
        for r in rows {
            writeln!(
                w,
                "{}\t{}\t{}\t{}\t{}\t{}",
                tsv_field(&r.playlist),
                r.row + 1,
                tsv_field(&r.artist),
                tsv_field(&r.track),
                tsv_field(&r.album),
                tsv_field(&r.reason)
            )?;
        }
        Ok(w)
    })
    .with_context(|| format!("Failed to write unmatched report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{parse_plist, PlistValue};
    use std::path::PathBuf;

    fn item(pid: &str, title: &str, secs: u32) -> LibraryItem {
        LibraryItem {
            persistent_id: pid.to_string(),
            title: title.to_string(),
            artist: "The Beatles".to_string(),
            album: "Help!".to_string(),
            track_number: None,
            disc_number: None,
            duration_secs: secs,
            location: PathBuf::from(format!("/Music/The Beatles/{} & more.m4a", title)),
            identifier: None,
        }
    }

    #[test]
    fn test_rendered_playlist_is_valid_plist() {
        let yesterday = item("AAAA000000000001", "Yesterday", 125);
        let help = item("AAAA000000000002", "Help!", 139);
        let bytes = render_playlist(Vec::new(), "Road <Trip>", &[&yesterday, &help, &yesterday]).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("<!DOCTYPE plist PUBLIC"));

        let root = parse_plist(bytes.as_slice()).unwrap();
        assert_eq!(root.get("Application Version").and_then(PlistValue::as_str), Some("13.0"));
        assert_eq!(root.get("Show Content Ratings"), Some(&PlistValue::Bool(true)));

        let tracks = root.get("Tracks").and_then(PlistValue::as_dict).unwrap();
        assert_eq!(tracks.len(), 2);
        let first = &tracks[0].1;
        assert_eq!(first.get("Persistent ID").and_then(PlistValue::as_str), Some("AAAA000000000001"));
        assert_eq!(first.get("Total Time").and_then(PlistValue::as_i64), Some(125_000));
        assert_eq!(
            first.get("Location").and_then(PlistValue::as_str),
            Some("file:///Music/The%20Beatles/Yesterday%20&%20more.m4a")
        );

        let playlist = match root.get("Playlists") {
            Some(PlistValue::Array(list)) => &list[0],
            other => panic!("unexpected Playlists {:?}", other),
        };
        assert_eq!(playlist.get("Name").and_then(PlistValue::as_str), Some("Road <Trip>"));
        let ids: Vec<i64> = match playlist.get("Playlist Items") {
            Some(PlistValue::Array(items)) => items
                .iter()
                .filter_map(|i| i.get("Track ID").and_then(PlistValue::as_i64))
                .collect(),
            other => panic!("unexpected Playlist Items {:?}", other),
        };
        assert_eq!(ids, vec![1, 2, 1]);
    }

    #[test]
    fn test_write_playlist_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("Mix.xml");
        let yesterday = item("AAAA000000000001", "Yesterday", 125);
        write_playlist(&path, "Mix", &[&yesterday]).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("out").join("Mix.xml.tmp").exists());
    }

    #[test]
    fn test_write_unmatched_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("_unmatched.tsv");
        let rows = vec![UnmatchedRow {
            playlist: "Mix".to_string(),
            row: 4,
            artist: "Nobody".to_string(),
            track: "Tab\there".to_string(),
            album: String::new(),
            reason: "no candidates in library".to_string(),
        }];
        write_unmatched(&path, &rows).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Playlist\tRow\tArtist\tTrack\tAlbum\tReason");
        assert_eq!(lines[1], "Mix\t5\tNobody\tTab here\t\tno candidates in library");
    }
}
