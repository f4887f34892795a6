//! In-memory library index.
//!
//! Every item is registered under several normalized composite keys. All key
//! kinds share one generic [`KeyLookup`]; a key maps to the ordered list of
//! items that produce it. Collisions are legal and left to the cascade.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

use crate::models::{IndexStats, ItemId, LibraryItem, LibraryRecord};
use crate::normalize::{normalize, normalize_identifier, primary_artist, strip_qualifiers, tokens};

/// Disc number assumed when a track number is known but the disc is not.
pub const DEFAULT_DISC: u32 = 1;

// ============================================================================
// Normalized Fields
// ============================================================================

/// Normalized view of a title/artist/album triple, shared by library items
/// and requests so both sides build keys the same way.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizedFields {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub primary_artist: String,
    pub stripped_title: String,
    pub stripped_album: String,
    pub disc: Option<u32>,
    pub track: Option<u32>,
}

impl NormalizedFields {
    pub fn new(
        title: &str,
        artist: &str,
        album: Option<&str>,
        disc: Option<u32>,
        track: Option<u32>,
    ) -> Self {
        let album = album.unwrap_or("");
        Self {
            title: normalize(title),
            artist: normalize(artist),
            album: normalize(album),
            primary_artist: primary_artist(artist),
            stripped_title: strip_qualifiers(title),
            stripped_album: if album.is_empty() { String::new() } else { strip_qualifiers(album) },
            disc,
            track,
        }
    }

    /// Album equality used for narrowing: plain or qualifier-stripped.
    pub fn same_album(&self, other: &NormalizedFields) -> bool {
        !self.album.is_empty()
            && !other.album.is_empty()
            && (self.album == other.album || self.stripped_album == other.stripped_album)
    }
}

/// Join normalized parts into a composite key.
pub fn composite_key(parts: &[&str]) -> String {
    parts.join("|")
}

// ============================================================================
// Key Kinds
// ============================================================================

/// The composite keys an item is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    ArtistTitleAlbum,
    ArtistTitle,
    PrimaryArtistTitle,
    AlbumDiscTrack,
    StrippedArtistTitleAlbum,
    StrippedArtistTitle,
    StrippedPrimaryArtistTitle,
    Album,
}

impl KeyKind {
    pub const ALL: [KeyKind; 8] = [
        KeyKind::ArtistTitleAlbum,
        KeyKind::ArtistTitle,
        KeyKind::PrimaryArtistTitle,
        KeyKind::AlbumDiscTrack,
        KeyKind::StrippedArtistTitleAlbum,
        KeyKind::StrippedArtistTitle,
        KeyKind::StrippedPrimaryArtistTitle,
        KeyKind::Album,
    ];

    /// Unstripped string keys, in cascade order
    pub const NORMALIZED: [KeyKind; 3] = [
        KeyKind::ArtistTitleAlbum,
        KeyKind::ArtistTitle,
        KeyKind::PrimaryArtistTitle,
    ];

    /// Qualifier-stripped string keys, in cascade order
    pub const STRIPPED: [KeyKind; 3] = [
        KeyKind::StrippedArtistTitleAlbum,
        KeyKind::StrippedArtistTitle,
        KeyKind::StrippedPrimaryArtistTitle,
    ];

    pub fn label(self) -> &'static str {
        match self {
            KeyKind::ArtistTitleAlbum => "artist|title|album",
            KeyKind::ArtistTitle => "artist|title",
            KeyKind::PrimaryArtistTitle => "primary_artist|title",
            KeyKind::AlbumDiscTrack => "album|disc|track",
            KeyKind::StrippedArtistTitleAlbum => "artist|stripped_title|stripped_album",
            KeyKind::StrippedArtistTitle => "artist|stripped_title",
            KeyKind::StrippedPrimaryArtistTitle => "primary_artist|stripped_title",
            KeyKind::Album => "album",
        }
    }

    /// Key for these fields, or None when a required component is missing.
    pub fn key_for(self, f: &NormalizedFields) -> Option<String> {
        if f.title.is_empty() && self != KeyKind::Album && self != KeyKind::AlbumDiscTrack {
            return None;
        }
        match self {
            KeyKind::ArtistTitleAlbum => {
                (!f.album.is_empty()).then(|| composite_key(&[&f.artist, &f.title, &f.album]))
            }
            KeyKind::ArtistTitle => Some(composite_key(&[&f.artist, &f.title])),
            KeyKind::PrimaryArtistTitle => Some(composite_key(&[&f.primary_artist, &f.title])),
            KeyKind::AlbumDiscTrack => {
                let track = f.track?;
                if f.album.is_empty() {
                    return None;
                }
                let disc = f.disc.unwrap_or(DEFAULT_DISC).to_string();
                Some(composite_key(&[&f.album, &disc, &track.to_string()]))
            }
            KeyKind::StrippedArtistTitleAlbum => (!f.stripped_album.is_empty())
                .then(|| composite_key(&[&f.artist, &f.stripped_title, &f.stripped_album])),
            KeyKind::StrippedArtistTitle => Some(composite_key(&[&f.artist, &f.stripped_title])),
            KeyKind::StrippedPrimaryArtistTitle => {
                Some(composite_key(&[&f.primary_artist, &f.stripped_title]))
            }
            KeyKind::Album => (!f.album.is_empty()).then(|| f.album.clone()),
        }
    }
}

// ============================================================================
// Generic Lookup
// ============================================================================

/// One key function's mapping: key -> items in catalog order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLookup {
    map: FxHashMap<String, Vec<ItemId>>,
}

impl KeyLookup {
    fn insert(&mut self, key: String, id: ItemId) {
        let bucket = self.map.entry(key).or_default();
        if bucket.last() != Some(&id) {
            bucket.push(id);
        }
    }

    pub fn get(&self, key: &str) -> &[ItemId] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ============================================================================
// Library Index
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedItem {
    pub item: LibraryItem,
    pub fields: NormalizedFields,
}

/// Read-only lookup structures over the local library.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryIndex {
    items: Vec<IndexedItem>,
    lookups: BTreeMap<KeyKind, KeyLookup>,
    by_identifier: FxHashMap<String, Vec<ItemId>>,
    by_title_token: FxHashMap<String, Vec<ItemId>>,
    by_persistent_id: FxHashMap<String, ItemId>,
    stats: IndexStats,
}

enum Rejection {
    Malformed,
    Remote,
}

fn validate(record: LibraryRecord) -> Result<LibraryItem, Rejection> {
    let title = record
        .title
        .filter(|t| !t.trim().is_empty())
        .ok_or(Rejection::Malformed)?;
    let duration_ms = record.duration_ms.ok_or(Rejection::Malformed)?;
    let persistent_id = record
        .persistent_id
        .filter(|p| !p.trim().is_empty())
        .ok_or(Rejection::Malformed)?;
    // Only local files are indexed; streaming-only entries stay unmatched
    let location = record.location.ok_or(Rejection::Remote)?;

    Ok(LibraryItem {
        persistent_id,
        title,
        artist: record.artist.unwrap_or_default(),
        album: record.album.unwrap_or_default(),
        track_number: record.track_number,
        disc_number: record.disc_number,
        duration_secs: ((duration_ms + 500) / 1000).min(u32::MAX as u64) as u32,
        location,
        identifier: record.identifier.as_deref().and_then(normalize_identifier),
    })
}

impl LibraryIndex {
    /// Build the index in a single pass over the catalog.
    /// Malformed, remote and duplicate records are skipped and counted.
    pub fn build<I>(records: I) -> Self
    where
        I: IntoIterator<Item = LibraryRecord>,
    {
        let mut index = LibraryIndex {
            items: Vec::new(),
            lookups: KeyKind::ALL.iter().map(|k| (*k, KeyLookup::default())).collect(),
            by_identifier: FxHashMap::default(),
            by_title_token: FxHashMap::default(),
            by_persistent_id: FxHashMap::default(),
            stats: IndexStats::default(),
        };

        for record in records {
            index.stats.records_seen += 1;
            match validate(record) {
                Ok(item) => index.insert(item),
                Err(Rejection::Malformed) => index.stats.malformed_skipped += 1,
                Err(Rejection::Remote) => index.stats.remote_skipped += 1,
            }
        }

        index
    }

    fn insert(&mut self, item: LibraryItem) {
        if self.by_persistent_id.contains_key(&item.persistent_id) {
            self.stats.duplicate_ids_skipped += 1;
            return;
        }

        let id = self.items.len();
        let fields = NormalizedFields::new(
            &item.title,
            &item.artist,
            Some(&item.album),
            item.disc_number,
            item.track_number,
        );

        for kind in KeyKind::ALL {
            if let Some(key) = kind.key_for(&fields) {
                if let Some(lookup) = self.lookups.get_mut(&kind) {
                    lookup.insert(key, id);
                }
            }
        }

        let mut title_tokens: Vec<&str> = tokens(&fields.title);
        title_tokens.extend(tokens(&fields.stripped_title));
        title_tokens.sort_unstable();
        title_tokens.dedup();
        for token in title_tokens {
            self.by_title_token.entry(token.to_string()).or_default().push(id);
        }

        if let Some(identifier) = &item.identifier {
            self.by_identifier.entry(identifier.clone()).or_default().push(id);
            self.stats.catalog_identifiers += 1;
        }

        self.by_persistent_id.insert(item.persistent_id.clone(), id);
        self.items.push(IndexedItem { item, fields });
        self.stats.indexed += 1;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    pub fn items(&self) -> impl Iterator<Item = &LibraryItem> {
        self.items.iter().map(|i| &i.item)
    }

    pub fn item(&self, id: ItemId) -> &LibraryItem {
        &self.items[id].item
    }

    pub fn fields(&self, id: ItemId) -> &NormalizedFields {
        &self.items[id].fields
    }

    pub fn lookup(&self, kind: KeyKind, key: &str) -> &[ItemId] {
        self.lookups.get(&kind).map(|l| l.get(key)).unwrap_or(&[])
    }

    /// Number of distinct keys registered for a kind.
    pub fn key_count(&self, kind: KeyKind) -> usize {
        self.lookups.get(&kind).map_or(0, KeyLookup::len)
    }

    /// Items whose catalog export already carries this identifier.
    pub fn by_identifier(&self, identifier: &str) -> &[ItemId] {
        self.by_identifier.get(identifier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Items whose normalized (or stripped) title contains this token.
    pub fn by_title_token(&self, token: &str) -> &[ItemId] {
        self.by_title_token.get(token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Items on the album with this normalized name.
    pub fn album_members(&self, normalized_album: &str) -> &[ItemId] {
        self.lookup(KeyKind::Album, normalized_album)
    }

    pub fn by_persistent_id(&self, persistent_id: &str) -> Option<ItemId> {
        self.by_persistent_id.get(persistent_id).copied()
    }

    /// "Artist - Title" for reports.
    pub fn display_label(&self, id: ItemId) -> String {
        let item = self.item(id);
        format!("{} - {}", item.artist, item.title)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn record(
        pid: &str,
        title: &str,
        artist: &str,
        album: &str,
        secs: u64,
        disc_track: Option<(u32, u32)>,
    ) -> LibraryRecord {
        LibraryRecord {
            persistent_id: Some(pid.to_string()),
            title: Some(title.to_string()),
            artist: Some(artist.to_string()),
            album: (!album.is_empty()).then(|| album.to_string()),
            track_number: disc_track.map(|(_, t)| t),
            disc_number: disc_track.map(|(d, _)| d),
            duration_ms: Some(secs * 1000),
            location: Some(PathBuf::from(format!("/music/{}.m4a", pid))),
            identifier: None,
        }
    }

    fn sample_catalog() -> Vec<LibraryRecord> {
        vec![
            record("A1", "Yesterday", "The Beatles", "Help!", 125, Some((1, 13))),
            record("A2", "Yesterday", "The Beatles", "Live at the BBC", 180, None),
            record("A3", "Hey Jude", "The Beatles", "1", 431, Some((1, 21))),
            record("A4", "Umbrella", "Rihanna, JAY-Z", "Good Girl Gone Bad", 275, Some((1, 1))),
        ]
    }

    #[test]
    fn test_build_registers_all_key_kinds() {
        let index = LibraryIndex::build(sample_catalog());
        assert_eq!(index.len(), 4);
        assert_eq!(index.lookup(KeyKind::ArtistTitleAlbum, "the beatles|yesterday|help!"), &[0]);
        assert_eq!(index.lookup(KeyKind::ArtistTitle, "the beatles|yesterday"), &[0, 1]);
        assert_eq!(index.lookup(KeyKind::PrimaryArtistTitle, "rihanna|umbrella"), &[3]);
        assert_eq!(index.lookup(KeyKind::AlbumDiscTrack, "help!|1|13"), &[0]);
        assert_eq!(index.album_members("good girl gone bad"), &[3]);
        assert!(index.by_title_token("yesterday").contains(&1));
        assert!(index.lookup(KeyKind::ArtistTitle, "nobody|nothing").is_empty());
    }

    #[test]
    fn test_structural_key_defaults_disc() {
        let mut rec = record("B1", "Song", "Artist", "Album", 200, None);
        rec.track_number = Some(4);
        let index = LibraryIndex::build(vec![rec]);
        assert_eq!(index.lookup(KeyKind::AlbumDiscTrack, "album|1|4"), &[0]);
    }

    #[test]
    fn test_stripped_keys_registered() {
        let index = LibraryIndex::build(vec![record(
            "C1",
            "Let It Be (Remastered 2009)",
            "The Beatles",
            "Let It Be (Deluxe Edition)",
            243,
            None,
        )]);
        assert_eq!(index.lookup(KeyKind::StrippedArtistTitle, "the beatles|let it be"), &[0]);
        assert_eq!(
            index.lookup(KeyKind::StrippedArtistTitleAlbum, "the beatles|let it be|let it be"),
            &[0]
        );
    }

    #[test]
    fn test_malformed_records_skipped_and_counted() {
        let mut no_title = record("M1", "x", "a", "b", 100, None);
        no_title.title = None;
        let mut no_duration = record("M2", "x", "a", "b", 100, None);
        no_duration.duration_ms = None;
        let mut remote = record("M3", "x", "a", "b", 100, None);
        remote.location = None;
        let duplicate = record("A1", "Other", "Other", "Other", 100, None);

        let mut catalog = sample_catalog();
        catalog.extend([no_title, no_duration, remote, duplicate]);
        let index = LibraryIndex::build(catalog);

        assert_eq!(index.len(), 4);
        let stats = index.stats();
        assert_eq!(stats.records_seen, 8);
        assert_eq!(stats.malformed_skipped, 2);
        assert_eq!(stats.remote_skipped, 1);
        assert_eq!(stats.duplicate_ids_skipped, 1);
        assert_eq!(index.item(index.by_persistent_id("A1").unwrap()).title, "Yesterday");
    }

    #[test]
    fn test_build_is_deterministic() {
        let first = LibraryIndex::build(sample_catalog());
        let second = LibraryIndex::build(sample_catalog());
        assert_eq!(first, second);
        for kind in KeyKind::ALL {
            assert_eq!(first.key_count(kind), second.key_count(kind));
        }
    }

    #[test]
    fn test_catalog_identifiers_normalized() {
        let mut rec = record("I1", "Yesterday", "The Beatles", "Help!", 125, None);
        rec.identifier = Some("gb-um7-10-29604".to_string());
        let index = LibraryIndex::build(vec![rec]);
        assert_eq!(index.by_identifier("GBUM71029604"), &[0]);
        assert_eq!(index.stats().catalog_identifiers, 1);
    }

    #[test]
    fn test_duration_rounded_from_millis() {
        let mut rec = record("D1", "T", "A", "", 0, None);
        rec.duration_ms = Some(125_600);
        let index = LibraryIndex::build(vec![rec]);
        assert_eq!(index.item(0).duration_secs, 126);
    }
}
