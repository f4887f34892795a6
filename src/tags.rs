//! Audio tag reading for identifier prefetch.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;

use crate::normalize::normalize_identifier;

/// Reads the identifier (ISRC) embedded in a local audio file.
///
/// `Ok(None)` means the file was read and has no usable identifier.
/// `Err` means the file could not be read at all.
pub trait IdentifierReader: Send + Sync {
    fn read_identifier(&self, path: &Path) -> Result<Option<String>>;
}

/// Production reader: probes the container with symphonia and scans its tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaReader;

impl IdentifierReader for SymphoniaReader {
    fn read_identifier(&self, path: &Path) -> Result<Option<String>> {
        let file = File::open(path).with_context(|| format!("Open {}", path.display()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .with_context(|| format!("Probe {}", path.display()))?;

        // ID3v2 ahead of the container is reported by the probe
        if let Some(found) = probed
            .metadata
            .get()
            .as_ref()
            .and_then(|m| m.current())
            .and_then(identifier_from_revision)
        {
            return Ok(Some(found));
        }

        let mut format = probed.format;
        let found = format.metadata().current().and_then(identifier_from_revision);
        Ok(found)
    }
}

fn identifier_from_revision(revision: &MetadataRevision) -> Option<String> {
    revision
        .tags()
        .iter()
        .filter(|tag| tag.std_key == Some(StandardTagKey::IdentIsrc) || is_isrc_key(&tag.key))
        .find_map(|tag| normalize_identifier(&tag.value.to_string()))
}

/// Raw tag keys that carry an ISRC: ID3 `TSRC`, Vorbis `ISRC`, and the
/// iTunes freeform atom `----:com.apple.iTunes:ISRC`.
fn is_isrc_key(key: &str) -> bool {
    let key = key.trim();
    key.eq_ignore_ascii_case("TSRC")
        || key.eq_ignore_ascii_case("ISRC")
        || key.to_ascii_uppercase().ends_with(":ISRC")
}
