//! Shared normalization functions for library/request matching.
//! Used by the index builder, the match cascade and diagnostics.
//!
//! CRITICAL: every composite key in the index is built from these functions.
//! Any change here changes which requests match. Run tests after changes.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Qualifier phrases removed by [`strip_qualifiers`] (applied in order).
/// Lossy: these only ever feed the secondary keys.
pub static QUALIFIER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Remaster variants: "- Remastered 2009", "- 2009 Remaster", "/ 1997 Remastered"
        Regex::new(r"(?i)\s*[-–—/]\s*(?:remaster(?:ed)?(?:\s+\d{4})?|(?:\d{4}\s+)?(?:digital\s+)?remaster(?:ed)?)(?:\s+version)?\s*$").unwrap(),
        // Bracketed remaster: "(Remastered 2009)", "[2011 Remaster]"
        Regex::new(r"(?i)\s*[\(\[](?:remaster(?:ed)?(?:\s+\d{4})?|(?:\d{4}\s+)?(?:digital\s+)?remaster(?:ed)?)(?:\s+version)?[\)\]]").unwrap(),
        // Live: "(Live)", "(Live at Wembley)", "[Live 1995]"
        Regex::new(r"(?i)\s*[\(\[]live(?:\s+(?:at|from|in)\s+[^)\]]+|\s+\d{4})?[\)\]]").unwrap(),
        Regex::new(r"(?i)\s*[-–—]\s*live(?:\s+(?:at|from|in)\s+.+|\s+\d{4})?\s*$").unwrap(),
        // Featured artists: "(feat. Artist)", "[ft. Someone]", "Song feat. Artist"
        Regex::new(r"(?i)\s*[\(\[](?:feat\.?|ft\.?|featuring)\s+[^)\]]+[\)\]]").unwrap(),
        Regex::new(r"(?i)\s+(?:feat\.?|ft\.?|featuring)\s+.+$").unwrap(),
        // Version/edit/edition: "(Radio Edit)", "[Mono]", "(Deluxe Edition)"
        Regex::new(r"(?i)\s*[\(\[](?:radio\s+(?:edit|version)|single\s+version|album\s+version|original\s+mix|extended(?:\s+(?:mix|version))?|mono|stereo|explicit|clean|acoustic(?:\s+version)?|demo(?:\s+version)?|bonus\s+track|(?:super\s+)?deluxe(?:\s+edition)?|expanded(?:\s+edition)?)[\)\]]").unwrap(),
        // Dash form of the same: "- Radio Edit", "- Mono", "- Single Version"
        Regex::new(r"(?i)\s*[-–—]\s*(?:radio\s+(?:edit|version)|single\s+version|album\s+version|mono|stereo|acoustic(?:\s+version)?|demo(?:\s+version)?|bonus\s+track)\s*$").unwrap(),
    ]
});

/// Multi-artist separators for extracting the primary artist.
/// Matches: `,` `&` `;` and the words feat/ft/featuring/with/vs.
pub static ARTIST_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:[,&;]|\s(?:feat\.?|ft\.?|featuring|with|vs\.?)\s)\s*").unwrap()
});

/// Regex to collapse whitespace runs into a single space
pub static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if a character is a Unicode combining mark (diacritical mark).
pub fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0xFE20..=0xFE2F)
}

/// Fold Unicode text to lowercase ASCII.
/// e.g., "Beyoncé" → "beyonce", "Motörhead" → "motorhead"
pub fn fold_to_ascii(s: &str) -> String {
    // Strip diacritics via NFKD decomposition first so "é" becomes "e", not "e'"
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    // Transliterate whatever is left (Cyrillic, Greek, CJK, ...)
    any_ascii(&stripped).to_lowercase()
}

// ============================================================================
// NORMALIZATION FUNCTIONS
// ============================================================================

/// Primary normalization: ASCII fold, lowercase, collapse whitespace, trim.
/// Idempotent: `normalize(&normalize(s)) == normalize(s)`.
pub fn normalize(s: &str) -> String {
    let folded = fold_to_ascii(s);
    WHITESPACE_RUN.replace_all(&folded, " ").trim().to_string()
}

/// Secondary normalization: removes qualifier phrases ("Remastered 2009",
/// "feat. X", "Live", "Radio Edit", ...) and then normalizes.
pub fn strip_qualifiers(s: &str) -> String {
    let mut result = s.to_string();
    for pattern in QUALIFIER_PATTERNS.iter() {
        result = pattern.replace_all(&result, "").to_string();
    }
    let stripped = normalize(&result);
    // A title that is nothing but a qualifier ("Live") keeps its plain form
    if stripped.is_empty() {
        normalize(s)
    } else {
        stripped
    }
}

/// First credited artist of a multi-artist string, normalized.
/// e.g., "Mustard, Migos" → "mustard", "Drake feat. Rihanna" → "drake".
/// Returns the whole normalized artist when there is no separator.
pub fn primary_artist(artist: &str) -> String {
    let normalized = normalize(artist);
    ARTIST_SEPARATOR
        .split(&normalized)
        .map(str::trim)
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or(normalized)
}

/// Word tokens of an already-normalized string, punctuation trimmed from the edges.
pub fn tokens(normalized: &str) -> Vec<&str> {
    normalized
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Canonical ISRC form: uppercase, no hyphens or spaces, 12 alphanumerics.
/// e.g., "gb-um7-10-29604" → Some("GBUM71029604")
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cleaned.len() == 12 && cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(cleaned)
    } else {
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================
