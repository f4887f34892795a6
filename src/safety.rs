//! Safety checks that keep the writers away from input files.
//!
//! Playlist names come from request file stems, so a playlist called
//! `Library` written next to `Library.xml` would clobber the catalog. Every
//! output path is checked against the inputs before anything is written.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Best-effort absolute form of a path that may not exist yet.
fn resolved(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// Validates that an output path is safe to overwrite.
///
/// Output cannot be the same file as any of the provided source paths.
pub fn validate_output_path(output: &Path, source_paths: &[&Path]) -> Result<()> {
    let out = resolved(output);
    for source in source_paths {
        if output == *source || out == resolved(source) {
            bail!(
                "Safety check failed: output '{}' cannot be the same as source '{}'",
                output.display(),
                source.display()
            );
        }
    }
    Ok(())
}

/// Validates the output directory before the run starts.
pub fn validate_output_dir(dir: &Path, source_paths: &[&Path]) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        bail!(
            "Safety check failed: output directory '{}' exists and is not a directory",
            dir.display()
        );
    }
    validate_output_path(dir, source_paths)
}

/// File name for a playlist's output plist.
pub fn playlist_file_name(playlist: &str) -> String {
    let cleaned: String = playlist
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "Untitled.xml".to_string()
    } else {
        format!("{}.xml", cleaned)
    }
}
