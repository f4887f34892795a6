//! Playlist reconciliation library - shared modules for both binaries.

pub mod cache;
pub mod cascade;
pub mod catalog;
pub mod diagnostics;
pub mod index;
pub mod models;
pub mod normalize;
pub mod prefetch;
pub mod progress;
pub mod report;
pub mod safety;
pub mod scoring;
pub mod tags;
