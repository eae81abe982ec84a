//! Library scanner
//!
//! Walks the music folder and enqueues one work unit per audio file. Unit
//! ids are derived from the path, so re-scanning is idempotent: files
//! already known keep their state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::db::{units, WorkUnit};
use crate::error::{TaggerError, TaggerResult};

/// Extensions treated as audio (compared case-insensitively)
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "m4a", "aac", "wav", "aiff", "wma"];

const IGNORED_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", ".git", ".svn"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Outcome of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Audio files found on disk
    pub found: usize,
    /// Files not previously known
    pub enqueued: usize,
}

/// Collect audio files under `root`, sorted
///
/// Symlinks are not followed. Unreadable entries are logged and skipped.
pub fn find_audio_files(root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    if !root.exists() {
        return Err(ScanError::PathNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_ignored(e));

    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_audio(entry.path()) => {
                files.push(entry.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!("Error accessing entry: {}", e),
        }
    }

    files.sort();
    Ok(files)
}

fn is_ignored(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    IGNORED_NAMES.iter().any(|ignored| name == *ignored)
}

fn is_audio(path: &Path) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    let ext = ext.to_string_lossy().to_ascii_lowercase();
    AUDIO_EXTENSIONS.contains(&ext.as_str())
}

/// Scan `root` and enqueue every audio file found
pub async fn scan_and_enqueue(pool: &SqlitePool, root: &Path) -> TaggerResult<ScanSummary> {
    let root_owned = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || find_audio_files(&root_owned))
        .await
        .map_err(|e| TaggerError::Io(std::io::Error::other(e)))??;

    let mut summary = ScanSummary {
        found: files.len(),
        enqueued: 0,
    };
    let mut seen = HashSet::new();

    for path in files {
        let path = path.to_string_lossy().into_owned();
        if !seen.insert(path.clone()) {
            continue;
        }
        if units::enqueue_unit(pool, &WorkUnit::pending(path.as_str())).await? {
            debug!(path = %path, "Enqueued");
            summary.enqueued += 1;
        }
    }

    info!(root = %root.display(), found = summary.found, enqueued = summary.enqueued, "Scan complete");
    Ok(summary)
}
