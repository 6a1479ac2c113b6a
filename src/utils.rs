//! Utility functions for CopySnap
//!
//! This module provides the shared filesystem helpers used throughout the
//! library: deterministic path ordering, sorted directory listing, recursive
//! deletion, atomic writes, symlink creation and the sortable timestamp
//! tokens that name run directories.
//!
//! ## Determinism
//!
//! Everything that walks a tree in this crate does so in lexicographic order
//! of the full path string ([`compare_paths`]). That ordering is part of the
//! external contract: directory digests fold their children in this order,
//! and problem reports list failures in this order, so two runs over an
//! unmodified tree produce byte-identical results regardless of how the
//! filesystem enumerates entries.

use crate::error::Result;
use chrono::{DateTime, TimeZone};
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Compare two paths by their full path string
///
/// Lexicographic byte order on the underlying OS string. This is the single
/// ordering used for hash folding, copy traversal and problem reporting.
pub fn compare_paths(a: &Path, b: &Path) -> Ordering {
    a.as_os_str().cmp(b.as_os_str())
}

/// Classification of a source path for hashing and copying
///
/// Hashing and copying must agree on what a path *is*, or a snapshot run
/// would link content the hash never covered. Symlinks to regular files
/// count as files (their bytes are read through the link); symlinks to
/// directories do not count as directories - recursing through them could
/// loop, so they fall into [`PathKind::Other`] together with dangling
/// links and special files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathKind {
    /// A real directory (never a symlinked one)
    Directory,
    /// A regular file, possibly reached through a file symlink
    File,
    /// Directory symlinks, dangling links, special files, stat failures
    Other,
}

/// Classify a path without ever recursing through a symlink
pub(crate) fn classify_path(path: &Path) -> PathKind {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => PathKind::Directory,
        Ok(metadata) if metadata.is_file() => PathKind::File,
        Ok(metadata) if metadata.file_type().is_symlink() => match fs::metadata(path) {
            Ok(target) if target.is_file() => PathKind::File,
            _ => PathKind::Other,
        },
        _ => PathKind::Other,
    }
}

/// List the immediate children of a directory in deterministic order
///
/// Returns full paths sorted by [`compare_paths`]. Propagates the listing
/// error so callers can decide whether an unreadable directory is fatal.
pub fn sorted_children(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    children.sort_by(|a, b| compare_paths(a, b));
    Ok(children)
}

/// Delete a file, symlink or directory tree, tolerating absence
///
/// A path that does not exist is treated as already deleted, which makes
/// this safe to call from rollback paths where the target may never have
/// been fully created. Symbolic links are removed without following them.
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if metadata.is_dir() {
        for entry in WalkDir::new(path).contents_first(true) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
    } else {
        fs::remove_file(path)?;
    }
    trace!("removed {:?}", path);
    Ok(())
}

/// Delete the contents of a directory, leaving the directory itself
pub fn clear_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// Atomic file write (write to temp file then rename)
///
/// The target file is never observable in a partially written state: either
/// the rename completed and the full content is visible, or the old content
/// (or absence) remains.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)
    } else {
        symlink_file(target, link)
    }
}

/// Format a moment as a sortable run-directory token
///
/// Pattern: `YYYY-MM-DD-HH-MM-SS-mmmm` with a zero-padded 4-digit
/// sub-second token, so that lexicographic order equals chronological
/// order. Recovery relies on this shape to order rediscovered run
/// directories.
pub fn timestamp_token<Tz: TimeZone>(moment: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}-{:04}",
        moment.format("%Y-%m-%d-%H-%M-%S"),
        moment.timestamp_subsec_micros() / 100
    )
}
