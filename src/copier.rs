//! Plain and delta copy algorithms
//!
//! A [`CopyEngine`] recreates a source tree underneath a run's target
//! directory. Target locations resolve the source path relative to the
//! *parent* of the source root, so a run directory contains the source
//! directory's own name as its single top-level entry; disaster recovery
//! relies on that shape.
//!
//! Two modes exist:
//!
//! - [`CopyEngine::plain_copy`] copies everything physically;
//! - [`CopyEngine::snapshot_copy`] consults the previous run's inverted
//!   checksum map and replaces unchanged paths with symbolic links into
//!   that run. An unchanged *directory* prunes its whole subtree: its
//!   digest folds every descendant, so one link covers all of them.
//!
//! Per-path failures never abort a copy; they are accumulated in a
//! [`ProblemReport`] and the traversal continues.

use crate::checksum::{ChecksumMap, InvertedChecksumMap};
use crate::error::{CopySnapError, Result};
use crate::progress::ProgressTracker;
use crate::report::{Problem, ProblemReport};
use crate::utils::{classify_path, clear_directory, create_symlink, sorted_children, PathKind};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Copy engine bound to one source tree and one run target directory
#[derive(Debug, Clone)]
pub struct CopyEngine {
    source_root: PathBuf,
    target_root: PathBuf,
}

impl CopyEngine {
    /// Create an engine copying `source_root` underneath `target_root`
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
        }
    }

    /// Resolve the target location for a path of the source tree
    ///
    /// The path is taken relative to the parent of the source root, so the
    /// source root itself maps to `<target>/<source-name>`.
    fn target_for(&self, source_path: &Path) -> PathBuf {
        let base = self.source_root.parent().unwrap_or_else(|| Path::new("/"));
        match source_path.strip_prefix(base) {
            Ok(relative) => self.target_root.join(relative),
            // not under the source tree; fall back to the final component
            Err(_) => match source_path.file_name() {
                Some(name) => self.target_root.join(name),
                None => self.target_root.clone(),
            },
        }
    }

    /// Physically copy the whole source tree under the target directory
    ///
    /// Directories are recreated with `create_dir`, file bytes copied
    /// verbatim, children visited in deterministic sorted order. With
    /// `overwrite` unset, an already-existing target directory is a fatal
    /// per-subtree error: it is recorded and that subtree is skipped. With
    /// `overwrite` set, existing target directory contents are deleted
    /// first and existing files replaced.
    pub fn plain_copy(&self, overwrite: bool) -> ProblemReport {
        let mut report = ProblemReport::new();
        self.plain_copy_rec(&self.source_root, overwrite, &mut report);
        report
    }

    fn plain_copy_rec(&self, current: &Path, overwrite: bool, report: &mut ProblemReport) {
        let target = self.target_for(current);
        match classify_path(current) {
            PathKind::Directory => {
                let children = match sorted_children(current) {
                    Ok(children) => children,
                    Err(e) => {
                        record_problem(report, current, &target, &e, "tried to perform a plain copy");
                        return;
                    }
                };
                if let Err(e) = self.create_target_directory(&target, overwrite) {
                    record_problem(report, current, &target, &e, "tried to perform a plain copy");
                    return;
                }
                for child in &children {
                    self.plain_copy_rec(child, overwrite, report);
                }
            }
            PathKind::File => {
                if let Err(e) = copy_file(current, &target, overwrite) {
                    record_problem(report, current, &target, &e, "tried to perform a plain copy");
                }
            }
            PathKind::Other => {
                record_unresolvable(report, current, &target);
            }
        }
    }

    fn create_target_directory(&self, target: &Path, overwrite: bool) -> io::Result<()> {
        match fs::create_dir(target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && overwrite => {
                clear_directory(target).map_err(|clear_err| match clear_err {
                    CopySnapError::Io(io_err) => io_err,
                    other => io::Error::other(other.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Delta-copy the source tree, linking unchanged paths into a prior run
    ///
    /// For every path of `current` in sorted order: one progress tick, then
    /// either skip (covered by an already-linked unchanged ancestor), link
    /// (digest found in `previous`), or materialise (new directory / copied
    /// file). An empty comparison map is a precondition failure reported
    /// before any filesystem work; a snapshot run needs a reference point.
    pub fn snapshot_copy(
        &self,
        current: &ChecksumMap,
        previous: &InvertedChecksumMap,
        tracker: &mut ProgressTracker,
    ) -> Result<ProblemReport> {
        if previous.is_empty() {
            return Err(CopySnapError::EmptyComparisonMap);
        }

        let mut report = ProblemReport::new();
        let mut unchanged_parent: Option<PathBuf> = None;

        for source_path in current.sorted_paths() {
            tracker.path_processed();

            if let Some(parent) = &unchanged_parent {
                if source_path.starts_with(parent) {
                    // covered by the symlinked ancestor
                    continue;
                }
            }

            let target_path = self.target_for(source_path);
            let Some(digest) = current.get(source_path) else {
                continue;
            };

            if let Some(link_target) = previous.path_for(&digest) {
                if classify_path(source_path) == PathKind::Directory {
                    unchanged_parent = Some(source_path.to_path_buf());
                }
                if let Err(e) = create_symlink(link_target, &target_path) {
                    record_problem(
                        &mut report,
                        source_path,
                        &target_path,
                        &e,
                        "tried to set symbolic link",
                    );
                }
            } else {
                unchanged_parent = None;
                match classify_path(source_path) {
                    PathKind::Directory => {
                        if let Err(e) = fs::create_dir(&target_path) {
                            record_problem(
                                &mut report,
                                source_path,
                                &target_path,
                                &e,
                                "tried to create new directory",
                            );
                        }
                    }
                    PathKind::File => {
                        if let Err(e) = copy_file(source_path, &target_path, false) {
                            record_problem(
                                &mut report,
                                source_path,
                                &target_path,
                                &e,
                                "tried to copy file",
                            );
                        }
                    }
                    PathKind::Other => {
                        record_unresolvable(&mut report, source_path, &target_path);
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Copy one regular file's bytes to the target location
fn copy_file(source: &Path, target: &Path, overwrite: bool) -> io::Result<()> {
    if !overwrite && target.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("target file already exists: {}", target.display()),
        ));
    }
    fs::copy(source, target)?;
    Ok(())
}

fn record_problem(
    report: &mut ProblemReport,
    source: &Path,
    target: &Path,
    error: &dyn std::fmt::Display,
    context: &str,
) {
    warn!("{}: {:?} -> {:?}: {}", context, source, target, error);
    report.record(Problem {
        source_path: source.to_path_buf(),
        target_path: target.to_path_buf(),
        error: error.to_string(),
        context: context.to_string(),
    });
}

fn record_unresolvable(report: &mut ProblemReport, source: &Path, target: &Path) {
    record_problem(
        report,
        source,
        target,
        &"unresolvable path",
        "path was not a directory and not a regular file",
    );
}
