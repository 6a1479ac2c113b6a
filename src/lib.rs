//! # CopySnap - content-addressed incremental directory snapshots
//!
//! A snapshot/backup engine for directory trees: every run produces either a
//! full physical copy or a space-efficient *snapshot* in which unchanged
//! files and directories are symbolic links into a prior run's copy, while
//! changed or new content is physically copied. Whether something changed is
//! decided by a recursive content hash, never by mtime/size heuristics.
//!
//! ## Overview
//!
//! A backup job is a [`SnapshotContext`]: the source directory it covers,
//! the home directory holding all managed state, and the ordered history of
//! completed runs. Each run flows through the same pipeline:
//!
//! 1. **Hash** - [`compute_checksum_map`] walks the source depth-first in
//!    deterministic sorted order and produces one 20-byte digest per path;
//!    directory digests fold in their children, so an unchanged directory
//!    digest guarantees an unchanged subtree.
//! 2. **Compare** - the latest prior run's map, rebased onto its run
//!    directory and inverted to digest → path form, tells the engine where
//!    identical content already lives on disk.
//! 3. **Copy** - [`CopyEngine`] links unchanged paths into the prior run
//!    (pruning whole subtrees under an unchanged directory) and copies the
//!    rest. Per-path failures land in a bounded [`ProblemReport`] instead
//!    of aborting the run.
//! 4. **Record** - a [`SnapshotRecord`] carrying the rebased map is
//!    appended to the context and persisted through a [`SnapshotStore`].
//!
//! Any failure after the run's target directory was created rolls back disk
//! and history together; a failing rollback surfaces as a distinct
//! double-fault error.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use copysnap::{JsonStore, ProgressTracker, SnapshotContext};
//! use std::path::Path;
//!
//! # fn main() -> copysnap::Result<()> {
//! let store = JsonStore::new("/backups/store");
//!
//! // Set up a context; its home directory lands under /backups
//! let mut context =
//!     SnapshotContext::create(Path::new("/data/projects"), Path::new("/backups"), &store)?;
//!
//! // First run: full physical copy
//! let report = context.plain_copy_and_save("baseline", &store, &mut ProgressTracker::silent())?;
//! assert!(report.is_clean());
//!
//! // Later runs: unchanged content becomes symlinks into the prior run
//! let mut tracker = ProgressTracker::with_sink(|progress| {
//!     if let Some(pct) = progress.percentage() {
//!         println!("{pct:.2}%");
//!     }
//! });
//! let report = context.snapshot_and_save("incremental", &store, &mut tracker)?;
//! if !report.is_clean() {
//!     eprintln!("{report}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Checksum maps
//!
//! A [`ChecksumMap`] maps every path of a tree (the root included) to a
//! fixed-length digest. [`ChecksumMap::redirect`] rebases the map onto a
//! run directory for storage; [`ChecksumMap::invert`] flips it into the
//! digest → path lookup that drives deduplication. Digest equality is the
//! sole identity test - see [`Digest`] for the stated trust assumption.
//!
//! ### Managed layout
//!
//! Each context owns a home directory with a `data/` target root (one
//! timestamp-named subdirectory per run, lexicographic = chronological),
//! a `.copysnap/` metadata directory and a plain-text `backup.txt`
//! recovery file. [`SnapshotContext::reconstruct`] can rebuild a context
//! from nothing but that layout when the structured store is lost.
//!
//! ### Persistence
//!
//! Durable history goes through the [`SnapshotStore`] trait, injected
//! explicitly wherever it is needed. [`JsonStore`] persists one JSON
//! document per context; [`MemoryStore`] backs tests.
//!
//! ## Concurrency
//!
//! One run executes single-threaded; the deterministic traversal order is
//! part of the output contract. Progress callbacks are invoked
//! synchronously from inside the traversal. A per-context run lock makes a
//! second concurrent run on the same context fail fast, while distinct
//! contexts may run in parallel.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, CopySnapError>`. Precondition failures
//! are reported before anything is touched; expected per-path failures are
//! summarized in problem reports; anything that leaves the managed
//! directory structure in an unknown state is escalated, never swallowed.

// Public API modules
pub mod checksum;
pub mod context;
pub mod copier;
pub mod error;
pub mod hashing;
pub mod progress;
pub mod record;
pub mod report;
pub mod store;

// Internal helpers
mod utils;

// Re-export main types for convenience
pub use checksum::{ChecksumMap, Digest, InvertedChecksumMap, DIGEST_LEN};
pub use context::{ContextSummary, SnapshotContext};
pub use copier::CopyEngine;
pub use error::{CopySnapError, Result};
pub use hashing::compute_checksum_map;
pub use progress::{CopyProgress, ProgressTracker};
pub use record::{CopyKind, SnapshotRecord};
pub use report::{Problem, ProblemReport, DEFAULT_MAX_STORED_PROBLEMS};
pub use store::{JsonStore, MemoryStore, SnapshotStore, StoreError, StoreResult};
