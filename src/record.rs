//! Snapshot run history records
//!
//! A [`SnapshotRecord`] describes one completed run: where its copy lives
//! on disk, how it was produced, and the checksum map of its content
//! rebased onto the run directory. The rebased map is what a later snapshot
//! run inverts to find link targets. Records are immutable once created
//! except for their display name.

use crate::checksum::{ChecksumMap, InvertedChecksumMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How a run's on-disk copy was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyKind {
    /// Full physical copy of the source tree
    Plain,
    /// Delta copy with symlinks into a prior run
    Snapshot,
    /// Rebuilt from disk during disaster recovery
    Restored,
}

impl fmt::Display for CopyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CopyKind::Plain => "Plain Copy",
            CopyKind::Snapshot => "Snapshot",
            CopyKind::Restored => "Restored",
        };
        f.write_str(label)
    }
}

/// One completed run of a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    id: String,
    context_id: String,
    name: String,
    run_directory: PathBuf,
    kind: CopyKind,
    checksum_map: ChecksumMap,
    created_at: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Create a record for a run that just completed
    ///
    /// `checksum_map` must already be rebased onto `run_directory`.
    pub fn new(
        context_id: impl Into<String>,
        name: impl Into<String>,
        run_directory: impl Into<PathBuf>,
        checksum_map: ChecksumMap,
        kind: CopyKind,
    ) -> Self {
        Self::with_created_at(context_id, name, run_directory, checksum_map, kind, Utc::now())
    }

    /// Create a record with an explicit creation time
    ///
    /// Used by disaster recovery, which back-dates restored records to the
    /// moment encoded in their run-directory name so that "latest" queries
    /// keep working.
    pub(crate) fn with_created_at(
        context_id: impl Into<String>,
        name: impl Into<String>,
        run_directory: impl Into<PathBuf>,
        checksum_map: ChecksumMap,
        kind: CopyKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.into(),
            name: name.into(),
            run_directory: run_directory.into(),
            kind,
            checksum_map,
            created_at,
        }
    }

    /// Unique record id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the owning context
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change the display name (the only mutable attribute)
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Absolute run directory holding this run's copy
    pub fn run_directory(&self) -> &Path {
        &self.run_directory
    }

    /// How the copy was produced
    pub fn kind(&self) -> CopyKind {
        self.kind
    }

    /// Checksum map rebased onto the run directory
    pub fn checksum_map(&self) -> &ChecksumMap {
        &self.checksum_map
    }

    /// Creation time; "latest" queries order by this
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Digest → run-directory-path lookup for delta comparisons
    pub fn inverted_map(&self) -> InvertedChecksumMap {
        self.checksum_map.invert()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{Digest, DIGEST_LEN};

    fn map() -> ChecksumMap {
        let mut map = ChecksumMap::new();
        map.insert(
            PathBuf::from("/runs/0001/tree"),
            Digest::from_bytes([1; DIGEST_LEN]),
        );
        map
    }

    #[test]
    fn test_new_record_has_unique_id() {
        let a = SnapshotRecord::new("ctx", "first", "/runs/0001", map(), CopyKind::Plain);
        let b = SnapshotRecord::new("ctx", "second", "/runs/0002", map(), CopyKind::Snapshot);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), CopyKind::Plain);
    }

    #[test]
    fn test_only_name_is_mutable() {
        let mut record = SnapshotRecord::new("ctx", "before", "/runs/0001", map(), CopyKind::Plain);
        record.set_name("after");
        assert_eq!(record.name(), "after");
        assert_eq!(record.run_directory(), Path::new("/runs/0001"));
    }

    #[test]
    fn test_inverted_map_resolves_digest() {
        let record = SnapshotRecord::new("ctx", "run", "/runs/0001", map(), CopyKind::Plain);
        let inverted = record.inverted_map();
        assert_eq!(
            inverted.path_for(&Digest::from_bytes([1; DIGEST_LEN])),
            Some(Path::new("/runs/0001/tree"))
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let record = SnapshotRecord::new("ctx", "run", "/runs/0001", map(), CopyKind::Restored);
        let json = serde_json::to_string(&record).unwrap();
        let back: SnapshotRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn test_copy_kind_labels() {
        assert_eq!(CopyKind::Plain.to_string(), "Plain Copy");
        assert_eq!(CopyKind::Snapshot.to_string(), "Snapshot");
        assert_eq!(CopyKind::Restored.to_string(), "Restored");
    }
}
