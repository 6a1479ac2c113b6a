//! Error types for the CopySnap library
//!
//! This module defines all error types that can occur during snapshot
//! operations. The taxonomy distinguishes precondition failures (nothing was
//! touched on disk), run-level failures (a partially written run directory
//! existed and has been rolled back), and rollback double-faults (disk and
//! metadata may disagree and need operator attention).

use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the CopySnap library
pub type Result<T> = std::result::Result<T, CopySnapError>;

/// Main error type for all CopySnap operations
#[derive(Debug, Error)]
pub enum CopySnapError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors from the persistence collaborator
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Directory walk error while deleting or discovering run directories
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// The snapshot source root cannot be read at all
    #[error("source path is not readable: {0:?}")]
    SourceUnreadable(PathBuf),

    /// A path that must be a directory is not one
    #[error("not a directory: {0:?}")]
    NotADirectory(PathBuf),

    /// No stored context exists under the given id
    #[error("context not found: {0}")]
    ContextNotFound(String),

    /// A snapshot run was requested but the context has no prior run to
    /// compare against
    #[error("no prior run recorded for context {0}")]
    NoPriorRun(String),

    /// The comparison checksum map for a snapshot run is empty
    #[error("comparison checksum map is empty")]
    EmptyComparisonMap,

    /// A record id was not found in the context it was claimed to belong to
    #[error("snapshot record {record_id} does not belong to context {context_id}")]
    UnknownRecord {
        /// Id of the offending record
        record_id: String,
        /// Id of the context that was asked to operate on it
        context_id: String,
    },

    /// Another run is already mutating this context
    #[error("a run is already in progress for context {0}")]
    RunInProgress(String),

    /// Managed directory layout is corrupted beyond non-destructive repair
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The plain-text recovery file could not be parsed
    #[error("malformed backup file: {0}")]
    MalformedBackupFile(String),

    /// A run failed after its target directory was created; rollback has
    /// completed successfully
    #[error("{operation} run failed: {source}")]
    RunFailed {
        /// Which run operation failed ("plain copy" or "snapshot")
        operation: &'static str,
        /// The failure that aborted the run
        source: Box<CopySnapError>,
    },

    /// A run failed and the subsequent rollback failed as well; the run
    /// directory and the recorded history may now disagree
    #[error(
        "rollback failed after run failure; disk and metadata may be \
         inconsistent (run error: {original}, cleanup error: {cleanup})"
    )]
    RollbackFailed {
        /// The failure that aborted the run
        original: Box<CopySnapError>,
        /// The failure encountered while undoing the run's side effects
        cleanup: Box<CopySnapError>,
    },
}

impl CopySnapError {
    /// Create an integrity error with a custom message
    pub fn integrity(msg: impl Into<String>) -> Self {
        CopySnapError::Integrity(msg.into())
    }

    /// Create a malformed-backup-file error with a custom message
    pub fn malformed_backup(msg: impl Into<String>) -> Self {
        CopySnapError::MalformedBackupFile(msg.into())
    }

    /// Wrap a run failure, preserving the original error as source
    pub(crate) fn run_failed(operation: &'static str, source: CopySnapError) -> Self {
        CopySnapError::RunFailed {
            operation,
            source: Box::new(source),
        }
    }

    /// Check whether this error is a precondition failure
    ///
    /// Precondition failures are reported before any filesystem or store
    /// state is touched; no rollback is required after one.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CopySnapError::SourceUnreadable(_)
                | CopySnapError::NotADirectory(_)
                | CopySnapError::ContextNotFound(_)
                | CopySnapError::NoPriorRun(_)
                | CopySnapError::EmptyComparisonMap
                | CopySnapError::UnknownRecord { .. }
                | CopySnapError::RunInProgress(_)
        )
    }

    /// Check whether this error is a rollback double-fault
    ///
    /// After a double-fault the managed directory tree and the stored run
    /// history may be inconsistent with each other.
    pub fn is_double_fault(&self) -> bool {
        matches!(self, CopySnapError::RollbackFailed { .. })
    }
}
