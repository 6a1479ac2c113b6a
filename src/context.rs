//! Snapshot context: managed layout, run history and orchestration
//!
//! A [`SnapshotContext`] is one backup job: the source directory it covers,
//! the home directory holding all managed state, and the ordered history of
//! completed runs. It sequences every run through the same lifecycle
//! (create the run's target directory, hash the source, copy plain or
//! delta, record history, persist) and rolls back the run directory and
//! any partially appended record together when a phase fails. A failing
//! rollback is surfaced as a distinct double-fault, because at that point
//! disk and metadata may disagree.
//!
//! Managed layout under the home directory:
//!
//! ```text
//! <home>/data/                  one subdirectory per run, timestamp-named
//! <home>/.copysnap/             internal metadata
//! <home>/.copysnap/backup.txt   plain-text recovery file (source=<path>)
//! ```
//!
//! The recovery file exists so that [`SnapshotContext::reconstruct`] can
//! rebuild a context from nothing but its home directory when the
//! structured store is gone.

use crate::checksum::ChecksumMap;
use crate::copier::CopyEngine;
use crate::error::{CopySnapError, Result};
use crate::hashing::compute_checksum_map;
use crate::progress::ProgressTracker;
use crate::record::{CopyKind, SnapshotRecord};
use crate::report::ProblemReport;
use crate::store::SnapshotStore;
use crate::utils::{compare_paths, remove_path, timestamp_token};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of generated home directory names
const HOME_DIR_PREFIX: &str = "CopySnap";
/// Name of the internal metadata directory under the home
const INTERNAL_DIR_NAME: &str = ".copysnap";
/// Name of the target root holding run directories
const TARGET_DIR_NAME: &str = "data";
/// Name of the plain-text recovery file
const BACKUP_FILE_NAME: &str = "backup.txt";
/// Key/value delimiter inside the recovery file
const BACKUP_DELIMITER: char = '=';
/// Recovery-file key for the source path
const SOURCE_KEY: &str = "source";

/// Context ids with a run currently mutating their history
static ACTIVE_RUNS: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// RAII guard serializing history mutations per context id
///
/// Two concurrent runs on the same context would interleave run-directory
/// creation and history writes; the guard makes the second one fail fast.
/// Distinct contexts are unaffected.
struct RunGuard {
    context_id: String,
}

impl RunGuard {
    fn acquire(context_id: &str) -> Result<Self> {
        let mut active = ACTIVE_RUNS.lock();
        if active.iter().any(|id| id == context_id) {
            return Err(CopySnapError::RunInProgress(context_id.to_string()));
        }
        active.push(context_id.to_string());
        Ok(Self {
            context_id: context_id.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        ACTIVE_RUNS.lock().retain(|id| id != &self.context_id);
    }
}

/// Lightweight listing row for a stored context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    /// Context id
    pub id: String,
    /// Display name
    pub name: String,
    /// Directory the context backs up
    pub source_path: PathBuf,
    /// Root of the context's managed state
    pub home_path: PathBuf,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Number of completed runs
    pub run_count: usize,
}

/// One backup job: configuration plus run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContext {
    id: String,
    name: String,
    source_path: PathBuf,
    home_path: PathBuf,
    created_at: DateTime<Utc>,
    records: Vec<SnapshotRecord>,
}

impl SnapshotContext {
    // -------------------- creation and loading

    /// Create a new context and initialise its home directory on disk
    ///
    /// Validates that `source_path` and `home_parent` are directories,
    /// derives a home directory name from the source name (timestamp
    /// suffix on collision), creates the managed layout, and persists the
    /// context. If initialisation or persisting fails the freshly created
    /// home directory is removed again.
    pub fn create(
        source_path: &Path,
        home_parent: &Path,
        store: &dyn SnapshotStore,
    ) -> Result<Self> {
        if !source_path.is_dir() {
            return Err(CopySnapError::NotADirectory(source_path.to_path_buf()));
        }
        if !home_parent.is_dir() {
            return Err(CopySnapError::NotADirectory(home_parent.to_path_buf()));
        }

        let mut home_path = home_parent.join(derive_home_dir_name(source_path));
        if home_path.exists() {
            let suffixed = format!(
                "{}_{}",
                home_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                Utc::now().format("%Y-%m-%d-%H-%M-%S")
            );
            home_path = home_parent.join(suffixed);
        }

        let source_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let context = Self {
            id: Uuid::new_v4().to_string(),
            name: format!("Context - {source_name}"),
            source_path: source_path.to_path_buf(),
            home_path,
            created_at: Utc::now(),
            records: Vec::new(),
        };

        if let Err(e) = context
            .initialise_layout()
            .and_then(|()| store.save(&context).map_err(CopySnapError::from))
        {
            // undo the half-created home directory; the context was never
            // usable
            if let Err(cleanup) = remove_path(&context.home_path) {
                warn!(
                    "could not delete home directory {:?} after failed creation: {}",
                    context.home_path, cleanup
                );
            }
            return Err(e);
        }

        remember_last_used(store, &context.id);
        info!(
            "created context {} with home {:?}",
            context.id, context.home_path
        );
        Ok(context)
    }

    /// Load a stored context by id and repair its managed layout
    pub fn load(store: &dyn SnapshotStore, id: &str) -> Result<Self> {
        let context = store
            .load(id)?
            .ok_or_else(|| CopySnapError::ContextNotFound(id.to_string()))?;
        context.check_and_restore_layout()?;
        remember_last_used(store, &context.id);
        Ok(context)
    }

    /// Rebuild a context from its home directory alone
    ///
    /// Disaster recovery: reads the source path from the plain-text
    /// recovery file, then prefers a stored context with a matching home
    /// path (its recorded source path must agree with the recovery file).
    /// If the store knows nothing, history is re-derived by re-hashing
    /// every run directory found on disk, newest first; run directories
    /// that are unreadable or have the wrong shape are logged and skipped.
    /// `fraction_sink` receives overall progress in `[0, 1]` across the
    /// discovered run directories.
    pub fn reconstruct(
        home_path: &Path,
        store: &dyn SnapshotStore,
        fraction_sink: &mut dyn FnMut(f64),
    ) -> Result<Self> {
        let backup = read_backup_file(home_path)?;
        let source_path = PathBuf::from(backup.get(SOURCE_KEY).ok_or_else(|| {
            CopySnapError::malformed_backup(format!("missing '{SOURCE_KEY}' entry"))
        })?);
        info!("recovery file names source path {:?}", source_path);

        if let Some(summary) = store
            .list()?
            .into_iter()
            .find(|summary| summary.home_path == home_path)
        {
            let context = store
                .load(&summary.id)?
                .ok_or_else(|| CopySnapError::ContextNotFound(summary.id.clone()))?;
            if context.source_path != source_path {
                return Err(CopySnapError::integrity(format!(
                    "stored context for home {:?} disagrees with recovery file: \
                     stored source {:?}, recorded source {:?}",
                    home_path, context.source_path, source_path
                )));
            }
            context.check_and_restore_layout()?;
            fraction_sink(1.0);
            return Ok(context);
        }

        info!("no stored context for home {:?}, rebuilding from disk", home_path);
        let home_name = home_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut context = Self {
            id: Uuid::new_v4().to_string(),
            name: format!("{home_name}_restored"),
            source_path,
            home_path: home_path.to_path_buf(),
            created_at: Utc::now(),
            records: Vec::new(),
        };
        context.check_and_restore_layout()?;

        let mut run_dirs = Vec::new();
        for entry in fs::read_dir(context.target_path())? {
            let path = entry?.path();
            if path.is_dir() {
                run_dirs.push(path);
            }
        }
        // newest first, so the most valuable history is recovered even if a
        // later directory fails
        run_dirs.sort_by(|a, b| compare_paths(b, a));

        let source_name = context
            .source_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        let total = run_dirs.len();
        for (done, run_dir) in run_dirs.iter().enumerate() {
            if total > 0 {
                fraction_sink(done as f64 / total as f64);
            }
            let tree = run_dir.join(&source_name);
            if !tree.is_dir() {
                warn!(
                    "expected a directory at {:?}, skipping run directory {:?}",
                    tree, run_dir
                );
                continue;
            }
            match compute_checksum_map(&tree, &mut ProgressTracker::silent()) {
                Ok(map) => {
                    let run_dir_name = run_dir
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let created_at =
                        parse_run_dir_timestamp(&run_dir_name).unwrap_or_else(Utc::now);
                    context.records.push(SnapshotRecord::with_created_at(
                        context.id.clone(),
                        format!("{run_dir_name}_restored"),
                        run_dir.clone(),
                        map,
                        CopyKind::Restored,
                        created_at,
                    ));
                }
                Err(e) => {
                    warn!(
                        "could not compute checksum map, skipping run directory {:?}: {}",
                        run_dir, e
                    );
                }
            }
        }
        fraction_sink(1.0);

        store.save(&context)?;
        remember_last_used(store, &context.id);
        info!(
            "reconstructed context {} with {} run(s)",
            context.id,
            context.records.len()
        );
        Ok(context)
    }

    // -------------------- run operations

    /// Perform a full physical copy into a fresh run directory and record it
    ///
    /// Hashes the source tree, copies it, appends a [`CopyKind::Plain`]
    /// record carrying the redirected checksum map, and persists the
    /// context. Any failure after the run directory was created rolls back
    /// disk and history together and surfaces a wrapped run error.
    pub fn plain_copy_and_save(
        &mut self,
        run_name: &str,
        store: &dyn SnapshotStore,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<ProblemReport> {
        let _guard = RunGuard::acquire(&self.id)?;
        let run_dir = self.next_run_directory();
        let records_before = self.records.len();
        debug!("starting plain copy run into {:?}", run_dir);
        match self.execute_plain(run_name, &run_dir, store, tracker) {
            Ok(report) => Ok(report),
            Err(original) => Err(self.roll_back("plain copy", &run_dir, records_before, store, original)),
        }
    }

    /// Perform a delta copy against the latest prior run and record it
    ///
    /// Fails fast with a precondition error when the context has no prior
    /// run, without touching the filesystem. Otherwise hashes the source,
    /// links unchanged paths into the latest run and copies the rest,
    /// appends a [`CopyKind::Snapshot`] record and persists. Rollback as in
    /// [`plain_copy_and_save`](Self::plain_copy_and_save).
    pub fn snapshot_and_save(
        &mut self,
        run_name: &str,
        store: &dyn SnapshotStore,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<ProblemReport> {
        let _guard = RunGuard::acquire(&self.id)?;
        let previous_inverted = self
            .latest_record()
            .ok_or_else(|| CopySnapError::NoPriorRun(self.id.clone()))?
            .inverted_map();
        let run_dir = self.next_run_directory();
        let records_before = self.records.len();
        debug!("starting snapshot run into {:?}", run_dir);
        match self.execute_snapshot(run_name, &run_dir, previous_inverted, store, tracker) {
            Ok(report) => Ok(report),
            Err(original) => Err(self.roll_back("snapshot", &run_dir, records_before, store, original)),
        }
    }

    fn execute_plain(
        &mut self,
        run_name: &str,
        run_dir: &Path,
        store: &dyn SnapshotStore,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<ProblemReport> {
        fs::create_dir(run_dir)?;
        let source_map = compute_checksum_map(&self.source_path, tracker)?;
        let report = CopyEngine::new(&self.source_path, run_dir).plain_copy(false);
        self.append_record(run_name, run_dir, source_map.redirect(run_dir), CopyKind::Plain);
        store.save(self)?;
        Ok(report)
    }

    fn execute_snapshot(
        &mut self,
        run_name: &str,
        run_dir: &Path,
        previous_inverted: crate::checksum::InvertedChecksumMap,
        store: &dyn SnapshotStore,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<ProblemReport> {
        fs::create_dir(run_dir)?;
        let source_map = compute_checksum_map(&self.source_path, tracker)?;
        let report = CopyEngine::new(&self.source_path, run_dir).snapshot_copy(
            &source_map,
            &previous_inverted,
            tracker,
        )?;
        self.append_record(run_name, run_dir, source_map.redirect(run_dir), CopyKind::Snapshot);
        store.save(self)?;
        Ok(report)
    }

    fn append_record(
        &mut self,
        run_name: &str,
        run_dir: &Path,
        redirected_map: ChecksumMap,
        kind: CopyKind,
    ) {
        self.records.push(SnapshotRecord::new(
            self.id.clone(),
            run_name,
            run_dir,
            redirected_map,
            kind,
        ));
    }

    /// Undo a failed run: drop the partially appended record, persist the
    /// restored history and delete the run directory (absent is fine)
    fn roll_back(
        &mut self,
        operation: &'static str,
        run_dir: &Path,
        records_before: usize,
        store: &dyn SnapshotStore,
        original: CopySnapError,
    ) -> CopySnapError {
        warn!("{} run failed, rolling back {:?}: {}", operation, run_dir, original);
        let cleanup = (|| -> Result<()> {
            if self.records.len() > records_before {
                self.records.truncate(records_before);
                store.save(self)?;
            }
            remove_path(run_dir)
        })();
        match cleanup {
            Ok(()) => CopySnapError::run_failed(operation, original),
            Err(cleanup) => CopySnapError::RollbackFailed {
                original: Box::new(original),
                cleanup: Box::new(cleanup),
            },
        }
    }

    // -------------------- history mutations

    /// Delete a completed run: its directory on disk and its record
    ///
    /// The record must belong to this context; an unknown id is a
    /// precondition failure and nothing is touched.
    pub fn delete_snapshot_and_save(
        &mut self,
        record_id: &str,
        store: &dyn SnapshotStore,
    ) -> Result<()> {
        let _guard = RunGuard::acquire(&self.id)?;
        let index = self
            .records
            .iter()
            .position(|record| record.id() == record_id)
            .ok_or_else(|| CopySnapError::UnknownRecord {
                record_id: record_id.to_string(),
                context_id: self.id.clone(),
            })?;
        remove_path(self.records[index].run_directory())?;
        let removed = self.records.remove(index);
        store.save(self)?;
        info!("deleted run {} ({:?})", removed.id(), removed.run_directory());
        Ok(())
    }

    /// Rename a record's display name and persist
    pub fn rename_record(
        &mut self,
        record_id: &str,
        new_name: &str,
        store: &dyn SnapshotStore,
    ) -> Result<()> {
        let _guard = RunGuard::acquire(&self.id)?;
        let record = self
            .records
            .iter_mut()
            .find(|record| record.id() == record_id)
            .ok_or_else(|| CopySnapError::UnknownRecord {
                record_id: record_id.to_string(),
                context_id: self.id.clone(),
            })?;
        record.set_name(new_name);
        store.save(self)?;
        Ok(())
    }

    /// Remove this context and its records from the store
    ///
    /// Files on disk are left untouched; the home directory can later be
    /// picked up again by [`reconstruct`](Self::reconstruct).
    pub fn delete(self, store: &dyn SnapshotStore) -> Result<()> {
        store.delete(&self.id)?;
        Ok(())
    }

    // -------------------- layout

    /// Target root holding one subdirectory per run
    pub fn target_path(&self) -> PathBuf {
        self.home_path.join(TARGET_DIR_NAME)
    }

    /// Internal metadata directory
    pub fn internal_path(&self) -> PathBuf {
        self.home_path.join(INTERNAL_DIR_NAME)
    }

    /// Plain-text recovery file
    pub fn backup_file_path(&self) -> PathBuf {
        self.internal_path().join(BACKUP_FILE_NAME)
    }

    fn next_run_directory(&self) -> PathBuf {
        self.target_path().join(timestamp_token(&Utc::now()))
    }

    fn initialise_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.home_path)?;
        fs::create_dir_all(self.target_path())?;
        fs::create_dir_all(self.internal_path())?;
        self.write_backup_file()?;
        Ok(())
    }

    /// Verify the managed layout and repair it non-destructively
    ///
    /// Home and source must be directories. A missing target or internal
    /// directory is flagged and recreated; recreating the internal
    /// directory also rewrites the recovery file, as does a missing
    /// recovery file on its own.
    pub fn check_and_restore_layout(&self) -> Result<()> {
        if !self.home_path.is_dir() {
            return Err(CopySnapError::integrity(format!(
                "home path of context {} is not a directory: {:?}",
                self.name, self.home_path
            )));
        }
        if !self.source_path.is_dir() {
            return Err(CopySnapError::integrity(format!(
                "source path of context {} is not a directory: {:?}",
                self.name, self.source_path
            )));
        }
        let target = self.target_path();
        if !target.is_dir() {
            warn!(
                "target path of context {} is invalid, recreating {:?}",
                self.name, target
            );
            fs::create_dir(&target).map_err(|e| {
                CopySnapError::integrity(format!(
                    "could not restore target location {target:?}: {e}"
                ))
            })?;
        }
        let internal = self.internal_path();
        if !internal.is_dir() {
            warn!(
                "internal path of context {} is invalid, recreating {:?}",
                self.name, internal
            );
            fs::create_dir(&internal)
                .and_then(|()| self.write_backup_file())
                .map_err(|e| {
                    CopySnapError::integrity(format!(
                        "could not restore internal location {internal:?}: {e}"
                    ))
                })?;
        } else if !self.backup_file_path().is_file() {
            warn!(
                "recovery file of context {} is missing, rewriting {:?}",
                self.name,
                self.backup_file_path()
            );
            self.write_backup_file().map_err(|e| {
                CopySnapError::integrity(format!(
                    "could not rewrite recovery file {:?}: {e}",
                    self.backup_file_path()
                ))
            })?;
        }
        Ok(())
    }

    fn write_backup_file(&self) -> io::Result<()> {
        let content = format!(
            "{SOURCE_KEY}{BACKUP_DELIMITER}{}\n",
            self.source_path.display()
        );
        crate::utils::atomic_write(&self.backup_file_path(), content.as_bytes())
    }

    // -------------------- accessors

    /// Context id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory this context backs up
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Root of this context's managed state
    pub fn home_path(&self) -> &Path {
        &self.home_path
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Completed runs, in recording order
    pub fn records(&self) -> &[SnapshotRecord] {
        &self.records
    }

    /// The most recent run by creation time
    pub fn latest_record(&self) -> Option<&SnapshotRecord> {
        self.records.iter().max_by_key(|record| record.created_at())
    }

    /// Listing row for this context
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            source_path: self.source_path.clone(),
            home_path: self.home_path.clone(),
            created_at: self.created_at,
            run_count: self.records.len(),
        }
    }
}

/// Derive the home directory name for a source path
///
/// `CopySnap-` plus the source name with spaces stripped and the first
/// letter upper-cased.
fn derive_home_dir_name(source_path: &Path) -> String {
    let normalized = source_path
        .file_name()
        .map(|n| n.to_string_lossy().replace(' ', ""))
        .unwrap_or_default();
    let mut chars = normalized.chars();
    let capitalised = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    format!("{HOME_DIR_PREFIX}-{capitalised}")
}

/// Parse the key=value recovery file of a home directory
fn read_backup_file(home_path: &Path) -> Result<HashMap<String, String>> {
    let path = home_path.join(INTERNAL_DIR_NAME).join(BACKUP_FILE_NAME);
    let content = fs::read_to_string(&path).map_err(|e| {
        CopySnapError::malformed_backup(format!("could not read {path:?}: {e}"))
    })?;
    let mut entries = HashMap::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        // values may contain the delimiter; split on the first one only
        let Some((key, value)) = line.split_once(BACKUP_DELIMITER) else {
            return Err(CopySnapError::malformed_backup(format!(
                "line without '{BACKUP_DELIMITER}': {line}"
            )));
        };
        entries.insert(key.to_string(), value.to_string());
    }
    Ok(entries)
}

/// Recover the creation moment encoded in a run-directory name
fn parse_run_dir_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let (seconds_part, subsec_part) = name.rsplit_once('-')?;
    let naive = NaiveDateTime::parse_from_str(seconds_part, "%Y-%m-%d-%H-%M-%S").ok()?;
    // the sub-second token counts hundreds of microseconds
    let subsec: i64 = subsec_part.parse().ok()?;
    Some(Utc.from_utc_datetime(&naive) + chrono::Duration::microseconds(subsec * 100))
}

/// Best-effort update of the store's last-used pointer
fn remember_last_used(store: &dyn SnapshotStore, id: &str) {
    if let Err(e) = store.set_last_used(Some(id)) {
        warn!("could not update last-used context pointer: {}", e);
    }
}
