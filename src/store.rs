//! Persistence collaborator for context history
//!
//! The engine does not care how run history is stored durably; it only
//! needs the small [`SnapshotStore`] contract: upsert a context document,
//! load it by id, delete it, list what exists. Contexts embed their records,
//! so deleting a context cascades to its history by construction. The store
//! also remembers the id of the most recently used context so an embedding
//! application can reopen it.
//!
//! Two backends are provided: [`JsonStore`] persists one JSON document per
//! context under a base directory, [`MemoryStore`] keeps everything in
//! memory for tests. The orchestrator takes the store as an explicit
//! `&dyn SnapshotStore` handle; there is no global instance.

use crate::context::{ContextSummary, SnapshotContext};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

use crate::utils::atomic_write;

/// Result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a [`SnapshotStore`] backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure while reading or writing a document
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A document could not be serialized or parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An id is unusable as a storage key
    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

/// Durable storage contract consumed by the engine
///
/// Ids are opaque unique strings the engine generates itself; a store holds
/// at most one context per id and `save` upserts.
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace a context document
    fn save(&self, context: &SnapshotContext) -> StoreResult<()>;

    /// Load a context by id; `None` if unknown
    fn load(&self, id: &str) -> StoreResult<Option<SnapshotContext>>;

    /// Remove a context (and thereby its embedded records); unknown ids are
    /// not an error
    fn delete(&self, id: &str) -> StoreResult<()>;

    /// Summaries of all stored contexts
    fn list(&self) -> StoreResult<Vec<ContextSummary>>;

    /// Remember (or clear) the most recently used context id
    fn set_last_used(&self, id: Option<&str>) -> StoreResult<()>;

    /// The most recently used context id, if any
    fn last_used(&self) -> StoreResult<Option<String>>;
}

/// Pointer document for the last-used context
#[derive(Debug, Serialize, Deserialize)]
struct LastUsed {
    context_id: String,
}

/// JSON-file store: one document per context
///
/// Layout under the base directory:
///
/// ```text
/// <base>/contexts/<id>.json
/// <base>/latest.json
/// ```
///
/// Writes are atomic (temp file plus rename), so a crashed write leaves
/// the previous document intact.
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_path: PathBuf,
}

impl JsonStore {
    /// Store rooted at the given base directory (created lazily)
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn contexts_dir(&self) -> PathBuf {
        self.base_path.join("contexts")
    }

    fn context_path(&self, id: &str) -> StoreResult<PathBuf> {
        validate_key(id)?;
        Ok(self.contexts_dir().join(format!("{id}.json")))
    }

    fn last_used_path(&self) -> PathBuf {
        self.base_path.join("latest.json")
    }
}

/// Reject ids that would escape the store directory
fn validate_key(id: &str) -> StoreResult<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\\') {
        return Err(StoreError::InvalidKey(id.to_string()));
    }
    Ok(())
}

impl SnapshotStore for JsonStore {
    fn save(&self, context: &SnapshotContext) -> StoreResult<()> {
        let path = self.context_path(context.id())?;
        fs::create_dir_all(self.contexts_dir())?;
        let content = serde_json::to_vec_pretty(context)?;
        atomic_write(&path, &content)?;
        debug!("saved context {} to {:?}", context.id(), path);
        Ok(())
    }

    fn load(&self, id: &str) -> StoreResult<Option<SnapshotContext>> {
        let path = self.context_path(id)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        let path = self.context_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // a dangling last-used pointer would resolve to nothing
        if self.last_used()?.as_deref() == Some(id) {
            self.set_last_used(None)?;
        }
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<ContextSummary>> {
        let dir = self.contexts_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|content| Ok(serde_json::from_str::<SnapshotContext>(&content)?))
            {
                Ok(context) => summaries.push(context.summary()),
                Err(e) => warn!("skipping unreadable context document {:?}: {}", path, e),
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    fn set_last_used(&self, id: Option<&str>) -> StoreResult<()> {
        match id {
            Some(id) => {
                validate_key(id)?;
                fs::create_dir_all(&self.base_path)?;
                let content = serde_json::to_vec_pretty(&LastUsed {
                    context_id: id.to_string(),
                })?;
                atomic_write(&self.last_used_path(), &content)?;
            }
            None => match fs::remove_file(self.last_used_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    fn last_used(&self) -> StoreResult<Option<String>> {
        match fs::read_to_string(self.last_used_path()) {
            Ok(content) => {
                let pointer: LastUsed = serde_json::from_str(&content)?;
                Ok(Some(pointer.context_id))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    contexts: RwLock<HashMap<String, SnapshotContext>>,
    last_used: RwLock<Option<String>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, context: &SnapshotContext) -> StoreResult<()> {
        self.contexts
            .write()
            .insert(context.id().to_string(), context.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> StoreResult<Option<SnapshotContext>> {
        Ok(self.contexts.read().get(id).cloned())
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        self.contexts.write().remove(id);
        let mut last_used = self.last_used.write();
        if last_used.as_deref() == Some(id) {
            *last_used = None;
        }
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<ContextSummary>> {
        let mut summaries: Vec<ContextSummary> = self
            .contexts
            .read()
            .values()
            .map(SnapshotContext::summary)
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    fn set_last_used(&self, id: Option<&str>) -> StoreResult<()> {
        *self.last_used.write() = id.map(str::to_string);
        Ok(())
    }

    fn last_used(&self) -> StoreResult<Option<String>> {
        Ok(self.last_used.read().clone())
    }
}
