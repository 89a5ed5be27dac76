//! Template registry: identity name → descriptor, persisted as one JSON blob.
//!
//! Readers take a shared snapshot (`Arc`) of the whole map; writers build a new
//! map and swap it in, so a matcher never observes a half-applied update.

use crate::features::HISTOGRAM_BINS;
use crate::types::Descriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tempfile::NamedTempFile;
use thiserror::Error;

/// On-disk format version. Bump when the descriptor layout changes.
pub const REGISTRY_FORMAT_VERSION: u32 = 1;

pub type Templates = BTreeMap<String, Descriptor>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("descriptor has {actual} bins, registry expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to write registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Versioned on-disk envelope.
#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    dimension: usize,
    templates: Templates,
}

/// What an `upsert` did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    /// The stored descriptor was already identical; nothing changed.
    Unchanged,
}

impl Upsert {
    /// Whether `name` was registered before the call.
    pub fn existed(self) -> bool {
        !matches!(self, Upsert::Inserted)
    }
}

/// Shared, lock-guarded identity registry bound to a file path.
pub struct TemplateRegistry {
    path: PathBuf,
    dimension: usize,
    templates: RwLock<Arc<Templates>>,
    // Serializes snapshot + write + rename so an older snapshot never lands last.
    save_lock: Mutex<()>,
}

impl TemplateRegistry {
    /// Open the registry at `path`, loading whatever usable data is there.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let templates = load(&path, HISTOGRAM_BINS);
        tracing::info!(path = %path.display(), identities = templates.len(), "template registry loaded");
        Self {
            path,
            dimension: HISTOGRAM_BINS,
            templates: RwLock::new(Arc::new(templates)),
            save_lock: Mutex::new(()),
        }
    }

    /// An empty registry that is only persisted when `save` is called.
    pub fn empty(path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            path: path.into(),
            dimension,
            templates: RwLock::new(Arc::new(Templates::new())),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current immutable view of every template.
    pub fn snapshot(&self) -> Arc<Templates> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Descriptor> {
        self.snapshot().get(name).cloned()
    }

    /// Insert or replace the descriptor for `name`.
    ///
    pub fn upsert(&self, name: &str, descriptor: Descriptor) -> Result<Upsert, RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if descriptor.len() != self.dimension {
            return Err(RegistryError::DimensionMismatch {
                expected: self.dimension,
                actual: descriptor.len(),
            });
        }

        let mut guard = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        if guard.get(name) == Some(&descriptor) {
            tracing::debug!(name, "template unchanged");
            return Ok(Upsert::Unchanged);
        }
        let mut next = Templates::clone(&guard);
        let outcome = match next.insert(name.to_string(), descriptor) {
            Some(_) => Upsert::Replaced,
            None => Upsert::Inserted,
        };
        *guard = Arc::new(next);

        tracing::debug!(name, ?outcome, "template upserted");
        Ok(outcome)
    }

    /// Remove `name`, returning whether it was registered.
    pub fn remove(&self, name: &str) -> bool {
        let mut guard = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.contains_key(name) {
            return false;
        }
        let mut next = Templates::clone(&guard);
        next.remove(name);
        *guard = Arc::new(next);
        tracing::debug!(name, "template removed");
        true
    }

    /// Drop every template from memory. Call `save` to persist.
    pub fn clear(&self) -> usize {
        let mut guard = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        let count = guard.len();
        *guard = Arc::new(Templates::new());
        count
    }

    /// Persist the current snapshot.
    ///
    /// Writes to a uniquely named sibling temp file, syncs it, then renames over
    /// the target so a crash mid-write leaves the previous file intact. Concurrent
    /// saves are serialized and the snapshot is taken under the same lock.
    pub fn save(&self) -> Result<(), RegistryError> {
        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();
        let file = RegistryFile {
            version: REGISTRY_FORMAT_VERSION,
            dimension: self.dimension,
            templates: Templates::clone(&snapshot),
        };
        let bytes = serde_json::to_vec(&file)?;

        let io_err = |source| RegistryError::Io { path: self.path.clone(), source };

        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                std::fs::create_dir_all(parent).map_err(io_err)?;
                parent
            }
            None => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        tracing::info!(path = %self.path.display(), identities = snapshot.len(), "template registry saved");
        Ok(())
    }
}

/// Read a registry file.
///
/// A missing file is an empty registry. Unreadable, corrupt, wrong-version and
/// wrong-dimension files are logged and also treated as empty.
pub fn load(path: &Path, dimension: usize) -> Templates {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no template registry yet; starting empty");
            return Templates::new();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read template registry; starting empty");
            return Templates::new();
        }
    };

    let file: RegistryFile = match serde_json::from_slice(&bytes) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt template registry; starting empty");
            return Templates::new();
        }
    };

    if file.version != REGISTRY_FORMAT_VERSION {
        tracing::warn!(
            path = %path.display(),
            found = file.version,
            expected = REGISTRY_FORMAT_VERSION,
            "unsupported template registry version; starting empty"
        );
        return Templates::new();
    }

    let mismatched = file.templates.values().any(|d| d.len() != dimension);
    if file.dimension != dimension || mismatched {
        tracing::warn!(
            path = %path.display(),
            found = file.dimension,
            expected = dimension,
            "template registry descriptor dimension mismatch; starting empty"
        );
        return Templates::new();
    }

    file.templates
}
