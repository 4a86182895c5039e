//! Collaborator capability contracts.
//!
//! The core never touches disk, dialogs, or persisted configuration
//! directly; it consumes these object-safe traits. Hosts inject their own
//! implementations. `FsIo` (std::fs) and `MemoryPersistence` are provided
//! for embedding and testing.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::authority::FileDescriptor;
use crate::error::{Error, Result};
use crate::registry::WindowId;

/// Outcome of asking the user what to do with unsaved changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    Save,
    Discard,
    Cancel,
}

/// Opaque file read/write capability.
pub trait IoCapability: Send + Sync {
    /// Read the full content of a file. `NotFound` when it does not exist.
    fn read(&self, path: &Path) -> Result<String>;
    /// Persist the full content of a document.
    fn save(&self, descriptor: &FileDescriptor, content: &str) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

/// User-consent capability for closing modified documents.
pub trait ConsentCapability: Send + Sync {
    fn ask_save_changes(&self, path: &Path) -> SaveDecision;
}

/// Snapshot handed to the persistence layer: window id → serialized tree.
pub type TreeSnapshot = HashMap<WindowId, serde_json::Value>;

/// Persisted-configuration capability (load/store a JSON-like tree).
pub trait PersistenceCapability: Send + Sync {
    fn is_initialized(&self) -> bool;
    fn init(&self, snapshot: &TreeSnapshot);
    fn get(&self) -> TreeSnapshot;
    fn set(&self, snapshot: &TreeSnapshot);
}

/// File-system watch capability. Events arrive on a channel handed to the
/// service at spawn; this trait only manages the watched set.
pub trait WatchCapability: Send + Sync {
    fn watch(&self, path: &Path) -> Result<()>;
    fn unwatch(&self, path: &Path) -> Result<()>;
    fn watched_paths(&self) -> HashSet<PathBuf>;
}

/// An observed file-system event on a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Changed(path) | WatchEvent::Removed(path) => path,
        }
    }
}

/// Direct std::fs implementation of the I/O capability.
pub struct FsIo;

impl IoCapability for FsIo {
    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| Error::from_io(path, e))
    }

    fn save(&self, descriptor: &FileDescriptor, content: &str) -> Result<()> {
        fs::write(&descriptor.path, content).map_err(|e| Error::from_io(&descriptor.path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// In-memory persistence, for hosts that do their own serialization and for
/// tests.
#[derive(Default)]
pub struct MemoryPersistence {
    snapshot: Mutex<Option<TreeSnapshot>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceCapability for MemoryPersistence {
    fn is_initialized(&self) -> bool {
        self.snapshot.lock().unwrap().is_some()
    }

    fn init(&self, snapshot: &TreeSnapshot) {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
    }

    fn get(&self) -> TreeSnapshot {
        self.snapshot.lock().unwrap().clone().unwrap_or_default()
    }

    fn set(&self, snapshot: &TreeSnapshot) {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
    }
}
