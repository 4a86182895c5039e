//! Typed change events.
//!
//! Every state-changing request that succeeds emits exactly one event per
//! logical change on a broadcast channel owned by the window registry.
//! Subscribers hold explicit receiver handles and may rely on exactly-once
//! delivery per change, not on any particular batching.

use std::path::PathBuf;

use crate::registry::WindowId;
use crate::tree::NodeId;

/// A single observable state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A window was created (boot restore or explicit request)
    NewWindow { window: WindowId },
    /// A leaf was added to a window's layout tree
    NewLeaf { window: WindowId, leaf: NodeId },
    /// A leaf was removed (its last tab closed, or merged away by collapse)
    LeafClosed { window: WindowId, leaf: NodeId },
    /// A file was opened in a leaf
    OpenFile {
        window: WindowId,
        leaf: NodeId,
        path: PathBuf,
    },
    /// A file was closed in a leaf
    CloseFile {
        window: WindowId,
        leaf: NodeId,
        path: PathBuf,
    },
    /// The active tab of a leaf changed (None when the leaf emptied)
    ActiveFile {
        window: WindowId,
        leaf: NodeId,
        path: Option<PathBuf>,
    },
    /// The tab order of a leaf was rearranged
    FilesSorted { window: WindowId, leaf: NodeId },
    /// A document's modified flag flipped
    ChangeFileStatus { path: PathBuf, modified: bool },
    /// A document's content reached disk
    FileSaved { path: PathBuf },
    /// The backing file changed on disk while the in-memory copy had
    /// unsaved edits; the canonical text was left untouched
    FileRemotelyChanged { path: PathBuf },
}

impl Event {
    /// Path the event concerns, when it concerns one.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Event::OpenFile { path, .. }
            | Event::CloseFile { path, .. }
            | Event::ChangeFileStatus { path, .. }
            | Event::FileSaved { path }
            | Event::FileRemotelyChanged { path } => Some(path),
            Event::ActiveFile { path, .. } => path.as_ref(),
            _ => None,
        }
    }
}
