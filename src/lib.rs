//! docpane - open-document and pane management for a desktop editor.
//!
//! Keeps four pieces of mutable state consistent: the per-window layout
//! tree of resizable panes, each pane's tab strip, the authoritative
//! versioned text shared by every pane showing the same file, and a
//! file-system watch set tracking exactly the open files.
//!
//! All mutations run on one owner task. Hosts talk to it through a
//! [`service::ServiceHandle`] and observe changes on a broadcast channel of
//! [`events::Event`]. Disk access, consent dialogs, persisted layout and
//! file watching are injected via the traits in [`capability`].

pub mod authority;
pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod registry;
pub mod service;
pub mod tree;
pub mod watchfs;

pub use authority::{DocumentKind, Edit, Update, VersionedUpdate};
pub use capability::{
    ConsentCapability, FsIo, IoCapability, PersistenceCapability, SaveDecision, WatchCapability,
    WatchEvent,
};
pub use config::Config;
pub use error::{Error, Result};
pub use events::Event;
pub use registry::WindowId;
pub use service::{DocumentService, ServiceHandle};
pub use tree::{Direction, Insertion, LayoutTree, NodeId, OpenOutcome, TabManager};
pub use watchfs::FsWatcher;
