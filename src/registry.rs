//! WindowRegistry - top-level window map and close/move/split orchestration.
//!
//! Owns one LayoutTree per window plus the broadcast channel every change
//! event goes out on. Close operations consult the consent capability for
//! uniquely-referenced modified documents; any save they trigger is returned
//! as a SaveJob for the caller to execute, never performed here.
//!
//! The last remaining window is never destroyed, only emptied, so a
//! persisted snapshot always has at least one window to restore.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::authority::{DocumentAuthority, SaveJob};
use crate::capability::{
    ConsentCapability, IoCapability, PersistenceCapability, SaveDecision, TreeSnapshot,
};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::tree::{Direction, Insertion, LayoutTree, NodeId, OpenOutcome};

/// Opaque window identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(String);

impl WindowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WindowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Window map, creation order, and the change-event channel.
pub struct WindowRegistry {
    windows: Vec<(WindowId, LayoutTree)>,
    next_window: u64,
    history_limit: usize,
    events: broadcast::Sender<Event>,
}

impl WindowRegistry {
    /// A registry with one fresh window.
    pub fn new(history_limit: usize) -> Self {
        let mut registry = Self::empty(history_limit);
        registry.new_window();
        registry
    }

    fn empty(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            windows: Vec::new(),
            next_window: 1,
            history_limit,
            events,
        }
    }

    /// Restore windows from the persistence capability. Malformed trees drop
    /// their window with a warning; tabs whose backing file vanished while
    /// the app was closed are pruned. Neither is fatal. A first run (or a
    /// snapshot with no usable window) yields one fresh window.
    pub fn restore(
        history_limit: usize,
        persistence: &dyn PersistenceCapability,
        io: &dyn IoCapability,
    ) -> Self {
        let mut registry = Self::empty(history_limit);
        if persistence.is_initialized() {
            let snapshot = persistence.get();
            let mut ids: Vec<&WindowId> = snapshot.keys().collect();
            ids.sort();
            for id in ids {
                match LayoutTree::deserialize(&snapshot[id], history_limit) {
                    Ok(mut tree) => {
                        prune_vanished(&mut tree, io);
                        registry.windows.push((id.clone(), tree));
                        registry.emit(Event::NewWindow { window: id.clone() });
                    }
                    Err(err) => {
                        warn!(window = %id, %err, "dropping window with malformed layout");
                    }
                }
            }
        }
        if registry.windows.is_empty() {
            registry.new_window();
        }
        if !persistence.is_initialized() {
            persistence.init(&registry.snapshot());
        }
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<Event> {
        self.events.clone()
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn tree(&self, window: &WindowId) -> Result<&LayoutTree> {
        self.windows
            .iter()
            .find(|(id, _)| id == window)
            .map(|(_, tree)| tree)
            .ok_or_else(|| Error::WindowNotFound(window.to_string()))
    }

    fn tree_mut(&mut self, window: &WindowId) -> Result<&mut LayoutTree> {
        self.windows
            .iter_mut()
            .find(|(id, _)| id == window)
            .map(|(_, tree)| tree)
            .ok_or_else(|| Error::WindowNotFound(window.to_string()))
    }

    /// Serialized layout of one window, the retrieve-tab-config payload.
    pub fn tab_config(&self, window: &WindowId) -> Result<serde_json::Value> {
        Ok(self.tree(window)?.serialize())
    }

    /// Full snapshot for the persistence capability.
    pub fn snapshot(&self) -> TreeSnapshot {
        self.windows
            .iter()
            .map(|(id, tree)| (id.clone(), tree.serialize()))
            .collect()
    }

    /// Union of open paths across every window, the required watch set.
    pub fn open_paths(&self) -> HashSet<PathBuf> {
        self.windows
            .iter()
            .flat_map(|(_, tree)| tree.open_paths())
            .collect()
    }

    /// Leaves anywhere that reference `path`.
    fn reference_count(&self, path: &Path) -> usize {
        self.windows
            .iter()
            .map(|(_, tree)| tree.leaves_with(path).len())
            .sum()
    }

    pub fn new_window(&mut self) -> WindowId {
        let id = loop {
            let candidate = WindowId(format!("window-{}", self.next_window));
            self.next_window += 1;
            if !self.windows.iter().any(|(id, _)| *id == candidate) {
                break candidate;
            }
        };
        self.windows
            .push((id.clone(), LayoutTree::new(self.history_limit)));
        self.emit(Event::NewWindow { window: id.clone() });
        id
    }

    /// Close a window. Uniquely-referenced modified documents go through the
    /// consent flow first; Cancel aborts with no mutation. The last window is
    /// emptied instead of destroyed.
    pub fn close_window(
        &mut self,
        window: &WindowId,
        authority: &mut DocumentAuthority,
        consent: &dyn ConsentCapability,
    ) -> Result<Vec<SaveJob>> {
        let doomed: Vec<PathBuf> = self
            .tree(window)?
            .open_paths()
            .into_iter()
            .filter(|path| {
                // Referenced by this window only
                self.reference_count(path)
                    == self
                        .tree(window)
                        .map(|t| t.leaves_with(path).len())
                        .unwrap_or(0)
            })
            .collect();

        // Decide everything before mutating anything so Cancel is a true abort
        let mut to_save = Vec::new();
        let mut to_discard = Vec::new();
        for path in &doomed {
            if authority.is_modified(path) {
                match consent.ask_save_changes(path) {
                    SaveDecision::Save => to_save.push(path.clone()),
                    SaveDecision::Discard => to_discard.push(path.clone()),
                    SaveDecision::Cancel => return Err(Error::Cancelled),
                }
            }
        }

        let mut jobs = Vec::new();
        for path in to_save {
            if let Some(job) = authority.begin_save(&path)? {
                jobs.push(job);
            }
        }
        for path in to_discard {
            authority.discard_changes(&path)?;
            self.emit(Event::ChangeFileStatus {
                path,
                modified: false,
            });
        }

        if self.windows.len() == 1 {
            info!(window = %window, "last window emptied instead of destroyed");
            *self.tree_mut(window)? = LayoutTree::new(self.history_limit);
        } else {
            self.windows.retain(|(id, _)| id != window);
        }
        Ok(jobs)
    }

    /// Open (or re-activate) a path in a leaf.
    pub fn open_file(&mut self, window: &WindowId, leaf: NodeId, path: &Path) -> Result<OpenOutcome> {
        let tree = self.tree_mut(window)?;
        let tabs = tree.tabs_mut(leaf).ok_or(Error::NodeNotFound(leaf))?;
        let outcome = tabs.open_file(path);
        if outcome == OpenOutcome::Opened {
            self.emit(Event::OpenFile {
                window: window.clone(),
                leaf,
                path: path.to_path_buf(),
            });
        }
        // A no-op open is still an activation
        self.emit(Event::ActiveFile {
            window: window.clone(),
            leaf,
            path: Some(path.to_path_buf()),
        });
        Ok(outcome)
    }

    /// Close one tab. When this leaf is the only reference anywhere and the
    /// document is modified, the consent capability decides: Save returns a
    /// job for the caller to execute, Discard clears the modified flag,
    /// Cancel aborts with no mutation. Shared documents close unprompted.
    pub fn close_file(
        &mut self,
        window: &WindowId,
        leaf: NodeId,
        path: &Path,
        authority: &mut DocumentAuthority,
        consent: &dyn ConsentCapability,
    ) -> Result<Option<SaveJob>> {
        let tabs = self
            .tree(window)?
            .tabs(leaf)
            .ok_or(Error::NodeNotFound(leaf))?;
        if !tabs.contains(path) {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let mut job = None;
        if self.reference_count(path) == 1 && authority.is_modified(path) {
            match consent.ask_save_changes(path) {
                SaveDecision::Save => job = authority.begin_save(path)?,
                SaveDecision::Discard => {
                    authority.discard_changes(path)?;
                    self.emit(Event::ChangeFileStatus {
                        path: path.to_path_buf(),
                        modified: false,
                    });
                }
                SaveDecision::Cancel => return Err(Error::Cancelled),
            }
        }
        self.close_tab(window, leaf, path);
        Ok(job)
    }

    /// Remove a tab without consent checks, then collapse the leaf when it
    /// emptied (a lone root leaf stays as an empty pane).
    fn close_tab(&mut self, window: &WindowId, leaf: NodeId, path: &Path) {
        let mut pending = Vec::new();
        {
            let Ok(tree) = self.tree_mut(window) else {
                return;
            };
            let Some(tabs) = tree.tabs_mut(leaf) else {
                return;
            };
            let was_active = tabs.active() == Some(path);
            if !tabs.close_file(path) {
                return;
            }
            pending.push(Event::CloseFile {
                window: window.clone(),
                leaf,
                path: path.to_path_buf(),
            });

            let emptied = tree.tabs(leaf).map(|t| t.is_empty()).unwrap_or(false);
            if emptied && tree.leaf_ids().len() > 1 {
                if tree.remove_node(leaf).is_ok() {
                    pending.push(Event::LeafClosed {
                        window: window.clone(),
                        leaf,
                    });
                }
            } else if was_active {
                let active = tree
                    .tabs(leaf)
                    .and_then(|t| t.active())
                    .map(Path::to_path_buf);
                pending.push(Event::ActiveFile {
                    window: window.clone(),
                    leaf,
                    path: active,
                });
            }
        }
        for event in pending {
            self.emit(event);
        }
    }

    /// Force-close a path in every leaf of every window, clearing pinned
    /// status first. Used when the backing file is deleted externally.
    /// Never prompts.
    pub fn close_file_everywhere(&mut self, path: &Path) {
        let targets: Vec<(WindowId, NodeId)> = self
            .windows
            .iter()
            .flat_map(|(id, tree)| {
                tree.leaves_with(path)
                    .into_iter()
                    .map(|leaf| (id.clone(), leaf))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (window, leaf) in targets {
            if let Ok(tree) = self.tree_mut(&window) {
                if let Some(tabs) = tree.tabs_mut(leaf) {
                    tabs.set_pinned(path, false);
                }
            }
            self.close_tab(&window, leaf, path);
        }
    }

    /// Close every unpinned tab of a leaf, then the leaf itself when it
    /// emptied. Pinned tabs are exempt from this bulk close and keep the
    /// leaf alive. Consent runs for every uniquely-referenced modified file
    /// before anything mutates; one Cancel aborts the whole operation.
    pub fn close_leaf(
        &mut self,
        window: &WindowId,
        leaf: NodeId,
        authority: &mut DocumentAuthority,
        consent: &dyn ConsentCapability,
    ) -> Result<Vec<SaveJob>> {
        let tabs = self
            .tree(window)?
            .tabs(leaf)
            .ok_or(Error::NodeNotFound(leaf))?;
        let closing: Vec<PathBuf> = tabs
            .files()
            .iter()
            .filter(|path| !tabs.is_pinned(path))
            .cloned()
            .collect();

        let mut to_save = Vec::new();
        let mut to_discard = Vec::new();
        for path in &closing {
            if self.reference_count(path) == 1 && authority.is_modified(path) {
                match consent.ask_save_changes(path) {
                    SaveDecision::Save => to_save.push(path.clone()),
                    SaveDecision::Discard => to_discard.push(path.clone()),
                    SaveDecision::Cancel => return Err(Error::Cancelled),
                }
            }
        }

        let mut jobs = Vec::new();
        for path in to_save {
            if let Some(job) = authority.begin_save(&path)? {
                jobs.push(job);
            }
        }
        for path in to_discard {
            authority.discard_changes(&path)?;
            self.emit(Event::ChangeFileStatus {
                path,
                modified: false,
            });
        }
        for path in closing {
            self.close_tab(window, leaf, &path);
        }
        Ok(jobs)
    }

    /// Relocate a tab: open at the target, then close the origin tab (which
    /// removes the origin leaf when that was its only tab).
    pub fn move_file(
        &mut self,
        from: (&WindowId, NodeId),
        to: (&WindowId, NodeId),
        path: &Path,
    ) -> Result<()> {
        let origin = self
            .tree(from.0)?
            .tabs(from.1)
            .ok_or(Error::NodeNotFound(from.1))?;
        if !origin.contains(path) {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        if from.0 == to.0 && from.1 == to.1 {
            return Ok(());
        }
        self.open_file(to.0, to.1, path)?;
        self.close_tab(from.0, from.1, path);
        Ok(())
    }

    /// Split a leaf, optionally relocating one of its tabs into the new
    /// pane. Returns the new leaf id.
    pub fn split_leaf(
        &mut self,
        window: &WindowId,
        leaf: NodeId,
        direction: Direction,
        insertion: Insertion,
        relocate: Option<&Path>,
    ) -> Result<NodeId> {
        let new_leaf = self.tree_mut(window)?.split(leaf, direction, insertion)?;
        self.emit(Event::NewLeaf {
            window: window.clone(),
            leaf: new_leaf,
        });
        if let Some(path) = relocate {
            self.move_file((window, leaf), (window, new_leaf), path)?;
        }
        Ok(new_leaf)
    }

    /// Reorder a leaf's tabs. False (and no event) when the proposed order
    /// is not a permutation of the current set.
    pub fn sort_open_files(
        &mut self,
        window: &WindowId,
        leaf: NodeId,
        order: &[PathBuf],
    ) -> Result<bool> {
        let tree = self.tree_mut(window)?;
        let tabs = tree.tabs_mut(leaf).ok_or(Error::NodeNotFound(leaf))?;
        let sorted = tabs.sort_open_files(order);
        if sorted {
            self.emit(Event::FilesSorted {
                window: window.clone(),
                leaf,
            });
        }
        Ok(sorted)
    }

    pub fn set_pinned(
        &mut self,
        window: &WindowId,
        leaf: NodeId,
        path: &Path,
        pinned: bool,
    ) -> Result<bool> {
        let tree = self.tree_mut(window)?;
        let tabs = tree.tabs_mut(leaf).ok_or(Error::NodeNotFound(leaf))?;
        Ok(tabs.set_pinned(path, pinned))
    }

    pub fn set_branch_sizes(
        &mut self,
        window: &WindowId,
        node: NodeId,
        sizes: &[f64],
    ) -> Result<()> {
        self.tree_mut(window)?.set_branch_sizes(node, sizes)
    }

    pub fn navigate_back(&mut self, window: &WindowId, leaf: NodeId) -> Result<Option<PathBuf>> {
        self.navigate(window, leaf, true)
    }

    pub fn navigate_forward(&mut self, window: &WindowId, leaf: NodeId) -> Result<Option<PathBuf>> {
        self.navigate(window, leaf, false)
    }

    fn navigate(&mut self, window: &WindowId, leaf: NodeId, back: bool) -> Result<Option<PathBuf>> {
        let tree = self.tree_mut(window)?;
        let tabs = tree.tabs_mut(leaf).ok_or(Error::NodeNotFound(leaf))?;
        let moved = if back { tabs.back() } else { tabs.forward() };
        if let Some(path) = &moved {
            self.emit(Event::ActiveFile {
                window: window.clone(),
                leaf,
                path: Some(path.clone()),
            });
        }
        Ok(moved)
    }

    /// File rename propagation: rewrite the authority descriptor and every
    /// tab referencing the old path, preserving position, active and pinned
    /// status.
    pub fn has_moved_file(&mut self, old: &Path, new: &Path, authority: &mut DocumentAuthority) {
        authority.rename_file(old, new);
        for (_, tree) in &mut self.windows {
            for leaf in tree.leaf_ids() {
                if let Some(tabs) = tree.tabs_mut(leaf) {
                    tabs.replace_file_path(old, new);
                }
            }
        }
    }

    /// Directory rename propagation: fans out to every tab and tracked
    /// document whose path is prefixed by the old directory.
    pub fn has_moved_dir(&mut self, old_dir: &Path, new_dir: &Path, authority: &mut DocumentAuthority) {
        authority.rename_dir(old_dir, new_dir);
        for (_, tree) in &mut self.windows {
            for leaf in tree.leaf_ids() {
                let moves: Vec<(PathBuf, PathBuf)> = tree
                    .tabs(leaf)
                    .map(|tabs| {
                        tabs.files()
                            .iter()
                            .filter_map(|path| {
                                path.strip_prefix(old_dir)
                                    .ok()
                                    .map(|rest| (path.clone(), new_dir.join(rest)))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if let Some(tabs) = tree.tabs_mut(leaf) {
                    for (old, new) in moves {
                        tabs.replace_file_path(&old, &new);
                    }
                }
            }
        }
    }
}

/// Drop restored tabs whose backing file vanished while the app was closed.
fn prune_vanished(tree: &mut LayoutTree, io: &dyn IoCapability) {
    for leaf in tree.leaf_ids() {
        let vanished: Vec<PathBuf> = tree
            .tabs(leaf)
            .map(|tabs| {
                tabs.files()
                    .iter()
                    .filter(|path| !io.exists(path))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for path in vanished {
            info!(path = %path.display(), "pruning tab for vanished file");
            if let Some(tabs) = tree.tabs_mut(leaf) {
                tabs.close_file(&path);
            }
        }
    }

    // Leaves emptied by pruning obey the same collapse rule as an explicit
    // close; only a sole leaf survives empty.
    let emptied: Vec<NodeId> = tree
        .leaf_ids()
        .into_iter()
        .filter(|&leaf| tree.tabs(leaf).map(|t| t.is_empty()).unwrap_or(false))
        .collect();
    for leaf in emptied {
        if tree.leaf_ids().len() > 1 {
            let _ = tree.remove_node(leaf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MemoryPersistence;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapIo {
        files: Mutex<HashMap<PathBuf, String>>,
    }

    impl MapIo {
        fn with(files: &[(&str, &str)]) -> Self {
            Self {
                files: Mutex::new(
                    files
                        .iter()
                        .map(|(p, c)| (PathBuf::from(p), c.to_string()))
                        .collect(),
                ),
            }
        }
    }

    impl IoCapability for MapIo {
        fn read(&self, path: &Path) -> Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::NotFound(path.to_path_buf()))
        }

        fn save(&self, descriptor: &crate::authority::FileDescriptor, content: &str) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(descriptor.path.clone(), content.to_string());
            Ok(())
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.lock().unwrap().contains_key(path)
        }
    }

    /// Pops scripted decisions front-first and records every prompt.
    struct ScriptedConsent {
        decisions: Mutex<Vec<SaveDecision>>,
        asked: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedConsent {
        fn with(decisions: &[SaveDecision]) -> Self {
            Self {
                decisions: Mutex::new(decisions.to_vec()),
                asked: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> usize {
            self.asked.lock().unwrap().len()
        }
    }

    impl ConsentCapability for ScriptedConsent {
        fn ask_save_changes(&self, path: &Path) -> SaveDecision {
            self.asked.lock().unwrap().push(path.to_path_buf());
            let mut decisions = self.decisions.lock().unwrap();
            if decisions.is_empty() {
                SaveDecision::Cancel
            } else {
                decisions.remove(0)
            }
        }
    }

    fn p(name: &str) -> PathBuf {
        PathBuf::from(format!("/notes/{name}"))
    }

    fn modified_doc(authority: &mut DocumentAuthority, io: &MapIo, path: &Path) {
        authority.get_document(path, io).unwrap();
        authority
            .push_updates(
                path,
                0,
                vec![crate::authority::Update {
                    edits: vec![crate::authority::Edit {
                        from: 0,
                        to: 0,
                        insert: "x".into(),
                    }],
                }],
            )
            .unwrap();
    }

    fn first_leaf(registry: &WindowRegistry, window: &WindowId) -> NodeId {
        registry.tree(window).unwrap().first_leaf()
    }

    #[test]
    fn test_close_modified_with_discard_clears_flag_and_removes_leaf() {
        let io = MapIo::with(&[("/notes/a.md", ""), ("/notes/b.md", "")]);
        let mut authority = DocumentAuthority::new(500);
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("b.md")).unwrap();
        let split = registry
            .split_leaf(&window, leaf, Direction::Horizontal, Insertion::After, None)
            .unwrap();
        registry.open_file(&window, split, &p("a.md")).unwrap();
        modified_doc(&mut authority, &io, &p("a.md"));

        let consent = ScriptedConsent::with(&[SaveDecision::Discard]);
        let job = registry
            .close_file(&window, split, &p("a.md"), &mut authority, &consent)
            .unwrap();
        assert!(job.is_none());
        assert_eq!(consent.prompts(), 1);
        assert!(!authority.is_modified(&p("a.md")));
        // The emptied leaf is gone
        assert_eq!(registry.tree(&window).unwrap().leaf_ids(), vec![leaf]);
    }

    #[test]
    fn test_close_modified_with_cancel_aborts_without_mutation() {
        let io = MapIo::with(&[("/notes/a.md", "")]);
        let mut authority = DocumentAuthority::new(500);
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        modified_doc(&mut authority, &io, &p("a.md"));

        let consent = ScriptedConsent::with(&[SaveDecision::Cancel]);
        let err = registry
            .close_file(&window, leaf, &p("a.md"), &mut authority, &consent)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(registry.tree(&window).unwrap().tabs(leaf).unwrap().contains(&p("a.md")));
        assert!(authority.is_modified(&p("a.md")));
    }

    #[test]
    fn test_close_modified_with_save_returns_job() {
        let io = MapIo::with(&[("/notes/a.md", "")]);
        let mut authority = DocumentAuthority::new(500);
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        modified_doc(&mut authority, &io, &p("a.md"));

        let consent = ScriptedConsent::with(&[SaveDecision::Save]);
        let job = registry
            .close_file(&window, leaf, &p("a.md"), &mut authority, &consent)
            .unwrap()
            .expect("save job for the caller");
        assert_eq!(job.content, "x");
        assert!(!registry.tree(&window).unwrap().tabs(leaf).unwrap().contains(&p("a.md")));
    }

    #[test]
    fn test_close_shared_document_never_prompts() {
        let io = MapIo::with(&[("/notes/a.md", "")]);
        let mut authority = DocumentAuthority::new(500);
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        let split = registry
            .split_leaf(&window, leaf, Direction::Horizontal, Insertion::After, None)
            .unwrap();
        registry.open_file(&window, split, &p("a.md")).unwrap();
        modified_doc(&mut authority, &io, &p("a.md"));

        let consent = ScriptedConsent::with(&[]);
        registry
            .close_file(&window, split, &p("a.md"), &mut authority, &consent)
            .unwrap();
        assert_eq!(consent.prompts(), 0);
        // Content survives in the other leaf, still modified
        assert!(authority.is_modified(&p("a.md")));
        assert!(registry.tree(&window).unwrap().tabs(leaf).unwrap().contains(&p("a.md")));
    }

    #[test]
    fn test_close_file_everywhere_clears_pins_across_windows_unprompted() {
        let mut registry = WindowRegistry::new(50);
        let first = registry.window_ids()[0].clone();
        let second = registry.new_window();
        let first_pane = first_leaf(&registry, &first);
        let second_pane = first_leaf(&registry, &second);
        registry.open_file(&first, first_pane, &p("a.md")).unwrap();
        registry.open_file(&first, first_pane, &p("keep.md")).unwrap();
        registry.open_file(&second, second_pane, &p("a.md")).unwrap();
        registry.set_pinned(&first, first_pane, &p("a.md"), true).unwrap();
        registry.set_pinned(&second, second_pane, &p("a.md"), true).unwrap();

        registry.close_file_everywhere(&p("a.md"));
        assert!(!registry.tree(&first).unwrap().tabs(first_pane).unwrap().contains(&p("a.md")));
        assert!(!registry
            .tree(&second)
            .unwrap()
            .tabs(second_pane)
            .unwrap()
            .contains(&p("a.md")));
        assert!(registry.open_paths().contains(&p("keep.md")));
    }

    #[test]
    fn test_move_file_removes_single_tab_origin_leaf() {
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        let target = registry
            .split_leaf(&window, leaf, Direction::Vertical, Insertion::After, None)
            .unwrap();
        registry.open_file(&window, target, &p("b.md")).unwrap();

        registry
            .move_file((&window, leaf), (&window, target), &p("a.md"))
            .unwrap();
        // Origin leaf had only a.md, so it is gone and the tree collapsed
        assert_eq!(registry.tree(&window).unwrap().leaf_ids(), vec![target]);
        let tabs = registry.tree(&window).unwrap().tabs(target).unwrap();
        assert!(tabs.contains(&p("a.md")) && tabs.contains(&p("b.md")));
    }

    #[test]
    fn test_split_leaf_with_relocation() {
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        registry.open_file(&window, leaf, &p("b.md")).unwrap();

        let new_leaf = registry
            .split_leaf(
                &window,
                leaf,
                Direction::Horizontal,
                Insertion::After,
                Some(&p("b.md")),
            )
            .unwrap();
        let tree = registry.tree(&window).unwrap();
        assert_eq!(tree.tabs(leaf).unwrap().files(), &[p("a.md")]);
        assert_eq!(tree.tabs(new_leaf).unwrap().files(), &[p("b.md")]);
    }

    #[test]
    fn test_close_leaf_spares_pinned_tabs() {
        let mut authority = DocumentAuthority::new(500);
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        registry.open_file(&window, leaf, &p("b.md")).unwrap();
        registry.set_pinned(&window, leaf, &p("a.md"), true).unwrap();

        let consent = ScriptedConsent::with(&[]);
        registry
            .close_leaf(&window, leaf, &mut authority, &consent)
            .unwrap();
        let tabs = registry.tree(&window).unwrap().tabs(leaf).unwrap();
        assert_eq!(tabs.files(), &[p("a.md")]);
    }

    #[test]
    fn test_last_window_emptied_not_destroyed() {
        let mut authority = DocumentAuthority::new(500);
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();

        let consent = ScriptedConsent::with(&[]);
        registry
            .close_window(&window, &mut authority, &consent)
            .unwrap();
        assert_eq!(registry.window_ids(), vec![window.clone()]);
        assert!(registry.open_paths().is_empty());

        // With two windows, close really destroys
        let second = registry.new_window();
        registry
            .close_window(&window, &mut authority, &consent)
            .unwrap();
        assert_eq!(registry.window_ids(), vec![second]);
    }

    #[test]
    fn test_restore_round_trip_and_pruning() {
        let io = MapIo::with(&[("/notes/a.md", ""), ("/notes/b.md", "")]);
        let persistence = MemoryPersistence::new();

        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        registry.open_file(&window, leaf, &p("b.md")).unwrap();
        registry.open_file(&window, leaf, &p("vanished.md")).unwrap();
        persistence.init(&registry.snapshot());

        let restored = WindowRegistry::restore(50, &persistence, &io);
        assert_eq!(restored.window_ids(), vec![window.clone()]);
        let tabs = restored
            .tree(&window)
            .unwrap()
            .tabs(restored.tree(&window).unwrap().first_leaf())
            .unwrap();
        // vanished.md was pruned at boot, the rest survived in order
        assert_eq!(tabs.files(), &[p("a.md"), p("b.md")]);
    }

    #[test]
    fn test_restore_collapses_leaf_emptied_by_pruning() {
        let io = MapIo::with(&[("/notes/a.md", "")]);
        let persistence = MemoryPersistence::new();

        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        let split = registry
            .split_leaf(&window, leaf, Direction::Horizontal, Insertion::After, None)
            .unwrap();
        registry.open_file(&window, split, &p("vanished.md")).unwrap();
        persistence.init(&registry.snapshot());

        // The second leaf's only file vanished while the app was closed;
        // the leaf must not be restored empty inside a branch
        let restored = WindowRegistry::restore(50, &persistence, &io);
        let tree = restored.tree(&window).unwrap();
        assert_eq!(tree.leaf_ids().len(), 1);
        assert!(!tree.is_branch(tree.root()));
        assert_eq!(tree.tabs(tree.first_leaf()).unwrap().files(), &[p("a.md")]);
    }

    #[test]
    fn test_restore_keeps_sole_leaf_when_everything_vanished() {
        let io = MapIo::with(&[]);
        let persistence = MemoryPersistence::new();

        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        registry.open_file(&window, leaf, &p("gone.md")).unwrap();
        persistence.init(&registry.snapshot());

        let restored = WindowRegistry::restore(50, &persistence, &io);
        let tree = restored.tree(&window).unwrap();
        assert_eq!(tree.leaf_ids().len(), 1);
        assert!(tree.tabs(tree.first_leaf()).unwrap().is_empty());
    }

    #[test]
    fn test_restore_drops_malformed_window_keeps_others() {
        let io = MapIo::with(&[("/notes/a.md", "")]);
        let persistence = MemoryPersistence::new();
        let mut snapshot = TreeSnapshot::new();
        snapshot.insert(
            WindowId::from("good"),
            serde_json::json!({"type": "leaf", "files": ["/notes/a.md"]}),
        );
        snapshot.insert(
            WindowId::from("bad"),
            serde_json::json!({"type": "grid"}),
        );
        persistence.init(&snapshot);

        let restored = WindowRegistry::restore(50, &persistence, &io);
        assert_eq!(restored.window_ids(), vec![WindowId::from("good")]);
    }

    #[test]
    fn test_restore_first_run_creates_fresh_window_and_initializes() {
        let io = MapIo::with(&[]);
        let persistence = MemoryPersistence::new();
        let restored = WindowRegistry::restore(50, &persistence, &io);
        assert_eq!(restored.window_ids().len(), 1);
        assert!(persistence.is_initialized());
        assert_eq!(persistence.get().len(), 1);
    }

    #[test]
    fn test_rename_propagation_across_windows() {
        let io = MapIo::with(&[("/notes/a.md", ""), ("/notes/sub/b.md", "")]);
        let mut authority = DocumentAuthority::new(500);
        let mut registry = WindowRegistry::new(50);
        let first = registry.window_ids()[0].clone();
        let second = registry.new_window();
        let first_pane = first_leaf(&registry, &first);
        let second_pane = first_leaf(&registry, &second);
        registry.open_file(&first, first_pane, &p("a.md")).unwrap();
        registry.open_file(&second, second_pane, &p("a.md")).unwrap();
        registry
            .open_file(&second, second_pane, &p("sub/b.md"))
            .unwrap();
        authority.get_document(&p("a.md"), &io).unwrap();
        authority.get_document(&p("sub/b.md"), &io).unwrap();

        registry.has_moved_file(&p("a.md"), &p("a2.md"), &mut authority);
        assert!(registry.tree(&first).unwrap().tabs(first_pane).unwrap().contains(&p("a2.md")));
        assert!(registry
            .tree(&second)
            .unwrap()
            .tabs(second_pane)
            .unwrap()
            .contains(&p("a2.md")));
        assert!(authority.is_open(&p("a2.md")));

        registry.has_moved_dir(Path::new("/notes"), Path::new("/moved"), &mut authority);
        assert!(registry
            .tree(&second)
            .unwrap()
            .tabs(second_pane)
            .unwrap()
            .contains(Path::new("/moved/sub/b.md")));
        assert!(authority.is_open(Path::new("/moved/sub/b.md")));
    }

    #[test]
    fn test_open_emits_open_and_activation_events() {
        let mut registry = WindowRegistry::new(50);
        let window = registry.window_ids()[0].clone();
        let leaf = first_leaf(&registry, &window);
        let mut rx = registry.subscribe();

        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::OpenFile {
                window: window.clone(),
                leaf,
                path: p("a.md")
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::ActiveFile {
                window: window.clone(),
                leaf,
                path: Some(p("a.md"))
            }
        );

        // Re-open is activation only
        registry.open_file(&window, leaf, &p("a.md")).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::ActiveFile {
                window,
                leaf,
                path: Some(p("a.md"))
            }
        );
    }
}
