//! TabManager - ordered tab strip owned by a single leaf
//!
//! Paths are unique within one leaf; the same path may be open in any number
//! of other leaves. The back/forward history records previously active paths
//! (browser-style: the current position is part of the history, divergent
//! navigation truncates the forward entries).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Result of an open request on a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The path was appended and made active
    Opened,
    /// The path was already open; it was made active
    AlreadyOpen,
}

/// Ordered tab list with active pointer, pinned flags and bounded history.
#[derive(Debug, Clone)]
pub struct TabManager {
    /// Open paths in tab-strip order
    files: Vec<PathBuf>,
    /// Active path, if any (always a member of `files`)
    active: Option<PathBuf>,
    /// Pinned paths (exempt from implicit bulk close)
    pinned: HashSet<PathBuf>,
    /// Activation history; `cursor` indexes the current position
    history: Vec<PathBuf>,
    cursor: usize,
    history_limit: usize,
}

impl TabManager {
    pub fn new(history_limit: usize) -> Self {
        Self {
            files: Vec::new(),
            active: None,
            pinned: HashSet::new(),
            history: Vec::new(),
            cursor: 0,
            // A limit of 0 would underflow the cursor on the first
            // activation; one retained entry is the floor.
            history_limit: history_limit.max(1),
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn active(&self) -> Option<&Path> {
        self.active.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f == path)
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pinned.contains(path)
    }

    pub fn pinned_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.pinned.iter()
    }

    /// Open a path: append and activate, or just activate when already open.
    pub fn open_file(&mut self, path: &Path) -> OpenOutcome {
        if self.contains(path) {
            self.activate(path);
            return OpenOutcome::AlreadyOpen;
        }
        self.files.push(path.to_path_buf());
        self.activate(path);
        OpenOutcome::Opened
    }

    /// Make an already-open path active, recording the move in history.
    pub fn activate(&mut self, path: &Path) -> bool {
        if !self.contains(path) {
            return false;
        }
        if self.active.as_deref() == Some(path) {
            return true;
        }
        self.active = Some(path.to_path_buf());
        self.push_history(path);
        true
    }

    /// Close a path. Returns false when the path is not open. When the
    /// closed path was active, the right neighbor is activated, else the
    /// left, else none. Neighbor activation does not grow the history (all
    /// entries for the closed path are pruned instead).
    pub fn close_file(&mut self, path: &Path) -> bool {
        let Some(index) = self.files.iter().position(|f| f == path) else {
            return false;
        };
        self.files.remove(index);
        self.pinned.remove(path);
        self.prune_history(path);

        if self.active.as_deref() == Some(path) {
            self.active = self
                .files
                .get(index)
                .or_else(|| self.files.get(index.wrapping_sub(1)))
                .cloned();
        }
        true
    }

    /// Reorder tabs. The new order must be a permutation of the current
    /// path set; anything else is a no-op returning false.
    pub fn sort_open_files(&mut self, order: &[PathBuf]) -> bool {
        if order.len() != self.files.len() {
            return false;
        }
        let current: HashSet<&PathBuf> = self.files.iter().collect();
        let proposed: HashSet<&PathBuf> = order.iter().collect();
        // Paths are unique per leaf, so set equality at equal length is
        // multiset equality.
        if proposed.len() != order.len() || current != proposed {
            return false;
        }
        self.files = order.to_vec();
        true
    }

    /// Rename/move propagation: swap `old` for `new` preserving position,
    /// active and pinned status. Returns whether anything changed.
    pub fn replace_file_path(&mut self, old: &Path, new: &Path) -> bool {
        let Some(index) = self.files.iter().position(|f| f == old) else {
            return false;
        };
        if self.contains(new) {
            // Target already open in this leaf; the stale entry just goes.
            return self.close_file(old);
        }
        self.files[index] = new.to_path_buf();
        if self.active.as_deref() == Some(old) {
            self.active = Some(new.to_path_buf());
        }
        if self.pinned.remove(old) {
            self.pinned.insert(new.to_path_buf());
        }
        for entry in &mut self.history {
            if entry.as_path() == old {
                *entry = new.to_path_buf();
            }
        }
        true
    }

    /// Pin or unpin an open path. Returns false when the path is not open.
    pub fn set_pinned(&mut self, path: &Path, pinned: bool) -> bool {
        if !self.contains(path) {
            return false;
        }
        if pinned {
            self.pinned.insert(path.to_path_buf());
        } else {
            self.pinned.remove(path);
        }
        true
    }

    /// Step back through the history. Clamps at the start (no-op, not an
    /// error). Returns the newly activated path.
    pub fn back(&mut self) -> Option<PathBuf> {
        if self.cursor == 0 || self.history.is_empty() {
            return None;
        }
        self.cursor -= 1;
        let path = self.history[self.cursor].clone();
        self.active = Some(path.clone());
        Some(path)
    }

    /// Step forward through the history. Clamps at the end.
    pub fn forward(&mut self) -> Option<PathBuf> {
        if self.history.is_empty() || self.cursor + 1 >= self.history.len() {
            return None;
        }
        self.cursor += 1;
        let path = self.history[self.cursor].clone();
        self.active = Some(path.clone());
        Some(path)
    }

    /// Record an activation: truncate forward entries, append, bound.
    fn push_history(&mut self, path: &Path) {
        if self.cursor + 1 < self.history.len() {
            self.history.truncate(self.cursor + 1);
        }
        self.history.push(path.to_path_buf());
        while self.history.len() > self.history_limit {
            self.history.remove(0);
        }
        self.cursor = self.history.len() - 1;
    }

    /// Drop every history entry for a closed path so navigation can only
    /// land on files that are still open.
    fn prune_history(&mut self, path: &Path) {
        let mut index = 0;
        self.history.retain(|entry| {
            let keep = entry.as_path() != path;
            if !keep && index <= self.cursor && self.cursor > 0 {
                self.cursor -= 1;
            }
            index += 1;
            keep
        });
        if self.cursor >= self.history.len() && !self.history.is_empty() {
            self.cursor = self.history.len() - 1;
        }
    }
}
