//! WatchReconciler - keeps the OS watch set equal to the open-document set.
//!
//! The required set is derived state: after any structural change the caller
//! recomputes the union of open paths and hands it to `reconcile`, which
//! diffs against what is currently watched and issues only the missing
//! watch/unwatch calls. Running it twice in a row does nothing the second
//! time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::capability::WatchCapability;

/// Bridges the open-document set to a watch capability, with an ignore list
/// for changes this process caused itself.
pub struct WatchReconciler {
    watcher: Arc<dyn WatchCapability>,
    /// Paths whose next observed change is our own write, one entry per
    /// expected notification.
    ignore: Vec<PathBuf>,
}

impl WatchReconciler {
    pub fn new(watcher: Arc<dyn WatchCapability>) -> Self {
        Self {
            watcher,
            ignore: Vec::new(),
        }
    }

    /// Make the watched set equal to `required`. Idempotent; failures on
    /// individual paths are logged and skipped so one bad path cannot stall
    /// the rest of the set.
    pub fn reconcile(&mut self, required: &HashSet<PathBuf>) {
        let watched = self.watcher.watched_paths();
        for path in required.difference(&watched) {
            if let Err(err) = self.watcher.watch(path) {
                warn!(path = %path.display(), %err, "failed to watch file");
            } else {
                debug!(path = %path.display(), "watching file");
            }
        }
        for path in watched.difference(required) {
            if let Err(err) = self.watcher.unwatch(path) {
                warn!(path = %path.display(), %err, "failed to unwatch file");
            }
            self.ignore.retain(|p| p != path);
        }
    }

    /// Register an expected self-caused change (called before every write we
    /// issue to a watched file).
    pub fn ignore_next(&mut self, path: &Path) {
        self.ignore.push(path.to_path_buf());
    }

    /// True when the event should be swallowed as a self-caused change.
    /// Each registered entry absorbs exactly one event.
    pub fn should_ignore(&mut self, path: &Path) -> bool {
        if let Some(index) = self.ignore.iter().position(|p| p == path) {
            self.ignore.remove(index);
            return true;
        }
        false
    }
}
