//! notify-backed file watcher.
//!
//! One RecommendedWatcher for all open files, each watched non-recursively.
//! The notify callback runs on the watcher's own thread and bridges into the
//! owner task's channel with `blocking_send`; modify/create map to Changed
//! (editors that save via rename-replace report Create on the watched path),
//! remove maps to Removed, everything else is dropped here.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::capability::{WatchCapability, WatchEvent};
use crate::error::{Error, Result};

pub struct FsWatcher {
    watcher: Mutex<RecommendedWatcher>,
    watched: Mutex<HashSet<PathBuf>>,
}

impl FsWatcher {
    /// Build a watcher delivering events into `events`. The receiving half
    /// belongs to the document service.
    pub fn new(events: mpsc::Sender<WatchEvent>) -> Result<Self> {
        let watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(%err, "file watcher error");
                        return;
                    }
                };
                for path in event.paths {
                    let mapped = match &event.kind {
                        EventKind::Remove(_) => WatchEvent::Removed(path),
                        EventKind::Modify(_) | EventKind::Create(_) => WatchEvent::Changed(path),
                        _ => continue,
                    };
                    if events.blocking_send(mapped).is_err() {
                        // Service shut down; nothing left to deliver to
                        return;
                    }
                }
            },
        )
        .map_err(watch_error)?;
        Ok(Self {
            watcher: Mutex::new(watcher),
            watched: Mutex::new(HashSet::new()),
        })
    }
}

impl WatchCapability for FsWatcher {
    fn watch(&self, path: &Path) -> Result<()> {
        let mut watched = self.watched.lock().unwrap();
        if watched.contains(path) {
            return Ok(());
        }
        self.watcher
            .lock()
            .unwrap()
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(watch_error)?;
        watched.insert(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&self, path: &Path) -> Result<()> {
        let mut watched = self.watched.lock().unwrap();
        if !watched.remove(path) {
            return Ok(());
        }
        self.watcher
            .lock()
            .unwrap()
            .unwatch(path)
            .map_err(watch_error)
    }

    fn watched_paths(&self) -> HashSet<PathBuf> {
        self.watched.lock().unwrap().clone()
    }
}

fn watch_error(err: notify::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[test]
    fn test_watch_set_bookkeeping() {
        let (tx, _rx) = mpsc::channel(16);
        let watcher = FsWatcher::new(tx).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.md");
        fs::write(&file, "x").unwrap();

        watcher.watch(&file).unwrap();
        // Re-watching the same path is a no-op, not an error
        watcher.watch(&file).unwrap();
        assert_eq!(watcher.watched_paths().len(), 1);

        watcher.unwatch(&file).unwrap();
        assert!(watcher.watched_paths().is_empty());
        // Unwatching an unwatched path is a no-op too
        watcher.unwatch(&file).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_external_write_is_observed() {
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = FsWatcher::new(tx).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.md");
        fs::write(&file, "before").unwrap();
        watcher.watch(&file).unwrap();

        fs::write(&file, "after").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report the write")
            .unwrap();
        assert_eq!(event.path(), file.as_path());
        assert!(matches!(event, WatchEvent::Changed(_)));
    }
}
