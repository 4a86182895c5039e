//! DocumentService - the single owner task.
//!
//! All tree and authority mutations run on one tokio task fed by one request
//! queue, so invariants never observe interleaved partial mutations. The
//! handle is a cheap clone that turns method calls into queued requests with
//! oneshot replies.
//!
//! Three things re-enter the queue from outside: completed save writes,
//! expired long-poll waiters, and due autosaves. Watch events arrive on
//! their own channel and are handled in the same select loop, so they are
//! serialized with everything else.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::authority::{
    DocumentAuthority, DocumentKind, PullDisposition, PullReply, SaveJob, Update, VersionedUpdate,
};
use crate::capability::{
    ConsentCapability, IoCapability, PersistenceCapability, WatchCapability, WatchEvent,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::reconciler::WatchReconciler;
use crate::registry::{WindowId, WindowRegistry};
use crate::tree::{Direction, Insertion, NodeId, OpenOutcome};

const REQUEST_QUEUE_CAPACITY: usize = 64;

/// One request per exposed operation, each carrying its reply channel.
enum Request {
    OpenFile {
        window: WindowId,
        leaf: NodeId,
        path: PathBuf,
        reply: oneshot::Sender<Result<OpenOutcome>>,
    },
    CloseFile {
        window: WindowId,
        leaf: NodeId,
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    SaveFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    MoveFile {
        from_window: WindowId,
        from_leaf: NodeId,
        to_window: WindowId,
        to_leaf: NodeId,
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    SplitLeaf {
        window: WindowId,
        leaf: NodeId,
        direction: Direction,
        insertion: Insertion,
        relocate: Option<PathBuf>,
        reply: oneshot::Sender<Result<NodeId>>,
    },
    CloseLeaf {
        window: WindowId,
        leaf: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
    SortOpenFiles {
        window: WindowId,
        leaf: NodeId,
        order: Vec<PathBuf>,
        reply: oneshot::Sender<Result<bool>>,
    },
    SetPinned {
        window: WindowId,
        leaf: NodeId,
        path: PathBuf,
        pinned: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    SetBranchSizes {
        window: WindowId,
        node: NodeId,
        sizes: Vec<f64>,
        reply: oneshot::Sender<Result<()>>,
    },
    NavigateBack {
        window: WindowId,
        leaf: NodeId,
        reply: oneshot::Sender<Result<Option<PathBuf>>>,
    },
    NavigateForward {
        window: WindowId,
        leaf: NodeId,
        reply: oneshot::Sender<Result<Option<PathBuf>>>,
    },
    NewWindow {
        reply: oneshot::Sender<WindowId>,
    },
    CloseWindow {
        window: WindowId,
        reply: oneshot::Sender<Result<()>>,
    },
    GetDocument {
        path: PathBuf,
        reply: oneshot::Sender<Result<(String, u64, DocumentKind)>>,
    },
    PullUpdates {
        path: PathBuf,
        known_version: u64,
        reply: PullReply,
    },
    PushUpdates {
        path: PathBuf,
        base_version: u64,
        updates: Vec<Update>,
        reply: oneshot::Sender<Result<u64>>,
    },
    GetModifiedPaths {
        reply: oneshot::Sender<Vec<PathBuf>>,
    },
    TabConfig {
        window: WindowId,
        reply: oneshot::Sender<Result<serde_json::Value>>,
    },
    Windows {
        reply: oneshot::Sender<Vec<WindowId>>,
    },
    LeafIds {
        window: WindowId,
        reply: oneshot::Sender<Result<Vec<NodeId>>>,
    },
    HasMovedFile {
        old: PathBuf,
        new: PathBuf,
        reply: oneshot::Sender<()>,
    },
    HasMovedDir {
        old: PathBuf,
        new: PathBuf,
        reply: oneshot::Sender<()>,
    },
}

/// Messages the service sends itself from spawned helpers.
enum Internal {
    SaveFinished { path: PathBuf, result: Result<()> },
    PullExpired { path: PathBuf, waiter: u64 },
    AutosaveDue { path: PathBuf },
}

/// Spawns and owns nothing itself; `spawn` is the entry point.
pub struct DocumentService;

struct Service {
    config: Config,
    registry: WindowRegistry,
    authority: DocumentAuthority,
    reconciler: WatchReconciler,
    io: Arc<dyn IoCapability>,
    consent: Arc<dyn ConsentCapability>,
    persistence: Arc<dyn PersistenceCapability>,
    requests: mpsc::Receiver<Request>,
    internal_rx: mpsc::Receiver<Internal>,
    internal_tx: mpsc::Sender<Internal>,
    watch_events: mpsc::Receiver<WatchEvent>,
    autosave_pending: HashSet<PathBuf>,
}

/// Cloneable async front end of the owner task.
#[derive(Clone)]
pub struct ServiceHandle {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<Event>,
}

impl DocumentService {
    /// Restore persisted windows, reconcile the initial watch set, and
    /// start the owner task. `watch_events` is the receiving half of the
    /// channel the watch capability delivers into.
    pub fn spawn(
        config: Config,
        io: Arc<dyn IoCapability>,
        consent: Arc<dyn ConsentCapability>,
        persistence: Arc<dyn PersistenceCapability>,
        watcher: Arc<dyn WatchCapability>,
        watch_events: mpsc::Receiver<WatchEvent>,
    ) -> ServiceHandle {
        let registry =
            WindowRegistry::restore(config.history.limit, persistence.as_ref(), io.as_ref());
        let events = registry.event_sender();
        let authority = DocumentAuthority::new(config.protocol.update_retention);
        let mut reconciler = WatchReconciler::new(watcher);
        reconciler.reconcile(&registry.open_paths());

        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let service = Service {
            config,
            registry,
            authority,
            reconciler,
            io,
            consent,
            persistence,
            requests: request_rx,
            internal_rx,
            internal_tx,
            watch_events,
            autosave_pending: HashSet::new(),
        };
        tokio::spawn(service.run());
        ServiceHandle {
            requests: request_tx,
            events,
        }
    }
}

impl Service {
    async fn run(mut self) {
        debug!("document service started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
                Some(event) = self.watch_events.recv() => self.handle_watch(event),
            }
        }
        debug!("document service stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::OpenFile {
                window,
                leaf,
                path,
                reply,
            } => {
                let result = self.open_file(&window, leaf, &path);
                let _ = reply.send(result);
            }
            Request::CloseFile {
                window,
                leaf,
                path,
                reply,
            } => {
                let result = self.close_file(&window, leaf, &path);
                let _ = reply.send(result);
            }
            Request::SaveFile { path, reply } => {
                let _ = reply.send(self.start_save(&path));
            }
            Request::MoveFile {
                from_window,
                from_leaf,
                to_window,
                to_leaf,
                path,
                reply,
            } => {
                let result = self
                    .registry
                    .move_file((&from_window, from_leaf), (&to_window, to_leaf), &path)
                    .map(|()| self.sync_derived_state());
                let _ = reply.send(result);
            }
            Request::SplitLeaf {
                window,
                leaf,
                direction,
                insertion,
                relocate,
                reply,
            } => {
                let result = self
                    .registry
                    .split_leaf(&window, leaf, direction, insertion, relocate.as_deref())
                    .map(|new_leaf| {
                        self.sync_derived_state();
                        new_leaf
                    });
                let _ = reply.send(result);
            }
            Request::CloseLeaf {
                window,
                leaf,
                reply,
            } => {
                let result = self.close_leaf(&window, leaf);
                let _ = reply.send(result);
            }
            Request::SortOpenFiles {
                window,
                leaf,
                order,
                reply,
            } => {
                let result = self.registry.sort_open_files(&window, leaf, &order);
                // Tab order is part of the persisted snapshot
                if matches!(result, Ok(true)) {
                    self.persist();
                }
                let _ = reply.send(result);
            }
            Request::SetPinned {
                window,
                leaf,
                path,
                pinned,
                reply,
            } => {
                let result = self.registry.set_pinned(&window, leaf, &path, pinned);
                if matches!(result, Ok(true)) {
                    self.persist();
                }
                let _ = reply.send(result);
            }
            Request::SetBranchSizes {
                window,
                node,
                sizes,
                reply,
            } => {
                let result = self
                    .registry
                    .set_branch_sizes(&window, node, &sizes)
                    .map(|()| self.persist());
                let _ = reply.send(result);
            }
            Request::NavigateBack {
                window,
                leaf,
                reply,
            } => {
                let result = self.registry.navigate_back(&window, leaf);
                // The active tab is part of the persisted snapshot
                if matches!(result, Ok(Some(_))) {
                    self.persist();
                }
                let _ = reply.send(result);
            }
            Request::NavigateForward {
                window,
                leaf,
                reply,
            } => {
                let result = self.registry.navigate_forward(&window, leaf);
                if matches!(result, Ok(Some(_))) {
                    self.persist();
                }
                let _ = reply.send(result);
            }
            Request::NewWindow { reply } => {
                let window = self.registry.new_window();
                self.persist();
                let _ = reply.send(window);
            }
            Request::CloseWindow { window, reply } => {
                let result = self.close_window(&window);
                let _ = reply.send(result);
            }
            Request::GetDocument { path, reply } => {
                let _ = reply.send(self.authority.get_document(&path, self.io.as_ref()));
            }
            Request::PullUpdates {
                path,
                known_version,
                reply,
            } => self.pull_updates(path, known_version, reply),
            Request::PushUpdates {
                path,
                base_version,
                updates,
                reply,
            } => {
                let result = self.push_updates(&path, base_version, updates);
                let _ = reply.send(result);
            }
            Request::GetModifiedPaths { reply } => {
                let _ = reply.send(self.authority.modified_paths());
            }
            Request::TabConfig { window, reply } => {
                let _ = reply.send(self.registry.tab_config(&window));
            }
            Request::Windows { reply } => {
                let _ = reply.send(self.registry.window_ids());
            }
            Request::LeafIds { window, reply } => {
                let _ = reply.send(self.registry.tree(&window).map(|tree| tree.leaf_ids()));
            }
            Request::HasMovedFile { old, new, reply } => {
                self.registry.has_moved_file(&old, &new, &mut self.authority);
                self.sync_derived_state();
                let _ = reply.send(());
            }
            Request::HasMovedDir { old, new, reply } => {
                self.registry.has_moved_dir(&old, &new, &mut self.authority);
                self.sync_derived_state();
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::SaveFinished { path, result } => {
                let resave = self.authority.finish_save(&path);
                match result {
                    Ok(()) => self.registry.emit(Event::FileSaved { path: path.clone() }),
                    // lastSavedVersion stays advanced; the disk copy is
                    // stale until the next save attempt succeeds
                    Err(err) => warn!(path = %path.display(), %err, "save failed"),
                }
                if resave {
                    if let Err(err) = self.start_save(&path) {
                        warn!(path = %path.display(), %err, "coalesced resave failed to start");
                    }
                } else {
                    let open = self.registry.open_paths();
                    self.authority.retain_open(&open);
                }
            }
            Internal::PullExpired { path, waiter } => {
                self.authority.expire_waiter(&path, waiter);
            }
            Internal::AutosaveDue { path } => {
                self.autosave_pending.remove(&path);
                if self.authority.is_modified(&path) {
                    if let Err(err) = self.start_save(&path) {
                        warn!(path = %path.display(), %err, "autosave failed to start");
                    }
                }
            }
        }
    }

    fn handle_watch(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Changed(path) => {
                if self.reconciler.should_ignore(&path) {
                    return;
                }
                let content = match self.io.read(&path) {
                    Ok(content) => content,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "could not read changed file");
                        return;
                    }
                };
                match self.authority.reconcile_external_change(&path, content) {
                    Some(crate::authority::ReconcileOutcome::Conflict) => {
                        self.registry.emit(Event::FileRemotelyChanged { path });
                    }
                    Some(crate::authority::ReconcileOutcome::Replaced { new_version }) => {
                        debug!(path = %path.display(), new_version, "document replaced from disk");
                    }
                    None => {}
                }
            }
            WatchEvent::Removed(path) => {
                debug!(path = %path.display(), "backing file deleted, closing everywhere");
                self.registry.close_file_everywhere(&path);
                self.sync_derived_state();
            }
        }
    }

    fn open_file(&mut self, window: &WindowId, leaf: NodeId, path: &Path) -> Result<OpenOutcome> {
        // Validate the target before loading, so a bad leaf id cannot leave
        // an unreferenced document behind in the authority
        if self.registry.tree(window)?.tabs(leaf).is_none() {
            return Err(Error::NodeNotFound(leaf));
        }
        self.authority.get_document(path, self.io.as_ref())?;
        let outcome = self.registry.open_file(window, leaf, path)?;
        self.sync_derived_state();
        Ok(outcome)
    }

    fn close_file(&mut self, window: &WindowId, leaf: NodeId, path: &Path) -> Result<()> {
        let job =
            self.registry
                .close_file(window, leaf, path, &mut self.authority, self.consent.as_ref())?;
        if let Some(job) = job {
            self.registry.emit(Event::ChangeFileStatus {
                path: path.to_path_buf(),
                modified: false,
            });
            self.dispatch_save(job);
        }
        self.sync_derived_state();
        Ok(())
    }

    fn close_leaf(&mut self, window: &WindowId, leaf: NodeId) -> Result<()> {
        let jobs =
            self.registry
                .close_leaf(window, leaf, &mut self.authority, self.consent.as_ref())?;
        for job in jobs {
            self.registry.emit(Event::ChangeFileStatus {
                path: job.descriptor.path.clone(),
                modified: false,
            });
            self.dispatch_save(job);
        }
        self.sync_derived_state();
        Ok(())
    }

    fn close_window(&mut self, window: &WindowId) -> Result<()> {
        let jobs =
            self.registry
                .close_window(window, &mut self.authority, self.consent.as_ref())?;
        for job in jobs {
            self.registry.emit(Event::ChangeFileStatus {
                path: job.descriptor.path.clone(),
                modified: false,
            });
            self.dispatch_save(job);
        }
        self.sync_derived_state();
        Ok(())
    }

    fn pull_updates(&mut self, path: PathBuf, known_version: u64, reply: PullReply) {
        match self.authority.pull_updates(&path, known_version, reply) {
            PullDisposition::Replied => {}
            PullDisposition::Parked { waiter } => {
                let internal = self.internal_tx.clone();
                let timeout = self.config.pull_timeout();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = internal.send(Internal::PullExpired { path, waiter }).await;
                });
            }
        }
    }

    fn push_updates(&mut self, path: &Path, base_version: u64, updates: Vec<Update>) -> Result<u64> {
        let (version, flipped) = self.authority.push_updates(path, base_version, updates)?;
        if flipped {
            self.registry.emit(Event::ChangeFileStatus {
                path: path.to_path_buf(),
                modified: self.authority.is_modified(path),
            });
        }
        self.schedule_autosave(path);
        Ok(version)
    }

    /// Begin a save unless one is already in flight (coalesced by the
    /// authority). The modified flag flips immediately.
    fn start_save(&mut self, path: &Path) -> Result<()> {
        let was_modified = self.authority.is_modified(path);
        match self.authority.begin_save(path)? {
            None => Ok(()),
            Some(job) => {
                if was_modified {
                    self.registry.emit(Event::ChangeFileStatus {
                        path: path.to_path_buf(),
                        modified: false,
                    });
                }
                self.dispatch_save(job);
                Ok(())
            }
        }
    }

    /// Hand a save job to a blocking worker. The write's own watch event is
    /// registered on the ignore list first, and completion re-enters the
    /// queue as SaveFinished.
    fn dispatch_save(&mut self, job: SaveJob) {
        let path = job.descriptor.path.clone();
        self.reconciler.ignore_next(&path);
        let io = self.io.clone();
        let internal = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = io.save(&job.descriptor, &job.content);
            let _ = internal.blocking_send(Internal::SaveFinished { path, result });
        });
    }

    fn schedule_autosave(&mut self, path: &Path) {
        let delay = self.config.autosave_delay();
        if delay.is_zero() || !self.autosave_pending.insert(path.to_path_buf()) {
            return;
        }
        let internal = self.internal_tx.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::AutosaveDue { path }).await;
        });
    }

    /// Recompute everything derived from the open-tab set: drop
    /// unreferenced documents, reconcile the watch set, persist the layout.
    fn sync_derived_state(&mut self) {
        let open = self.registry.open_paths();
        self.authority.retain_open(&open);
        self.reconciler.reconcile(&open);
        self.persist();
    }

    fn persist(&self) {
        self.persistence.set(&self.registry.snapshot());
    }
}

impl ServiceHandle {
    /// Subscribe to change events. Subscribers that lag behind the channel
    /// capacity lose the oldest events (broadcast semantics).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| Error::ServiceClosed)?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    pub async fn open_file(
        &self,
        window: &WindowId,
        leaf: NodeId,
        path: &Path,
    ) -> Result<OpenOutcome> {
        self.request(|reply| Request::OpenFile {
            window: window.clone(),
            leaf,
            path: path.to_path_buf(),
            reply,
        })
        .await?
    }

    pub async fn close_file(&self, window: &WindowId, leaf: NodeId, path: &Path) -> Result<()> {
        self.request(|reply| Request::CloseFile {
            window: window.clone(),
            leaf,
            path: path.to_path_buf(),
            reply,
        })
        .await?
    }

    /// Fire-and-forget save: Ok means the write was started or coalesced,
    /// completion is signaled by a FileSaved event.
    pub async fn save_file(&self, path: &Path) -> Result<()> {
        self.request(|reply| Request::SaveFile {
            path: path.to_path_buf(),
            reply,
        })
        .await?
    }

    pub async fn move_file(
        &self,
        from: (&WindowId, NodeId),
        to: (&WindowId, NodeId),
        path: &Path,
    ) -> Result<()> {
        self.request(|reply| Request::MoveFile {
            from_window: from.0.clone(),
            from_leaf: from.1,
            to_window: to.0.clone(),
            to_leaf: to.1,
            path: path.to_path_buf(),
            reply,
        })
        .await?
    }

    pub async fn split_leaf(
        &self,
        window: &WindowId,
        leaf: NodeId,
        direction: Direction,
        insertion: Insertion,
        relocate: Option<&Path>,
    ) -> Result<NodeId> {
        self.request(|reply| Request::SplitLeaf {
            window: window.clone(),
            leaf,
            direction,
            insertion,
            relocate: relocate.map(Path::to_path_buf),
            reply,
        })
        .await?
    }

    pub async fn close_leaf(&self, window: &WindowId, leaf: NodeId) -> Result<()> {
        self.request(|reply| Request::CloseLeaf {
            window: window.clone(),
            leaf,
            reply,
        })
        .await?
    }

    pub async fn sort_open_files(
        &self,
        window: &WindowId,
        leaf: NodeId,
        order: Vec<PathBuf>,
    ) -> Result<bool> {
        self.request(|reply| Request::SortOpenFiles {
            window: window.clone(),
            leaf,
            order,
            reply,
        })
        .await?
    }

    pub async fn set_pinned(
        &self,
        window: &WindowId,
        leaf: NodeId,
        path: &Path,
        pinned: bool,
    ) -> Result<bool> {
        self.request(|reply| Request::SetPinned {
            window: window.clone(),
            leaf,
            path: path.to_path_buf(),
            pinned,
            reply,
        })
        .await?
    }

    pub async fn set_branch_sizes(
        &self,
        window: &WindowId,
        node: NodeId,
        sizes: Vec<f64>,
    ) -> Result<()> {
        self.request(|reply| Request::SetBranchSizes {
            window: window.clone(),
            node,
            sizes,
            reply,
        })
        .await?
    }

    pub async fn navigate_back(&self, window: &WindowId, leaf: NodeId) -> Result<Option<PathBuf>> {
        self.request(|reply| Request::NavigateBack {
            window: window.clone(),
            leaf,
            reply,
        })
        .await?
    }

    pub async fn navigate_forward(
        &self,
        window: &WindowId,
        leaf: NodeId,
    ) -> Result<Option<PathBuf>> {
        self.request(|reply| Request::NavigateForward {
            window: window.clone(),
            leaf,
            reply,
        })
        .await?
    }

    pub async fn new_window(&self) -> Result<WindowId> {
        self.request(|reply| Request::NewWindow { reply }).await
    }

    pub async fn close_window(&self, window: &WindowId) -> Result<()> {
        self.request(|reply| Request::CloseWindow {
            window: window.clone(),
            reply,
        })
        .await?
    }

    pub async fn get_document(&self, path: &Path) -> Result<(String, u64, DocumentKind)> {
        self.request(|reply| Request::GetDocument {
            path: path.to_path_buf(),
            reply,
        })
        .await?
    }

    /// Long-poll for updates after `known_version`. Returns an empty list
    /// on timeout, the backlog immediately when one exists.
    pub async fn pull_updates(
        &self,
        path: &Path,
        known_version: u64,
    ) -> Result<Vec<VersionedUpdate>> {
        self.request(|reply| Request::PullUpdates {
            path: path.to_path_buf(),
            known_version,
            reply,
        })
        .await?
    }

    pub async fn push_updates(
        &self,
        path: &Path,
        base_version: u64,
        updates: Vec<Update>,
    ) -> Result<u64> {
        self.request(|reply| Request::PushUpdates {
            path: path.to_path_buf(),
            base_version,
            updates,
            reply,
        })
        .await?
    }

    pub async fn get_modified_paths(&self) -> Result<Vec<PathBuf>> {
        self.request(|reply| Request::GetModifiedPaths { reply })
            .await
    }

    /// Serialized layout of one window (the retrieve-tab-config payload).
    pub async fn tab_config(&self, window: &WindowId) -> Result<serde_json::Value> {
        self.request(|reply| Request::TabConfig {
            window: window.clone(),
            reply,
        })
        .await?
    }

    pub async fn windows(&self) -> Result<Vec<WindowId>> {
        self.request(|reply| Request::Windows { reply }).await
    }

    pub async fn leaf_ids(&self, window: &WindowId) -> Result<Vec<NodeId>> {
        self.request(|reply| Request::LeafIds {
            window: window.clone(),
            reply,
        })
        .await?
    }

    pub async fn has_moved_file(&self, old: &Path, new: &Path) -> Result<()> {
        self.request(|reply| Request::HasMovedFile {
            old: old.to_path_buf(),
            new: new.to_path_buf(),
            reply,
        })
        .await
    }

    pub async fn has_moved_dir(&self, old: &Path, new: &Path) -> Result<()> {
        self.request(|reply| Request::HasMovedDir {
            old: old.to_path_buf(),
            new: new.to_path_buf(),
            reply,
        })
        .await
    }
}
