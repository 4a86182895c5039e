//! DocumentAuthority - the single in-memory source of truth for open
//! documents.
//!
//! Every pane displaying the same file shares one entry here. Edits arrive
//! as incremental updates against a base version; the authority applies
//! them to the canonical text, advances the version counter, keeps a
//! bounded replay backlog, and releases parked pull requests. Modification
//! state is the distance between `last_saved_version` and
//! `current_version`.
//!
//! All methods are called from the single owner task (see service), so the
//! register-waiter-then-check-version sequence can never race with a push.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::capability::IoCapability;
use crate::error::{Error, Result};

/// Content files get front-matter extraction and parser-aware saving;
/// everything else is treated as plain code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Content,
    Code,
}

impl DocumentKind {
    fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("md" | "markdown" | "mdx" | "txt") => DocumentKind::Content,
            _ => DocumentKind::Code,
        }
    }
}

/// Path components plus the raw front-matter block of content files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub dir: PathBuf,
    pub name: String,
    pub ext: String,
    pub frontmatter: Option<String>,
}

impl FileDescriptor {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ext: path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default(),
            frontmatter: None,
        }
    }

    fn rebase(&mut self, new_path: &Path) {
        let frontmatter = self.frontmatter.take();
        *self = Self::new(new_path);
        self.frontmatter = frontmatter;
    }
}

/// One text edit: replace the byte range `from..to` with `insert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub from: usize,
    pub to: usize,
    pub insert: String,
}

/// A minimal description of a text change, the unit the protocol moves
/// around instead of full document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub edits: Vec<Edit>,
}

/// An applied update tagged with the version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedUpdate {
    pub version: u64,
    pub update: Update,
}

/// Reply channel of a pull request.
pub type PullReply = oneshot::Sender<Result<Vec<VersionedUpdate>>>;

/// Whether a pull was answered immediately or parked for a later push.
#[derive(Debug)]
pub enum PullDisposition {
    Replied,
    /// Parked; the caller arms the long-poll timeout for this waiter.
    Parked { waiter: u64 },
}

/// What happened to a document when its backing file changed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Unmodified document: canonical text replaced wholesale.
    Replaced { new_version: u64 },
    /// Unsaved edits present: text untouched, the user must decide.
    Conflict,
}

/// Work handed to the I/O layer by `begin_save`.
#[derive(Debug, Clone)]
pub struct SaveJob {
    pub descriptor: FileDescriptor,
    pub content: String,
}

struct PullWaiter {
    id: u64,
    known_version: u64,
    reply: PullReply,
}

struct OpenDocument {
    descriptor: FileDescriptor,
    kind: DocumentKind,
    text: String,
    current_version: u64,
    last_saved_version: u64,
    backlog: VecDeque<VersionedUpdate>,
    waiters: Vec<PullWaiter>,
    save_in_flight: bool,
    save_pending: bool,
}

impl OpenDocument {
    fn is_modified(&self) -> bool {
        self.last_saved_version != self.current_version
    }

    /// Version of the oldest update still in the backlog, i.e. the lowest
    /// `known_version` a pull can be served from without a full re-fetch.
    fn oldest_retained(&self) -> u64 {
        self.current_version - self.backlog.len() as u64
    }

    fn updates_since(&self, known_version: u64) -> Vec<VersionedUpdate> {
        self.backlog
            .iter()
            .filter(|u| u.version > known_version)
            .cloned()
            .collect()
    }
}

/// Authoritative store of open document content and version state.
pub struct DocumentAuthority {
    docs: HashMap<PathBuf, OpenDocument>,
    update_retention: usize,
    next_waiter_id: u64,
}

impl DocumentAuthority {
    pub fn new(update_retention: usize) -> Self {
        Self {
            docs: HashMap::new(),
            update_retention,
            next_waiter_id: 1,
        }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.docs.contains_key(path)
    }

    pub fn is_modified(&self, path: &Path) -> bool {
        self.docs.get(path).map(|d| d.is_modified()).unwrap_or(false)
    }

    pub fn modified_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .docs
            .iter()
            .filter(|(_, d)| d.is_modified())
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Load (or return the cached) document. Fails with `NotFound` when the
    /// backing file cannot be read and no in-memory copy exists.
    pub fn get_document(
        &mut self,
        path: &Path,
        io: &dyn IoCapability,
    ) -> Result<(String, u64, DocumentKind)> {
        if !self.docs.contains_key(path) {
            let text = io.read(path)?;
            let kind = DocumentKind::from_path(path);
            let mut descriptor = FileDescriptor::new(path);
            if kind == DocumentKind::Content {
                descriptor.frontmatter = extract_frontmatter(&text);
            }
            debug!(path = %path.display(), ?kind, "loading document into authority");
            self.docs.insert(
                path.to_path_buf(),
                OpenDocument {
                    descriptor,
                    kind,
                    text,
                    current_version: 0,
                    last_saved_version: 0,
                    backlog: VecDeque::new(),
                    waiters: Vec::new(),
                    save_in_flight: false,
                    save_pending: false,
                },
            );
        }
        let doc = &self.docs[path];
        Ok((doc.text.clone(), doc.current_version, doc.kind))
    }

    /// Answer a pull immediately when a backlog exists, otherwise park the
    /// waiter. The waiter is registered before anything else can run on the
    /// owner task, so a concurrent push cannot be missed.
    pub fn pull_updates(
        &mut self,
        path: &Path,
        known_version: u64,
        reply: PullReply,
    ) -> PullDisposition {
        let Some(doc) = self.docs.get_mut(path) else {
            let _ = reply.send(Err(Error::NotFound(path.to_path_buf())));
            return PullDisposition::Replied;
        };
        if known_version > doc.current_version {
            let _ = reply.send(Err(Error::StaleBase {
                submitted: known_version,
                current: doc.current_version,
            }));
            return PullDisposition::Replied;
        }
        if known_version == doc.current_version {
            let id = self.next_waiter_id;
            self.next_waiter_id += 1;
            doc.waiters.push(PullWaiter {
                id,
                known_version,
                reply,
            });
            return PullDisposition::Parked { waiter: id };
        }
        if known_version < doc.oldest_retained() {
            let _ = reply.send(Err(Error::VersionTooOld {
                requested: known_version,
                oldest: doc.oldest_retained(),
            }));
            return PullDisposition::Replied;
        }
        let _ = reply.send(Ok(doc.updates_since(known_version)));
        PullDisposition::Replied
    }

    /// Long-poll expiry: a still-parked waiter gets an empty update list
    /// (timeout is not an error). A waiter already released is a no-op.
    pub fn expire_waiter(&mut self, path: &Path, waiter: u64) {
        if let Some(doc) = self.docs.get_mut(path) {
            if let Some(index) = doc.waiters.iter().position(|w| w.id == waiter) {
                let waiter = doc.waiters.remove(index);
                let _ = waiter.reply.send(Ok(Vec::new()));
            }
        }
    }

    /// Apply updates submitted against `base_version`. Strict: a stale base
    /// fails with `StaleBase` and leaves state unchanged; the client must
    /// pull and resubmit. On success the version advances by the number of
    /// updates, the backlog grows, and every parked waiter is released with
    /// the updates since its own known version. Returns the new version and
    /// whether the modified flag flipped.
    pub fn push_updates(
        &mut self,
        path: &Path,
        base_version: u64,
        updates: Vec<Update>,
    ) -> Result<(u64, bool)> {
        let doc = self
            .docs
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))?;
        if base_version != doc.current_version {
            return Err(Error::StaleBase {
                submitted: base_version,
                current: doc.current_version,
            });
        }

        // All-or-nothing: apply to a working copy first so a bad edit range
        // cannot leave a half-applied push behind.
        let mut working = doc.text.clone();
        for update in &updates {
            for edit in &update.edits {
                apply_edit(&mut working, edit)?;
            }
        }

        let was_modified = doc.is_modified();
        doc.text = working;
        for update in updates {
            doc.current_version += 1;
            doc.backlog.push_back(VersionedUpdate {
                version: doc.current_version,
                update,
            });
        }
        while doc.backlog.len() > self.update_retention {
            doc.backlog.pop_front();
        }
        if doc.kind == DocumentKind::Content {
            doc.descriptor.frontmatter = extract_frontmatter(&doc.text);
        }

        for waiter in doc.waiters.drain(..) {
            let since = doc
                .backlog
                .iter()
                .filter(|u| u.version > waiter.known_version)
                .cloned()
                .collect();
            let _ = waiter.reply.send(Ok(since));
        }

        debug!(path = %path.display(), version = doc.current_version, "updates applied");
        Ok((doc.current_version, was_modified != doc.is_modified()))
    }

    /// Start a save. Returns None when a save for this path is already in
    /// flight: the request is coalesced and replayed once the running write
    /// finishes, so the later content wins without duplicate writes.
    ///
    /// `last_saved_version` advances before the write completes. This is
    /// deliberate: an edit arriving mid-write must read as unsaved
    /// afterwards. The accepted risk is that a failed write leaves the
    /// document marked saved while the disk copy is stale.
    pub fn begin_save(&mut self, path: &Path) -> Result<Option<SaveJob>> {
        let doc = self
            .docs
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))?;
        if doc.save_in_flight {
            doc.save_pending = true;
            return Ok(None);
        }
        doc.save_in_flight = true;
        doc.save_pending = false;
        doc.last_saved_version = doc.current_version;
        Ok(Some(SaveJob {
            descriptor: doc.descriptor.clone(),
            content: doc.text.clone(),
        }))
    }

    /// Record write completion. Returns true when a coalesced save request
    /// arrived mid-write and the caller should begin another save.
    pub fn finish_save(&mut self, path: &Path) -> bool {
        let Some(doc) = self.docs.get_mut(path) else {
            return false;
        };
        doc.save_in_flight = false;
        std::mem::take(&mut doc.save_pending)
    }

    pub fn save_in_flight(&self, path: &Path) -> bool {
        self.docs.get(path).map(|d| d.save_in_flight).unwrap_or(false)
    }

    /// Drop unsaved changes: the in-memory text stays, but the document no
    /// longer reads as modified (Discard consent outcome).
    pub fn discard_changes(&mut self, path: &Path) -> Result<()> {
        let doc = self
            .docs
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_path_buf()))?;
        doc.last_saved_version = doc.current_version;
        Ok(())
    }

    /// The backing file changed on disk. Unmodified documents take the disk
    /// content wholesale; the backlog is cleared because in-place edits
    /// cannot be replayed across a full replacement, so parked pullers are
    /// told to re-fetch. Modified documents are left untouched and reported
    /// as a conflict.
    pub fn reconcile_external_change(
        &mut self,
        path: &Path,
        new_content: String,
    ) -> Option<ReconcileOutcome> {
        let doc = self.docs.get_mut(path)?;
        if doc.is_modified() {
            return Some(ReconcileOutcome::Conflict);
        }
        doc.text = new_content;
        doc.current_version += 1;
        doc.last_saved_version = doc.current_version;
        doc.backlog.clear();
        if doc.kind == DocumentKind::Content {
            doc.descriptor.frontmatter = extract_frontmatter(&doc.text);
        }
        let oldest = doc.oldest_retained();
        for waiter in doc.waiters.drain(..) {
            let _ = waiter.reply.send(Err(Error::VersionTooOld {
                requested: waiter.known_version,
                oldest,
            }));
        }
        Some(ReconcileOutcome::Replaced {
            new_version: doc.current_version,
        })
    }

    /// File rename propagation: move the entry and rebase its descriptor.
    pub fn rename_file(&mut self, old: &Path, new: &Path) -> bool {
        let Some(mut doc) = self.docs.remove(old) else {
            return false;
        };
        doc.descriptor.rebase(new);
        self.docs.insert(new.to_path_buf(), doc);
        true
    }

    /// Directory rename propagation: every tracked document under `old_dir`
    /// moves to the corresponding path under `new_dir`. Returns the
    /// (old, new) pairs for tab rewriting.
    pub fn rename_dir(&mut self, old_dir: &Path, new_dir: &Path) -> Vec<(PathBuf, PathBuf)> {
        let moves: Vec<(PathBuf, PathBuf)> = self
            .docs
            .keys()
            .filter_map(|path| {
                path.strip_prefix(old_dir)
                    .ok()
                    .map(|rest| (path.clone(), new_dir.join(rest)))
            })
            .collect();
        for (old, new) in &moves {
            self.rename_file(old, new);
        }
        moves
    }

    /// Drop every document no leaf references any more, unless a save is
    /// still in flight for it. Parked pullers of dropped documents get
    /// `NotFound`.
    pub fn retain_open(&mut self, open: &HashSet<PathBuf>) {
        let stale: Vec<PathBuf> = self
            .docs
            .iter()
            .filter(|(path, doc)| !open.contains(*path) && !doc.save_in_flight)
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            if let Some(doc) = self.docs.remove(&path) {
                debug!(path = %path.display(), "dropping unreferenced document");
                for waiter in doc.waiters {
                    let _ = waiter.reply.send(Err(Error::NotFound(path.clone())));
                }
            }
        }
    }

    pub fn descriptor(&self, path: &Path) -> Option<&FileDescriptor> {
        self.docs.get(path).map(|d| &d.descriptor)
    }

    #[cfg(test)]
    pub fn text(&self, path: &Path) -> Option<&str> {
        self.docs.get(path).map(|d| d.text.as_str())
    }

    #[cfg(test)]
    pub fn current_version(&self, path: &Path) -> Option<u64> {
        self.docs.get(path).map(|d| d.current_version)
    }
}

fn apply_edit(text: &mut String, edit: &Edit) -> Result<()> {
    if edit.from > edit.to
        || edit.to > text.len()
        || !text.is_char_boundary(edit.from)
        || !text.is_char_boundary(edit.to)
    {
        return Err(Error::InvalidUpdate {
            from: edit.from,
            to: edit.to,
            len: text.len(),
        });
    }
    text.replace_range(edit.from..edit.to, &edit.insert);
    Ok(())
}

/// Raw front-matter block of a content file: the lines between a leading
/// `---` fence and the next one. Parsing the block is the host's concern.
fn extract_frontmatter(text: &str) -> Option<String> {
    let rest = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n"))?;
    let mut block = String::new();
    for line in rest.lines() {
        if line.trim_end() == "---" {
            return Some(block);
        }
        block.push_str(line);
        block.push('\n');
    }
    None
}
