//! Directory watching built on `notify`.
//!
//! Watches are registered per directory (non-recursive at the OS level) and
//! tracked in an explicit registration map, so recursive coverage, handle
//! invalidation, and the "nothing left to watch" condition are all
//! observable. Raw notifications flow from the notify callback thread into
//! a bounded channel; `run` drains that channel and dispatches each event
//! synchronously to a sink, so handlers see events in arrival order without
//! an intermediate queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ShipError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Opaque handle for one directory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// What happened to a path, as far as callers care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    /// The OS event queue lost detail; the path is a watched root that may
    /// have unreported changes.
    Overflow,
}

/// How `run` ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The cancellation token fired during the wait.
    Cancelled,
    /// The last registration was invalidated; nothing left to watch.
    Exhausted,
}

/// Single-method capability handed into the watch loop. The handler returns
/// before the loop consumes the next event; an error aborts the loop.
#[async_trait]
pub trait WatchSink: Send {
    async fn apply(&mut self, kind: WatchEventKind, path: &Path) -> Result<()>;
}

enum WatchMessage {
    Event(Event),
    Error(notify::Error),
}

/// Watches a set of directories for filesystem events.
pub struct DirWatcher {
    watcher: RecommendedWatcher,
    registrations: HashMap<WatchId, PathBuf>,
    by_path: HashMap<PathBuf, WatchId>,
    next_id: u64,
    recursive: bool,
    rx: mpsc::Receiver<WatchMessage>,
}

impl std::fmt::Debug for DirWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirWatcher")
            .field("registrations", &self.registrations.len())
            .field("recursive", &self.recursive)
            .finish()
    }
}

impl DirWatcher {
    /// Build a watcher with no registrations. `recursive` controls whether
    /// directories created later are registered as they appear.
    pub fn new(recursive: bool) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WatchMessage>(EVENT_CHANNEL_CAPACITY);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let msg = match res {
                    Ok(event) => WatchMessage::Event(event),
                    Err(err) => WatchMessage::Error(err),
                };
                // Receiver dropped means run() already returned.
                let _ = tx.blocking_send(msg);
            },
            NotifyConfig::default(),
        )
        .map_err(|err| ShipError::Watch(format!("failed to create watcher: {err}")))?;

        Ok(Self {
            watcher,
            registrations: HashMap::new(),
            by_path: HashMap::new(),
            next_id: 0,
            recursive,
            rx,
        })
    }

    /// Register one directory for create/modify/remove events. Idempotent:
    /// a path already registered keeps its existing handle.
    pub fn register(&mut self, dir: &Path) -> Result<WatchId> {
        let dir = std::path::absolute(dir)?;

        if let Some(id) = self.by_path.get(&dir) {
            debug!(dir = %dir.display(), "already registered");
            return Ok(*id);
        }

        self.watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| {
                ShipError::Watch(format!("failed to watch {}: {err}", dir.display()))
            })?;

        let id = WatchId(self.next_id);
        self.next_id += 1;
        debug!(dir = %dir.display(), ?id, "registered");
        self.registrations.insert(id, dir.clone());
        self.by_path.insert(dir, id);
        Ok(id)
    }

    /// Walk the tree rooted at `root` and register every directory found,
    /// pre-order. One-time and synchronous: trees that do not exist yet are
    /// picked up by the event loop, not here. A subdirectory that cannot be
    /// read or registered is skipped with a warning; the root itself must
    /// succeed.
    pub fn register_recursive(&mut self, root: &Path) -> Result<()> {
        self.register(root)?;

        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %dir.display(), %err, "could not list directory during registration");
                    continue;
                }
            };
            for entry in entries {
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                if path.is_dir() {
                    match self.register(&path) {
                        Ok(_) => stack.push(path),
                        Err(err) => {
                            warn!(%err, "skipping unwatchable subdirectory");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drain events until cancelled, exhausted, or the sink fails.
    ///
    /// This is the only blocking wait in the system. Cancellation is a
    /// distinct terminal state, not an error; losing the last registration
    /// is reported as [`WatchOutcome::Exhausted`] for the caller to treat
    /// as fatal.
    pub async fn run<S: WatchSink>(
        &mut self,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome> {
        loop {
            if self.registrations.is_empty() {
                error!("all watched directories are inaccessible");
                return Ok(WatchOutcome::Exhausted);
            }

            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("watch interrupted");
                    return Ok(WatchOutcome::Cancelled);
                }
                msg = self.rx.recv() => msg,
            };

            match msg {
                Some(WatchMessage::Event(event)) => self.handle_event(event, sink).await?,
                Some(WatchMessage::Error(err)) => self.handle_watch_error(err, sink).await?,
                None => return Err(ShipError::Watch("event channel closed".to_string())),
            }
        }
    }

    async fn handle_event<S: WatchSink>(&mut self, event: Event, sink: &mut S) -> Result<()> {
        // Queue overflow arrives as a flagged catch-all event, usually with
        // no paths attached.
        if event.need_rescan() || matches!(event.kind, EventKind::Other) {
            return self.report_overflow(sink).await;
        }

        for (kind, path) in classify(&event) {
            if kind == WatchEventKind::Created && self.recursive && path.is_dir() {
                // Register the new directory (and anything already inside
                // it) before its own contents can produce unwatched events.
                if let Err(err) = self.register_recursive(&path) {
                    warn!(%err, "could not register newly created directory");
                }
            }

            sink.apply(kind, &path).await?;

            if kind == WatchEventKind::Removed {
                self.invalidate_if_registered(&path);
            }
        }
        Ok(())
    }

    /// Watcher-level failures. An error naming watched paths invalidates
    /// those registrations; anything else is reported as overflow on every
    /// root so the caller can reconcile with a directory listing.
    async fn handle_watch_error<S: WatchSink>(
        &mut self,
        err: notify::Error,
        sink: &mut S,
    ) -> Result<()> {
        if err.paths.is_empty() {
            warn!(%err, "watch backend error, reporting overflow");
            return self.report_overflow(sink).await;
        }

        for path in err.paths.clone() {
            warn!(path = %path.display(), %err, "dropping failed registration");
            self.invalidate_if_registered(&path);
        }
        Ok(())
    }

    async fn report_overflow<S: WatchSink>(&mut self, sink: &mut S) -> Result<()> {
        let roots: Vec<PathBuf> = self.registrations.values().cloned().collect();
        for root in roots {
            sink.apply(WatchEventKind::Overflow, &root).await?;
        }
        Ok(())
    }

    fn invalidate_if_registered(&mut self, path: &Path) {
        let Some(id) = self.by_path.remove(path) else {
            return;
        };
        self.registrations.remove(&id);
        let _ = self.watcher.unwatch(path);
        info!(dir = %path.display(), ?id, "registration invalidated");
    }

    #[cfg(test)]
    fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    #[cfg(test)]
    fn is_registered(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }
}

/// Map one notify event to the dispatchable (kind, path) pairs it implies.
/// Access and catch-all events carry no information we act on.
fn classify(event: &Event) -> Vec<(WatchEventKind, PathBuf)> {
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| (WatchEventKind::Created, p.clone()))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (WatchEventKind::Removed, p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            // A rename into place is a creation from the caller's view.
            RenameMode::To => event
                .paths
                .iter()
                .map(|p| (WatchEventKind::Created, p.clone()))
                .collect(),
            RenameMode::From => event
                .paths
                .iter()
                .map(|p| (WatchEventKind::Removed, p.clone()))
                .collect(),
            RenameMode::Both => {
                let mut out = Vec::new();
                if let Some(old) = event.paths.first() {
                    out.push((WatchEventKind::Removed, old.clone()));
                }
                if let Some(new) = event.paths.get(1) {
                    out.push((WatchEventKind::Created, new.clone()));
                }
                out
            }
            _ => event
                .paths
                .iter()
                .map(|p| (WatchEventKind::Modified, p.clone()))
                .collect(),
        },
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| (WatchEventKind::Modified, p.clone()))
            .collect(),
        // Overflow is handled before classification; nothing else in the
        // catch-all kinds is actionable.
        EventKind::Other | EventKind::Any | EventKind::Access(_) => Vec::new(),
    }
}
