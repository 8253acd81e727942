//! Directory watch primitives.
//!
//! A [`WatchBackend`] turns a set of directories into a live watch whose
//! events are pushed into an [`EventSink`]. The returned [`WatchGuard`]
//! owns the OS resources; closing it stops delivery.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::error::ReloadError;
use super::event::FileEvent;

/// What a backend delivers to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    Event(FileEvent),
    /// Non-fatal error reported by the OS watcher.
    Error(String),
}

/// Sending side of the coordinator's watch inbox.
///
/// Backends only ever push into the sink; they never touch pipeline state.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<WatchSignal>,
    overflowing: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WatchSignal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            overflowing: Arc::new(AtomicBool::new(false)),
        };
        (sink, rx)
    }

    /// Deliver from a non-async thread (e.g. the notify callback thread).
    ///
    /// Never blocks: when the inbox is full the event is dropped. Returns
    /// `false` once the coordinator has gone away.
    pub fn try_emit(&self, event: FileEvent) -> bool {
        self.try_signal(WatchSignal::Event(event))
    }

    /// Deliver from async code.
    pub async fn emit(&self, event: FileEvent) -> bool {
        self.tx.send(WatchSignal::Event(event)).await.is_ok()
    }

    pub fn try_report_error(&self, reason: String) {
        self.try_signal(WatchSignal::Error(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn try_signal(&self, signal: WatchSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => {
                if self.overflowing.swap(false, Ordering::Relaxed) {
                    crate::debug_event!("watcher", "inbox drained, delivering again");
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                if !self.overflowing.swap(true, Ordering::Relaxed) {
                    tracing::warn!("[watcher] inbox full, dropping file events");
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Ownership of an established watch. Closing releases it.
pub trait WatchGuard: Send {
    fn close(self: Box<Self>);
}

/// The environment's "watch these directories" primitive.
pub trait WatchBackend: Send {
    /// Start watching `dirs` recursively, delivering into `sink`.
    fn watch(
        &mut self,
        dirs: &BTreeSet<PathBuf>,
        sink: EventSink,
    ) -> Result<Box<dyn WatchGuard>, ReloadError>;
}

/// Backend built on `notify::RecommendedWatcher`.
#[derive(Debug, Default)]
pub struct NotifyBackend;

impl NotifyBackend {
    pub fn new() -> Self {
        Self
    }
}

struct NotifyGuard {
    watcher: RecommendedWatcher,
    dirs: BTreeSet<PathBuf>,
}

impl WatchGuard for NotifyGuard {
    fn close(self: Box<Self>) {
        // No per-directory unwatch: on inotify it waits on the event
        // thread, which may itself be waiting on a full inbox. Dropping
        // the watcher only signals the thread to exit.
        let NotifyGuard { watcher, dirs } = *self;
        drop(watcher);
        crate::debug_event!("watcher", "released", "{} directories", dirs.len());
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(
        &mut self,
        dirs: &BTreeSet<PathBuf>,
        sink: EventSink,
    ) -> Result<Box<dyn WatchGuard>, ReloadError> {
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for file_event in FileEvent::from_notify(event) {
                        if !sink.try_emit(file_event) {
                            break;
                        }
                    }
                }
                Err(e) => sink.try_report_error(e.to_string()),
            })?;

        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| ReloadError::WatchSetup {
                    path: dir.clone(),
                    reason: e.to_string(),
                })?;
            crate::debug_event!("watcher", "watching", "{}", dir.display());
        }

        Ok(Box::new(NotifyGuard {
            watcher,
            dirs: dirs.clone(),
        }))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sink: Option<EventSink>,
    watches: Vec<BTreeSet<PathBuf>>,
    releases: usize,
    active: usize,
    fail_next: Option<String>,
}

/// In-process backend: events are injected by the embedding application.
///
/// Useful where no OS watcher is wanted (tests, sandboxes, editors that
/// already know when a plugin file was saved). Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an event into the active watch.
    ///
    /// Returns `false` when nothing is being watched.
    pub async fn emit(&self, event: FileEvent) -> bool {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => sink.emit(event).await,
            None => false,
        }
    }

    /// Make the next `watch` call fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.state.lock().fail_next = Some(reason.into());
    }

    /// Number of watches established so far.
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Number of watches released so far.
    pub fn release_count(&self) -> usize {
        self.state.lock().releases
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    /// Directory set of the most recent watch.
    pub fn last_dirs(&self) -> Option<BTreeSet<PathBuf>> {
        self.state.lock().watches.last().cloned()
    }
}

struct MemoryGuard {
    state: Arc<Mutex<MemoryState>>,
}

impl WatchGuard for MemoryGuard {
    fn close(self: Box<Self>) {
        let mut state = self.state.lock();
        state.releases += 1;
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            state.sink = None;
        }
    }
}

impl WatchBackend for MemoryBackend {
    fn watch(
        &mut self,
        dirs: &BTreeSet<PathBuf>,
        sink: EventSink,
    ) -> Result<Box<dyn WatchGuard>, ReloadError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next.take() {
            return Err(ReloadError::WatchSetup {
                path: dirs.iter().next().cloned().unwrap_or_default(),
                reason,
            });
        }

        state.watches.push(dirs.clone());
        state.active += 1;
        state.sink = Some(sink);

        Ok(Box::new(MemoryGuard {
            state: self.state.clone(),
        }))
    }
}
