//! Lifecycle of the directory watch and the debounce timers.
//!
//! The session holds the only watch handle. `setup` is idempotent for an
//! unchanged directory set and `teardown` may be called any number of
//! times; the handle is released exactly once.

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::backend::{EventSink, WatchBackend, WatchGuard};
use super::debouncer::Debouncer;
use super::error::ReloadError;

/// An established watch over a fixed directory set.
pub struct WatchHandle {
    id: u64,
    dirs: BTreeSet<PathBuf>,
    guard: Box<dyn WatchGuard>,
}

impl WatchHandle {
    /// Sequence number, unique per session.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dirs(&self) -> &BTreeSet<PathBuf> {
        &self.dirs
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("dirs", &self.dirs)
            .finish_non_exhaustive()
    }
}

/// What `setup` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupKind {
    /// The existing handle already covered the requested set.
    Reused { handle_id: u64 },
    /// A new handle was created (any previous one was released first).
    Established { handle_id: u64 },
}

impl SetupKind {
    pub fn handle_id(self) -> u64 {
        match self {
            SetupKind::Reused { handle_id } | SetupKind::Established { handle_id } => handle_id,
        }
    }
}

/// What `teardown` released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownReport {
    pub handle_released: bool,
    pub timers_cancelled: usize,
}

/// Owner of the watch handle and the per-plugin debounce timers.
///
/// Invariant: a handle exists iff watching is enabled.
pub struct WatchSession {
    backend: Box<dyn WatchBackend>,
    sink: EventSink,
    handle: Option<WatchHandle>,
    debouncer: Debouncer,
    next_handle_id: u64,
}

impl WatchSession {
    pub fn new(backend: Box<dyn WatchBackend>, sink: EventSink, debouncer: Debouncer) -> Self {
        Self {
            backend,
            sink,
            handle: None,
            debouncer,
            next_handle_id: 0,
        }
    }

    /// Watch exactly `dirs`.
    ///
    /// Returns the existing handle when it already covers the same set.
    /// Otherwise the old handle is released and a new one established. On
    /// failure nothing is watched and watching counts as disabled.
    pub fn setup(&mut self, dirs: BTreeSet<PathBuf>) -> Result<SetupKind, ReloadError> {
        if let Some(handle) = &self.handle {
            if handle.dirs == dirs {
                return Ok(SetupKind::Reused {
                    handle_id: handle.id,
                });
            }
        }

        self.release_handle();

        let guard = match self.backend.watch(&dirs, self.sink.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("[session] watch setup failed, watching disabled: {e}");
                return Err(e);
            }
        };

        self.next_handle_id += 1;
        let handle_id = self.next_handle_id;
        crate::log_event!(
            "session",
            "watching",
            "{} directories (handle {handle_id})",
            dirs.len()
        );
        self.handle = Some(WatchHandle {
            id: handle_id,
            dirs,
            guard,
        });

        Ok(SetupKind::Established { handle_id })
    }

    /// Follow a new directory set if watching is enabled.
    ///
    /// Returns `Ok(None)` when watching is off.
    pub fn update(&mut self, dirs: BTreeSet<PathBuf>) -> Result<Option<SetupKind>, ReloadError> {
        if self.handle.is_none() {
            return Ok(None);
        }
        self.setup(dirs).map(Some)
    }

    /// Release the watch handle and cancel every pending timer.
    ///
    /// Calling it again is a no-op.
    pub fn teardown(&mut self) -> TeardownReport {
        let report = TeardownReport {
            handle_released: self.release_handle(),
            timers_cancelled: self.debouncer.cancel_all(),
        };

        if report.handle_released || report.timers_cancelled > 0 {
            crate::log_event!(
                "session",
                "torn down",
                "{} timers cancelled",
                report.timers_cancelled
            );
        }
        report
    }

    fn release_handle(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                crate::debug_event!("session", "released", "handle {}", handle.id);
                handle.guard.close();
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&WatchHandle> {
        self.handle.as_ref()
    }

    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.handle
            .as_ref()
            .map(|handle| handle.dirs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    pub fn debouncer_mut(&mut self) -> &mut Debouncer {
        &mut self.debouncer
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
