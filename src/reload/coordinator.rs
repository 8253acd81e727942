//! The single task that owns all pipeline state.
//!
//! Commands from handles, watch signals, timer expiries and finished
//! reloads all arrive here and are handled one at a time, so the index,
//! the timers and the watch handle are never touched concurrently.
//! Reloads themselves run as separate tasks; the coordinator keeps
//! accepting events for other plugins while one is in flight.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;

use super::PluginId;
use super::backend::WatchSignal;
use super::debouncer::Expiry;
use super::error::PipelineResult;
use super::event::{EventFilter, FileEvent};
use super::orchestrator::ReloadOrchestrator;
use super::outcome::{
    OutcomeBroadcaster, OutcomeCallback, ReloadFailure, ReloadOutcome, ReloadResult, SkipReason,
};
use super::path_index::PathIndex;
use super::session::WatchSession;

/// Requests from [`ReloadPipeline`](super::ReloadPipeline) handles.
pub(crate) enum Command {
    Register {
        id: PluginId,
        path: PathBuf,
        reply: oneshot::Sender<PipelineResult<()>>,
    },
    Deregister {
        id: PluginId,
        reply: oneshot::Sender<bool>,
    },
    EnableWatching {
        reply: oneshot::Sender<PipelineResult<()>>,
    },
    DisableWatching {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        callback: OutcomeCallback,
        reply: oneshot::Sender<()>,
    },
    Notify {
        id: PluginId,
        at: Instant,
        reply: oneshot::Sender<bool>,
    },
    ReloadNow {
        id: PluginId,
        reply: oneshot::Sender<ReloadOutcome>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Snapshot of the coordinator's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub watching: bool,
    pub watched_dirs: Vec<PathBuf>,
    /// Registered plugins and their entry points.
    pub plugins: Vec<(PluginId, PathBuf)>,
    /// Plugins with a debounce timer running.
    pub pending: Vec<PluginId>,
    /// Plugins with a reload in progress.
    pub in_flight: Vec<PluginId>,
}

pub(crate) struct Coordinator {
    inbox: mpsc::Receiver<Command>,
    signals: mpsc::Receiver<WatchSignal>,
    expiries: mpsc::UnboundedReceiver<Expiry>,
    index: PathIndex,
    session: WatchSession,
    filter: EventFilter,
    orchestrator: ReloadOrchestrator,
    broadcaster: OutcomeBroadcaster,
    reloads: JoinSet<ReloadOutcome>,
    /// Reload task -> plugin it is reloading.
    running: HashMap<task::Id, PluginId>,
    /// Plugins that changed while their reload was in flight.
    deferred: HashSet<PluginId>,
    /// Callers of `reload_now` waiting for an in-flight attempt.
    waiters: HashMap<PluginId, Vec<oneshot::Sender<ReloadOutcome>>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    start_watching: bool,
}

pub(crate) struct CoordinatorParts {
    pub inbox: mpsc::Receiver<Command>,
    pub signals: mpsc::Receiver<WatchSignal>,
    pub expiries: mpsc::UnboundedReceiver<Expiry>,
    pub index: PathIndex,
    pub session: WatchSession,
    pub filter: EventFilter,
    pub orchestrator: ReloadOrchestrator,
    pub broadcaster: OutcomeBroadcaster,
    pub start_watching: bool,
}

impl Coordinator {
    pub(crate) fn new(parts: CoordinatorParts) -> Self {
        Self {
            inbox: parts.inbox,
            signals: parts.signals,
            expiries: parts.expiries,
            index: parts.index,
            session: parts.session,
            filter: parts.filter,
            orchestrator: parts.orchestrator,
            broadcaster: parts.broadcaster,
            reloads: JoinSet::new(),
            running: HashMap::new(),
            deferred: HashSet::new(),
            waiters: HashMap::new(),
            shutdown_waiters: Vec::new(),
            start_watching: parts.start_watching,
        }
    }

    /// Run until shutdown is requested or every handle is dropped.
    pub(crate) async fn run(mut self) {
        if self.start_watching {
            self.enable_watching().ok();
        }
        crate::debug_event!("pipeline", "started");

        loop {
            tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown_waiters.push(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(signal) = self.signals.recv() => self.handle_signal(signal),
                Some(expiry) = self.expiries.recv() => self.handle_expiry(expiry),
                Some(joined) = self.reloads.join_next_with_id(), if !self.reloads.is_empty() => {
                    self.handle_joined(joined);
                }
            }
        }

        self.stop().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { id, path, reply } => {
                let result = self.register(id, &path);
                let _ = reply.send(result);
            }
            Command::Deregister { id, reply } => {
                let _ = reply.send(self.deregister(&id));
            }
            Command::EnableWatching { reply } => {
                let _ = reply.send(self.enable_watching());
            }
            Command::DisableWatching { reply } => {
                self.disable_watching();
                let _ = reply.send(());
            }
            Command::Subscribe { callback, reply } => {
                self.broadcaster.add_callback(callback);
                let _ = reply.send(());
            }
            Command::Notify { id, at, reply } => {
                let known = self.index.contains(&id);
                if known {
                    self.record_change(id, at);
                }
                let _ = reply.send(known);
            }
            Command::ReloadNow { id, reply } => self.reload_now(id, reply),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => self.shutdown_waiters.push(reply),
        }
    }

    fn register(&mut self, id: PluginId, path: &Path) -> PipelineResult<()> {
        let registered = self.index.register(id.clone(), path)?;
        crate::log_event!("pipeline", "registered", "{id} at {}", registered.entry.display());
        self.refresh_watch();
        Ok(())
    }

    fn deregister(&mut self, id: &PluginId) -> bool {
        // A pending reload for a plugin that is going away must not fire
        self.session.debouncer_mut().cancel(id);
        self.deferred.remove(id);

        let removed = self.index.deregister(id).is_some();
        if removed {
            crate::log_event!("pipeline", "deregistered", "{id}");
            self.refresh_watch();
        }
        removed
    }

    /// Point the watch at the current registrations, if watching.
    fn refresh_watch(&mut self) {
        if let Err(e) = self.session.update(self.index.watch_dirs()) {
            tracing::warn!("[pipeline] watching disabled, manual reloads only: {e}");
        }
    }

    fn enable_watching(&mut self) -> PipelineResult<()> {
        self.session.setup(self.index.watch_dirs()).map(|kind| {
            crate::debug_event!("pipeline", "watching enabled", "{kind:?}");
        })
    }

    fn disable_watching(&mut self) {
        self.session.teardown();
        self.deferred.clear();
    }

    fn handle_signal(&mut self, signal: WatchSignal) {
        match signal {
            WatchSignal::Event(event) => self.handle_event(event),
            WatchSignal::Error(reason) => {
                tracing::warn!("[watcher] watch error: {reason}");
            }
        }
    }

    fn handle_event(&mut self, event: FileEvent) {
        // Events still queued from a released handle
        if !self.session.is_watching() {
            return;
        }

        if !self.filter.accepts(&event.path) {
            crate::debug_event!("watcher", "filtered", "{:?} {}", event.kind, event.path.display());
            return;
        }

        let Some(id) = self.index.resolve(&event.path).cloned() else {
            crate::debug_event!("watcher", "unrelated", "{:?} {}", event.kind, event.path.display());
            return;
        };

        crate::debug_event!("watcher", "changed", "{id}: {:?} {}", event.kind, event.path.display());
        self.record_change(id, Instant::now());
    }

    /// Open or extend the debounce window for `id`.
    ///
    /// While a reload of `id` runs, the change is parked and a fresh window
    /// opens once that reload reports.
    fn record_change(&mut self, id: PluginId, at: Instant) {
        if self.is_running(&id) {
            crate::debug_event!("pipeline", "deferred", "{id} (reload in flight)");
            self.deferred.insert(id);
            return;
        }
        self.session.debouncer_mut().notify(&id, at);
    }

    fn handle_expiry(&mut self, expiry: Expiry) {
        if let Some(id) = self.session.debouncer_mut().accept(&expiry) {
            self.start_reload(id);
        }
    }

    fn reload_now(&mut self, id: PluginId, reply: oneshot::Sender<ReloadOutcome>) {
        self.waiters.entry(id.clone()).or_default().push(reply);
        if self.is_running(&id) {
            return;
        }
        self.session.debouncer_mut().cancel(&id);
        self.start_reload(id);
    }

    fn is_running(&self, id: &PluginId) -> bool {
        self.running.values().any(|running| running == id)
    }

    fn start_reload(&mut self, id: PluginId) {
        let Some(path) = self.index.entry_path(&id).map(Path::to_path_buf) else {
            self.finish(ReloadOutcome::new(
                id,
                ReloadResult::Skipped(SkipReason::Unregistered),
            ));
            return;
        };

        crate::debug_event!("pipeline", "reloading", "{id}");
        let orchestrator = self.orchestrator.clone();
        let task_plugin = id.clone();
        let handle = self
            .reloads
            .spawn(async move { orchestrator.reload(&task_plugin, &path).await });
        self.running.insert(handle.id(), id);
    }

    fn handle_joined(&mut self, joined: Result<(task::Id, ReloadOutcome), JoinError>) {
        let (task_id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                let task_id = e.id();
                let Some(id) = self.running.get(&task_id).cloned() else {
                    tracing::error!("[pipeline] unknown reload task failed: {e}");
                    return;
                };
                tracing::error!("[pipeline] reload task for {id} died: {e}");
                let outcome = ReloadOutcome::new(
                    id,
                    ReloadResult::Failed(ReloadFailure::Interrupted {
                        reason: e.to_string(),
                    }),
                );
                (task_id, outcome)
            }
        };

        self.running.remove(&task_id);
        self.finish(outcome);
    }

    /// Record a terminal outcome and reopen a window for deferred changes.
    fn finish(&mut self, outcome: ReloadOutcome) {
        self.broadcaster.publish(&outcome);

        if let Some(waiters) = self.waiters.remove(&outcome.plugin_id) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }

        let id = outcome.plugin_id;
        if self.deferred.remove(&id) && self.index.contains(&id) {
            self.session.debouncer_mut().notify(&id, Instant::now());
        }
    }

    fn status(&self) -> PipelineStatus {
        let mut in_flight: Vec<PluginId> = self.running.values().cloned().collect();
        in_flight.sort();

        PipelineStatus {
            watching: self.session.is_watching(),
            watched_dirs: self.session.watched_dirs(),
            plugins: self
                .index
                .iter()
                .map(|(id, plugin)| (id.clone(), plugin.entry.clone()))
                .collect(),
            pending: self.session.debouncer().pending_ids(),
            in_flight,
        }
    }

    /// Tear down, let in-flight reloads finish, then release waiters.
    async fn stop(&mut self) {
        self.inbox.close();
        while let Ok(command) = self.inbox.try_recv() {
            if let Command::Shutdown { reply } = command {
                self.shutdown_waiters.push(reply);
            }
        }

        self.disable_watching();

        if !self.reloads.is_empty() {
            crate::debug_event!("pipeline", "draining", "{} reloads", self.reloads.len());
        }
        while let Some(joined) = self.reloads.join_next_with_id().await {
            self.handle_joined(joined);
        }
        self.deferred.clear();

        crate::log_event!("pipeline", "stopped");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
