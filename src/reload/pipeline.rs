//! Public handle to a running reload pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::config::WatchConfig;

use super::PluginId;
use super::backend::{EventSink, NotifyBackend, WatchBackend};
use super::coordinator::{Command, Coordinator, CoordinatorParts, PipelineStatus};
use super::debouncer::Debouncer;
use super::error::{PipelineResult, ReloadError};
use super::event::EventFilter;
use super::orchestrator::{PluginHost, ReloadOrchestrator};
use super::outcome::{OutcomeBroadcaster, OutcomeCallback, ReloadOutcome};
use super::path_index::PathIndex;
use super::session::WatchSession;

const OUTCOME_CAPACITY: usize = 128;

/// Cloneable handle to the coordinator task.
///
/// Every method is a message to the coordinator; once it has stopped they
/// return [`ReloadError::PipelineClosed`]. The coordinator stops on
/// [`shutdown`](Self::shutdown) or when the last handle is dropped.
#[derive(Clone)]
pub struct ReloadPipeline {
    tx: mpsc::Sender<Command>,
    outcomes: broadcast::Sender<ReloadOutcome>,
}

impl ReloadPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> PipelineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ReloadError::PipelineClosed)?;
        rx.await.map_err(|_| ReloadError::PipelineClosed)
    }

    /// Associate `id` with the plugin entry at `path`.
    ///
    /// Re-registering an id moves it; the old tree stops resolving to it.
    pub async fn register_plugin(
        &self,
        id: impl Into<PluginId>,
        path: impl Into<PathBuf>,
    ) -> PipelineResult<()> {
        let (id, path) = (id.into(), path.into());
        self.request(|reply| Command::Register { id, path, reply })
            .await?
    }

    /// Forget `id`, cancelling any pending reload. Returns whether it was known.
    pub async fn deregister_plugin(&self, id: impl Into<PluginId>) -> PipelineResult<bool> {
        let id = id.into();
        self.request(|reply| Command::Deregister { id, reply }).await
    }

    /// Start watching every registered tree.
    ///
    /// On failure watching stays off; manual reloads keep working.
    pub async fn enable_watching(&self) -> PipelineResult<()> {
        self.request(|reply| Command::EnableWatching { reply })
            .await?
    }

    /// Stop watching and cancel pending reloads. Safe to call repeatedly.
    pub async fn disable_watching(&self) -> PipelineResult<()> {
        self.request(|reply| Command::DisableWatching { reply })
            .await
    }

    /// Call `callback` with every outcome, on the coordinator task.
    ///
    /// Keep it short; slow callbacks delay the pipeline.
    pub async fn subscribe<F>(&self, callback: F) -> PipelineResult<()>
    where
        F: Fn(&ReloadOutcome) + Send + Sync + 'static,
    {
        let callback: OutcomeCallback = Arc::new(callback);
        self.request(|reply| Command::Subscribe { callback, reply })
            .await
    }

    /// Receiver of outcomes published from now on.
    pub fn outcomes(&self) -> broadcast::Receiver<ReloadOutcome> {
        self.outcomes.subscribe()
    }

    /// Report a change to `id` directly, without a filesystem event.
    ///
    /// Returns `false` if `id` is not registered.
    pub async fn notify(&self, id: impl Into<PluginId>) -> PipelineResult<bool> {
        let id = id.into();
        let at = Instant::now();
        self.request(|reply| Command::Notify { id, at, reply })
            .await
    }

    /// Reload `id` immediately and wait for the outcome.
    ///
    /// A pending debounce window for `id` is dropped. If a reload is already
    /// running, its outcome is returned instead of starting another.
    pub async fn reload_now(&self, id: impl Into<PluginId>) -> PipelineResult<ReloadOutcome> {
        let id = id.into();
        self.request(|reply| Command::ReloadNow { id, reply })
            .await
    }

    pub async fn status(&self) -> PipelineResult<PipelineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop the coordinator after in-flight reloads report.
    ///
    /// Calling it on a stopped pipeline is a no-op.
    pub async fn shutdown(&self) -> PipelineResult<()> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(ReloadError::PipelineClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Builder for a [`ReloadPipeline`].
pub struct PipelineBuilder {
    host: Option<Arc<dyn PluginHost>>,
    backend: Option<Box<dyn WatchBackend>>,
    filter: EventFilter,
    quiet_period: Duration,
    nested_plugins: bool,
    inbox_capacity: usize,
    watching: bool,
    plugins: Vec<(PluginId, PathBuf)>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        let defaults = WatchConfig::default();
        Self {
            host: None,
            backend: None,
            filter: EventFilter::allow_all(),
            quiet_period: defaults.quiet_period(),
            nested_plugins: defaults.nested_plugins,
            inbox_capacity: defaults.inbox_capacity,
            watching: defaults.enabled,
            plugins: Vec::new(),
        }
    }

    /// Take quiet period, filter, nesting and watch flag from `[watch]`.
    pub fn from_config(config: &WatchConfig) -> PipelineResult<Self> {
        Ok(Self::new()
            .quiet_period(config.quiet_period())
            .filter(EventFilter::from_config(config)?)
            .nested_plugins(config.nested_plugins)
            .inbox_capacity(config.inbox_capacity)
            .watching(config.enabled))
    }

    /// The plugin subsystem to drive. Required.
    pub fn host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Watch primitive. Defaults to [`NotifyBackend`].
    pub fn backend(mut self, backend: impl WatchBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    pub fn nested_plugins(mut self, allow: bool) -> Self {
        self.nested_plugins = allow;
        self
    }

    pub fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// Start watching as soon as the pipeline runs.
    pub fn watching(mut self, enabled: bool) -> Self {
        self.watching = enabled;
        self
    }

    /// Register a plugin before the pipeline starts.
    pub fn plugin(mut self, id: impl Into<PluginId>, path: impl Into<PathBuf>) -> Self {
        self.plugins.push((id.into(), path.into()));
        self
    }

    /// Spawn the coordinator on the current tokio runtime.
    pub fn build(self) -> PipelineResult<ReloadPipeline> {
        let host = self.host.ok_or_else(|| ReloadError::Config {
            reason: "a plugin host is required".to_string(),
        })?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| ReloadError::Config {
            reason: format!("reload pipeline needs a tokio runtime: {e}"),
        })?;

        let mut index = PathIndex::new(self.nested_plugins);
        for (id, path) in &self.plugins {
            index.register(id.clone(), path)?;
        }

        let capacity = self.inbox_capacity.max(1);
        let (tx, inbox) = mpsc::channel(capacity);
        let (sink, signals) = EventSink::channel(capacity);
        let (expiry_tx, expiries) = mpsc::unbounded_channel();

        let backend = self
            .backend
            .unwrap_or_else(|| Box::new(NotifyBackend::new()));
        let session = WatchSession::new(backend, sink, Debouncer::new(self.quiet_period, expiry_tx));

        let broadcaster = OutcomeBroadcaster::new(OUTCOME_CAPACITY);
        let outcomes = broadcaster.sender();

        let coordinator = Coordinator::new(CoordinatorParts {
            inbox,
            signals,
            expiries,
            index,
            session,
            filter: self.filter,
            orchestrator: ReloadOrchestrator::new(host),
            broadcaster,
            start_watching: self.watching,
        });
        runtime.spawn(coordinator.run());

        Ok(ReloadPipeline { tx, outcomes })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
