//! Terminal reload outcomes and their delivery to subscribers.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use super::PluginId;

/// Why a reload was skipped without touching the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The plugin subsystem does not know the id.
    NotFound,
    /// The id has no registered path to load from.
    Unregistered,
}

/// Which step of the unload/load sequence failed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ReloadFailure {
    #[error("unload failed: {reason}")]
    Unload { reason: String },

    #[error("load failed: {reason}")]
    Load { reason: String },

    /// The reload task died before reporting.
    #[error("reload interrupted: {reason}")]
    Interrupted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ReloadResult {
    Reloaded,
    Skipped(SkipReason),
    Failed(ReloadFailure),
}

/// Result of one debounced (or manual) reload trigger. Reported once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadOutcome {
    pub plugin_id: PluginId,
    #[serde(flatten)]
    pub result: ReloadResult,
    /// Wall time spent in the plugin subsystem.
    pub elapsed_ms: u64,
}

impl ReloadOutcome {
    pub fn new(plugin_id: PluginId, result: ReloadResult) -> Self {
        Self {
            plugin_id,
            result,
            elapsed_ms: 0,
        }
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn is_reloaded(&self) -> bool {
        self.result == ReloadResult::Reloaded
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.result, ReloadResult::Failed(_))
    }
}

impl fmt::Display for ReloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            ReloadResult::Reloaded => {
                write!(f, "{}: reloaded in {}ms", self.plugin_id, self.elapsed_ms)
            }
            ReloadResult::Skipped(SkipReason::NotFound) => {
                write!(f, "{}: skipped (not found)", self.plugin_id)
            }
            ReloadResult::Skipped(SkipReason::Unregistered) => {
                write!(f, "{}: skipped (not registered)", self.plugin_id)
            }
            ReloadResult::Failed(failure) => write!(f, "{}: {failure}", self.plugin_id),
        }
    }
}

/// Callback invoked with every terminal outcome.
pub type OutcomeCallback = Arc<dyn Fn(&ReloadOutcome) + Send + Sync>;

/// Fans outcomes out to callbacks and broadcast receivers.
pub struct OutcomeBroadcaster {
    sender: broadcast::Sender<ReloadOutcome>,
    callbacks: Vec<OutcomeCallback>,
}

impl OutcomeBroadcaster {
    /// Create a broadcaster with the given receiver lag capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            callbacks: Vec::new(),
        }
    }

    pub fn add_callback(&mut self, callback: OutcomeCallback) {
        self.callbacks.push(callback);
    }

    /// Receiver for outcomes published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadOutcome> {
        self.sender.subscribe()
    }

    /// Clone of the sending side, for handles that hand out receivers.
    pub fn sender(&self) -> broadcast::Sender<ReloadOutcome> {
        self.sender.clone()
    }

    pub fn publish(&self, outcome: &ReloadOutcome) {
        for callback in &self.callbacks {
            callback(outcome);
        }

        match self.sender.send(outcome.clone()) {
            Ok(count) => {
                crate::debug_event!("pipeline", "published", "{outcome} to {count} receivers");
            }
            Err(_) => {
                // No receivers, callbacks may still have seen it
                crate::debug_event!("pipeline", "no receivers", "{outcome}");
            }
        }
    }
}
