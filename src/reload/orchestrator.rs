//! Unload/load sequencing against the external plugin subsystem.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::PluginId;
use super::outcome::{ReloadFailure, ReloadOutcome, ReloadResult, SkipReason};

/// The plugin subsystem the pipeline drives.
///
/// Calls may be slow; the pipeline never holds its own state locked while
/// awaiting them. Timeouts, if any, belong to the implementation.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Whether the subsystem currently knows `id`.
    async fn exists(&self, id: &PluginId) -> bool;

    async fn unload(&self, id: &PluginId) -> anyhow::Result<()>;

    async fn load(&self, id: &PluginId, path: &Path) -> anyhow::Result<()>;
}

/// Steps of a single reload attempt.
///
/// `Idle -> Unloading -> Loading -> Reloaded`, with `Failed` reachable from
/// either active step. Nothing re-enters `Unloading`; a new attempt starts
/// from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    Idle,
    Unloading,
    Loading,
    Reloaded,
    Failed,
}

impl ReloadPhase {
    pub fn can_advance_to(self, next: ReloadPhase) -> bool {
        matches!(
            (self, next),
            (ReloadPhase::Idle, ReloadPhase::Unloading)
                | (ReloadPhase::Unloading, ReloadPhase::Loading)
                | (ReloadPhase::Unloading, ReloadPhase::Failed)
                | (ReloadPhase::Loading, ReloadPhase::Reloaded)
                | (ReloadPhase::Loading, ReloadPhase::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReloadPhase::Reloaded | ReloadPhase::Failed)
    }
}

/// Progress record of one attempt, used for logging.
#[derive(Debug)]
struct Attempt<'a> {
    id: &'a PluginId,
    phase: ReloadPhase,
}

impl<'a> Attempt<'a> {
    fn new(id: &'a PluginId) -> Self {
        Self {
            id,
            phase: ReloadPhase::Idle,
        }
    }

    fn advance(&mut self, next: ReloadPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal reload transition {:?} -> {next:?}",
            self.phase
        );
        crate::debug_event!("reload", "phase", "{} {:?} -> {next:?}", self.id, self.phase);
        self.phase = next;
    }
}

/// Runs the unload -> load sequence and reports exactly one outcome.
///
/// The sequence is not atomic: if `load` fails the plugin stays unloaded.
/// No retry or rollback happens here; the outcome says what happened.
#[derive(Clone)]
pub struct ReloadOrchestrator {
    host: Arc<dyn PluginHost>,
}

impl ReloadOrchestrator {
    pub fn new(host: Arc<dyn PluginHost>) -> Self {
        Self { host }
    }

    /// Reload `id` from `path`.
    pub async fn reload(&self, id: &PluginId, path: &Path) -> ReloadOutcome {
        let started = Instant::now();
        let result = self.run(id, path).await;
        let outcome = ReloadOutcome::new(id.clone(), result)
            .with_elapsed_ms(started.elapsed().as_millis() as u64);

        match &outcome.result {
            ReloadResult::Reloaded => crate::log_event!("reload", "reloaded", "{outcome}"),
            ReloadResult::Skipped(_) => crate::debug_event!("reload", "skipped", "{outcome}"),
            ReloadResult::Failed(_) => tracing::warn!("[reload] {outcome}"),
        }
        outcome
    }

    async fn run(&self, id: &PluginId, path: &Path) -> ReloadResult {
        if !self.host.exists(id).await {
            return ReloadResult::Skipped(SkipReason::NotFound);
        }

        let mut attempt = Attempt::new(id);

        attempt.advance(ReloadPhase::Unloading);
        if let Err(e) = self.host.unload(id).await {
            attempt.advance(ReloadPhase::Failed);
            return ReloadResult::Failed(ReloadFailure::Unload {
                reason: format!("{e:#}"),
            });
        }

        attempt.advance(ReloadPhase::Loading);
        if let Err(e) = self.host.load(id, path).await {
            attempt.advance(ReloadPhase::Failed);
            return ReloadResult::Failed(ReloadFailure::Load {
                reason: format!("{e:#}"),
            });
        }

        attempt.advance(ReloadPhase::Reloaded);
        debug_assert!(attempt.phase.is_terminal());
        ReloadResult::Reloaded
    }
}
