//! Per-plugin debouncing of change notifications.
//!
//! Each plugin has at most one live timer. A new change cancels the
//! pending timer and starts a fresh one, so a burst of saves (editor
//! auto-save, formatters, git checkouts) collapses into a single reload
//! fired one quiet period after the last change.
//!
//! Timers run as detached tasks and report expiry as a message on a
//! channel owned by the coordinator; they never touch shared state.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::PluginId;

/// Message sent by a timer task when its window closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub plugin_id: PluginId,
    /// Distinguishes this timer from earlier ones for the same plugin.
    pub generation: u64,
}

#[derive(Debug)]
struct PendingTimer {
    token: CancellationToken,
    generation: u64,
    deadline: Instant,
}

/// Cancel-and-reschedule timers keyed by plugin id.
#[derive(Debug)]
pub struct Debouncer {
    pending: HashMap<PluginId, PendingTimer>,
    quiet_period: Duration,
    next_generation: u64,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
}

impl Debouncer {
    /// Create a debouncer whose timers report on `expiry_tx`.
    pub fn new(quiet_period: Duration, expiry_tx: mpsc::UnboundedSender<Expiry>) -> Self {
        Self {
            pending: HashMap::new(),
            quiet_period,
            next_generation: 0,
            expiry_tx,
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Record a change for `id` observed at `at`.
    ///
    /// Cancels any pending timer for `id` and schedules a new one at
    /// `at + quiet_period`. Returns `true` if a pending timer was replaced.
    /// Must be called from within a tokio runtime.
    pub fn notify(&mut self, id: &PluginId, at: Instant) -> bool {
        let replaced = self.cancel_timer(id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = at + self.quiet_period;
        let token = CancellationToken::new();

        let expiry = Expiry {
            plugin_id: id.clone(),
            generation,
        };
        let tx = self.expiry_tx.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = sleep_until(deadline) => {
                    // Receiver gone means the coordinator stopped
                    let _ = tx.send(expiry);
                }
            }
        });

        self.pending.insert(
            id.clone(),
            PendingTimer {
                token,
                generation,
                deadline,
            },
        );

        crate::debug_event!(
            "debounce",
            if replaced { "extended" } else { "scheduled" },
            "{id} (generation {generation})"
        );
        replaced
    }

    /// Claim an expiry message.
    ///
    /// Returns the plugin id if `expiry` belongs to the live timer for that
    /// plugin, removing the timer entry. Expiries from cancelled or
    /// superseded timers return `None`: a timer that lost the race against
    /// its own cancellation never results in a reload.
    pub fn accept(&mut self, expiry: &Expiry) -> Option<PluginId> {
        match self.pending.get(&expiry.plugin_id) {
            Some(timer) if timer.generation == expiry.generation => {
                self.pending.remove(&expiry.plugin_id);
                Some(expiry.plugin_id.clone())
            }
            _ => {
                crate::debug_event!(
                    "debounce",
                    "stale expiry",
                    "{} (generation {})",
                    expiry.plugin_id,
                    expiry.generation
                );
                None
            }
        }
    }

    /// Cancel the pending timer for `id`, if any.
    pub fn cancel(&mut self, id: &PluginId) -> bool {
        let cancelled = self.cancel_timer(id);
        if cancelled {
            crate::debug_event!("debounce", "cancelled", "{id}");
        }
        cancelled
    }

    fn cancel_timer(&mut self, id: &PluginId) -> bool {
        match self.pending.remove(id) {
            Some(timer) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer, returning how many were live.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, timer) in self.pending.drain() {
            timer.token.cancel();
        }
        count
    }

    pub fn is_pending(&self, id: &PluginId) -> bool {
        self.pending.contains_key(id)
    }

    /// When the pending timer for `id` will fire.
    pub fn deadline(&self, id: &PluginId) -> Option<Instant> {
        self.pending.get(id).map(|timer| timer.deadline)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
