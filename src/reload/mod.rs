//! Debounced hot reload of plugins on file change.
//!
//! Registered plugins own a directory tree. Changes anywhere in a tree are
//! resolved to the owning plugin, debounced per plugin, and turned into an
//! unload followed by a load against the host's plugin subsystem.
//!
//! # Architecture
//!
//! ```text
//! ReloadPipeline (cloneable handle)
//!         |  commands
//!         v
//! Coordinator task ----------------------------+
//!   - PathIndex      (path -> plugin)          |
//!   - WatchSession   (watch handle + timers)   |  spawns
//!   - EventFilter                              v
//!         ^      ^                     ReloadOrchestrator
//!         |      |                       unload -> load
//!   WatchBackend  Debouncer expiries            |
//!   (notify or in-memory)                       v
//!                                      OutcomeBroadcaster
//! ```
//!
//! All pipeline state lives in the coordinator task. Watch callbacks and
//! timers only send messages to it.

mod backend;
mod coordinator;
mod debouncer;
mod error;
mod event;
mod id;
mod orchestrator;
mod outcome;
mod path_index;
mod pipeline;
mod session;

pub use backend::{EventSink, MemoryBackend, NotifyBackend, WatchBackend, WatchGuard, WatchSignal};
pub use coordinator::PipelineStatus;
pub use debouncer::{Debouncer, Expiry};
pub use error::{PipelineResult, ReloadError};
pub use event::{EventFilter, FileEvent, FileEventKind};
pub use id::PluginId;
pub use orchestrator::{PluginHost, ReloadOrchestrator, ReloadPhase};
pub use outcome::{
    OutcomeBroadcaster, OutcomeCallback, ReloadFailure, ReloadOutcome, ReloadResult, SkipReason,
};
pub use path_index::{PathIndex, RegisteredPlugin, canonicalize_lossy, normalize_lexically};
pub use pipeline::{PipelineBuilder, ReloadPipeline};
pub use session::{SetupKind, TeardownReport, WatchHandle, WatchSession};
