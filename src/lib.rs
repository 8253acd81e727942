//! Hot reload for plugin source trees.
//!
//! Register plugins by id and entry path, and the [`ReloadPipeline`] watches
//! their directory trees, coalesces bursts of changes per plugin, and runs
//! an unload followed by a load through your [`PluginHost`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use plugin_reload::{CommandHost, ReloadPipeline, config::HostConfig};
//! # async fn demo() -> Result<(), plugin_reload::ReloadError> {
//! let host = Arc::new(CommandHost::new(&HostConfig::default(), []));
//! let pipeline = ReloadPipeline::builder().host(host).build()?;
//!
//! pipeline.register_plugin("status-bar", "plugins/status-bar/init.lua").await?;
//! pipeline.enable_watching().await?;
//!
//! let mut outcomes = pipeline.outcomes();
//! while let Ok(outcome) = outcomes.recv().await {
//!     println!("{outcome}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod host;
pub mod logging;
pub mod reload;

pub use config::Settings;
pub use host::CommandHost;
pub use reload::{
    EventFilter, FileEvent, FileEventKind, MemoryBackend, NotifyBackend, PipelineBuilder,
    PipelineResult, PipelineStatus, PluginHost, PluginId, ReloadError, ReloadFailure,
    ReloadOutcome, ReloadPipeline, ReloadResult, SkipReason,
};
