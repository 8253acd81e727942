//! Error types for the reload pipeline.

use std::path::PathBuf;
use thiserror::Error;

use super::PluginId;

/// Errors from pipeline operations.
///
/// Failures of the plugin subsystem during a reload are not errors at this
/// level; they travel as [`ReloadFailure`](super::ReloadFailure) inside a
/// terminal outcome.
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("Path {path} is already owned by plugin '{existing}', cannot register '{requested}'")]
    DuplicatePath {
        path: PathBuf,
        existing: PluginId,
        requested: PluginId,
    },

    #[error("Cannot watch {path}: {reason}")]
    WatchSetup { path: PathBuf, reason: String },

    #[error("Reload pipeline has shut down")]
    PipelineClosed,

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl From<notify::Error> for ReloadError {
    fn from(e: notify::Error) -> Self {
        ReloadError::WatchSetup {
            path: e.paths.first().cloned().unwrap_or_default(),
            reason: e.to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, ReloadError>;
