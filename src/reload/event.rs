//! File change events and the filter deciding which ones trigger a reload.

use std::path::{Path, PathBuf};

use glob::Pattern;
use notify::EventKind;
use notify::event::ModifyKind;

use crate::config::WatchConfig;

use super::error::ReloadError;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

/// A single change notification from the watch backend.
///
/// Transient: consumed by the coordinator and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Translate a raw notify event, one `FileEvent` per affected path.
    ///
    /// Access and unclassified events produce nothing.
    pub fn from_notify(event: notify::Event) -> Vec<FileEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Created,
            EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Renamed,
            EventKind::Modify(_) => FileEventKind::Modified,
            EventKind::Remove(_) => FileEventKind::Removed,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
        };

        event
            .paths
            .into_iter()
            .map(|path| FileEvent { path, kind })
            .collect()
    }
}

/// Decides which files inside a plugin tree count as reload-triggering.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Lowercased extensions without the leading dot; empty accepts all.
    extensions: Vec<String>,
    ignore: Vec<Pattern>,
}

impl EventFilter {
    pub fn new<E, P>(extensions: E, ignore_patterns: P) -> Result<Self, ReloadError>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        let ignore = ignore_patterns
            .into_iter()
            .map(|pattern| {
                Pattern::new(pattern.as_ref()).map_err(|e| ReloadError::Config {
                    reason: format!("bad ignore pattern '{}': {e}", pattern.as_ref()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { extensions, ignore })
    }

    pub fn from_config(config: &WatchConfig) -> Result<Self, ReloadError> {
        Self::new(&config.extensions, &config.ignore_patterns)
    }

    /// Accept every path.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn accepts(&self, path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if self.ignore.iter().any(|pattern| pattern.matches(name)) {
                return false;
            }
        }

        if self.extensions.is_empty() {
            return true;
        }

        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }
}
