//! Resolve command - which configured plugin owns a path.

use std::path::Path;

use anyhow::bail;

use crate::config::Settings;
use crate::reload::{PathIndex, PluginId, canonicalize_lossy};

/// Look up the owner of `path` among the configured plugins.
pub fn resolve(settings: &Settings, path: &Path) -> Option<PluginId> {
    let mut index = PathIndex::new(settings.watch.nested_plugins);
    for (id, plugin_path) in settings.plugin_paths() {
        if let Err(e) = index.register(id, &plugin_path) {
            tracing::warn!("[cli] skipping plugin: {e}");
        }
    }
    index.resolve(&canonicalize_lossy(path)).cloned()
}

pub fn run(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    match resolve(settings, path) {
        Some(id) => {
            println!("{id}");
            Ok(())
        }
        None => bail!("no configured plugin owns {}", path.display()),
    }
}
