//! Plugin host that drives an external subsystem through shell commands.
//!
//! The `[host]` section of the settings holds two templates:
//!
//! ```toml
//! [host]
//! load_command = "my-editor --remote {id} --load {path}"
//! unload_command = "echo unloading {id}"
//! ```
//!
//! The command runs under `sh -c` with the id and path passed as positional
//! parameters. `{id}` and `{path}` become `"$1"` and `"$2"`, so each stands
//! for exactly one shell word whatever characters the value holds. Write
//! placeholders outside of quotes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use crate::config::HostConfig;
use crate::reload::{PluginHost, PluginId};

/// [`PluginHost`] backed by `load_command` / `unload_command` templates.
///
/// A missing template makes that step a no-op. The host considers an id to
/// exist if it was passed to [`CommandHost::new`] or has been loaded since.
pub struct CommandHost {
    load_command: Option<String>,
    unload_command: Option<String>,
    /// Known plugins and the path they were last loaded from.
    known: Mutex<HashMap<PluginId, Option<PathBuf>>>,
}

impl CommandHost {
    pub fn new(config: &HostConfig, initial: impl IntoIterator<Item = (PluginId, PathBuf)>) -> Self {
        Self {
            load_command: config.load_command.clone(),
            unload_command: config.unload_command.clone(),
            known: Mutex::new(
                initial
                    .into_iter()
                    .map(|(id, path)| (id, Some(path)))
                    .collect(),
            ),
        }
    }

    async fn run(&self, template: &str, id: &PluginId, path: Option<&Path>) -> anyhow::Result<()> {
        let script = expand_template(template);
        let path = path.map(|p| p.as_os_str().to_owned()).unwrap_or_default();
        crate::debug_event!("host", "running", "{script} ({id}, {})", path.to_string_lossy());

        let output = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .arg(SCRIPT_NAME)
            .arg(id.as_str())
            .arg(&path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{script}`"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if stderr.is_empty() {
                bail!("`{script}` exited with {}", output.status);
            }
            bail!("{stderr}");
        }
        Ok(())
    }
}

#[async_trait]
impl PluginHost for CommandHost {
    async fn exists(&self, id: &PluginId) -> bool {
        self.known.lock().contains_key(id)
    }

    async fn unload(&self, id: &PluginId) -> anyhow::Result<()> {
        let Some(template) = &self.unload_command else {
            return Ok(());
        };
        let path = self.known.lock().get(id).cloned().flatten();
        self.run(template, id, path.as_deref()).await
    }

    async fn load(&self, id: &PluginId, path: &Path) -> anyhow::Result<()> {
        if let Some(template) = &self.load_command {
            self.run(template, id, Some(path)).await?;
        }
        self.known.lock().insert(id.clone(), Some(path.to_path_buf()));
        Ok(())
    }
}

/// `$0` of the spawned shell.
const SCRIPT_NAME: &str = "plugin-reload";

/// Point the placeholders at the positional parameters. Values never pass
/// through the shell parser.
fn expand_template(template: &str) -> String {
    template.replace("{id}", "\"$1\"").replace("{path}", "\"$2\"")
}
