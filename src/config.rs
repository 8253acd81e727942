//! Layered configuration for the reload pipeline.
//!
//! Sources, lowest precedence first:
//! - built-in defaults
//! - `.plugin-reload/settings.toml` (searched upward from the current directory)
//! - environment variables
//!
//! # Environment Variables
//!
//! Variables are prefixed with `PLUGIN_RELOAD_` and use double underscores
//! to separate nested levels:
//! - `PLUGIN_RELOAD_WATCH__QUIET_PERIOD_MS=500` sets `watch.quiet_period_ms`
//! - `PLUGIN_RELOAD_WATCH__ENABLED=false` sets `watch.enabled`
//! - `PLUGIN_RELOAD_LOGGING__DEFAULT=info` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reload::PluginId;

/// Directory holding the settings file.
pub const CONFIG_DIR: &str = ".plugin-reload";
/// Settings file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "settings.toml";
/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PLUGIN_RELOAD_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory relative plugin paths are resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Commands used by the shell-backed plugin host
    #[serde(default)]
    pub host: HostConfig,

    /// Plugins to register at startup, keyed by plugin id
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginEntry>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatchConfig {
    /// Start with filesystem watching switched on
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period in milliseconds before a burst of changes becomes a reload
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// File extensions that trigger a reload (empty means every file)
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Glob patterns on file names that never trigger a reload
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// Allow a plugin tree to live inside another plugin's tree
    #[serde(default = "default_true")]
    pub nested_plugins: bool,

    /// Capacity of the coordinator's command inbox
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Level applied to every target without an override
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target level overrides
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct HostConfig {
    /// Shell template run to load a plugin; `{id}` and `{path}` are substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_command: Option<String>,

    /// Shell template run to unload a plugin; `{id}` and `{path}` are substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unload_command: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PluginEntry {
    /// Entry point of the plugin (file or directory)
    pub path: PathBuf,
}

fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_quiet_period_ms() -> u64 {
    250
}
fn default_inbox_capacity() -> usize {
    256
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_ignore_patterns() -> Vec<String> {
    vec![
        "*.swp".to_string(),
        "*.swx".to_string(),
        "*~".to_string(),
        ".#*".to_string(),
        "4913".to_string(),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            workspace_root: None,
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
            host: HostConfig::default(),
            plugins: BTreeMap::new(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet_period_ms: default_quiet_period_ms(),
            extensions: Vec::new(),
            ignore_patterns: default_ignore_patterns(),
            nested_plugins: true,
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: BTreeMap::new(),
        }
    }
}

impl WatchConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

impl Settings {
    /// Load configuration from all sources, discovering the settings file.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::figment(&config_path)
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                if settings.workspace_root.is_none() {
                    settings.workspace_root = Self::workspace_root();
                }
                settings
            })
    }

    /// Load configuration from a specific file (plus defaults and environment).
    ///
    /// The workspace root defaults to the directory containing
    /// `.plugin-reload/`, or the file's own directory otherwise.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        let path = path.as_ref();
        Self::figment(path)
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                if settings.workspace_root.is_none() {
                    settings.workspace_root = root_for_config_file(path);
                }
                settings
            })
    }

    fn figment(config_path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // `__` separates nesting levels, single `_` stays inside field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find `.plugin-reload/settings.toml` from the current directory upward.
    fn find_workspace_config() -> Option<PathBuf> {
        Self::workspace_root().map(|root| root.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Directory containing `.plugin-reload/`, searched upward from cwd.
    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .find(|ancestor| ancestor.join(CONFIG_DIR).is_dir())
            .map(Path::to_path_buf)
    }

    /// Configured plugins with relative paths resolved against the workspace root.
    pub fn plugin_paths(&self) -> Vec<(PluginId, PathBuf)> {
        self.plugins
            .iter()
            .map(|(id, entry)| {
                let path = match (&self.workspace_root, entry.path.is_relative()) {
                    (Some(root), true) => root.join(&entry.path),
                    _ => entry.path.clone(),
                };
                (PluginId::from(id.as_str()), path)
            })
            .collect()
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create `.plugin-reload/settings.toml` in `dir` with default values.
    pub fn init_config_file(dir: &Path, force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = dir.join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}

fn root_for_config_file(path: &Path) -> Option<PathBuf> {
    let parent = path.parent()?;
    if parent.file_name().is_some_and(|name| name == CONFIG_DIR) {
        parent.parent().map(Path::to_path_buf)
    } else if parent.as_os_str().is_empty() {
        std::env::current_dir().ok()
    } else {
        Some(parent.to_path_buf())
    }
}
