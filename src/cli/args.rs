//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(
    name = "plugin-reload",
    version = env!("CARGO_PKG_VERSION"),
    about = "Reload plugins when their source files change",
    long_about = "Watch plugin source trees, debounce bursts of changes, then unload and reload the affected plugin.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Quick Start:\n  $ plugin-reload init\n  $ $EDITOR .plugin-reload/settings.toml   # add [plugins.<id>] and [host] commands\n  $ plugin-reload watch"
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true, env = "PLUGIN_RELOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log pipeline activity at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize project
    #[command(about = "Set up .plugin-reload directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Watch configured plugins and reload them on change
    #[command(
        about = "Watch plugin trees and reload on change",
        after_help = "Examples:\n  plugin-reload watch\n  plugin-reload watch --quiet-ms 500\n  plugin-reload watch --json | jq .result"
    )]
    Watch {
        /// Quiet period in milliseconds (overrides watch.quiet_period_ms)
        #[arg(long, value_name = "MS")]
        quiet_ms: Option<u64>,

        /// Print outcomes as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Report which configured plugin owns a path
    #[command(about = "Show the plugin a file belongs to")]
    Resolve {
        /// File or directory to look up
        path: PathBuf,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings from .plugin-reload/settings.toml")]
    Config,
}
