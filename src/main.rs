use clap::Parser;

use plugin_reload::cli::commands::{init, resolve, watch};
use plugin_reload::cli::{Cli, Commands};
use plugin_reload::config::Settings;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path).unwrap_or_else(|e| {
            eprintln!("Configuration error in {}: {e}", path.display());
            std::process::exit(1);
        }),
        None => Settings::load().unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            eprintln!("Using default configuration for now.");
            Settings::default()
        }),
    };

    plugin_reload::logging::init_with_config(&settings.logging, cli.verbose);

    let result = match cli.command {
        Commands::Init { force } => match std::env::current_dir() {
            Ok(dir) => init::run_init(&dir, force),
            Err(e) => Err(e.into()),
        },
        Commands::Config => init::run_config(&settings),
        Commands::Resolve { path } => resolve::run(&settings, &path),
        Commands::Watch { quiet_ms, json } => {
            watch::run(watch::WatchArgs { quiet_ms, json }, &settings).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
