//! Watch command - run the reload pipeline until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use crate::config::{CONFIG_DIR, CONFIG_FILE, Settings};
use crate::host::CommandHost;
use crate::reload::{PipelineBuilder, ReloadOutcome, ReloadResult};

/// Arguments for the watch command.
pub struct WatchArgs {
    pub quiet_ms: Option<u64>,
    pub json: bool,
}

/// Run the watch command.
pub async fn run(args: WatchArgs, settings: &Settings) -> anyhow::Result<()> {
    let mut watch_config = settings.watch.clone();
    if let Some(ms) = args.quiet_ms {
        watch_config.quiet_period_ms = ms;
    }

    let plugins = settings.plugin_paths();
    if plugins.is_empty() {
        eprintln!("No plugins configured. Add [plugins.<id>] entries to {CONFIG_DIR}/{CONFIG_FILE}");
    }

    let host = Arc::new(CommandHost::new(&settings.host, plugins.clone()));
    // Register everything first so the watch is set up once
    let pipeline = PipelineBuilder::from_config(&watch_config)?
        .host(host)
        .watching(false)
        .build()?;

    for (id, path) in plugins {
        pipeline
            .register_plugin(id.clone(), path)
            .await
            .with_context(|| format!("cannot register plugin '{id}'"))?;
    }

    let mut outcomes = pipeline.outcomes();

    if watch_config.enabled {
        if let Err(e) = pipeline.enable_watching().await {
            eprintln!("Warning: {e}");
            eprintln!("File watching is off; nothing will reload automatically.");
        }
    }

    let status = pipeline.status().await?;
    eprintln!(
        "Watching {} plugins in {} directories (quiet period {}ms). Press Ctrl-C to stop.",
        status.plugins.len(),
        status.watched_dirs.len(),
        watch_config.quiet_period_ms
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                eprintln!("Stopping...");
                break;
            }
            received = outcomes.recv() => match received {
                Ok(outcome) => print_outcome(&outcome, args.json)?,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("[cli] output fell behind, {missed} outcomes not shown");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    pipeline.shutdown().await?;
    // Reloads that were in flight at Ctrl-C report during shutdown
    while let Ok(outcome) = outcomes.try_recv() {
        print_outcome(&outcome, args.json)?;
    }

    Ok(())
}

fn print_outcome(outcome: &ReloadOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(outcome)?);
    } else {
        let time = chrono::Local::now().format("%H:%M:%S");
        let marker = match outcome.result {
            ReloadResult::Reloaded => "✓",
            ReloadResult::Skipped(_) => "-",
            ReloadResult::Failed(_) => "✗",
        };
        println!("[{time}] {marker} {outcome}");
    }
    Ok(())
}
