//! Log setup for the reload pipeline and the CLI.
//!
//! Output is one compact line per event, timestamped to the millisecond,
//! filtered per component.
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! default = "warn"
//!
//! [logging.modules]
//! plugin_reload = "info"   # show reload outcomes
//! ```
//!
//! `RUST_LOG` wins over the config when it is set:
//! ```bash
//! RUST_LOG=plugin_reload=debug plugin-reload watch
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Wall-clock time as HH:MM:SS.mmm
struct WallClock;

impl FormatTime for WallClock {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Build the filter directive string for a logging config.
///
/// `verbose` raises the default level to `debug` for this crate only.
pub fn filter_directives(config: &LoggingConfig, verbose: bool) -> String {
    let mut directives = config.default.clone();
    if verbose {
        directives.push_str(",plugin_reload=debug");
    }
    for (module, level) in &config.modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    directives
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init_with_config(config: &LoggingConfig, verbose: bool) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config, verbose))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_timer(WallClock)
            .with_level(true)
            .with_filter(filter);

        // try_init: a host application may already own the global subscriber
        let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    });
}

/// Install the subscriber with `LoggingConfig::default()` (quiet).
pub fn init() {
    init_with_config(&LoggingConfig::default(), false);
}

/// Info-level event tagged with the emitting component.
///
/// ```ignore
/// log_event!("reload", "reloaded", "{id} in {ms}ms");
/// log_event!("session", "torn down");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Debug-level counterpart of [`log_event!`].
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}
