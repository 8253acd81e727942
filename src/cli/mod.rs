//! Command-line interface for the `plugin-reload` binary.

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};
