//! Command-line interface for queue operations.
//!
//! Provides ops commands over the store (status, queue inspection and
//! cleanup) plus a bare worker runner.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
