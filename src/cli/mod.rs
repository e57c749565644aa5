//! Command-line interface for swe-kiln.
//!
//! Provides the `build` and `validate` commands over the image pipeline.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
