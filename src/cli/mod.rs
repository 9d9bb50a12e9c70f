//! Command-line interface for jobforge.
//!
//! Provides the worker process entry point and operator commands for
//! enqueueing jobs, inspecting stats and signalling live processes.

pub mod builtin_jobs;
mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
