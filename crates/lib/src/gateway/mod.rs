//! Gateway: owns the pipeline for the lifetime of the process.
//!
//! Builds the outbound queue, limiters, dispatcher and poller, serves a small HTTP
//! status endpoint, and shuts everything down in order on SIGINT/SIGTERM.

mod commands;
mod server;

pub use commands::register_builtins;
pub use server::{run_gateway, run_with_api};
