//! Command Line Interface for muxrpc
// (c) 2026 The muxrpc authors
mod args;
mod cli_main;
mod demo;
mod peer;
pub(crate) mod styles;
pub use cli_main::cli;
