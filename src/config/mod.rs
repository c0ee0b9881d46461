// (c) 2026 The muxrpc authors
//! # Configuration management
//!
//! muxrpc obtains run-time configuration from the following sources, highest priority first:
//! 1. Command-line options
//! 1. Environment variables prefixed `MUXRPC_`, e.g. `MUXRPC_QUEUE_DEPTH=50`
//! 1. A configuration file given with `--config`
//! 1. The user's configuration file
//!    * On Unix, this is `~/.config/muxrpc/muxrpc.toml`
//!    * On Windows, this is `%AppData%\Roaming\muxrpc\muxrpc.toml`
//! 1. Hard-wired defaults
//!
//! Run `muxrpc --config-files` for the list of files we look for.
//!
//! Each option may appear in multiple places; the highest priority source wins.
//!
//! ## File format
//!
//! Configuration files are [TOML](https://toml.io/). Field names are as in [Configuration].
//!
//! ## Example
//!
//! ```text
//! # Peers on this network send large blobs
//! max_body_size = 4194304
//! queue_depth = 300
//! listen = "0.0.0.0:8008"
//! time_format = "utc"
//! ```

pub(crate) mod structure;
pub use structure::{Configuration, ConfigurationOverrides};

mod sysdefault;
use sysdefault::SystemDefault;

mod manager;
pub use manager::Manager;

pub(crate) const BASE_CONFIG_FILENAME: &str = "muxrpc.toml";
pub(crate) const ENV_PREFIX: &str = "MUXRPC_";
