//! Command line arguments
// (c) 2026 The muxrpc authors

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::styles::CLAP_STYLES;
use crate::config::ConfigurationOverrides;
use crate::protocol::CallType;

#[derive(Debug, Parser, Clone)]
#[command(
    author,
    version,
    about,
    styles = CLAP_STYLES,
    infer_long_args(true),
    subcommand_required(false)
)]
#[allow(clippy::struct_excessive_bools)]
/// A muxrpc peer for local debugging.
///
/// Connections are plain TCP; there is no secret handshake.
pub(crate) struct CliArgs {
    /// What to do
    #[command(subcommand)]
    pub(crate) mode: Option<Mode>,

    /// Enable detailed debug output
    ///
    /// This has the same effect as setting `RUST_LOG=muxrpc=debug` in the environment.
    /// If present, `RUST_LOG` overrides this option.
    #[arg(short, long, action, global = true, help_heading("Debug"))]
    pub(crate) debug: bool,

    /// Quiet mode: report only errors
    #[arg(
        short,
        long,
        action,
        global = true,
        conflicts_with("debug"),
        help_heading("Output")
    )]
    pub(crate) quiet: bool,

    /// Log to a file
    ///
    /// By default the log receives everything printed to stderr.
    /// To override this behaviour, set the environment variable `RUST_LOG_FILE_DETAIL` (same semantics as `RUST_LOG`).
    #[arg(
        short('l'),
        long,
        value_name("FILE"),
        global = true,
        help_heading("Output")
    )]
    pub(crate) log_file: Option<PathBuf>,

    /// Read configuration from this file, in addition to the user configuration file
    #[arg(long, value_name("FILE"), global = true, help_heading("Configuration"))]
    pub(crate) config: Option<PathBuf>,

    /// Outputs the paths to configuration file(s), then exits
    #[arg(long, help_heading("Configuration"))]
    pub(crate) config_files: bool,

    #[command(flatten)]
    pub(crate) overrides: ConfigurationOverrides,
}

/// Operating modes
#[derive(Debug, Subcommand, Clone)]
pub(crate) enum Mode {
    /// Accepts connections and serves the demonstration methods
    Serve {
        /// Address to listen on [default: from configuration]
        #[arg(long, value_name("ADDR"))]
        listen: Option<String>,
    },
    /// Connects to a peer, makes one call and prints the result
    Call(CallArgs),
}

/// Arguments for `call` mode
#[derive(Debug, Args, Clone)]
pub(crate) struct CallArgs {
    /// Peer address, as HOST:PORT
    #[arg(value_name("ADDR"))]
    pub(crate) addr: String,

    /// Method name, dotted (e.g. `blobs.get`)
    #[arg(value_name("METHOD"))]
    pub(crate) method: String,

    /// Call arguments, as JSON. A single non-array value is sent as the only argument.
    #[arg(value_name("ARGS_JSON"))]
    pub(crate) args: Option<String>,

    /// Call type
    #[arg(long = "type", value_name("TYPE"), default_value_t = CallType::Async)]
    pub(crate) call_type: CallType,
}
