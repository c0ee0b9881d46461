//! Main CLI for muxrpc
// (c) 2026 The muxrpc authors

use std::ffi::OsString;
use std::io::IsTerminal as _;
use std::process::ExitCode;

use anstream::{eprintln, println};
use anyhow::Result;
use clap::Parser as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::args::{CliArgs, Mode};
use super::styles::{ERROR, RESET};
use crate::config::{Configuration, Manager};
use crate::util::{setup_tracing, trace_level, tracing_is_initialised};

/// Main CLI entrypoint
///
/// Call this from `main`, passing the arguments to use.
/// Normally you will call `cli(std::env::args_os())` but you can pass in alternate arguments for CLI testing.
#[must_use]
pub fn cli<I, T>(args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    cli_inner(args)
        .inspect_err(|e| {
            if tracing_is_initialised() {
                tracing::error!("{e:#}");
            } else {
                eprintln!("{ERROR}Error:{RESET} {e:#}");
            }
        })
        .map_or(ExitCode::FAILURE, |()| ExitCode::SUCCESS)
}

fn cli_inner<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    use clap::error::ErrorKind::{DisplayHelp, DisplayVersion};
    let args = match CliArgs::try_parse_from(args) {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), DisplayHelp | DisplayVersion) => {
            e.print()?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if args.config_files {
        println!("{:?}", Manager::config_files());
        return Ok(());
    }
    let Some(mode) = args.mode.clone() else {
        anyhow::bail!("no mode given; try --help");
    };

    let config = configuration(&args)?;
    setup_tracing(
        trace_level(args.debug, args.quiet),
        args.log_file.as_deref(),
        config.time_format,
        std::io::stderr().is_terminal(),
    )?; // to provoke an error: set RUST_LOG=.
    debug!("configuration: {config:?}");

    handle_mode(mode, &config)
}

/// Folds the command line in with the other configuration sources
fn configuration(args: &CliArgs) -> Result<Configuration> {
    let mut manager = Manager::standard(args.config.as_deref());
    manager.merge_provider(args.overrides.clone());
    manager.validated()
}

#[tokio::main]
async fn handle_mode(mode: Mode, config: &Configuration) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let _ = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                cancel.cancel();
            }
        });
    }

    match mode {
        Mode::Serve { listen } => {
            let listen = listen.as_deref().unwrap_or(&config.listen);
            super::peer::serve_main(config, listen, &cancel).await
        }
        Mode::Call(args) => super::peer::call_main(config, &args, &cancel).await,
    }
}
