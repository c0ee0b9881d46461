//! Log output for the `muxrpc` binary
// (c) 2026 The muxrpc authors

use std::{fs::File, path::Path, sync::Arc};

use anyhow::Context as _;
use serde::{Deserialize, Serialize, de};
use strum::VariantNames as _;
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{
        MakeWriter,
        format::Writer,
        time::{ChronoLocal, ChronoUtc, FormatTime},
    },
    prelude::*,
    registry::LookupSpan,
};

/// Filter for console output, in `EnvFilter` syntax
const CONSOLE_FILTER_VAR: &str = "RUST_LOG";
/// Filter for the log file, if different from the console
const FILE_FILTER_VAR: &str = "RUST_LOG_FILE_DETAIL";

/// Maps the verbosity flags to a level
#[must_use]
pub fn trace_level(debug: bool, quiet: bool) -> &'static str {
    match (debug, quiet) {
        (true, _) => "debug",
        (false, true) => "error",
        (false, false) => "info",
    }
}

/// How log lines are time stamped
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
    clap::ValueEnum,
    Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "kebab-case")]
pub enum TimeFormat {
    /// Local wall clock, `2026-10-18 09:55:06L`
    #[default]
    Local,
    /// UTC, `2026-10-18 08:55:06Z`
    Utc,
    /// Local time in RFC 3339 form, `2026-10-18T09:55:06+01:00`
    Rfc3339,
}

// Accepts any case, so `UTC` in a config file works
impl<'de> Deserialize<'de> for TimeFormat {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.to_ascii_lowercase()
            .parse()
            .map_err(|_| de::Error::unknown_variant(&s, TimeFormat::VARIANTS))
    }
}

/// The timer behind a [`TimeFormat`]
#[derive(Debug, Clone)]
enum Stamp {
    Local(ChronoLocal),
    Utc(ChronoUtc),
}

impl From<TimeFormat> for Stamp {
    fn from(format: TimeFormat) -> Self {
        match format {
            TimeFormat::Local => Stamp::Local(ChronoLocal::new("%Y-%m-%d %H:%M:%SL".into())),
            TimeFormat::Utc => Stamp::Utc(ChronoUtc::new("%Y-%m-%d %H:%M:%SZ".into())),
            TimeFormat::Rfc3339 => Stamp::Local(ChronoLocal::rfc_3339()),
        }
    }
}

impl FormatTime for Stamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        match self {
            Stamp::Local(t) => t.format_time(w),
            Stamp::Utc(t) => t.format_time(w),
        }
    }
}

/// A filter, and whether it came from the environment.
///
/// Our own default filter only passes muxrpc events, so targets are only worth printing
/// when the user asked for something wider.
fn filter_from(var: &str, level: &str) -> anyhow::Result<(EnvFilter, bool)> {
    match std::env::var(var) {
        Ok(spec) => {
            let filter = EnvFilter::try_new(&spec)
                .with_context(|| format!("{var}={spec:?} was not understood"))?;
            Ok((filter, true))
        }
        Err(_) => Ok((EnvFilter::try_new(format!("muxrpc={level}"))?, false)),
    }
}

fn fmt_layer<S, W>(
    writer: W,
    (filter, show_target): (EnvFilter, bool),
    time_format: TimeFormat,
    ansi: bool,
) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .compact()
        .with_target(show_target)
        .with_ansi(ansi)
        .with_timer(Stamp::from(time_format))
        .with_writer(writer)
        .with_filter(filter)
}

/// Opens the log file and picks its filter: `RUST_LOG_FILE_DETAIL` if set, else the console's
fn file_output(path: &Path, level: &str) -> anyhow::Result<(Arc<File>, (EnvFilter, bool))> {
    let file = File::create(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let filter = if std::env::var_os(FILE_FILTER_VAR).is_some() {
        filter_from(FILE_FILTER_VAR, level)?
    } else {
        filter_from(CONSOLE_FILTER_VAR, level)?
    };
    Ok((Arc::new(file), filter))
}

/// Sends log output to stderr and, optionally, to a file.
///
/// Only muxrpc's own events at `level` and above are shown unless `RUST_LOG` says otherwise.
/// A second call leaves the first configuration in place.
///
/// If this fails nothing has been installed, so the caller must report the error itself.
pub fn setup(
    level: &str,
    log_file: Option<&Path>,
    time_format: TimeFormat,
    ansi: bool,
) -> anyhow::Result<()> {
    if is_initialized() {
        tracing::warn!("logging is already set up");
        return Ok(());
    }
    let console = fmt_layer(
        std::io::stderr,
        filter_from(CONSOLE_FILTER_VAR, level)?,
        time_format,
        ansi,
    );
    let file = log_file
        .map(|path| file_output(path, level))
        .transpose()?
        .map(|(file, filter)| fmt_layer(file, filter, time_format, false));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()?;
    Ok(())
}

/// Has a global subscriber been installed?
#[must_use]
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}
