//! Configuration structure
// (c) 2026 The muxrpc authors

use std::sync::LazyLock;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::session::{DEFAULT_MAX_BODY_SIZE, DEFAULT_QUEUE_DEPTH, SessionConfig};
use crate::util::TimeFormat;

/// The set of configurable options.
///
/// There is no `default()`; the hard-wired defaults are [`Configuration::system_default()`].
/// On the command line, options are given through [`ConfigurationOverrides`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Configuration {
    /// How many inbound messages each stream buffers before the connection's receive
    /// loop waits for the stream's reader. [default: 150]
    pub queue_depth: usize,

    /// The largest frame body we will send or accept, in bytes. A peer sending anything
    /// larger is disconnected. [default: 1048576]
    pub max_body_size: u32,

    /// Address to listen on in `serve` mode [default: 127.0.0.1:8008]
    pub listen: String,

    /// The format of timestamps in log output [default: local]
    pub time_format: TimeFormat,
}

static SYSTEM_DEFAULT_CONFIG: LazyLock<Configuration> = LazyLock::new(|| Configuration {
    queue_depth: DEFAULT_QUEUE_DEPTH,
    max_body_size: DEFAULT_MAX_BODY_SIZE,
    listen: "127.0.0.1:8008".into(),
    time_format: TimeFormat::Local,
});

impl Configuration {
    /// Returns the system default settings
    #[must_use]
    pub fn system_default() -> &'static Self {
        &SYSTEM_DEFAULT_CONFIG
    }

    /// The subset of options that a [`Session`](crate::Session) uses
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_depth: self.queue_depth,
            max_body_size: self.max_body_size,
        }
    }

    /// Performs additional validation checks on a configuration object
    pub(crate) fn try_validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            anyhow::bail!("The stream queue depth (queue_depth) must be at least 1");
        }
        if self.max_body_size == 0 {
            anyhow::bail!("The maximum body size (max_body_size) must be at least 1");
        }
        Ok(())
    }

    /// Performs additional validation checks on the configuration.
    pub(crate) fn validate(self) -> Result<Self> {
        self.try_validate()?;
        Ok(self)
    }
}

/// Command-line overrides for [`Configuration`].
///
/// Every field is optional; anything not given falls through to lower priority sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::Args)]
pub struct ConfigurationOverrides {
    /// Inbound queue depth per stream [default: 150]
    #[arg(long, value_name = "n", help_heading("Configuration"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,

    /// Largest frame body to send or accept, in bytes [default: 1048576]
    #[arg(long, value_name = "bytes", help_heading("Configuration"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_size: Option<u32>,

    /// The format of timestamps in log output [default: local]
    #[arg(long, value_name = "FORMAT", help_heading("Configuration"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_format: Option<TimeFormat>,
}

impl figment::Provider for ConfigurationOverrides {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("command line")
    }

    fn data(
        &self,
    ) -> std::result::Result<
        figment::value::Map<figment::Profile, figment::value::Dict>,
        figment::Error,
    > {
        figment::providers::Serialized::defaults(self).data()
    }
}

#[cfg(test)]
mod test {
    use assertables::assert_contains;
    use pretty_assertions::assert_eq;

    use super::{Configuration, SYSTEM_DEFAULT_CONFIG};

    #[test]
    fn session_subset() {
        let sc = SYSTEM_DEFAULT_CONFIG.session_config();
        assert_eq!(sc, crate::SessionConfig::default());
    }

    #[test]
    fn validate() {
        let mut cfg = SYSTEM_DEFAULT_CONFIG.clone();
        assert!(cfg.try_validate().is_ok());

        cfg.queue_depth = 0;
        let err = cfg.try_validate().unwrap_err();
        assert_contains!(err.to_string(), "queue_depth");

        cfg = SYSTEM_DEFAULT_CONFIG.clone();
        cfg.max_body_size = 0;
        let err = cfg.clone().validate().unwrap_err();
        assert_contains!(err.to_string(), "max_body_size");
    }

    #[test]
    fn serialized_names() {
        let v = serde_json::to_value(Configuration::system_default()).unwrap();
        assert_eq!(v["queue_depth"], 150);
        assert_eq!(v["listen"], "127.0.0.1:8008");
        assert_eq!(v["time_format"], "local");
    }
}
