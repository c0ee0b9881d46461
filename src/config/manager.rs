//! Configuration file wrangling
// (c) 2026 The muxrpc authors

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use figment::{
    Figment, Provider,
    providers::{Env, Format as _, Toml},
};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BASE_CONFIG_FILENAME, Configuration, ENV_PREFIX, SystemDefault};

/// Processes and merges all possible configuration sources.
///
/// Sources are merged lowest priority first; see the [module documentation](super).
#[derive(Debug, Default)]
pub struct Manager {
    /// Configuration data
    data: Figment,
}

impl Manager {
    /// Constructor.
    ///
    /// `extra_file`, if given, is read after the user configuration file; it is an error
    /// for it not to exist.
    pub(super) fn new(extra_file: Option<&Path>, apply_env: bool, apply_config_files: bool) -> Self {
        let mut new1 = Self::default();
        new1.apply_system_default();
        if apply_config_files {
            match Self::user_config_path() {
                Some(p) if p.exists() => new1.merge_toml_file(&p),
                Some(p) => debug!("user configuration file {p:?} not present"),
                None => warn!("could not determine user configuration file path"),
            }
        }
        if let Some(extra) = extra_file {
            new1.merge_toml_file(extra);
        }
        if apply_env {
            new1.merge_provider(Env::prefixed(ENV_PREFIX));
        }
        new1
    }

    /// General constructor for production use
    ///
    /// Reads the user's configuration file, then `extra_file` if given, then the environment.
    #[must_use]
    pub fn standard(extra_file: Option<&Path>) -> Self {
        Self::new(extra_file, true, true)
    }

    /// Testing/internal constructor: does not read files or the environment
    #[must_use]
    #[cfg(test)]
    pub(crate) fn without_files() -> Self {
        Self::new(None, false, false)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("muxrpc").join(BASE_CONFIG_FILENAME))
    }

    /// Returns the list of configuration files we look for
    #[must_use]
    pub fn config_files() -> Vec<String> {
        Self::user_config_path()
            .iter()
            .map(|p| p.as_os_str().to_string_lossy().to_string())
            .collect()
    }

    /// Merges in a data set, which is some sort of [figment::Provider](https://docs.rs/figment/latest/figment/trait.Provider.html).
    /// This uses figment's `merge` operation, which prefers to _replace_ existing items.
    pub fn merge_provider<T>(&mut self, provider: T)
    where
        T: Provider,
    {
        let f = std::mem::take(&mut self.data);
        self.data = f.merge(provider); // in the error case, this leaves the provider in a fused state
    }

    /// Merges in a TOML configuration file
    pub fn merge_toml_file<F>(&mut self, file: F)
    where
        F: AsRef<Path>,
    {
        debug!("reading configuration from {:?}", file.as_ref());
        self.merge_provider(Toml::file_exact(file.as_ref()));
    }

    /// Applies the system default settings, at a lower priority than everything else
    pub fn apply_system_default(&mut self) {
        let f = std::mem::take(&mut self.data);
        self.data = f.join(SystemDefault {});
    }

    /// Attempts to extract a particular struct from the data.
    ///
    /// `T` is usually [Configuration], but it isn't intrinsically required to be.
    pub fn get<'de, T>(&self) -> Result<T, figment::Error>
    where
        T: Deserialize<'de>,
    {
        self.data.extract::<T>()
    }

    /// Extracts the [`Configuration`] and performs additional validation checks on it
    pub fn validated(&self) -> Result<Configuration> {
        self.get::<Configuration>()
            .context("failed to read configuration")?
            .validate()
    }
}
