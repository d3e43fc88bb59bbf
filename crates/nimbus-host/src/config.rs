//! Host configuration loaded from `config.toml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nimbus_pty::{
    ConfigSource, EnvSanitization, HostEnvironment, SessionContext, SessionSettings, ShellConfig,
};
use serde::Deserialize;

/// Per-profile settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileConfig {
    /// Extra environment for shells started with this profile.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Main host configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    /// Windows ConPTY preference; left to the backend when unset.
    pub use_conpty: Option<bool>,
    /// Shell used when none is given on the command line.
    pub shell: Option<String>,
    pub shell_args: Option<Vec<String>>,
    /// Script PowerShell sessions load on startup.
    pub startup_script: Option<PathBuf>,
    /// Failed-start window in milliseconds.
    pub early_exit_window_ms: Option<u64>,
    #[serde(default)]
    pub sanitize: EnvSanitization,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

impl HostConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file gives the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::debug!("no config at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Failed to determine config directory")?;
        Ok(dir.join("nimbus").join("config.toml"))
    }

    /// Build the context every session of this host shares.
    ///
    /// An explicit `[sanitize]` table replaces whatever was detected from
    /// the environment.
    pub fn session_context(self, host: HostEnvironment) -> SessionContext {
        let host = if self.sanitize != EnvSanitization::default() {
            host.with_sanitization(self.sanitize.clone())
        } else {
            host
        };

        let mut settings = SessionSettings::for_host(&host);
        if let Some(shell) = &self.shell {
            let args = self
                .shell_args
                .clone()
                .unwrap_or_else(|| settings.default_shell.args.clone());
            settings.default_shell = ShellConfig::new(shell.clone(), args);
        }
        if let Some(ms) = self.early_exit_window_ms {
            settings.early_exit_window = Duration::from_millis(ms);
        }
        settings.startup_script = self.startup_script.clone();

        SessionContext::new(host)
            .with_settings(settings)
            .with_config(Arc::new(self))
    }
}

impl ConfigSource for HostConfig {
    fn profile_env(&self, profile: &str) -> HashMap<String, String> {
        self.profiles
            .get(profile)
            .map(|p| p.env.clone())
            .unwrap_or_default()
    }

    fn use_conpty(&self) -> Option<bool> {
        self.use_conpty
    }
}
