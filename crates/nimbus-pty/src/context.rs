//! Collaborators and settings shared by every session of a host.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::batcher::BatchLimits;
use crate::env::{EnvDecorator, HostEnvironment, IdentityDecorator};
use crate::pty::{NativePtyBackend, PtyBackend};
use crate::recovery::EARLY_EXIT_WINDOW;
use crate::shell::{DefaultShellFallback, FallbackResolver, ShellConfig};

/// Read-only view of user configuration.
pub trait ConfigSource: Send + Sync {
    /// Extra environment for shells started with `profile`.
    fn profile_env(&self, profile: &str) -> HashMap<String, String>;

    /// Windows ConPTY preference, if the user set one.
    fn use_conpty(&self) -> Option<bool> {
        None
    }
}

/// In-memory configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    pub profiles: HashMap<String, HashMap<String, String>>,
    pub use_conpty: Option<bool>,
}

impl StaticConfig {
    pub fn with_profile_env(mut self, profile: &str, env: HashMap<String, String>) -> Self {
        self.profiles.insert(profile.to_string(), env);
        self
    }
}

impl ConfigSource for StaticConfig {
    fn profile_env(&self, profile: &str) -> HashMap<String, String> {
        self.profiles.get(profile).cloned().unwrap_or_default()
    }

    fn use_conpty(&self) -> Option<bool> {
        self.use_conpty
    }
}

/// Tunables for session behavior.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub batch: BatchLimits,
    /// A non-zero exit sooner than this after spawn counts as a failed start.
    pub early_exit_window: Duration,
    /// What a session runs when the host gives no shell, and what a failed
    /// shell falls back to.
    pub default_shell: ShellConfig,
    /// Script PowerShell sessions dot-source on startup.
    pub startup_script: Option<PathBuf>,
}

impl SessionSettings {
    pub fn for_host(host: &HostEnvironment) -> Self {
        Self {
            batch: BatchLimits::default(),
            early_exit_window: EARLY_EXIT_WINDOW,
            default_shell: ShellConfig::platform_default(&host.vars),
            startup_script: None,
        }
    }
}

/// Everything a session needs from its host, passed explicitly.
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn PtyBackend>,
    pub config: Arc<dyn ConfigSource>,
    pub fallback: Arc<dyn FallbackResolver>,
    pub decorator: Arc<dyn EnvDecorator>,
    pub host: Arc<HostEnvironment>,
    pub settings: SessionSettings,
}

impl SessionContext {
    /// Context with the native backend, no profile config, the default
    /// fallback and no decoration.
    pub fn new(host: HostEnvironment) -> Self {
        let settings = SessionSettings::for_host(&host);
        Self {
            backend: Arc::new(NativePtyBackend),
            config: Arc::new(StaticConfig::default()),
            fallback: Arc::new(DefaultShellFallback),
            decorator: Arc::new(IdentityDecorator),
            host: Arc::new(host),
            settings,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn PtyBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackResolver>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn EnvDecorator>) -> Self {
        self.decorator = decorator;
        self
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }
}
