//! Construction of the environment a session's shell is started with.
//!
//! The ambient environment is never read implicitly. Hosts capture it once in
//! a [`HostEnvironment`] and hand it to every session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::login_env::capture_login_env;

/// Extra clean-up for hosts whose ambient environment is not fit for a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EnvSanitization {
    /// Start from the target shell's login environment instead of the
    /// ambient one.
    pub login_shell_env: bool,
    /// Remove `PATH` entries that start with this prefix.
    pub strip_path_prefix: Option<String>,
    /// Put this directory first on `PATH`.
    pub prepend_path: Option<PathBuf>,
}

impl EnvSanitization {
    fn is_noop(&self) -> bool {
        self.strip_path_prefix.is_none() && self.prepend_path.is_none()
    }
}

/// Snapshot of the host process environment plus what sessions add to it.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    pub vars: HashMap<String, String>,
    /// Reported to shells as `TERM_PROGRAM`.
    pub product_name: String,
    /// Reported to shells as `TERM_PROGRAM_VERSION`.
    pub product_version: String,
    pub sanitize: EnvSanitization,
    /// Variables the host runtime sets on its own that must not reach a shell
    /// unless a profile sets them explicitly.
    pub leaked_keys: Vec<String>,
    /// Login shell environments by shell, shared by clones.
    login_envs: Arc<Mutex<HashMap<String, Option<HashMap<String, String>>>>>,
}

impl HostEnvironment {
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self {
            vars,
            product_name: "nimbus".to_string(),
            product_version: env!("CARGO_PKG_VERSION").to_string(),
            sanitize: EnvSanitization::default(),
            leaked_keys: vec!["GOOGLE_API_KEY".to_string()],
            login_envs: Arc::default(),
        }
    }

    /// Snapshot the current process environment.
    ///
    /// When running from a mounted application image (`APPIMAGE` and
    /// `APPDIR` both set) the mount point leaks onto `PATH`, so sanitization
    /// is switched on: the login shell environment is used and mount entries
    /// are stripped from `PATH`.
    pub fn detect() -> Self {
        let mut host = Self::new(std::env::vars().collect());
        if host.vars.contains_key("APPIMAGE") {
            if let Some(app_dir) = host.vars.get("APPDIR").cloned() {
                host.sanitize.login_shell_env = true;
                host.sanitize.strip_path_prefix = Some(app_dir);
            }
        }
        host
    }

    pub fn with_product(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.product_name = name.into();
        self.product_version = version.into();
        self
    }

    pub fn with_sanitization(mut self, sanitize: EnvSanitization) -> Self {
        self.sanitize = sanitize;
        self
    }

    /// Login environment of `shell`, captured on first use and then reused.
    ///
    /// A failed capture is remembered too, so a broken login shell costs at
    /// most one timeout per host.
    pub fn login_env(&self, shell: &str) -> Option<HashMap<String, String>> {
        let cached = self
            .login_envs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(shell)
            .cloned();
        if let Some(env) = cached {
            return env;
        }

        let captured = run_blocking(|| capture_login_env(shell, &self.vars));
        self.login_envs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shell.to_string(), captured.clone());
        captured
    }

    /// Locale tag for `LANG`, like `de_DE`.
    pub fn locale(&self) -> String {
        ["LC_ALL", "LC_CTYPE", "LANG"]
            .iter()
            .filter_map(|key| self.vars.get(*key))
            .map(|value| normalize_locale(value))
            .find(|tag| !tag.is_empty() && tag != "C" && tag != "POSIX")
            .unwrap_or_else(|| "en_US".to_string())
    }
}

/// Run blocking work that may be called from a runtime worker thread.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Strip encoding and modifier from a locale name and use `_` as separator.
fn normalize_locale(value: &str) -> String {
    let tag = value.split(['.', '@']).next().unwrap_or_default();
    tag.replace('-', "_")
}

/// Last-step transform over a shell's environment, used by plugins to add
/// their shell integration.
pub trait EnvDecorator: Send + Sync {
    fn decorate(&self, env: HashMap<String, String>) -> HashMap<String, String>;
}

impl<F> EnvDecorator for F
where
    F: Fn(HashMap<String, String>) -> HashMap<String, String> + Send + Sync,
{
    fn decorate(&self, env: HashMap<String, String>) -> HashMap<String, String> {
        self(env)
    }
}

/// Leaves the environment untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDecorator;

impl EnvDecorator for IdentityDecorator {
    fn decorate(&self, env: HashMap<String, String>) -> HashMap<String, String> {
        env
    }
}

/// Build the complete environment for `shell`.
///
/// Layers, later wins: ambient (or login shell) variables, terminal
/// identification, profile overrides. Then `PATH` is sanitized, leaked host
/// keys are dropped and the decorator runs last.
pub fn build_env(
    host: &HostEnvironment,
    shell: &str,
    profile_env: &HashMap<String, String>,
    decorator: &dyn EnvDecorator,
) -> HashMap<String, String> {
    let mut env = if host.sanitize.login_shell_env {
        host.login_env(shell).unwrap_or_else(|| host.vars.clone())
    } else {
        host.vars.clone()
    };

    env.insert("LANG".to_string(), format!("{}.UTF-8", host.locale()));
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("COLORTERM".to_string(), "truecolor".to_string());
    env.insert("TERM_PROGRAM".to_string(), host.product_name.clone());
    env.insert("TERM_PROGRAM_VERSION".to_string(), host.product_version.clone());
    env.extend(profile_env.iter().map(|(k, v)| (k.clone(), v.clone())));

    if !host.sanitize.is_noop() {
        let path = sanitize_path(env.get("PATH").map_or("", String::as_str), &host.sanitize);
        env.insert("PATH".to_string(), path);
    }

    for key in &host.leaked_keys {
        if env.get(key).is_some_and(|value| host.vars.get(key) == Some(value)) {
            env.remove(key);
        }
    }

    decorator.decorate(env)
}

fn sanitize_path(path: &str, sanitize: &EnvSanitization) -> String {
    let prefix = sanitize.strip_path_prefix.as_deref();
    let head = sanitize
        .prepend_path
        .as_ref()
        .map(|dir| dir.display().to_string());

    head.into_iter()
        .chain(
            path.split(':')
                .filter(|entry| !entry.is_empty())
                .filter(|entry| prefix.map_or(true, |p| !entry.starts_with(p)))
                .map(str::to_string),
        )
        .collect::<Vec<_>>()
        .join(":")
}
