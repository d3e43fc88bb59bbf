//! Shell selection and fallback resolution.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A shell invocation: executable plus arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    pub shell: String,
    pub args: Vec<String>,
}

impl ShellConfig {
    pub fn new(shell: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            shell: shell.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The platform default shell for the given environment.
    ///
    /// Unix: `$SHELL`, else `/bin/sh`, started as a login shell.
    /// Windows: `%COMSPEC%`, else `cmd.exe`, with no arguments.
    pub fn platform_default(env: &HashMap<String, String>) -> Self {
        if cfg!(windows) {
            let shell = non_empty(env, "COMSPEC").unwrap_or("cmd.exe");
            Self::new(shell, Vec::<String>::new())
        } else {
            let shell = non_empty(env, "SHELL").unwrap_or("/bin/sh");
            Self::new(shell, ["--login"])
        }
    }

    /// Resolve the shell for a session from optional overrides.
    ///
    /// PowerShell gets its arguments replaced so it dot-sources the bundled
    /// startup script and stays open, whatever arguments were requested.
    pub fn select(
        shell: Option<&str>,
        args: Option<&[String]>,
        defaults: &ShellConfig,
        startup_script: Option<&Path>,
    ) -> Self {
        let shell = shell.unwrap_or(&defaults.shell).to_string();
        let mut args = args.map_or_else(|| defaults.args.clone(), <[String]>::to_vec);

        if let Some(script) = startup_script {
            if is_powershell(&shell) {
                args = powershell_startup_args(script);
            }
        }

        Self { shell, args }
    }
}

fn non_empty<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Whether `shell` names Windows PowerShell or PowerShell Core.
pub fn is_powershell(shell: &str) -> bool {
    shell.to_lowercase().contains("powershell")
}

fn powershell_startup_args(script: &Path) -> Vec<String> {
    vec![
        "-NoExit".to_string(),
        "-NoLogo".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
        format!(". '{}'", script.display()),
    ]
}

/// Picks a replacement when a configured shell fails right after launch.
///
/// Implementations must be pure: no I/O, same answer for the same input.
pub trait FallbackResolver: Send + Sync {
    fn resolve(&self, failed: &ShellConfig, defaults: &ShellConfig) -> Option<ShellConfig>;
}

/// Falls back to the platform default, unless that is what just failed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultShellFallback;

impl FallbackResolver for DefaultShellFallback {
    fn resolve(&self, failed: &ShellConfig, defaults: &ShellConfig) -> Option<ShellConfig> {
        (failed != defaults).then(|| defaults.clone())
    }
}

/// Never offers a fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFallback;

impl FallbackResolver for NoFallback {
    fn resolve(&self, _failed: &ShellConfig, _defaults: &ShellConfig) -> Option<ShellConfig> {
        None
    }
}
