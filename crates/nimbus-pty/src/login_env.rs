//! Capture a login shell's environment.
//!
//! Used when the host was started in a way that leaves the ambient
//! environment unusable for a shell (a bundled package mount, a desktop
//! launcher with a bare PATH). Runs `<shell> -l -c '/usr/bin/env -0'` and
//! parses the NUL-delimited output.

use std::collections::HashMap;
use std::time::Duration;

/// How long the login shell may take before we give up on it.
pub const LOGIN_ENV_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `shell` as a login shell and return its environment.
///
/// Returns `None` on any failure, including a result without `PATH`.
#[cfg(unix)]
pub fn capture_login_env(shell: &str, base_env: &HashMap<String, String>) -> Option<HashMap<String, String>> {
    use std::io::Read;
    use std::process::{Command, Stdio};
    use std::sync::mpsc;

    let mut child = match Command::new(shell)
        .args(["-l", "-c", "/usr/bin/env -0"])
        .env_clear()
        .envs(base_env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            log::warn!("Failed to spawn login shell '{shell}': {e}");
            return None;
        }
    };

    let stdout = child.stdout.take();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        // Drain the pipe so the child never blocks on a full buffer.
        let mut buf = Vec::new();
        if let Some(mut stdout) = stdout {
            let _ = stdout.read_to_end(&mut buf);
        }
        let _ = tx.send((child.wait(), buf));
    });

    match rx.recv_timeout(LOGIN_ENV_TIMEOUT) {
        Ok((Ok(status), data)) if status.success() => {
            let env = parse_env_null_delimited(&data);
            if !env.contains_key("PATH") {
                log::warn!("Login shell '{shell}' produced no usable environment");
                return None;
            }
            log::info!("Captured {} environment variables from login shell", env.len());
            Some(env)
        }
        Ok((Ok(status), _)) => {
            log::warn!("Login shell '{shell}' exited with status: {status}");
            None
        }
        Ok((Err(e), _)) => {
            log::warn!("Login shell '{shell}' wait failed: {e}");
            None
        }
        Err(_) => {
            log::warn!("Login shell '{shell}' timed out after {LOGIN_ENV_TIMEOUT:?}");
            None
        }
    }
}

#[cfg(not(unix))]
pub fn capture_login_env(_shell: &str, _base_env: &HashMap<String, String>) -> Option<HashMap<String, String>> {
    None
}

/// Parse `env -0` output.
pub(crate) fn parse_env_null_delimited(data: &[u8]) -> HashMap<String, String> {
    String::from_utf8_lossy(data)
        .split('\0')
        .filter_map(|entry| entry.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
