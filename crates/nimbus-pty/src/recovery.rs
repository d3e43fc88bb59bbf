//! What to do when a session's process exits.
//!
//! A shell that exits with an error almost immediately after being started
//! is most likely misconfigured, not closed by the user. Such a session is
//! restarted with a fallback shell and the reason is printed into the
//! terminal, so the user sees what went wrong instead of a tab that vanishes.

use std::time::Duration;

use crate::shell::{FallbackResolver, ShellConfig};

/// Exits sooner than this after spawn count as a failed start.
pub const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// End the session.
    Terminate,
    /// Failed start with no way to recover. Print the diagnostic, then end.
    GiveUp { diagnostic: String },
    /// Failed start. Print the diagnostic and respawn with `fallback`.
    Restart {
        fallback: ShellConfig,
        diagnostic: String,
    },
}

/// Decide the outcome of a process exit.
///
/// The resolver is only consulted for failed starts: a non-zero code within
/// `window` of the spawn.
pub fn decide_outcome(
    exit_code: u32,
    elapsed: Duration,
    window: Duration,
    failed: &ShellConfig,
    defaults: &ShellConfig,
    resolver: &dyn FallbackResolver,
) -> ExitOutcome {
    if exit_code == 0 || elapsed >= window {
        return ExitOutcome::Terminate;
    }

    let headline = format!(
        "shell exited in {} ms with exit code {exit_code}",
        elapsed.as_millis()
    );
    match resolver.resolve(failed, defaults) {
        Some(fallback) => {
            let diagnostic = terminal_text(&format!(
                "\n{headline}\nplease check the shell config: {}\nusing fallback shell config: {}\n",
                pretty(failed),
                pretty(&fallback),
            ));
            ExitOutcome::Restart {
                fallback,
                diagnostic,
            }
        }
        None => ExitOutcome::GiveUp {
            diagnostic: terminal_text(&format!(
                "\n{headline}\nNo fallback available, please check the shell config.\n"
            )),
        },
    }
}

fn pretty(config: &ShellConfig) -> String {
    serde_json::to_string_pretty(config).unwrap_or_else(|_| format!("{config:?}"))
}

/// Convert `\n` to `\r\n` so text renders correctly on a raw terminal.
pub(crate) fn terminal_text(text: &str) -> String {
    text.replace('\n', "\r\n")
}
