//! nimbus-pty: terminal session management for Nimbus.
//!
//! This crate owns the shell process behind a terminal tab. It spawns the
//! shell on a pseudoterminal, batches its output into id-prefixed frames for
//! delivery to a renderer, relays input and resizes back, and restarts a
//! shell that fails right after launch with a fallback configuration.
//!
//! # Architecture
//!
//! - [`OutputBatcher`]: Size- and time-bounded batching of pty output.
//! - [`TerminalSession`]: One shell on one pty, driven by its own task;
//!   controlled through a [`SessionHandle`], observed through
//!   [`SessionEvents`].
//! - [`PtyBackend`]: The process boundary. [`NativePtyBackend`] uses the
//!   platform pty through portable-pty.
//! - [`SessionContext`]: Collaborators a host provides: config, fallback
//!   resolution, environment decoration, the ambient environment.

pub mod batcher;
pub mod context;
pub mod env;
pub mod error;
pub mod login_env;
pub mod pty;
pub mod recovery;
pub mod session;
pub mod shell;

pub use batcher::{BatchLimits, OutputBatcher};
pub use context::{ConfigSource, SessionContext, SessionSettings, StaticConfig};
pub use env::{EnvDecorator, EnvSanitization, HostEnvironment, IdentityDecorator};
pub use error::{PtyError, PtyErrorKind, SessionError, SpawnError};
pub use pty::{NativePtyBackend, ProcessEvent, PtyBackend, PtyProcess, SpawnRequest, SpawnedProcess};
pub use recovery::{decide_outcome, ExitOutcome};
pub use session::{
    ExitReason, SessionEvents, SessionHandle, SessionId, SessionOptions, TerminalSession,
};
pub use shell::{DefaultShellFallback, FallbackResolver, NoFallback, ShellConfig};
