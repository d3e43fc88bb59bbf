//! nimbus-host: runs Nimbus terminal sessions for a process on a terminal.
//!
//! - [`config`]: `config.toml` and the session context built from it.
//! - [`host`]: registry of live sessions and routing of their frames.
//! - [`input_thread`]: stdin relay.
//! - [`window`]: size of the host's own terminal and its changes.

pub mod config;
pub mod host;
pub mod input_thread;
pub mod window;

pub use config::HostConfig;
pub use host::{HostError, HostEvent, SessionHost};
