use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nimbus_pty::{HostEnvironment, SessionId, SessionOptions};
use tokio::sync::mpsc;

use nimbus_host::input_thread::start_input_thread;
use nimbus_host::window::{start_resize_relay, terminal_size};
use nimbus_host::{HostConfig, HostEvent, SessionHost};

/// Run a shell in a Nimbus terminal session, relaying stdin and stdout.
#[derive(Debug, Parser)]
#[command(name = "nimbus-session", version)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config profile for the shell environment
    #[arg(long, default_value = "default")]
    profile: String,

    /// Shell to run instead of the configured default
    #[arg(long)]
    shell: Option<String>,

    /// Shell argument; repeat for several
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Working directory for the shell
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Columns (defaults to the size of this terminal)
    #[arg(long)]
    cols: Option<u16>,

    /// Rows (defaults to the size of this terminal)
    #[arg(long)]
    rows: Option<u16>,
}

impl Cli {
    fn session_options(&self) -> SessionOptions {
        let detected = terminal_size();
        SessionOptions {
            id: SessionId::generate(),
            rows: self.rows.or(detected.map(|(_, rows)| rows)),
            cols: self.cols.or(detected.map(|(cols, _)| cols)),
            cwd: self.cwd.clone(),
            shell: self.shell.clone(),
            shell_args: (!self.args.is_empty()).then(|| self.args.clone()),
            profile: self.profile.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = HostConfig::load(cli.config.as_deref())?;
    let ctx = config.session_context(HostEnvironment::detect());

    let (mut host, mut events) = SessionHost::new(ctx);
    let id = host
        .create_session(cli.session_options())
        .context("failed to start terminal session")?;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    start_input_thread(std::io::stdin(), input_tx).context("failed to start stdin relay")?;
    let mut stdin_open = true;

    // An explicit size pins the session; otherwise it follows this terminal.
    let (resize_tx, mut resize_rx) = mpsc::unbounded_channel();
    let mut follow_window = cli.cols.is_none() && cli.rows.is_none();
    if follow_window {
        start_resize_relay(resize_tx).context("failed to watch window size")?;
    }

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            input = input_rx.recv(), if stdin_open => match input {
                Some(text) => {
                    host.write(&id, text);
                }
                None => {
                    log::info!("stdin closed");
                    stdin_open = false;
                }
            },
            size = resize_rx.recv(), if follow_window => match size {
                Some((cols, rows)) => {
                    host.resize(&id, cols, rows);
                }
                None => follow_window = false,
            },
            event = events.recv() => match event {
                Some(HostEvent::Data(frame)) => {
                    if let Some((_, payload)) = host.route(&frame) {
                        stdout.write_all(payload.as_bytes())?;
                        stdout.flush()?;
                    }
                }
                Some(HostEvent::Exit { id, reason }) => {
                    log::info!("session {id} ended: {reason:?}");
                    host.remove_session(&id);
                    if host.is_empty() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    Ok(())
}
