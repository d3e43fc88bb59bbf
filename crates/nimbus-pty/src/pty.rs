use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::error::{PtyError, SpawnError};

/// Terminal size used when the host does not supply one.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Everything a backend needs to start a shell on a pty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Used to name the I/O thread.
    pub label: String,
    pub shell: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    /// The complete environment. Nothing is inherited implicitly.
    pub env: HashMap<String, String>,
    /// Windows ConPTY hint. `None` leaves the choice to the backend.
    pub use_conpty: Option<bool>,
}

/// Events a running process reports to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Vec<u8>),
    /// The process exited with a code. Either this or `Signaled` is sent
    /// exactly once, after the last `Output`.
    Exit(u32),
    /// The process was killed by a signal and has no exit code.
    Signaled(String),
}

/// Control side of a spawned process.
pub trait PtyProcess: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError>;
    fn kill(&mut self) -> Result<(), PtyError>;
}

/// A freshly spawned process and the stream of its events.
pub struct SpawnedProcess {
    pub process: Box<dyn PtyProcess>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Something that can start shells on a pseudoterminal.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError>;
}

/// Backend over the platform's native pty via portable-pty.
///
/// Reads are blocking, so each process gets a dedicated OS thread that
/// forwards output chunks and, once the pty reaches EOF, waits for the child
/// and reports its exit code.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, SpawnError> {
        let pty_system = native_pty_system();

        if let Some(use_conpty) = request.use_conpty {
            log::debug!("use_conpty={use_conpty} ignored; the native pty system picks its own mode");
        }

        let pair = pty_system
            .openpty(pty_size(request.cols, request.rows))
            .map_err(|e| SpawnError::Unavailable(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&request.shell);
        cmd.args(&request.args);
        cmd.env_clear();
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Failed(format!("{}: {e}", request.shell)))?;
        // Only the child may hold the slave side, or the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::Unavailable(format!("failed to clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::Unavailable(format!("failed to take writer: {e}")))?;
        let killer = child.clone_killer();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("pty-io-{}", request.label))
            .spawn(move || {
                read_loop(reader, &events_tx);
                let event = match child.wait() {
                    // portable-pty reports code 1 for signal deaths.
                    Ok(status) => match status.signal() {
                        Some(signal) => ProcessEvent::Signaled(signal.to_string()),
                        None => ProcessEvent::Exit(status.exit_code()),
                    },
                    Err(e) => {
                        log::warn!("failed to wait for pty child: {e}");
                        ProcessEvent::Exit(1)
                    }
                };
                let _ = events_tx.send(event);
            })
            .map_err(|e| SpawnError::Failed(format!("failed to start I/O thread: {e}")))?;

        Ok(SpawnedProcess {
            process: Box::new(NativePty {
                master: pair.master,
                writer,
                killer,
            }),
            events: events_rx,
        })
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, events: &mpsc::UnboundedSender<ProcessEvent>) {
    let mut buf = [0u8; 65536];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            // EIO is how Linux reports a pty whose child has gone away.
            Err(_) => return,
        };
        if events.send(ProcessEvent::Output(buf[..n].to_vec())).is_err() {
            // Session is gone; keep draining so the child can exit.
            continue;
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct NativePty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl PtyProcess for NativePty {
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    fn kill(&mut self) -> Result<(), PtyError> {
        self.killer
            .kill()
            .map_err(|e| PtyError::KillFailed(format!("{e}")))
    }
}
