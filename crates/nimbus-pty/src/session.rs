use std::fmt;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::batcher::OutputBatcher;
use crate::context::SessionContext;
use crate::env::build_env;
use crate::error::{PtyErrorKind, SessionError};
use crate::pty::{ProcessEvent, PtyProcess, SpawnRequest, DEFAULT_COLS, DEFAULT_ROWS};
use crate::recovery::{decide_outcome, terminal_text, ExitOutcome};
use crate::shell::ShellConfig;

/// Identifier of a terminal session. Every data frame starts with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id (UUID v4, so all ids have the same length).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The payload of `frame` if it belongs to this session.
    pub fn strip_frame<'a>(&self, frame: &'a str) -> Option<&'a str> {
        frame.strip_prefix(self.0.as_str())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What the host asks for when creating a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub id: SessionId,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub cwd: Option<PathBuf>,
    pub shell: Option<String>,
    pub shell_args: Option<Vec<String>>,
    /// Config profile the shell environment comes from.
    pub profile: String,
}

impl SessionOptions {
    pub fn new(id: SessionId, profile: impl Into<String>) -> Self {
        Self {
            id,
            rows: None,
            cols: None,
            cwd: None,
            shell: None,
            shell_args: None,
            profile: profile.into(),
        }
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn with_shell_args(mut self, args: Vec<String>) -> Self {
        self.shell_args = Some(args);
        self
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The shell exited and was not restarted.
    ProcessExited(u32),
    /// The shell was killed by a signal. Never restarted.
    Signaled(String),
    /// The host called [`SessionHandle::destroy`].
    Destroyed,
    /// The pty or the data channel went away.
    StreamClosed,
}

/// Outbound side of a session.
pub struct SessionEvents {
    /// Batched output frames, each prefixed with the session id.
    pub data: mpsc::UnboundedReceiver<String>,
    /// Fires once when the session ends.
    pub exit: oneshot::Receiver<ExitReason>,
}

#[derive(Debug)]
enum Command {
    Write(String),
    Resize { cols: u16, rows: u16 },
    Destroy,
}

/// Host-facing commands for a running session.
///
/// Commands never fail. Once the session has ended they are dropped with a
/// warning. Dropping every handle destroys the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Send user input to the shell.
    pub fn write(&self, data: impl Into<String>) {
        self.send(Command::Write(data.into()), "write to");
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.send(Command::Resize { cols, rows }, "resize");
    }

    /// Kill the shell and end the session.
    pub fn destroy(&self) {
        self.send(Command::Destroy, "destroy");
    }

    /// Whether the session has ended.
    pub fn is_ended(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command, action: &str) {
        if self.commands.send(command).is_err() {
            log::warn!("Attempted to {action} session {} with no live process", self.id);
        }
    }
}

struct LiveProcess {
    process: Box<dyn PtyProcess>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// A shell running on a pty, with batched output and restart on failed start.
///
/// Each session is driven by its own tokio task. Process output, process
/// exit, the batch timer and host commands are all handled on that task, one
/// at a time.
pub struct TerminalSession {
    id: SessionId,
    cols: u16,
    rows: u16,
    cwd: Option<PathBuf>,
    profile: String,
    ctx: SessionContext,
    active: ShellConfig,
    live: Option<LiveProcess>,
    batcher: OutputBatcher,
    started_at: Instant,
    ended: bool,
    data_tx: mpsc::UnboundedSender<String>,
    exit_tx: Option<oneshot::Sender<ExitReason>>,
}

impl TerminalSession {
    /// Spawn the shell and start driving the session.
    ///
    /// Must be called from within a tokio runtime. Only a failure to start
    /// the first shell is returned; everything after that is reported through
    /// [`SessionEvents`].
    pub fn start(
        options: SessionOptions,
        ctx: SessionContext,
    ) -> Result<(SessionHandle, SessionEvents), SessionError> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut session = TerminalSession {
            batcher: OutputBatcher::with_limits(options.id.as_str(), ctx.settings.batch),
            id: options.id.clone(),
            cols: options.cols.unwrap_or(DEFAULT_COLS),
            rows: options.rows.unwrap_or(DEFAULT_ROWS),
            cwd: options.cwd,
            profile: options.profile,
            active: ctx.settings.default_shell.clone(),
            ctx,
            live: None,
            started_at: Instant::now(),
            ended: false,
            data_tx,
            exit_tx: Some(exit_tx),
        };
        session.spawn(options.shell.as_deref(), options.shell_args.as_deref())?;

        tokio::spawn(session.run(commands_rx));

        Ok((
            SessionHandle {
                id: options.id,
                commands: commands_tx,
            },
            SessionEvents {
                data: data_rx,
                exit: exit_rx,
            },
        ))
    }

    fn spawn(&mut self, shell: Option<&str>, args: Option<&[String]>) -> Result<(), SessionError> {
        let settings = &self.ctx.settings;
        let selected = ShellConfig::select(
            shell,
            args,
            &settings.default_shell,
            settings.startup_script.as_deref(),
        );
        let profile_env = self.ctx.config.profile_env(&self.profile);
        let env = build_env(
            &self.ctx.host,
            &selected.shell,
            &profile_env,
            self.ctx.decorator.as_ref(),
        );

        let request = SpawnRequest {
            label: self.id.to_string(),
            shell: selected.shell.clone(),
            args: selected.args.clone(),
            cols: self.cols,
            rows: self.rows,
            cwd: self.cwd.clone(),
            env,
            use_conpty: self.ctx.config.use_conpty(),
        };
        let spawned = self
            .ctx
            .backend
            .spawn(&request)
            .map_err(|e| SessionError::from_spawn(&selected.shell, e))?;
        log::info!(
            "session {}: started {} {:?} ({}x{})",
            self.id,
            selected.shell,
            selected.args,
            self.cols,
            self.rows
        );

        self.live = Some(LiveProcess {
            process: spawned.process,
            events: spawned.events,
        });
        self.active = selected;
        self.started_at = Instant::now();
        Ok(())
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while !self.ended {
            let deadline = self.batcher.deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::debug!("session {}: all handles dropped", self.id);
                        self.destroy();
                    }
                },
                event = next_event(&mut self.live) => self.handle_event(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let frame = self.batcher.flush();
                    self.emit(frame);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Write(data) => self.write(&data),
            Command::Resize { cols, rows } => self.resize(cols, rows),
            Command::Destroy => self.destroy(),
        }
    }

    fn handle_event(&mut self, event: Option<ProcessEvent>) {
        match event {
            Some(ProcessEvent::Output(chunk)) => {
                if let Some(frame) = self.batcher.write(&chunk) {
                    self.emit(frame);
                }
            }
            Some(ProcessEvent::Exit(code)) => self.on_exit(code),
            Some(ProcessEvent::Signaled(signal)) => {
                log::info!("session {}: shell killed by signal: {signal}", self.id);
                self.end(ExitReason::Signaled(signal));
            }
            None => {
                log::warn!("session {}: process event stream closed", self.id);
                self.live = None;
                self.end(ExitReason::StreamClosed);
            }
        }
    }

    fn on_exit(&mut self, code: u32) {
        if self.ended {
            return;
        }
        let outcome = decide_outcome(
            code,
            self.started_at.elapsed(),
            self.ctx.settings.early_exit_window,
            &self.active,
            &self.ctx.settings.default_shell,
            self.ctx.fallback.as_ref(),
        );
        match outcome {
            ExitOutcome::Terminate => self.end(ExitReason::ProcessExited(code)),
            ExitOutcome::GiveUp { diagnostic } => {
                log::warn!("session {}: {}", self.id, diagnostic.trim());
                self.write_text(&diagnostic);
                self.end(ExitReason::ProcessExited(code));
            }
            ExitOutcome::Restart {
                fallback,
                diagnostic,
            } => {
                log::warn!("session {}: {}", self.id, diagnostic.trim());
                self.write_text(&diagnostic);
                self.restart(fallback, code);
            }
        }
    }

    fn restart(&mut self, fallback: ShellConfig, code: u32) {
        // The old process and batcher go before anything new is created.
        self.live = None;
        let frame = self.batcher.flush();
        self.batcher = OutputBatcher::with_limits(self.id.as_str(), self.ctx.settings.batch);
        self.emit(frame);
        if self.ended {
            return;
        }

        if let Err(err) = self.spawn(Some(fallback.shell.as_str()), Some(fallback.args.as_slice())) {
            log::error!("session {}: fallback shell failed: {err}", self.id);
            self.write_text(&terminal_text(&format!("failed to start fallback shell: {err}\n")));
            self.end(ExitReason::ProcessExited(code));
        }
    }

    fn write(&mut self, data: &str) {
        let Some(live) = self.live.as_mut() else {
            log::warn!("Attempted to write to session {} with no pty", self.id);
            return;
        };
        if let Err(err) = live.process.write(data.as_bytes()) {
            match err.kind() {
                PtyErrorKind::BrokenPipe => {
                    log::warn!("session {}: terminal write failed, stream closed: {err}", self.id);
                    self.end(ExitReason::StreamClosed);
                }
                PtyErrorKind::Transient => {
                    log::error!("session {}: error writing to pty: {err}", self.id);
                }
            }
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        let Some(live) = self.live.as_mut() else {
            log::warn!("Attempted to resize session {} with no pty", self.id);
            return;
        };
        if let Err(err) = live.process.resize(cols, rows) {
            log::error!("session {}: {err}", self.id);
        }
    }

    fn destroy(&mut self) {
        match self.live.as_mut() {
            Some(live) => {
                if let Err(err) = live.process.kill() {
                    log::error!("session {}: exit error: {err}", self.id);
                }
            }
            None => log::warn!("Attempted to destroy session {} with no pty", self.id),
        }
        self.end(ExitReason::Destroyed);
    }

    fn write_text(&mut self, text: &str) {
        if let Some(frame) = self.batcher.write_str(text) {
            self.emit(frame);
        }
    }

    fn emit(&mut self, frame: String) {
        if self.data_tx.send(frame).is_err() {
            log::warn!("session {}: terminal stream closed", self.id);
            self.end(ExitReason::StreamClosed);
        }
    }

    /// Move to the ended state: deliver what is still batched, then fire the
    /// exit event. Only the first call has any effect.
    fn end(&mut self, reason: ExitReason) {
        if self.ended {
            return;
        }
        self.ended = true;
        if !self.batcher.is_empty() {
            let _ = self.data_tx.send(self.batcher.flush());
        }
        if let Some(exit_tx) = self.exit_tx.take() {
            let _ = exit_tx.send(reason);
        }
    }
}

async fn next_event(live: &mut Option<LiveProcess>) -> Option<ProcessEvent> {
    match live {
        Some(live) => live.events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot::error::TryRecvError;

    use super::*;
    use crate::context::StaticConfig;
    use crate::env::HostEnvironment;
    use crate::error::SpawnError;
    use crate::pty::fake::FakeBackend;
    use crate::shell::FallbackResolver;

    const ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    struct CountingFallback {
        answer: Option<ShellConfig>,
        calls: AtomicUsize,
    }

    impl CountingFallback {
        fn new(answer: Option<ShellConfig>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FallbackResolver for CountingFallback {
        fn resolve(&self, _failed: &ShellConfig, _defaults: &ShellConfig) -> Option<ShellConfig> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn sh_login() -> ShellConfig {
        ShellConfig::new("/bin/sh", ["--login"])
    }

    fn context(backend: &Arc<FakeBackend>, fallback: &Arc<CountingFallback>) -> SessionContext {
        let mut vars = HashMap::new();
        vars.insert("SHELL".to_string(), "/bin/bash".to_string());
        vars.insert("HOME".to_string(), "/home/tester".to_string());
        let mut ctx = SessionContext::new(HostEnvironment::new(vars))
            .with_backend(backend.clone())
            .with_fallback(fallback.clone());
        ctx.settings.default_shell = ShellConfig::new("/bin/bash", ["--login"]);
        ctx
    }

    fn options() -> SessionOptions {
        SessionOptions::new(SessionId::new(ID), "default")
            .with_shell("/bin/zsh")
            .with_shell_args(vec!["--broken".to_string()])
    }

    /// Let the session task run until it is idle.
    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn frame(payload: &str) -> String {
        format!("{ID}{payload}")
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_spawns_resolved_config() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let mut env = HashMap::new();
        env.insert("EDITOR".to_string(), "vi".to_string());
        let config = StaticConfig {
            use_conpty: Some(false),
            ..StaticConfig::default()
        }
        .with_profile_env("default", env);
        let ctx = context(&backend, &fallback).with_config(Arc::new(config));

        let opts = options().with_size(100, 30).with_cwd("/tmp");
        let (_handle, _events) = TerminalSession::start(opts, ctx).expect("start session");

        assert_eq!(backend.spawn_count(), 1);
        let request = backend.request(0);
        assert_eq!(request.label, ID);
        assert_eq!(request.shell, "/bin/zsh");
        assert_eq!(request.args, vec!["--broken"]);
        assert_eq!((request.cols, request.rows), (100, 30));
        assert_eq!(request.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(request.env["EDITOR"], "vi");
        assert_eq!(request.env["TERM"], "xterm-256color");
        assert_eq!(request.env["HOME"], "/home/tester");
        assert_eq!(request.use_conpty, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_defaults_when_host_gives_nothing() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let opts = SessionOptions::new(SessionId::new(ID), "default");
        let (_handle, _events) =
            TerminalSession::start(opts, context(&backend, &fallback)).expect("start session");

        let request = backend.request(0);
        assert_eq!(request.shell, "/bin/bash");
        assert_eq!(request.args, vec!["--login"]);
        assert_eq!((request.cols, request.rows), (DEFAULT_COLS, DEFAULT_ROWS));
        assert_eq!(request.cwd, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_output_arrives_as_one_frame() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (_handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        let process = backend.events(0);
        for byte in ["a", "b", "c", "d", "e"] {
            process.send(ProcessEvent::Output(byte.as_bytes().to_vec())).unwrap();
        }

        assert_eq!(events.data.recv().await, Some(frame("abcde")));
        settle().await;
        assert!(events.data.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_arrives_within_batch_delay() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (_handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        let sent_at = Instant::now();
        backend.events(0).send(ProcessEvent::Output(b"prompt$ ".to_vec())).unwrap();
        assert_eq!(events.data.recv().await, Some(frame("prompt$ ")));
        assert!(sent_at.elapsed() <= crate::batcher::BATCH_DURATION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_failure_restarts_with_fallback() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(Some(sh_login()));
        let (_handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        tokio::time::advance(Duration::from_millis(200)).await;
        backend.events(0).send(ProcessEvent::Exit(1)).unwrap();

        let data = events.data.recv().await.expect("diagnostic frame");
        assert!(data.starts_with(ID));
        assert!(data.contains("exit code 1"), "got: {data}");
        assert!(data.contains("shell exited in 200 ms"), "got: {data}");
        assert!(data.contains("--broken"));

        assert_eq!(fallback.calls(), 1);
        assert_eq!(backend.spawn_count(), 2);
        let request = backend.request(1);
        assert_eq!(request.shell, "/bin/sh");
        assert_eq!(request.args, vec!["--login"]);
        assert_eq!(events.exit.try_recv(), Err(TryRecvError::Empty));

        // Output of the new shell flows through a fresh batch.
        backend.events(1).send(ProcessEvent::Output(b"$ ".to_vec())).unwrap();
        assert_eq!(events.data.recv().await, Some(frame("$ ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_exit_terminates_without_resolver() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(Some(sh_login()));
        let (handle, events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        tokio::time::advance(Duration::from_secs(5)).await;
        backend.events(0).send(ProcessEvent::Exit(0)).unwrap();

        assert_eq!(events.exit.await, Ok(ExitReason::ProcessExited(0)));
        assert_eq!(fallback.calls(), 0);
        assert_eq!(backend.spawn_count(), 1);
        assert!(handle.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_terminates() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(Some(sh_login()));
        let (_handle, events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        tokio::time::advance(Duration::from_millis(1500)).await;
        backend.events(0).send(ProcessEvent::Exit(2)).unwrap();

        assert_eq!(events.exit.await, Ok(ExitReason::ProcessExited(2)));
        assert_eq!(fallback.calls(), 0);
        assert_eq!(backend.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_failure_without_fallback_ends_with_diagnostic() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (_handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        backend.events(0).send(ProcessEvent::Exit(1)).unwrap();

        let data = events.data.recv().await.expect("diagnostic frame");
        assert!(data.contains("No fallback available"), "got: {data}");
        assert_eq!(events.exit.await, Ok(ExitReason::ProcessExited(1)));
        assert_eq!(backend.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_fires_once_across_restarts() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(Some(sh_login()));
        let (handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        backend.events(0).send(ProcessEvent::Exit(1)).unwrap();
        events.data.recv().await.expect("diagnostic frame");

        // The fallback shell is judged on its own start time.
        tokio::time::advance(Duration::from_secs(2)).await;
        backend.events(1).send(ProcessEvent::Exit(1)).unwrap();
        assert_eq!(events.exit.await, Ok(ExitReason::ProcessExited(1)));
        assert_eq!(backend.spawn_count(), 2);

        // Commands after the end are dropped quietly.
        handle.write("ls\n");
        handle.resize(10, 10);
        handle.destroy();
        settle().await;
        assert!(handle.is_ended());
        assert!(backend.log(1).lock().unwrap().written.is_empty());
        assert!(!backend.log(1).lock().unwrap().killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_and_resize_reach_process() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (handle, _events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        handle.write("echo hi\r");
        handle.resize(132, 43);
        settle().await;

        let log = backend.log(0);
        let log = log.lock().unwrap();
        assert_eq!(log.written, b"echo hi\r");
        assert_eq!(log.resizes, vec![(132, 43)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_uses_current_size() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(Some(sh_login()));
        let (handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        handle.resize(120, 50);
        settle().await;
        backend.events(0).send(ProcessEvent::Exit(1)).unwrap();
        events.data.recv().await.expect("diagnostic frame");

        let request = backend.request(1);
        assert_eq!((request.cols, request.rows), (120, 50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_kills_and_exits_once() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (handle, events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        handle.destroy();
        assert_eq!(events.exit.await, Ok(ExitReason::Destroyed));
        assert!(backend.log(0).lock().unwrap().killed);

        // A late exit report from the killed process goes nowhere.
        let _ = backend.events(0).send(ProcessEvent::Exit(0));
        handle.destroy();
        settle().await;
        assert!(handle.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_destroys_session() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (handle, events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        drop(handle);
        assert_eq!(events.exit.await, Ok(ExitReason::Destroyed));
        assert!(backend.log(0).lock().unwrap().killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_pipe_on_write_ends_session() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (handle, events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        backend.log(0).lock().unwrap().write_error = Some(ErrorKind::BrokenPipe);
        handle.write("x");
        assert_eq!(events.exit.await, Ok(ExitReason::StreamClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_error_is_ignored() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        let log = backend.log(0);
        log.lock().unwrap().write_error = Some(ErrorKind::PermissionDenied);
        handle.write("lost");
        settle().await;
        assert_eq!(events.exit.try_recv(), Err(TryRecvError::Empty));

        log.lock().unwrap().write_error = None;
        handle.write("kept");
        settle().await;
        assert_eq!(log.lock().unwrap().written, b"kept");
        assert!(!handle.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_output_delivered_before_exit() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (_handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        tokio::time::advance(Duration::from_secs(3)).await;
        let process = backend.events(0);
        process.send(ProcessEvent::Output(b"logout\r\n".to_vec())).unwrap();
        process.send(ProcessEvent::Exit(0)).unwrap();

        assert_eq!(events.exit.await, Ok(ExitReason::ProcessExited(0)));
        assert_eq!(events.data.try_recv(), Ok(frame("logout\r\n")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_data_channel_ends_session() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(None);
        let (handle, events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        let SessionEvents { data, exit } = events;
        drop(data);
        backend.events(0).send(ProcessEvent::Output(b"nobody listens".to_vec())).unwrap();

        assert_eq!(exit.await, Ok(ExitReason::StreamClosed));
        assert!(handle.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_signal_death_is_not_a_failed_start() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(Some(sh_login()));
        let (_handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        tokio::time::advance(Duration::from_millis(50)).await;
        backend.events(0).send(ProcessEvent::Signaled("Killed".to_string())).unwrap();

        assert_eq!(events.exit.await, Ok(ExitReason::Signaled("Killed".to_string())));
        assert_eq!(fallback.calls(), 0);
        assert_eq!(backend.spawn_count(), 1);
        assert!(events.data.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_unavailable_fails_construction() {
        let backend = Arc::new(FakeBackend::default());
        backend.fail_next(SpawnError::Unavailable("openpty: ENODEV".to_string()));
        let fallback = CountingFallback::new(None);

        match TerminalSession::start(options(), context(&backend, &fallback)) {
            Err(SessionError::BackendUnavailable(msg)) => assert!(msg.contains("ENODEV")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("start should fail"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fallback_spawn_ends_session() {
        let backend = Arc::new(FakeBackend::default());
        let fallback = CountingFallback::new(Some(sh_login()));
        let (_handle, mut events) =
            TerminalSession::start(options(), context(&backend, &fallback)).expect("start session");

        backend.fail_next(SpawnError::Failed("/bin/sh: not found".to_string()));
        backend.events(0).send(ProcessEvent::Exit(1)).unwrap();

        let diagnostic = events.data.recv().await.expect("diagnostic frame");
        assert!(diagnostic.contains("exit code 1"));
        let failure = events.data.recv().await.expect("failure frame");
        assert!(failure.contains("failed to start fallback shell"), "got: {failure}");
        assert_eq!(events.exit.await, Ok(ExitReason::ProcessExited(1)));
    }

    #[test]
    fn test_session_id_frames() {
        let id = SessionId::new("abc");
        assert_eq!(id.strip_frame("abcdata"), Some("data"));
        assert_eq!(id.strip_frame("xyzdata"), None);
        assert_eq!(id.to_string(), "abc");

        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[cfg(unix)]
    mod native {
        use super::*;
        use crate::shell::DefaultShellFallback;

        fn native_context(default_shell: ShellConfig) -> SessionContext {
            let mut vars = HashMap::new();
            vars.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
            let mut ctx = SessionContext::new(HostEnvironment::new(vars))
                .with_fallback(Arc::new(DefaultShellFallback));
            ctx.settings.default_shell = default_shell;
            ctx
        }

        /// Gather frames until the session ends.
        async fn run_to_end(id: &SessionId, events: SessionEvents) -> (String, ExitReason) {
            let SessionEvents { mut data, mut exit } = events;
            let mut output = String::new();
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                tokio::select! {
                    biased;
                    reason = &mut exit => {
                        while let Ok(frame) = data.try_recv() {
                            output.push_str(id.strip_frame(&frame).expect("frame prefix"));
                        }
                        return (output, reason.expect("exit reason"));
                    }
                    frame = data.recv() => match frame {
                        Some(frame) => output.push_str(id.strip_frame(&frame).expect("frame prefix")),
                        None => break,
                    },
                    _ = sleep_until(deadline) => panic!("session did not end, output: {output}"),
                }
            }
            panic!("data channel closed before exit, output: {output}");
        }

        #[tokio::test]
        async fn test_native_session_output_and_exit() {
            let id = SessionId::generate();
            let opts = SessionOptions::new(id.clone(), "default")
                .with_shell("/bin/sh")
                .with_shell_args(vec!["-c".to_string(), "echo NIMBUS_SESSION_OK".to_string()]);
            let (_handle, events) =
                TerminalSession::start(opts, native_context(sh_login())).expect("start /bin/sh");

            let (output, reason) = run_to_end(&id, events).await;
            assert!(output.contains("NIMBUS_SESSION_OK"), "got: {output}");
            assert_eq!(reason, ExitReason::ProcessExited(0));
        }

        #[tokio::test]
        async fn test_native_failed_shell_falls_back() {
            let id = SessionId::generate();
            let fallback = ShellConfig::new("/bin/sh", ["-c", "echo FALLBACK_OK"]);
            let opts = SessionOptions::new(id.clone(), "default")
                .with_shell("/bin/sh")
                .with_shell_args(vec!["-c".to_string(), "exit 2".to_string()]);
            let (_handle, events) =
                TerminalSession::start(opts, native_context(fallback)).expect("start /bin/sh");

            let (output, reason) = run_to_end(&id, events).await;
            assert!(output.contains("exit code 2"), "got: {output}");
            assert!(output.contains("FALLBACK_OK"), "got: {output}");
            assert_eq!(reason, ExitReason::ProcessExited(0));
        }

        #[tokio::test]
        async fn test_native_killed_shell_is_not_restarted() {
            let id = SessionId::generate();
            let fallback = ShellConfig::new("/bin/sh", ["-c", "echo FALLBACK_RAN"]);
            let opts = SessionOptions::new(id.clone(), "default")
                .with_shell("/bin/sh")
                .with_shell_args(vec!["-c".to_string(), "kill -9 $$".to_string()]);
            let (_handle, events) =
                TerminalSession::start(opts, native_context(fallback)).expect("start /bin/sh");

            let (output, reason) = run_to_end(&id, events).await;
            assert!(!output.contains("FALLBACK_RAN"), "got: {output}");
            assert!(!output.contains("exit code"), "got: {output}");
            assert!(matches!(reason, ExitReason::Signaled(_)), "got: {reason:?}");
        }
    }
}
