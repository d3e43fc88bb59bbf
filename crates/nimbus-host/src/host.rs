use std::collections::HashMap;

use nimbus_pty::{
    ExitReason, SessionContext, SessionError, SessionHandle, SessionId, SessionOptions,
    TerminalSession,
};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("session {0} already exists")]
    DuplicateSession(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Events from all sessions of a host, on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// An id-prefixed output frame.
    Data(String),
    Exit { id: SessionId, reason: ExitReason },
}

/// Manages the sessions of one host.
///
/// Output of every session is multiplexed onto a single [`HostEvent`]
/// channel; frames are routed back to their session by id prefix.
pub struct SessionHost {
    ctx: SessionContext,
    sessions: HashMap<SessionId, SessionHandle>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
}

impl SessionHost {
    /// Create an empty host and the receiver for its events.
    pub fn new(ctx: SessionContext) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let host = Self {
            ctx,
            sessions: HashMap::new(),
            events_tx,
        };
        (host, events_rx)
    }

    /// Start a session and forward its events. Must be called from within a
    /// tokio runtime.
    ///
    /// Ids are unique among live sessions; an id may be reused once its
    /// session has been removed.
    pub fn create_session(&mut self, options: SessionOptions) -> Result<SessionId, HostError> {
        let id = options.id.clone();
        if self.sessions.contains_key(&id) {
            return Err(HostError::DuplicateSession(id));
        }

        let (handle, events) = TerminalSession::start(options, self.ctx.clone())?;
        let events_tx = self.events_tx.clone();
        let forward_id = id.clone();
        tokio::spawn(async move {
            let mut data = events.data;
            while let Some(frame) = data.recv().await {
                if events_tx.send(HostEvent::Data(frame)).is_err() {
                    return;
                }
            }
            // The data channel closes after the exit event has been sent.
            if let Ok(reason) = events.exit.await {
                let _ = events_tx.send(HostEvent::Exit {
                    id: forward_id,
                    reason,
                });
            }
        });

        self.sessions.insert(id.clone(), handle);
        Ok(id)
    }

    pub fn get_session(&self, id: &SessionId) -> Option<&SessionHandle> {
        self.sessions.get(id)
    }

    /// Send input to a session. Returns `false` if the id is unknown.
    pub fn write(&self, id: &SessionId, data: impl Into<String>) -> bool {
        match self.sessions.get(id) {
            Some(handle) => {
                handle.write(data);
                true
            }
            None => false,
        }
    }

    pub fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> bool {
        match self.sessions.get(id) {
            Some(handle) => {
                handle.resize(cols, rows);
                true
            }
            None => false,
        }
    }

    /// Destroy and forget a session.
    pub fn close_session(&mut self, id: &SessionId) {
        if let Some(handle) = self.sessions.remove(id) {
            handle.destroy();
        }
    }

    /// Forget a session that has already ended.
    pub fn remove_session(&mut self, id: &SessionId) {
        self.sessions.remove(id);
    }

    /// List all session IDs.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Find the session a frame belongs to and return its payload.
    ///
    /// The longest matching id wins, so `session-ab` frames never go to
    /// `session-a`.
    pub fn route<'a>(&self, frame: &'a str) -> Option<(&SessionId, &'a str)> {
        self.sessions
            .keys()
            .filter_map(|id| id.strip_frame(frame).map(|payload| (id, payload)))
            .max_by_key(|(id, _)| id.as_str().len())
    }
}
