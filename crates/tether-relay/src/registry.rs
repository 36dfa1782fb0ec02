//! Per-connection table of live sessions

use crate::backend::{open_backend, BackendEnvelope, BackendError, BackendEvent, EventSink, LaunchSpec, ProcessBackend};
use crate::system::RelayInfo;
use std::collections::HashMap;
use std::path::PathBuf;
use tether_proto::{CreateSessionParams, MessageId, SessionEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Backend spawned, ready frame not yet emitted
    Starting,
    /// Accepting input
    Ready,
    /// Kill requested, waiting for the exit event
    Closing,
}

#[derive(Debug)]
struct SessionEntry {
    serial: u64,
    backend: ProcessBackend,
    state: SessionState,
    cwd: Option<PathBuf>,
}

/// Sessions owned by one connection, keyed by the creating request's id.
///
/// Backends report through the channel handed to [`SessionRegistry::new`];
/// the owner feeds each envelope back through [`SessionRegistry::on_event`]
/// to turn it into a wire frame. Every live entry produces exactly one exit
/// frame, after which the key may be reused.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<MessageId, SessionEntry>,
    next_serial: u64,
    events_tx: mpsc::UnboundedSender<BackendEnvelope>,
    info: RelayInfo,
}

impl SessionRegistry {
    /// Create an empty registry reporting backend events to `events_tx`
    pub fn new(info: RelayInfo, events_tx: mpsc::UnboundedSender<BackendEnvelope>) -> Self {
        Self {
            sessions: HashMap::new(),
            next_serial: 0,
            events_tx,
            info,
        }
    }

    /// Start a session under `key` and return its ready frame.
    ///
    /// The caller must write the returned frame before forwarding any event
    /// for `key`; backend events are only ever read after this returns.
    pub fn create(&mut self, key: MessageId, params: CreateSessionParams) -> Result<SessionEvent, BackendError> {
        if self.sessions.contains_key(&key) {
            return Err(BackendError::KeyInUse(key));
        }

        self.next_serial += 1;
        let serial = self.next_serial;

        let shell = params.shell.unwrap_or_else(|| self.info.shell().to_string());
        let cwd = params
            .cwd
            .map(PathBuf::from)
            .or_else(|| self.info.home().map(PathBuf::from));
        let spec = LaunchSpec {
            shell: shell.clone(),
            cwd: cwd.clone(),
            cols: params.cols,
            rows: params.rows,
            env: params.env,
        };

        let sink = EventSink::new(key.clone(), serial, self.events_tx.clone());
        let backend = open_backend(&spec, self.info.pty_available(), sink)?;
        let ready = SessionEvent::Ready {
            pid: backend.pid(),
            shell,
            backend: backend.kind(),
        };

        info!("session {} started: backend={:?} pid={:?}", key, backend.kind(), backend.pid());
        self.sessions.insert(
            key,
            SessionEntry {
                serial,
                backend,
                state: SessionState::Starting,
                cwd,
            },
        );

        Ok(ready)
    }

    /// Mark a session ready once its ready frame is on the wire
    pub fn mark_ready(&mut self, key: &MessageId) {
        if let Some(entry) = self.sessions.get_mut(key) {
            if entry.state == SessionState::Starting {
                entry.state = SessionState::Ready;
            }
        }
    }

    /// Forward input; returns `false` when the key is unknown
    pub fn input(&self, key: &MessageId, data: &str) -> bool {
        match self.sessions.get(key) {
            Some(entry) => {
                if let Err(e) = entry.backend.write(data) {
                    warn!("input for session {} dropped: {}", key, e);
                }
                true
            }
            None => {
                debug!("input for unknown session {} ignored", key);
                false
            }
        }
    }

    /// Resize a session; returns `false` when the key is unknown
    pub fn resize(&self, key: &MessageId, cols: u16, rows: u16) -> bool {
        match self.sessions.get(key) {
            Some(entry) => {
                if let Err(e) = entry.backend.resize(cols, rows) {
                    warn!("resize of session {} failed: {}", key, e);
                }
                true
            }
            None => {
                debug!("resize for unknown session {} ignored", key);
                false
            }
        }
    }

    /// Signal a session. Unknown or already-exited keys are a no-op and
    /// return `Ok(false)`.
    pub fn kill(&mut self, key: &MessageId, signal: Option<&str>) -> Result<bool, BackendError> {
        let Some(entry) = self.sessions.get_mut(key) else {
            debug!("kill for unknown session {} ignored", key);
            return Ok(false);
        };
        entry.backend.kill(signal)?;
        entry.state = SessionState::Closing;
        debug!("session {} signalled ({})", key, signal.unwrap_or("default"));
        Ok(true)
    }

    /// Translate a backend event into the frame to send under its key.
    ///
    /// Events for a key with no live entry, or from an older incarnation of
    /// the key, are dropped. An exit removes the entry.
    pub fn on_event(&mut self, envelope: BackendEnvelope) -> Option<SessionEvent> {
        let entry = self.sessions.get(&envelope.key)?;
        if entry.serial != envelope.serial {
            debug!(
                "stale event for session {} (serial {} != {})",
                envelope.key, envelope.serial, entry.serial
            );
            return None;
        }

        match envelope.event {
            BackendEvent::Data(data) => Some(SessionEvent::Data { data }),
            BackendEvent::Exit { code, signal } => {
                self.sessions.remove(&envelope.key);
                info!("session {} exited: code={:?} signal={:?}", envelope.key, code, signal);
                Some(SessionEvent::Exit { exit_code: code, signal })
            }
        }
    }

    /// Kill every live session; used when the connection goes away
    pub fn close_all(&mut self) -> usize {
        let count = self.sessions.len();
        for (key, entry) in self.sessions.drain() {
            if let Err(e) = entry.backend.kill(Some("SIGKILL")) {
                warn!("failed to kill session {} on close: {}", key, e);
            }
        }
        count
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether `key` names a live session
    pub fn contains(&self, key: &MessageId) -> bool {
        self.sessions.contains_key(key)
    }

    /// State of a live session
    pub fn state(&self, key: &MessageId) -> Option<SessionState> {
        self.sessions.get(key).map(|entry| entry.state)
    }

    /// Working directory a session was started in
    pub fn cwd(&self, key: &MessageId) -> Option<&PathBuf> {
        self.sessions.get(key).and_then(|entry| entry.cwd.as_ref())
    }
}
