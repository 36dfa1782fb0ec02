//! Client-side proxy for an interactive session on the relay

use crate::router::StreamFrame;
use crate::{Result, TetherError};
use serde_json::json;
use tether_proto::{BackendKind, ErrorCode, ErrorDetails, Message, MessageId, Method, SessionEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Details from a session's `ready` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInfo {
    /// Shell process id
    pub pid: Option<u32>,
    /// Shell that was started
    pub shell: String,
    /// Backend serving the session
    pub backend: BackendKind,
}

/// Something that happened to a session
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    /// The backend accepts input
    Ready(ReadyInfo),
    /// Output text
    Data(String),
    /// The process ended; no further events follow
    Exit {
        /// Exit code, absent when killed by a signal
        code: Option<i32>,
        /// Terminating signal name
        signal: Option<String>,
    },
    /// The session could not be created or the connection dropped
    Failed(ErrorDetails),
}

/// Lifecycle of a session as seen by its proxy
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    /// Waiting for the `ready` frame
    Starting,
    /// Ready frame seen
    Ready(ReadyInfo),
    /// Exit frame seen
    Exited {
        /// Exit code
        code: Option<i32>,
        /// Terminating signal name
        signal: Option<String>,
    },
    /// Ended without an exit frame
    Failed(ErrorDetails),
}

impl SessionPhase {
    fn is_settled(&self) -> bool {
        !matches!(self, SessionPhase::Starting)
    }
}

#[derive(Debug)]
enum Command {
    Input(String),
    Resize { cols: u16, rows: u16 },
    Kill(Option<String>),
}

impl Command {
    fn into_message(self, key: &MessageId) -> Message {
        match self {
            Command::Input(data) => Message::notification(
                Method::TerminalInput.as_str(),
                json!({ "sessionId": key, "data": data }),
            ),
            Command::Resize { cols, rows } => Message::notification(
                Method::TerminalResize.as_str(),
                json!({ "sessionId": key, "cols": cols, "rows": rows }),
            ),
            Command::Kill(signal) => {
                let mut params = json!({ "sessionId": key });
                if let Some(signal) = signal {
                    params["signal"] = json!(signal);
                }
                Message::notification(Method::TerminalKill.as_str(), params)
            }
        }
    }
}

/// Handle to one remote session.
///
/// Input, resize and kill requests made before the relay reports the session
/// ready are held back and sent, in order, right after the `ready` frame.
pub struct TerminalSession {
    key: MessageId,
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<SessionPhase>,
    events: Option<TerminalEvents>,
}

/// Receiving side of a session's events
pub struct TerminalEvents {
    rx: mpsc::UnboundedReceiver<TerminalEvent>,
}

impl TerminalEvents {
    /// Next event; `None` once the session has ended and all events were read
    pub async fn recv(&mut self) -> Option<TerminalEvent> {
        self.rx.recv().await
    }

    /// Concatenate output until the session ends
    pub async fn collect_output(mut self) -> (String, Option<TerminalEvent>) {
        let mut output = String::new();
        while let Some(event) = self.rx.recv().await {
            match event {
                TerminalEvent::Data(data) => output.push_str(&data),
                TerminalEvent::Ready(_) => {}
                end => return (output, Some(end)),
            }
        }
        (output, None)
    }
}

impl TerminalSession {
    pub(crate) fn spawn(
        key: MessageId,
        frames: mpsc::UnboundedReceiver<StreamFrame>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Starting);

        tokio::spawn(drive(key.clone(), frames, commands_rx, outbound, events_tx, phase_tx));

        Self {
            key,
            commands: commands_tx,
            phase: phase_rx,
            events: Some(TerminalEvents { rx: events_rx }),
        }
    }

    /// Session key on the wire
    pub fn key(&self) -> &MessageId {
        &self.key
    }

    /// Send input text
    pub fn write(&self, data: impl Into<String>) -> Result<()> {
        self.command(Command::Input(data.into()))
    }

    /// Change the terminal size
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.command(Command::Resize { cols, rows })
    }

    /// Signal the session; the relay picks a default when `signal` is `None`.
    /// Does not wait for the exit frame.
    pub fn kill(&self, signal: Option<&str>) -> Result<()> {
        self.command(Command::Kill(signal.map(str::to_string)))
    }

    /// Commands to an exited session are dropped; only a lost connection is an error
    fn command(&self, command: Command) -> Result<()> {
        if self.commands.send(command).is_ok() {
            return Ok(());
        }
        match &*self.phase.borrow() {
            SessionPhase::Failed(details) if details.code == ErrorCode::Closed => Err(TetherError::Closed),
            _ => {
                debug!("{} has ended, command dropped", self.key);
                Ok(())
            }
        }
    }

    /// Whether the `ready` frame has been seen
    pub fn is_ready(&self) -> bool {
        matches!(*self.phase.borrow(), SessionPhase::Ready(_))
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        self.phase.borrow().clone()
    }

    /// Wait for the `ready` frame
    pub async fn wait_ready(&mut self) -> Result<ReadyInfo> {
        let phase = self
            .phase
            .wait_for(SessionPhase::is_settled)
            .await
            .map_err(|_| TetherError::Closed)?
            .clone();
        match phase {
            SessionPhase::Ready(info) => Ok(info),
            SessionPhase::Failed(details) => Err(details.into()),
            SessionPhase::Exited { code, signal } => Err(TetherError::Session(format!(
                "session ended before ready (code {:?}, signal {:?})",
                code, signal
            ))),
            SessionPhase::Starting => Err(TetherError::Closed),
        }
    }

    /// Next event, while the events have not been taken
    pub async fn next_event(&mut self) -> Option<TerminalEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Move the event receiver out, e.g. into a separate task
    pub fn take_events(&mut self) -> Option<TerminalEvents> {
        self.events.take()
    }
}

async fn drive(
    key: MessageId,
    mut frames: mpsc::UnboundedReceiver<StreamFrame>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    phase: watch::Sender<SessionPhase>,
) {
    let mut ready = false;
    let mut queued: Vec<Command> = Vec::new();
    let mut commands_open = true;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let frame = frame.unwrap_or_else(|| {
                    StreamFrame::Failed(ErrorDetails::new(ErrorCode::Closed, "connection closed"))
                });
                match frame {
                    StreamFrame::Event(SessionEvent::Ready { pid, shell, backend }) => {
                        let info = ReadyInfo { pid, shell, backend };
                        debug!("{} ready ({:?}, pid {:?})", key, info.backend, info.pid);
                        ready = true;
                        phase.send_replace(SessionPhase::Ready(info.clone()));
                        let _ = events.send(TerminalEvent::Ready(info));
                        if !queued.is_empty() {
                            debug!("{} flushing {} queued commands", key, queued.len());
                        }
                        for command in queued.drain(..) {
                            let _ = outbound.send(command.into_message(&key));
                        }
                    }
                    StreamFrame::Event(SessionEvent::Data { data }) => {
                        trace!("{} {} bytes", key, data.len());
                        let _ = events.send(TerminalEvent::Data(data));
                    }
                    StreamFrame::Event(SessionEvent::Exit { exit_code, signal }) => {
                        debug!("{} exited (code {:?}, signal {:?})", key, exit_code, signal);
                        phase.send_replace(SessionPhase::Exited { code: exit_code, signal: signal.clone() });
                        let _ = events.send(TerminalEvent::Exit { code: exit_code, signal });
                        break;
                    }
                    StreamFrame::Failed(details) => {
                        debug!("{} failed: {}", key, details);
                        phase.send_replace(SessionPhase::Failed(details.clone()));
                        let _ = events.send(TerminalEvent::Failed(details));
                        break;
                    }
                }
            }
            command = commands.recv(), if commands_open => match command {
                Some(command) if ready => {
                    let _ = outbound.send(command.into_message(&key));
                }
                Some(command) => queued.push(command),
                None => commands_open = false,
            },
        }
    }

    if !queued.is_empty() {
        debug!("{} dropped {} commands sent before it ended", key, queued.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    struct Harness {
        frames: mpsc::UnboundedSender<StreamFrame>,
        outbound: mpsc::UnboundedReceiver<Message>,
        session: TerminalSession,
    }

    fn harness() -> Harness {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = TerminalSession::spawn(MessageId::from("term-1"), frames_rx, outbound_tx);
        Harness {
            frames: frames_tx,
            outbound: outbound_rx,
            session,
        }
    }

    fn ready() -> StreamFrame {
        StreamFrame::Event(SessionEvent::Ready {
            pid: Some(7),
            shell: "/bin/sh".into(),
            backend: BackendKind::Spawn,
        })
    }

    fn params(message: &Message) -> &Value {
        message.params.as_ref().unwrap()
    }

    #[tokio::test]
    async fn test_input_waits_for_ready() {
        let mut h = harness();
        assert!(!h.session.is_ready());

        h.session.write("echo one\n").unwrap();
        h.session.resize(120, 40).unwrap();
        tokio::task::yield_now().await;
        assert!(h.outbound.try_recv().is_err());

        h.frames.send(ready()).unwrap();
        let info = h.session.wait_ready().await.unwrap();
        assert_eq!(info.pid, Some(7));
        assert!(h.session.is_ready());

        let first = h.outbound.recv().await.unwrap();
        assert_eq!(first.method.as_deref(), Some("terminal.input"));
        assert_eq!(first.id, None);
        assert_eq!(params(&first)["sessionId"], "term-1");
        assert_eq!(params(&first)["data"], "echo one\n");

        let second = h.outbound.recv().await.unwrap();
        assert_eq!(second.method.as_deref(), Some("terminal.resize"));
        assert_eq!(params(&second)["cols"], 120);

        // after ready, commands go straight out
        h.session.kill(Some("SIGINT")).unwrap();
        let third = h.outbound.recv().await.unwrap();
        assert_eq!(third.method.as_deref(), Some("terminal.kill"));
        assert_eq!(params(&third)["signal"], "SIGINT");
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let mut h = harness();
        h.frames.send(ready()).unwrap();
        h.frames
            .send(StreamFrame::Event(SessionEvent::Data { data: "a".into() }))
            .unwrap();
        h.frames
            .send(StreamFrame::Event(SessionEvent::Data { data: "b".into() }))
            .unwrap();
        h.frames
            .send(StreamFrame::Event(SessionEvent::Exit {
                exit_code: Some(0),
                signal: None,
            }))
            .unwrap();

        assert!(matches!(h.session.next_event().await, Some(TerminalEvent::Ready(_))));
        let events = h.session.take_events().unwrap();
        let (output, end) = events.collect_output().await;
        assert_eq!(output, "ab");
        assert_eq!(
            end,
            Some(TerminalEvent::Exit {
                code: Some(0),
                signal: None
            })
        );
        assert!(h.session.next_event().await.is_none());
        assert!(matches!(h.session.phase(), SessionPhase::Exited { code: Some(0), .. }));
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_not_an_error() {
        let mut h = harness();
        h.frames.send(ready()).unwrap();
        h.frames
            .send(StreamFrame::Event(SessionEvent::Exit {
                exit_code: None,
                signal: Some("SIGTERM".into()),
            }))
            .unwrap();
        let (_, end) = h.session.take_events().unwrap().collect_output().await;
        assert!(matches!(end, Some(TerminalEvent::Exit { code: None, .. })));

        assert!(h.session.kill(None).is_ok());
        assert!(h.session.kill(None).is_ok());
        assert!(h.session.write("late input\n").is_ok());
    }

    #[tokio::test]
    async fn test_failed_create_rejects_wait_ready() {
        let mut h = harness();
        h.frames
            .send(StreamFrame::Failed(ErrorDetails::new(ErrorCode::SessionCreate, "no backend")))
            .unwrap();

        let err = h.session.wait_ready().await.unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::SessionCreate));
        assert!(matches!(h.session.next_event().await, Some(TerminalEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_dropped_router_fails_session() {
        let mut h = harness();
        drop(h.frames);

        assert!(matches!(h.session.wait_ready().await, Err(TetherError::Closed)));
        match h.session.next_event().await {
            Some(TerminalEvent::Failed(details)) => assert_eq!(details.code, ErrorCode::Closed),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
