//! Process backends for interactive sessions
//!
//! A session is served either by a real pseudo-terminal or, when none can be
//! opened, by a plain child process with piped stdio (stdout and stderr are
//! merged into one output stream). Both variants report output and exit
//! through the same [`EventSink`], so the registry never needs to know which
//! one it is talking to.

use crate::utf8::Utf8Decoder;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_proto::{BackendKind, MessageId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 4096;

/// How long a backend waits for its output to drain after the process exits
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Errors raised while starting or driving a backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Opening the pseudo-terminal or spawning into it failed
    #[error("pseudo-terminal unavailable: {0}")]
    Pty(String),

    /// Spawning the piped child failed
    #[error("process spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    /// Both variants failed
    #[error("no backend could start the session ({pty}; {spawn})")]
    Unavailable {
        /// Pseudo-terminal failure
        pty: String,
        /// Piped child failure
        spawn: String,
    },

    /// A live session already uses this key
    #[error("session key already in use: {0}")]
    KeyInUse(MessageId),

    /// Signal name not recognised
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// Delivering a signal failed
    #[error("failed to signal process: {0}")]
    Signal(String),

    /// Resizing the terminal failed
    #[error("resize failed: {0}")]
    Resize(String),

    /// The backend's input side is gone
    #[error("session input closed")]
    InputClosed,
}

/// What to start
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Shell executable
    pub shell: String,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Initial width
    pub cols: u16,
    /// Initial height
    pub rows: u16,
    /// Extra environment
    pub env: HashMap<String, String>,
}

/// Output of a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Decoded output text
    Data(String),
    /// Process ended; emitted once, after all output
    Exit {
        /// Exit code, absent when killed by a signal
        code: Option<i32>,
        /// Terminating signal
        signal: Option<String>,
    },
}

/// A backend event tagged with the session it belongs to
#[derive(Debug, Clone)]
pub struct BackendEnvelope {
    /// Session key
    pub key: MessageId,
    /// Incarnation of the key; stale events carry an older serial
    pub serial: u64,
    /// The event
    pub event: BackendEvent,
}

/// Where a backend delivers its events
#[derive(Debug, Clone)]
pub struct EventSink {
    key: MessageId,
    serial: u64,
    tx: mpsc::UnboundedSender<BackendEnvelope>,
}

impl EventSink {
    /// Create a sink for one session incarnation
    pub fn new(key: MessageId, serial: u64, tx: mpsc::UnboundedSender<BackendEnvelope>) -> Self {
        Self { key, serial, tx }
    }

    fn send(&self, event: BackendEvent) {
        let envelope = BackendEnvelope {
            key: self.key.clone(),
            serial: self.serial,
            event,
        };
        if self.tx.send(envelope).is_err() {
            trace!("event for {} dropped, connection gone", self.key);
        }
    }

    fn data(&self, text: String) {
        if !text.is_empty() {
            self.send(BackendEvent::Data(text));
        }
    }
}

/// A running session process
pub enum ProcessBackend {
    /// Pseudo-terminal variant
    Pty(PtyBackend),
    /// Piped child variant
    Spawn(SpawnBackend),
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("kind", &self.kind())
            .field("pid", &self.pid())
            .finish()
    }
}

impl ProcessBackend {
    /// Which variant is running
    pub fn kind(&self) -> BackendKind {
        match self {
            ProcessBackend::Pty(_) => BackendKind::Pty,
            ProcessBackend::Spawn(_) => BackendKind::Spawn,
        }
    }

    /// Process id of the shell
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessBackend::Pty(pty) => pty.pid,
            ProcessBackend::Spawn(spawn) => spawn.pid,
        }
    }

    /// Queue input for the process
    pub fn write(&self, data: &str) -> Result<(), BackendError> {
        let tx = match self {
            ProcessBackend::Pty(pty) => &pty.input_tx,
            ProcessBackend::Spawn(spawn) => &spawn.input_tx,
        };
        tx.send(data.as_bytes().to_vec()).map_err(|_| BackendError::InputClosed)
    }

    /// Change the terminal size; the piped variant has none and ignores it
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        match self {
            ProcessBackend::Pty(pty) => pty
                .master
                .resize(pty_size(cols, rows))
                .map_err(|e| BackendError::Resize(e.to_string())),
            ProcessBackend::Spawn(_) => {
                trace!("resize ignored for piped session");
                Ok(())
            }
        }
    }

    /// Deliver a signal; `None` picks the variant's default
    /// (`SIGHUP` for a terminal, `SIGTERM` for a piped child)
    pub fn kill(&self, signal: Option<&str>) -> Result<(), BackendError> {
        match self {
            ProcessBackend::Pty(pty) => pty.kill(signal.unwrap_or("SIGHUP")),
            ProcessBackend::Spawn(spawn) => spawn.kill(signal.unwrap_or("SIGTERM")),
        }
    }
}

/// Start a session, preferring a pseudo-terminal
pub fn open_backend(spec: &LaunchSpec, pty_allowed: bool, sink: EventSink) -> Result<ProcessBackend, BackendError> {
    if !pty_allowed {
        return SpawnBackend::start(spec, sink).map(ProcessBackend::Spawn);
    }

    match PtyBackend::start(spec, sink.clone()) {
        Ok(pty) => Ok(ProcessBackend::Pty(pty)),
        Err(pty_err) => {
            warn!("falling back to piped process for {}: {}", sink.key, pty_err);
            SpawnBackend::start(spec, sink)
                .map(ProcessBackend::Spawn)
                .map_err(|spawn_err| BackendError::Unavailable {
                    pty: pty_err.to_string(),
                    spawn: spawn_err.to_string(),
                })
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

/// Session backed by a pseudo-terminal
pub struct PtyBackend {
    master: Box<dyn MasterPty + Send>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    delivered: Arc<Mutex<Option<String>>>,
    pid: Option<u32>,
}

impl PtyBackend {
    fn start(spec: &LaunchSpec, sink: EventSink) -> Result<Self, BackendError> {
        let pair = native_pty_system()
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| BackendError::Pty(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::Pty(format!("failed to spawn shell: {e}")))?;
        // The master only sees EOF once every slave handle is closed
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::Pty(format!("failed to clone reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::Pty(format!("failed to take writer: {e}")))?;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        std::thread::Builder::new()
            .name(format!("pty-write-{}", sink.key))
            .spawn(move || {
                while let Some(bytes) = input_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                        debug!("pty input closed: {}", e);
                        break;
                    }
                }
            })?;

        // Set once exit is reported; later output is dropped
        let exited = Arc::new(Mutex::new(false));
        let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();

        let output_sink = sink.clone();
        let output_gate = Arc::clone(&exited);
        std::thread::Builder::new()
            .name(format!("pty-read-{}", sink.key))
            .spawn(move || {
                let forward = |text: String| {
                    let exited = output_gate.lock().unwrap_or_else(PoisonError::into_inner);
                    if !*exited {
                        output_sink.data(text);
                    }
                };
                let mut decoder = Utf8Decoder::new();
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => forward(decoder.decode(&buf[..n])),
                        // EIO once the slave side is gone
                        Err(_) => break,
                    }
                }
                forward(decoder.finish());
                let _ = drained_tx.send(());
            })?;

        let delivered = Arc::new(Mutex::new(None::<String>));
        let last_signal = Arc::clone(&delivered);
        std::thread::Builder::new()
            .name(format!("pty-wait-{}", sink.key))
            .spawn(move || {
                let status = child.wait();

                // A background job can hold the slave open long after the shell is gone
                if drained_rx.recv_timeout(DRAIN_GRACE).is_err() {
                    debug!("pty output still open after {} exited, not waiting further", sink.key);
                }

                let event = match status {
                    Ok(status) => match status.signal() {
                        Some(reported) => {
                            let name = last_signal
                                .lock()
                                .ok()
                                .and_then(|guard| guard.clone())
                                .unwrap_or_else(|| reported.to_string());
                            BackendEvent::Exit { code: None, signal: Some(name) }
                        }
                        None => BackendEvent::Exit {
                            code: i32::try_from(status.exit_code()).ok(),
                            signal: None,
                        },
                    },
                    Err(e) => {
                        warn!("failed to reap pty child: {}", e);
                        BackendEvent::Exit { code: None, signal: None }
                    }
                };

                let mut closed = exited.lock().unwrap_or_else(PoisonError::into_inner);
                *closed = true;
                sink.send(event);
            })?;

        debug!("started pty session pid={:?}", pid);
        Ok(Self {
            master: pair.master,
            input_tx,
            killer: Mutex::new(killer),
            delivered,
            pid,
        })
    }

    fn kill(&self, signal: &str) -> Result<(), BackendError> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let signal = signals::parse(signal)?;
            if let Ok(mut guard) = self.delivered.lock() {
                *guard = Some(signal.as_str().to_string());
            }
            return signals::deliver_group(pid, signal);
        }

        let _ = signal;
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| BackendError::Signal("killer lock poisoned".to_string()))?;
        match killer.kill() {
            Ok(()) => Ok(()),
            // already reaped
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::Signal(e.to_string())),
        }
    }
}

/// Session backed by a child process with piped stdio
pub struct SpawnBackend {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    kill_tx: mpsc::UnboundedSender<String>,
    pid: Option<u32>,
}

impl SpawnBackend {
    fn start(spec: &LaunchSpec, sink: EventSink) -> Result<Self, BackendError> {
        let mut cmd = Command::new(&spec.shell);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env("TERM", "dumb")
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(bytes) = input_rx.recv().await {
                    if let Err(e) = stdin.write_all(&bytes).await {
                        debug!("piped input closed: {}", e);
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }

        let stdout = child.stdout.take().map(|out| tokio::spawn(pump(out, sink.clone())));
        let stderr = child.stderr.take().map(|err| tokio::spawn(pump(err, sink.clone())));

        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut delivered: Option<String> = None;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(signal) = kill_rx.recv() => {
                        match deliver_to_child(&mut child, pid, &signal) {
                            Ok(name) => delivered = Some(name),
                            Err(e) => warn!("failed to signal piped child: {}", e),
                        }
                    }
                }
            };

            let drain = async {
                for task in [stdout, stderr].into_iter().flatten() {
                    let _ = task.await;
                }
            };
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                debug!("output pipes still open after exit, not waiting further");
            }

            let event = match status {
                Ok(status) => {
                    let (code, signal) = exit_parts(status);
                    BackendEvent::Exit {
                        code,
                        signal: signal.map(|reported| delivered.unwrap_or(reported)),
                    }
                }
                Err(e) => {
                    warn!("failed to reap piped child: {}", e);
                    BackendEvent::Exit { code: None, signal: None }
                }
            };
            sink.send(event);
        });

        debug!("started piped session pid={:?}", pid);
        Ok(Self { input_tx, kill_tx, pid })
    }

    fn kill(&self, signal: &str) -> Result<(), BackendError> {
        #[cfg(unix)]
        signals::parse(signal)?;
        // A closed channel means the child has already been reaped
        let _ = self.kill_tx.send(signal.to_string());
        Ok(())
    }
}

async fn pump<R>(mut source: R, sink: EventSink)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8Decoder::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.data(decoder.decode(&buf[..n])),
        }
    }
    sink.data(decoder.finish());
}

#[cfg(unix)]
fn deliver_to_child(child: &mut tokio::process::Child, pid: Option<u32>, signal: &str) -> Result<String, BackendError> {
    let signal = signals::parse(signal)?;
    match pid {
        Some(pid) => signals::deliver(pid, signal)?,
        None => child.start_kill()?,
    }
    Ok(signal.as_str().to_string())
}

#[cfg(not(unix))]
fn deliver_to_child(child: &mut tokio::process::Child, _pid: Option<u32>, signal: &str) -> Result<String, BackendError> {
    child.start_kill()?;
    Ok(signal.to_string())
}

#[cfg(unix)]
fn exit_parts(status: std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(raw) => {
            let name = nix::sys::signal::Signal::try_from(raw)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| format!("SIG{raw}"));
            (None, Some(name))
        }
        None => (status.code(), None),
    }
}

#[cfg(not(unix))]
fn exit_parts(status: std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    (status.code(), None)
}

#[cfg(unix)]
mod signals {
    use super::BackendError;
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use tracing::debug;
    use nix::unistd::Pid;
    use std::str::FromStr;

    /// Accepts `SIGTERM`, `TERM`, `term` or a signal number
    pub(super) fn parse(name: &str) -> Result<Signal, BackendError> {
        let trimmed = name.trim();
        if let Ok(raw) = trimmed.parse::<i32>() {
            return Signal::try_from(raw).map_err(|_| BackendError::UnknownSignal(name.to_string()));
        }
        let upper = trimmed.to_ascii_uppercase();
        let full = if upper.starts_with("SIG") { upper } else { format!("SIG{upper}") };
        Signal::from_str(&full).map_err(|_| BackendError::UnknownSignal(name.to_string()))
    }

    fn to_pid(pid: u32) -> Result<Pid, BackendError> {
        i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|_| BackendError::Signal(format!("pid out of range: {pid}")))
    }

    pub(super) fn deliver(pid: u32, signal: Signal) -> Result<(), BackendError> {
        match kill(to_pid(pid)?, signal) {
            // already gone
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(BackendError::Signal(e.to_string())),
        }
    }

    /// Signal the process group led by `pid`, falling back to the process alone
    pub(super) fn deliver_group(pid: u32, signal: Signal) -> Result<(), BackendError> {
        match killpg(to_pid(pid)?, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => {
                debug!("group signal for {} failed ({}), signalling the shell only", pid, e);
                deliver(pid, signal)
            }
        }
    }
}
