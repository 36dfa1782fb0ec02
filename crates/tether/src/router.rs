//! Request correlation and the connection reader/writer tasks

use crate::{Result, TetherError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{ErrorCode, ErrorDetails, Greeting, Message, MessageCodec, MessageId, Method, SessionEvent};
use tether_ssh::ByteStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Outcome of a single-shot request as received from the wire
pub type Reply = std::result::Result<Value, ErrorDetails>;

/// A frame delivered to a streaming consumer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// `ready`, `data` or `exit`
    Event(SessionEvent),
    /// Error response under the stream's key; ends the stream
    Failed(ErrorDetails),
}

enum Pending {
    Single(oneshot::Sender<Reply>),
    Stream(mpsc::UnboundedSender<StreamFrame>),
}

/// What [`PendingTable::dispatch`] did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A single-shot entry was resolved and removed
    Resolved,
    /// A frame was delivered and the stream stays open
    Streamed,
    /// A terminal frame was delivered and the stream removed
    Finished,
    /// Nothing was waiting for the message
    Unmatched,
}

/// Correlation map from outbound ids to whoever waits for the answers.
///
/// Single-shot requests get integer ids counted from 1; streaming sessions get
/// `term-<n>` string keys, so the two spaces never collide. Every entry is
/// resolved at most once: by a response, a terminal frame, an expiry or
/// [`fail_all`](Self::fail_all).
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<MessageId, Pending>,
    next_request: i64,
    next_session: u64,
    closed: bool,
}

impl PendingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(TetherError::Closed)
        } else {
            Ok(())
        }
    }

    /// Allocate a request id and the receiver its reply lands on
    pub fn register_single(&mut self) -> Result<(MessageId, oneshot::Receiver<Reply>)> {
        self.ensure_open()?;
        self.next_request += 1;
        let id = MessageId::Number(self.next_request);
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id.clone(), Pending::Single(tx));
        Ok((id, rx))
    }

    /// Allocate a session key and the receiver its frames land on
    pub fn register_stream(&mut self) -> Result<(MessageId, mpsc::UnboundedReceiver<StreamFrame>)> {
        self.ensure_open()?;
        self.next_session += 1;
        let id = MessageId::String(format!("term-{}", self.next_session));
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.insert(id.clone(), Pending::Stream(tx));
        Ok((id, rx))
    }

    /// Route an inbound response or session frame
    pub fn dispatch(&mut self, message: Message) -> Dispatch {
        let Some(id) = message.id.clone() else {
            if let Some(error) = &message.error {
                warn!("Relay reported an uncorrelated error: {}", error);
            }
            return Dispatch::Unmatched;
        };

        match self.entries.remove(&id) {
            None => {
                debug!("No pending entry for {}", id);
                Dispatch::Unmatched
            }
            Some(Pending::Single(tx)) => {
                let _ = tx.send(message.into_result());
                Dispatch::Resolved
            }
            Some(Pending::Stream(tx)) => match message.into_result() {
                Err(error) => {
                    let _ = tx.send(StreamFrame::Failed(error));
                    Dispatch::Finished
                }
                Ok(value) => match serde_json::from_value::<SessionEvent>(value) {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        let _ = tx.send(StreamFrame::Event(event));
                        if terminal {
                            Dispatch::Finished
                        } else {
                            self.entries.insert(id, Pending::Stream(tx));
                            Dispatch::Streamed
                        }
                    }
                    Err(e) => {
                        warn!("Malformed session frame for {}: {}", id, e);
                        self.entries.insert(id, Pending::Stream(tx));
                        Dispatch::Unmatched
                    }
                },
            },
        }
    }

    /// Resolve an entry with an error generated locally
    pub fn reject(&mut self, id: &MessageId, error: ErrorDetails) -> bool {
        match self.entries.remove(id) {
            Some(Pending::Single(tx)) => {
                let _ = tx.send(Err(error));
                true
            }
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(StreamFrame::Failed(error));
                true
            }
            None => false,
        }
    }

    /// Drop an entry whose waiter has given up
    pub fn expire(&mut self, id: &MessageId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every entry and refuse new ones; returns how many were failed
    pub fn fail_all(&mut self, error: ErrorDetails) -> usize {
        self.closed = true;
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            match pending {
                Pending::Single(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(StreamFrame::Failed(error.clone()));
                }
            }
        }
        count
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry exists for `id`
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether [`fail_all`](Self::fail_all) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn closed_error(reason: &str) -> ErrorDetails {
    ErrorDetails::new(ErrorCode::Closed, reason)
}

/// Client side of one relay connection: a writer task draining the outbound
/// queue and a reader task dispatching into the pending table
#[derive(Clone)]
pub struct Router {
    pending: Arc<Mutex<PendingTable>>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: Arc<watch::Sender<bool>>,
    request_timeout: Duration,
}

impl Router {
    /// Start the reader and writer tasks over `stream` and wait for the greeting
    pub async fn start<S>(stream: S, request_timeout: Duration, greeting_timeout: Duration) -> Result<(Self, Greeting)>
    where
        S: ByteStream + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let pending = Arc::new(Mutex::new(PendingTable::new()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (greeting_tx, greeting_rx) = oneshot::channel();

        tokio::spawn(read_loop(reader, Arc::clone(&pending), greeting_tx, shutdown_rx.clone()));
        tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&pending), shutdown_rx));

        let router = Self {
            pending,
            outbound: outbound_tx,
            shutdown: Arc::new(shutdown_tx),
            request_timeout,
        };

        let greeting = match timeout(greeting_timeout, greeting_rx).await {
            Ok(Ok(greeting)) => greeting,
            Ok(Err(_)) => {
                router.close().await;
                return Err(TetherError::Handshake("connection closed before greeting".to_string()));
            }
            Err(_) => {
                router.close().await;
                return Err(TetherError::Handshake(format!("no greeting within {:?}", greeting_timeout)));
            }
        };
        debug!("Greeting from relay {} (pid {})", greeting.relay_version, greeting.pid);
        Ok((router, greeting))
    }

    /// Send a single-shot request and wait for its reply
    pub async fn call(&self, method: Method, params: Value) -> Result<Value> {
        let (id, reply_rx) = self.pending.lock().await.register_single()?;
        debug!("-> {} {}", id, method);

        if self.outbound.send(Message::request(id.clone(), method.as_str(), params)).is_err() {
            self.pending.lock().await.expire(&id);
            return Err(TetherError::Closed);
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply.map_err(TetherError::from),
            Ok(Err(_)) => Err(TetherError::Closed),
            Err(_) => {
                self.pending.lock().await.expire(&id);
                warn!("{} {} timed out after {:?}", method, id, self.request_timeout);
                Err(TetherError::Timeout {
                    duration: self.request_timeout,
                })
            }
        }
    }

    /// Send a notification; nothing is awaited
    pub fn notify(&self, method: Method, params: Value) -> Result<()> {
        self.outbound
            .send(Message::notification(method.as_str(), params))
            .map_err(|_| TetherError::Closed)
    }

    /// Send a streaming request under a fresh session key
    pub async fn open_stream(
        &self,
        method: Method,
        params: Value,
    ) -> Result<(MessageId, mpsc::UnboundedReceiver<StreamFrame>)> {
        let (key, frames) = self.pending.lock().await.register_stream()?;
        debug!("-> {} {}", key, method);

        if self.outbound.send(Message::request(key.clone(), method.as_str(), params)).is_err() {
            self.pending.lock().await.expire(&key);
            return Err(TetherError::Closed);
        }
        Ok((key, frames))
    }

    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound.clone()
    }

    /// Request timeout in effect
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Outstanding requests and live streams
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether the connection has shut down
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.outbound.is_closed()
    }

    /// Stop both tasks and fail everything still waiting
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let failed = self.pending.lock().await.fail_all(closed_error("connection closed by client"));
        info!("Router closed ({} pending entries failed)", failed);
    }
}

async fn read_loop<R>(
    mut reader: R,
    pending: Arc<Mutex<PendingTable>>,
    greeting_tx: oneshot::Sender<Greeting>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut codec = MessageCodec::new();
    let mut greeting_tx = Some(greeting_tx);

    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = codec.read_message(&mut reader) => read,
        };

        match read {
            Ok(Some(message)) if message.is_greeting() => {
                let Some(tx) = greeting_tx.take() else {
                    warn!("Ignoring repeated greeting");
                    continue;
                };
                match message.into_result().map(serde_json::from_value::<Greeting>) {
                    Ok(Ok(greeting)) => {
                        let _ = tx.send(greeting);
                    }
                    Ok(Err(e)) => {
                        error!("Unreadable greeting: {}", e);
                        break;
                    }
                    Err(details) => {
                        error!("Relay greeted with an error: {}", details);
                        break;
                    }
                }
            }
            Ok(Some(message)) => {
                pending.lock().await.dispatch(message);
            }
            Ok(None) => {
                info!("Relay closed the connection");
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Skipping unreadable message from relay: {}", e);
            }
            Err(e) => {
                error!("Failed to read from relay: {}", e);
                break;
            }
        }
    }

    let failed = pending.lock().await.fail_all(closed_error("connection closed"));
    if failed > 0 {
        debug!("Reader stopped with {} pending entries", failed);
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    pending: Arc<Mutex<PendingTable>>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let codec = MessageCodec::new();

    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = codec.write_message(&mut writer, &message).await {
            if e.is_recoverable() || matches!(e, tether_proto::ProtocolError::Serialization(_)) {
                // Only this message is lost
                if let Some(id) = &message.id {
                    pending.lock().await.reject(id, ErrorDetails::from(e));
                }
                continue;
            }
            error!("Failed to write to relay: {}", e);
            pending.lock().await.fail_all(closed_error("connection lost"));
            break;
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests;
