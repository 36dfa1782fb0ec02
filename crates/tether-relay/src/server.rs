//! Connection loop, request dispatch and the TCP accept loop

use crate::backend::{BackendEnvelope, BackendError};
use crate::config::RelayConfig;
use crate::handlers::{decode, ExecHandler, FsHandler, Handler};
use crate::registry::SessionRegistry;
use crate::system::RelayInfo;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_proto::{
    CreateSessionParams, ErrorCode, ErrorDetails, InputParams, KillParams, Message, MessageCodec, MessageId,
    MessageKind, Method, ProtocolError, ResizeParams, SessionEvent, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Serves one transport connection: reads requests, writes responses and
/// session frames, and owns the sessions created over it
pub struct ConnectionLoop<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    id: Uuid,
    reader: R,
    writer: W,
    codec: MessageCodec,
    info: RelayInfo,
    registry: SessionRegistry,
    events_rx: mpsc::UnboundedReceiver<BackendEnvelope>,
    replies_tx: mpsc::UnboundedSender<Message>,
    replies_rx: mpsc::UnboundedReceiver<Message>,
    handlers: HashMap<Method, Arc<dyn Handler>>,
    shutdown_rx: Option<oneshot::Receiver<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl<R, W> ConnectionLoop<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a connection loop over a reader/writer pair
    pub fn with_io(reader: R, writer: W, config: &RelayConfig, info: RelayInfo) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let fs: Arc<dyn Handler> = Arc::new(FsHandler);
        let exec: Arc<dyn Handler> = Arc::new(ExecHandler::new(config.exec_timeout));
        let mut handlers = HashMap::new();
        for method in [Method::ReadDir, Method::ReadFile, Method::WriteFile, Method::Stat] {
            handlers.insert(method, Arc::clone(&fs));
        }
        handlers.insert(Method::TerminalExec, exec);

        Self {
            id: Uuid::new_v4(),
            reader,
            writer,
            codec: MessageCodec::with_max_message_size(config.max_message_size),
            registry: SessionRegistry::new(info.clone(), events_tx),
            info,
            events_rx,
            replies_tx,
            replies_rx,
            handlers,
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Connection identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register or replace the handler for a single-shot method
    pub fn register_handler(&mut self, method: Method, handler: Arc<dyn Handler>) {
        debug!("Registered handler for {}", method);
        self.handlers.insert(method, handler);
    }

    /// Get shutdown sender for graceful shutdown
    pub fn shutdown_sender(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown_tx.take()
    }

    /// Run until the peer disconnects or shutdown is requested. Every session
    /// owned by the connection is killed before this returns.
    pub async fn run(&mut self) -> Result<()> {
        info!("connection {} open", self.id);

        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .context("Shutdown receiver already taken")?;

        let greeting = serde_json::to_value(self.info.greeting()).context("Failed to encode greeting")?;
        self.send(&Message::response(Some(MessageId::greeting()), greeting)).await?;

        let result = loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("connection {} shutting down", self.id);
                    break Ok(());
                }

                read = self.codec.read_message(&mut self.reader) => {
                    match read {
                        Ok(Some(message)) => {
                            if let Err(e) = self.process_message(message).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => {
                            info!("connection {} closed by peer", self.id);
                            break Ok(());
                        }
                        Err(e) if e.is_recoverable() => {
                            warn!("connection {}: rejecting malformed message: {}", self.id, e);
                            if let Err(e) = self.send(&Message::error(None, e.into())).await {
                                break Err(e);
                            }
                        }
                        Err(e) => {
                            error!("connection {}: read failed: {}", self.id, e);
                            break Err(e.into());
                        }
                    }
                }

                Some(envelope) = self.events_rx.recv() => {
                    let key = envelope.key.clone();
                    if let Some(frame) = self.registry.on_event(envelope) {
                        if let Err(e) = self.send_frame(key, frame).await {
                            break Err(e);
                        }
                    }
                }

                Some(reply) = self.replies_rx.recv() => {
                    if let Err(e) = self.send(&reply).await {
                        break Err(e);
                    }
                }
            }
        };

        let closed = self.registry.close_all();
        info!("connection {} closed, killed {} session(s)", self.id, closed);
        result
    }

    async fn process_message(&mut self, message: Message) -> Result<()> {
        let id = message.id.clone();

        if message.version != PROTOCOL_VERSION {
            warn!("unsupported protocol version {:?}", message.version);
            if id.is_some() {
                let error = ErrorDetails::new(
                    ErrorCode::InvalidRequest,
                    format!("unsupported protocol version {}", message.version),
                )
                .with_context("expected", PROTOCOL_VERSION);
                self.send(&Message::error(id, error)).await?;
            }
            return Ok(());
        }

        if message.kind() == MessageKind::Response {
            warn!("ignoring unexpected response message id={:?}", id);
            return Ok(());
        }

        let Some(name) = message.method else {
            return Ok(());
        };
        let params = message.params.unwrap_or(Value::Null);

        let method = match name.parse::<Method>() {
            Ok(method) => method,
            Err(e) => {
                warn!("{}", e);
                if id.is_some() {
                    let error = ErrorDetails::new(ErrorCode::MethodNotFound, e).with_context("method", name);
                    self.send(&Message::error(id, error)).await?;
                }
                return Ok(());
            }
        };

        debug!("dispatching {} id={:?}", method, id);
        match method {
            Method::TerminalCreate => self.create_session(id, params).await,
            Method::TerminalInput => {
                let outcome = decode::<InputParams>(method, params).map(|p| {
                    self.registry.input(&p.session_id, &p.data);
                    Value::Null
                });
                self.answer(id, outcome).await
            }
            Method::TerminalResize => {
                let outcome = decode::<ResizeParams>(method, params).map(|p| {
                    self.registry.resize(&p.session_id, p.cols, p.rows);
                    Value::Null
                });
                self.answer(id, outcome).await
            }
            Method::TerminalKill => {
                let outcome = decode::<KillParams>(method, params).and_then(|p| {
                    self.registry
                        .kill(&p.session_id, p.signal.as_deref())
                        .map(|_| Value::Null)
                        .map_err(|e| ErrorDetails::new(ErrorCode::InvalidParams, e.to_string()))
                });
                self.answer(id, outcome).await
            }
            Method::SystemInfo => {
                let outcome = serde_json::to_value(self.info.system_info(self.registry.len()))
                    .map_err(|e| ErrorDetails::new(ErrorCode::InternalError, e.to_string()));
                self.answer(id, outcome).await
            }
            _ => {
                self.spawn_handler(method, id, params);
                Ok(())
            }
        }
    }

    async fn create_session(&mut self, id: Option<MessageId>, params: Value) -> Result<()> {
        let Some(key) = id else {
            warn!("terminal.create sent as notification, ignoring");
            return Ok(());
        };

        let params: CreateSessionParams = match decode(Method::TerminalCreate, params) {
            Ok(params) => params,
            Err(error) => return self.send(&Message::error(Some(key), error)).await,
        };

        match self.registry.create(key.clone(), params) {
            Ok(ready) => {
                self.send_frame(key.clone(), ready).await?;
                self.registry.mark_ready(&key);
                Ok(())
            }
            Err(e) => {
                error!("failed to create session {}: {}", key, e);
                let code = match e {
                    BackendError::KeyInUse(_) => ErrorCode::InvalidRequest,
                    _ => ErrorCode::SessionCreate,
                };
                self.send(&Message::error(Some(key), ErrorDetails::new(code, e.to_string())))
                    .await
            }
        }
    }

    fn spawn_handler(&self, method: Method, id: Option<MessageId>, params: Value) {
        let Some(handler) = self.handlers.get(&method).cloned() else {
            warn!("no handler registered for {}", method);
            let error = ErrorDetails::new(ErrorCode::MethodNotFound, format!("no handler for {}", method));
            if id.is_some() {
                let _ = self.replies_tx.send(Message::error(id, error));
            }
            return;
        };

        let replies = self.replies_tx.clone();
        tokio::spawn(async move {
            let outcome = handler.handle(method, params).await;
            if let Err(error) = &outcome {
                debug!("{} failed: {}", method, error);
            }
            if id.is_none() {
                return;
            }
            let reply = match outcome {
                Ok(result) => Message::response(id, result),
                Err(error) => Message::error(id, error),
            };
            // The loop has exited if this fails; nothing left to tell
            let _ = replies.send(reply);
        });
    }

    /// Reply to a request; notifications get no answer
    async fn answer(&mut self, id: Option<MessageId>, outcome: Result<Value, ErrorDetails>) -> Result<()> {
        match (id, outcome) {
            (None, Ok(_)) => Ok(()),
            (None, Err(error)) => {
                warn!("notification failed: {}", error);
                Ok(())
            }
            (Some(id), Ok(result)) => self.send(&Message::response(Some(id), result)).await,
            (Some(id), Err(error)) => self.send(&Message::error(Some(id), error)).await,
        }
    }

    async fn send_frame(&mut self, key: MessageId, frame: SessionEvent) -> Result<()> {
        let frame = serde_json::to_value(frame).context("Failed to encode session frame")?;
        self.send(&Message::response(Some(key), frame)).await
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        match self.codec.write_message(&mut self.writer, message).await {
            Ok(()) => Ok(()),
            Err(e @ (ProtocolError::MessageTooLarge { .. } | ProtocolError::Serialization(_))) => {
                warn!("could not encode reply to {:?}: {}", message.id, e);
                let error = ErrorDetails::new(ErrorCode::InternalError, e.to_string());
                self.codec
                    .write_message(&mut self.writer, &Message::error(message.id.clone(), error))
                    .await
                    .context("Failed to write error reply")
            }
            Err(e) => Err(e).context("Failed to write message"),
        }
    }
}

/// TCP listener that serves each accepted connection on its own task
pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
    info: RelayInfo,
}

impl RelayServer {
    /// Bind the listen address from `config`
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr())
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;
        let info = RelayInfo::detect(&config);
        Ok(Self { listener, config, info })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read local address")
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<()> {
        info!(
            "relay listening on {} (pty available: {})",
            self.local_addr()?,
            self.info.pty_available()
        );

        loop {
            let (stream, peer) = self.listener.accept().await.context("Failed to accept connection")?;
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            let mut connection = ConnectionLoop::with_io(reader, writer, &self.config, self.info.clone());
            info!("accepted {} as connection {}", peer, connection.id());

            tokio::spawn(async move {
                if let Err(e) = connection.run().await {
                    error!("connection {} failed: {:#}", connection.id(), e);
                }
            });
        }
    }
}
