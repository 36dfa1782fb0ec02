//! Connection setup and the public remote operations

use crate::router::Router;
use crate::terminal::TerminalSession;
use crate::{Result, TetherError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tether_proto::{
    CreateSessionParams, DirEntry, ExecOutput, ExecParams, FileContent, FileStat, Greeting, Method, PathParams,
    SystemInfo, WriteFileParams,
};
use tether_ssh::{
    negotiate, Bootstrap, BootstrapConfig, BootstrapOutcome, ByteStream, ChannelKind, Dialer, NegotiateConfig,
    RemoteShell, SshConfig, SshTransport, TcpDialer,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Window for single-shot replies
    pub request_timeout: Duration,
    /// Window for the relay's greeting after the stream opens
    pub greeting_timeout: Duration,
    /// Relay bootstrap settings
    pub bootstrap: BootstrapConfig,
    /// Direct-or-tunnel settings
    pub negotiate: NegotiateConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            greeting_timeout: Duration::from_secs(10),
            bootstrap: BootstrapConfig::default(),
            negotiate: NegotiateConfig::default(),
        }
    }
}

/// Builder for connections to `[user@]host[:port]`
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    /// Target connection string
    target: String,
    /// SSH configuration
    ssh_config: SshConfig,
    /// Client configuration
    config: ClientConfig,
    /// Host the relay is dialed on, when it differs from the SSH host
    relay_host: Option<String>,
}

impl ConnectionBuilder {
    /// Create a new connection builder
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        let (username, host, port) = Self::parse_target(&target);

        let ssh_config = SshConfig {
            host,
            port,
            username,
            ..Default::default()
        };

        Self {
            target,
            ssh_config,
            config: ClientConfig::default(),
            relay_host: None,
        }
    }

    /// Parse target string into components
    pub fn parse_target(target: &str) -> (Option<String>, String, u16) {
        // Format: [user@]host[:port]
        let (username, rest) = match target.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, target),
        };

        // Bracketed IPv6 literal, optionally with a port
        if let Some(inner) = rest.strip_prefix('[') {
            if let Some((host, tail)) = inner.split_once(']') {
                let port = tail.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(22);
                return (username, host.to_string(), port);
            }
        }

        match rest.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
                Ok(port) => (username, host.to_string(), port),
                Err(_) => (username, rest.to_string(), 22),
            },
            _ => (username, rest.to_string(), 22),
        }
    }

    /// Target as given
    pub fn target(&self) -> &str {
        &self.target
    }

    /// SSH configuration so far
    pub fn ssh_config(&self) -> &SshConfig {
        &self.ssh_config
    }

    /// Client configuration so far
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Set SSH key path
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.ssh_config.key_path = Some(key_path.into());
        self
    }

    /// Set an SSH `-o` option
    pub fn with_ssh_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ssh_config.options.insert(key.into(), value.into());
        self
    }

    /// Set the SSH connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.ssh_config.connect_timeout = timeout.as_secs().max(1);
        self
    }

    /// Set the local relay executable to deploy
    pub fn with_relay_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.bootstrap.artifact_path = path.into();
        self
    }

    /// Set the remote working directory
    pub fn with_remote_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.bootstrap.remote_dir = dir.into();
        self
    }

    /// Set the relay port
    pub fn with_relay_port(mut self, port: u16) -> Self {
        self.config.bootstrap.relay_port = port;
        self
    }

    /// Set a command run remotely after the artifact is uploaded
    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.config.bootstrap.install_command = Some(command.into());
        self
    }

    /// Dial the relay on a different host than the SSH target
    pub fn with_relay_host(mut self, host: impl Into<String>) -> Self {
        self.relay_host = Some(host.into());
        self
    }

    /// Set the single-shot request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the direct connection timeout
    pub fn with_direct_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiate.direct_timeout = timeout;
        self
    }

    /// Bootstrap the relay over SSH and connect to it
    pub async fn connect(self) -> Result<Connection> {
        if self.ssh_config.host.is_empty() {
            return Err(TetherError::Configuration(format!("no host in target {:?}", self.target)));
        }
        let relay_host = self.relay_host.unwrap_or_else(|| self.ssh_config.host.clone());
        let transport = SshTransport::new(self.ssh_config);
        Connection::connect_with(&transport, &TcpDialer, &relay_host, self.config).await
    }
}

/// Live connection to a relay
pub struct Connection {
    id: Uuid,
    router: Router,
    kind: ChannelKind,
    greeting: Greeting,
    bootstrap: Option<BootstrapOutcome>,
}

impl Connection {
    /// Bootstrap through `shell`, then negotiate a stream to `relay_host`
    pub async fn connect_with(
        shell: &dyn RemoteShell,
        dialer: &dyn Dialer,
        relay_host: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let outcome = Bootstrap::new(config.bootstrap.clone()).run(shell).await?;
        let port = config.bootstrap.relay_port;

        let channel = negotiate(dialer, shell, relay_host, port, &config.negotiate).await?;
        let mut connection = Self::establish(channel.stream, channel.kind, &config).await?;
        connection.bootstrap = Some(outcome);
        Ok(connection)
    }

    /// Speak to a relay over an already open stream
    pub async fn over_stream<S>(stream: S, config: &ClientConfig) -> Result<Self>
    where
        S: ByteStream + 'static,
    {
        Self::establish(stream, ChannelKind::Direct, config).await
    }

    async fn establish<S>(stream: S, kind: ChannelKind, config: &ClientConfig) -> Result<Self>
    where
        S: ByteStream + 'static,
    {
        let (router, greeting) = Router::start(stream, config.request_timeout, config.greeting_timeout).await?;
        let id = Uuid::new_v4();
        info!(
            "Connection {} to relay {} ({}/{}, pty {}) over {} channel",
            id, greeting.relay_version, greeting.platform, greeting.arch, greeting.pty_available, kind
        );
        Ok(Self {
            id,
            router,
            kind,
            greeting,
            bootstrap: None,
        })
    }

    /// Local identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// How the relay was reached
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Greeting sent by the relay on connect
    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// What bootstrap found and did, when this connection ran it
    pub fn bootstrap_outcome(&self) -> Option<&BootstrapOutcome> {
        self.bootstrap.as_ref()
    }

    async fn call<P, R>(&self, method: Method, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.router.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// List a directory, sorted by name
    pub async fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.call(Method::ReadDir, &PathParams { path: path.to_string() }).await
    }

    /// Read a file as text
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let content: FileContent = self.call(Method::ReadFile, &PathParams { path: path.to_string() }).await?;
        Ok(content.content)
    }

    /// Write a file, creating parent directories
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let params = WriteFileParams {
            path: path.to_string(),
            content: content.to_string(),
        };
        let _: serde_json::Value = self.call(Method::WriteFile, &params).await?;
        Ok(())
    }

    /// Stat a path without following a final symlink
    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        self.call(Method::Stat, &PathParams { path: path.to_string() }).await
    }

    /// Run a command to completion with `sh -c`
    pub async fn execute(&self, command: &str, cwd: Option<&str>, timeout: Option<Duration>) -> Result<ExecOutput> {
        debug!("Executing remote command: {}", command);
        let params = ExecParams {
            command: command.to_string(),
            cwd: cwd.map(str::to_string),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        self.call(Method::TerminalExec, &params).await
    }

    /// Relay capability and diagnostics snapshot
    pub async fn system_info(&self) -> Result<SystemInfo> {
        self.call(Method::SystemInfo, &serde_json::json!({})).await
    }

    /// Start an interactive session. Returns at once; use
    /// [`TerminalSession::wait_ready`] to learn whether it started.
    pub async fn create_session(&self, params: CreateSessionParams) -> Result<TerminalSession> {
        let params = serde_json::to_value(&params)?;
        let (key, frames) = self.router.open_stream(Method::TerminalCreate, params).await?;
        debug!("Opened session {}", key);
        Ok(TerminalSession::spawn(key, frames, self.router.outbound()))
    }

    /// Requests and sessions awaiting the relay
    pub async fn pending_count(&self) -> usize {
        self.router.pending_count().await
    }

    /// Whether the connection has shut down
    pub fn is_closed(&self) -> bool {
        self.router.is_closed()
    }

    /// Close the connection. Outstanding requests fail with
    /// [`TetherError::Closed`]; the relay kills the sessions it owned.
    pub async fn close(&self) {
        info!("Closing connection {}", self.id);
        self.router.close().await;
    }
}

#[cfg(test)]
mod tests;
