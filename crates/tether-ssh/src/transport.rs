//! Remote command execution over SSH

use crate::connection::{ByteStream, TunnelStream};
use crate::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Everything the bootstrap and tunnel fallback need from a secure-shell
/// session to the remote host
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a shell command line remotely and capture its output
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Copy a local file to a remote path
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Open a byte stream to `127.0.0.1:port` as seen from the remote host
    async fn open_tunnel(&self, port: u16) -> Result<Box<dyn ByteStream>, TransportError>;

    /// Get connection information
    fn connection_info(&self) -> ConnectionInfo;
}

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code, absent when terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed output with the given code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout of a successful command, or `CommandFailed`
    pub fn into_stdout(self) -> Result<String, TransportError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(TransportError::CommandFailed {
                code: self.exit_code.unwrap_or(-1),
                message: self.stderr.trim().to_string(),
            })
        }
    }

    fn from_std(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        }
    }
}

/// Connection information
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote SSH port
    pub port: u16,
    /// Username, when not left to the ssh client
    pub username: Option<String>,
    /// Connection type
    pub transport_type: TransportType,
}

/// Transport type enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with subprocess
    SshSubprocess,
    /// Local process (development and testing)
    Local,
}

/// SSH configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username; the ssh client's default when `None`
    pub username: Option<String>,
    /// SSH key path
    pub key_path: Option<PathBuf>,
    /// SSH options
    pub options: HashMap<String, String>,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Command timeout in seconds
    pub command_timeout: u64,
    /// SSH client binary
    pub ssh_binary: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: None,
            key_path: None,
            options: HashMap::new(),
            connect_timeout: 30,
            command_timeout: 300,
            ssh_binary: "ssh".to_string(),
        }
    }
}

impl SshConfig {
    /// `user@host` or `host`
    pub fn target(&self) -> String {
        match &self.username {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// SSH transport implementation using the `ssh` client subprocess
pub struct SshTransport {
    /// SSH configuration
    config: SshConfig,
}

impl SshTransport {
    /// Create a new ssh transport
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Get the SSH configuration
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Build SSH option arguments (everything before the target)
    fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout),
            "-p".to_string(),
            self.config.port.to_string(),
        ];

        // Add SSH key if specified
        if let Some(key_path) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key_path.to_string_lossy().to_string());
        }

        // Add custom options
        for (key, value) in &self.config.options {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        args
    }

    /// Build SSH arguments for running a remote command
    fn build_ssh_args(&self) -> Vec<String> {
        let mut args = self.ssh_options();
        args.push("-T".to_string());
        args.push(self.config.target());
        args
    }

    /// Build SSH arguments for forwarding stdio to a remote port
    fn build_tunnel_args(&self, port: u16) -> Vec<String> {
        let mut args = self.ssh_options();
        args.push("-W".to_string());
        args.push(format!("127.0.0.1:{}", port));
        args.push(self.config.target());
        args
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout)
    }
}

#[async_trait]
impl RemoteShell for SshTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut ssh_args = self.build_ssh_args();
        ssh_args.push(command.to_string());

        debug!("Executing SSH command: {} {}", self.config.ssh_binary, ssh_args.join(" "));

        let output = Command::new(&self.config.ssh_binary)
            .args(&ssh_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.command_timeout(), output)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connection(format!("Failed to execute SSH: {}", e)))?;

        // 255 is ssh's own failure, not the remote command's
        if output.status.code() == Some(255) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Connection(format!("SSH failed: {}", stderr.trim())));
        }

        Ok(CommandOutput::from_std(output))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let mut file = tokio::fs::File::open(local).await?;

        let mut ssh_args = self.build_ssh_args();
        ssh_args.push(format!("cat > {}", shell_quote(remote)));

        info!("Uploading {} to {}:{}", local.display(), self.config.host, remote);

        let mut child = Command::new(&self.config.ssh_binary)
            .args(&ssh_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connection(format!("Failed to start SSH for upload: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::io::copy(&mut file, &mut stdin).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.command_timeout(), child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                message: format!("upload failed: {}", stderr.trim()),
            });
        }
        Ok(())
    }

    async fn open_tunnel(&self, port: u16) -> Result<Box<dyn ByteStream>, TransportError> {
        let ssh_args = self.build_tunnel_args(port);
        debug!("Opening SSH tunnel: {} {}", self.config.ssh_binary, ssh_args.join(" "));

        let child = Command::new(&self.config.ssh_binary)
            .args(&ssh_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connection(format!("Failed to start SSH tunnel: {}", e)))?;

        let stream = TunnelStream::new(child)
            .ok_or_else(|| TransportError::Connection("SSH tunnel has no stdio".to_string()))?;
        info!("Tunnel to {}:{} open via {}", self.config.host, port, self.config.target());
        Ok(Box::new(stream))
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            transport_type: TransportType::SshSubprocess,
        }
    }
}

/// Runs "remote" commands on this machine. The relay artifact is copied into
/// place and tunnels are plain loopback sockets, so a full bootstrap can be
/// exercised without an SSH server.
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

#[async_trait]
impl RemoteShell for LocalShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        debug!("Executing local command: {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput::from_std(output))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn open_tunnel(&self, port: u16) -> Result<Box<dyn ByteStream>, TransportError> {
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
        Ok(Box::new(stream))
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "localhost".to_string(),
            port: 0,
            username: None,
            transport_type: TransportType::Local,
        }
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}
