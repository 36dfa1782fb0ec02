//! Method table and typed parameters/results

use crate::message::MessageId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The fixed set of methods understood by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// List a directory
    ReadDir,
    /// Read a file as text
    ReadFile,
    /// Write a file, creating parent directories
    WriteFile,
    /// Stat a path
    Stat,
    /// Start an interactive session (streaming)
    TerminalCreate,
    /// Send input to a session
    TerminalInput,
    /// Resize a session
    TerminalResize,
    /// Signal a session
    TerminalKill,
    /// Run a command to completion
    TerminalExec,
    /// Capability and diagnostics snapshot
    SystemInfo,
}

impl Method {
    /// All methods, in table order
    pub const ALL: [Method; 10] = [
        Method::ReadDir,
        Method::ReadFile,
        Method::WriteFile,
        Method::Stat,
        Method::TerminalCreate,
        Method::TerminalInput,
        Method::TerminalResize,
        Method::TerminalKill,
        Method::TerminalExec,
        Method::SystemInfo,
    ];

    /// Wire name of the method
    pub fn as_str(self) -> &'static str {
        match self {
            Method::ReadDir => "fs.readDir",
            Method::ReadFile => "fs.readFile",
            Method::WriteFile => "fs.writeFile",
            Method::Stat => "fs.stat",
            Method::TerminalCreate => "terminal.create",
            Method::TerminalInput => "terminal.input",
            Method::TerminalResize => "terminal.resize",
            Method::TerminalKill => "terminal.kill",
            Method::TerminalExec => "terminal.exec",
            Method::SystemInfo => "system.info",
        }
    }

    /// Whether responses to this method are streamed under the request id
    pub fn is_streaming(self) -> bool {
        matches!(self, Method::TerminalCreate)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| format!("unknown method: {}", s))
    }
}

/// Parameters carrying a single path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathParams {
    /// Remote path
    pub path: String,
}

/// `fs.writeFile` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileParams {
    /// Remote path
    pub path: String,
    /// Text content
    pub content: String,
}

/// `fs.readFile` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    /// Text content
    pub content: String,
}

/// Classification of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file (and anything that is neither a directory nor a link)
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

impl EntryKind {
    /// Classify from metadata obtained without following links
    pub fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// One `fs.readDir` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Entry classification
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

/// `fs.stat` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Path classification
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes
    pub size: u64,
    /// Last modification, milliseconds since the Unix epoch
    pub mtime: u64,
    /// Permission bits
    pub mode: u32,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// `terminal.create` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    /// Working directory; the relay user's home when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Terminal width
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Terminal height
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Shell override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl Default for CreateSessionParams {
    fn default() -> Self {
        Self {
            cwd: None,
            cols: default_cols(),
            rows: default_rows(),
            shell: None,
            env: HashMap::new(),
        }
    }
}

/// `terminal.input` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParams {
    /// Target session
    pub session_id: MessageId,
    /// Input text
    pub data: String,
}

/// `terminal.resize` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeParams {
    /// Target session
    pub session_id: MessageId,
    /// New width
    pub cols: u16,
    /// New height
    pub rows: u16,
}

/// `terminal.kill` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillParams {
    /// Target session
    pub session_id: MessageId,
    /// Signal name such as `SIGTERM`; backend default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// `terminal.exec` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecParams {
    /// Shell command line
    pub command: String,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Time budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// `terminal.exec` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code, absent when killed by a signal
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Which process backend serves a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Real pseudo-terminal
    Pty,
    /// Plain child process with piped stdio
    Spawn,
}

/// Streaming frames carried in `result` under a session key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionEvent {
    /// Backend is accepting input; sent exactly once, first
    Ready {
        /// Process id of the shell
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        /// Shell that was started
        shell: String,
        /// Backend variant in use
        backend: BackendKind,
    },
    /// Output chunk, in backend emission order
    Data {
        /// Decoded output text
        data: String,
    },
    /// Terminal frame; sent exactly once, last
    Exit {
        /// Exit code, absent when killed by a signal
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        /// Terminating signal name
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

impl SessionEvent {
    /// Whether this frame ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Exit { .. })
    }
}

/// Capability snapshot sent once at connection open under the greeting id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "greeting", rename_all = "camelCase")]
pub struct Greeting {
    /// Protocol version
    pub version: String,
    /// Relay build version
    pub relay_version: String,
    /// Relay process id
    pub pid: u32,
    /// Operating system
    pub platform: String,
    /// CPU architecture
    pub arch: String,
    /// Whether sessions can be backed by a pseudo-terminal
    pub pty_available: bool,
    /// Default shell for new sessions
    pub shell: String,
    /// Home directory of the relay user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
}

/// `system.info` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// Relay build version
    pub relay_version: String,
    /// Relay process id
    pub pid: u32,
    /// Operating system
    pub platform: String,
    /// CPU architecture
    pub arch: String,
    /// Whether sessions can be backed by a pseudo-terminal
    pub pty_available: bool,
    /// Default shell for new sessions
    pub shell: String,
    /// Home directory of the relay user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<String>,
    /// Seconds since the relay started
    pub uptime_secs: u64,
    /// Live sessions on the asking connection
    pub sessions: usize,
}
