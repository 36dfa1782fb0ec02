//! Relay configuration

use std::time::Duration;
use tether_proto::codec::MAX_MESSAGE_SIZE;
use tether_proto::DEFAULT_RELAY_PORT;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Shell for new sessions (falls back to `$SHELL`, then `/bin/sh`)
    pub shell: Option<String>,
    /// Never attempt a pseudo-terminal; always use the spawn backend
    pub disable_pty: bool,
    /// Upper bound for `terminal.exec` when the request sets none
    pub exec_timeout: Duration,
    /// Largest accepted message
    pub max_message_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_RELAY_PORT,
            shell: None,
            disable_pty: false,
            exec_timeout: Duration::from_secs(300),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl RelayConfig {
    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Shell used when a session does not override it
    pub fn default_shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}
