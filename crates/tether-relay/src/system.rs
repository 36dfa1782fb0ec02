//! Capability detection and diagnostics snapshots

use crate::config::RelayConfig;
use portable_pty::{native_pty_system, PtySize};
use std::time::Instant;
use tether_proto::{Greeting, SystemInfo, PROTOCOL_VERSION};
use tracing::{debug, warn};

/// Facts about the relay process, computed once at startup
#[derive(Debug, Clone)]
pub struct RelayInfo {
    started: Instant,
    pty_available: bool,
    shell: String,
    home: Option<String>,
}

impl RelayInfo {
    /// Probe the host for pseudo-terminal support and resolve defaults
    pub fn detect(config: &RelayConfig) -> Self {
        let pty_available = !config.disable_pty && pty_supported();
        Self {
            started: Instant::now(),
            pty_available,
            shell: config.default_shell(),
            home: std::env::var("HOME").ok(),
        }
    }

    /// Whether sessions may use the pty backend
    pub fn pty_available(&self) -> bool {
        self.pty_available
    }

    /// Default shell for new sessions
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Home directory of the relay user
    pub fn home(&self) -> Option<&str> {
        self.home.as_deref()
    }

    /// Greeting payload sent on connection open
    pub fn greeting(&self) -> Greeting {
        Greeting {
            version: PROTOCOL_VERSION.to_string(),
            relay_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pty_available: self.pty_available,
            shell: self.shell.clone(),
            home: self.home.clone(),
        }
    }

    /// `system.info` payload for a connection owning `sessions` sessions
    pub fn system_info(&self, sessions: usize) -> SystemInfo {
        SystemInfo {
            relay_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pty_available: self.pty_available,
            shell: self.shell.clone(),
            home: self.home.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            sessions,
        }
    }
}

fn pty_supported() -> bool {
    match native_pty_system().openpty(PtySize::default()) {
        Ok(_pair) => {
            debug!("pseudo-terminal support detected");
            true
        }
        Err(e) => {
            warn!("pseudo-terminals unavailable, sessions will use piped processes: {}", e);
            false
        }
    }
}
