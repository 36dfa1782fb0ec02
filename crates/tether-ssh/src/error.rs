//! SSH-specific error types

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// State captured on the remote host while a relay fails to come up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Matching lines from the remote process listing
    pub process_listing: Option<String>,
    /// Last lines of the relay log
    pub log_tail: Option<String>,
}

impl Diagnostics {
    /// Whether anything was captured
    pub fn is_empty(&self) -> bool {
        self.process_listing.is_none() && self.log_tail.is_none()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no diagnostics captured");
        }
        if let Some(ps) = &self.process_listing {
            writeln!(f, "--- processes ---")?;
            writeln!(f, "{}", ps.trim_end())?;
        }
        if let Some(log) = &self.log_tail {
            writeln!(f, "--- relay log ---")?;
            write!(f, "{}", log.trim_end())?;
        }
        Ok(())
    }
}

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// SSH connection error
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote command failed
    #[error("Remote command failed with exit code {code}: {message}")]
    CommandFailed {
        /// Exit code of the failed command (-1 when killed by a signal)
        code: i32,
        /// Error message
        message: String,
    },

    /// The relay artifact to deploy does not exist locally
    #[error("Relay artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// A deploy or start step failed
    #[error("Deployment failed: {message}")]
    Deployment {
        /// What went wrong
        message: String,
        /// Remote state at the time of failure
        diagnostics: Diagnostics,
    },

    /// The relay never answered the readiness probe
    #[error("Relay did not become ready after {attempts} probe attempts\n{diagnostics}")]
    BootstrapTimeout {
        /// Probes made
        attempts: u32,
        /// Last captured remote state
        diagnostics: Diagnostics,
    },

    /// Neither the direct socket nor the tunnel could be opened
    #[error("No transport to relay: direct ({direct}); tunnel ({tunnel})")]
    Negotiation {
        /// Why the direct attempt failed
        direct: String,
        /// Why the tunnel attempt failed
        tunnel: String,
    },
}

impl TransportError {
    /// Diagnostics attached to a bootstrap failure, if any
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            TransportError::Deployment { diagnostics, .. } | TransportError::BootstrapTimeout { diagnostics, .. } => {
                Some(diagnostics)
            }
            _ => None,
        }
    }
}
