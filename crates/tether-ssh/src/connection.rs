//! Byte streams carried over an SSH subprocess

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::debug;

/// Any bidirectional byte stream a relay connection can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Stream forwarded to a remote port by `ssh -W`, exposed as the
/// subprocess's stdout (read side) and stdin (write side)
#[derive(Debug)]
pub struct TunnelStream {
    /// SSH process handle
    ssh_process: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl TunnelStream {
    /// Wrap a spawned `ssh -W` process; `None` when its stdio is not piped
    pub fn new(mut ssh_process: Child) -> Option<Self> {
        let stdin = ssh_process.stdin.take()?;
        let stdout = ssh_process.stdout.take()?;
        Some(Self {
            ssh_process,
            stdin,
            stdout,
        })
    }

    /// Process id of the ssh client
    pub fn id(&self) -> Option<u32> {
        self.ssh_process.id()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        debug!("Closing SSH tunnel pid={:?}", self.ssh_process.id());
        let _ = self.ssh_process.start_kill();
    }
}
