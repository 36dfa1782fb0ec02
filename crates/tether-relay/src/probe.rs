//! Liveness probe against a running relay

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tether_proto::{Greeting, MessageCodec};
use tokio::net::TcpStream;
use tracing::debug;

/// Connect to a relay and wait for its greeting
pub async fn probe(host: &str, port: u16, wait: Duration) -> Result<Greeting> {
    let attempt = async {
        let mut stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
        let mut codec = MessageCodec::new();

        loop {
            match codec.read_message(&mut stream).await {
                Ok(Some(message)) if message.is_greeting() => {
                    let payload = message
                        .into_result()
                        .map_err(|e| anyhow::anyhow!("relay sent an error greeting: {}", e))?;
                    return serde_json::from_value::<Greeting>(payload).context("Malformed greeting");
                }
                Ok(Some(message)) => debug!("skipping pre-greeting message id={:?}", message.id),
                Ok(None) => bail!("relay closed the connection before greeting"),
                Err(e) => return Err(e).context("Failed to read greeting"),
            }
        }
    };

    tokio::time::timeout(wait, attempt)
        .await
        .with_context(|| format!("Timed out after {:?} waiting for relay greeting", wait))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::server::RelayServer;

    #[tokio::test]
    async fn test_probe_running_relay() {
        let server = RelayServer::bind(RelayConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            disable_pty: true,
            ..Default::default()
        })
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(server.run());

        let greeting = probe("127.0.0.1", port, Duration::from_secs(5)).await.unwrap();
        assert_eq!(greeting.pid, std::process::id());
        assert!(!greeting.pty_available);
    }

    #[tokio::test]
    async fn test_probe_nothing_listening() {
        // Bind then drop to find a port with no listener
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(probe("127.0.0.1", port, Duration::from_secs(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_silent_listener_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = probe("127.0.0.1", port, Duration::from_millis(200)).await.unwrap_err();
        assert!(err.to_string().contains("Timed out"));
    }
}
