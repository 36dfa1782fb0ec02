//! Unit tests for connection setup

use super::*;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tether_relay::{ConnectionLoop, RelayConfig, RelayInfo};
use tether_ssh::{CommandOutput, ConnectionInfo, TransportError, TransportType};
use tokio::io::DuplexStream;

fn relay_config() -> RelayConfig {
    RelayConfig {
        disable_pty: true,
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    }
}

/// Client end of an in-process relay connection
fn spawn_relay() -> DuplexStream {
    let config = relay_config();
    let info = RelayInfo::detect(&config);
    let (client, relay) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(relay);
    let mut connection = ConnectionLoop::with_io(reader, writer, &config, info);
    tokio::spawn(async move { connection.run().await });
    client
}

#[derive(Default)]
struct RelayDialer {
    dials: AtomicUsize,
}

#[async_trait]
impl Dialer for RelayDialer {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<Box<dyn ByteStream>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(spawn_relay()))
    }
}

#[derive(Default)]
struct BlackholeDialer {
    dials: AtomicUsize,
}

#[async_trait]
impl Dialer for BlackholeDialer {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<Box<dyn ByteStream>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Probes succeed when `relay_running`; tunnels lead to an in-process relay
struct StubShell {
    relay_running: bool,
    probes: AtomicUsize,
    tunnels: AtomicUsize,
}

impl StubShell {
    fn new(relay_running: bool) -> Self {
        Self {
            relay_running,
            probes: AtomicUsize::new(0),
            tunnels: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RemoteShell for StubShell {
    async fn exec(&self, command: &str) -> std::result::Result<CommandOutput, TransportError> {
        if command.contains(" probe --port") {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.relay_running {
                let info = RelayInfo::detect(&relay_config());
                return Ok(CommandOutput::ok(serde_json::to_string(&info.greeting()).unwrap()));
            }
            return Ok(CommandOutput::failed(1, "connection refused"));
        }
        if command.starts_with("uname") {
            return Ok(CommandOutput::ok("Linux x86_64"));
        }
        Ok(CommandOutput::ok(""))
    }

    async fn upload(&self, _local: &Path, _remote: &str) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    async fn open_tunnel(&self, _port: u16) -> std::result::Result<Box<dyn ByteStream>, TransportError> {
        self.tunnels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(spawn_relay()))
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: "stub".into(),
            port: 22,
            username: None,
            transport_type: TransportType::Local,
        }
    }
}

#[test]
fn test_parse_target() {
    assert_eq!(
        ConnectionBuilder::parse_target("deploy@build-01:2222"),
        (Some("deploy".to_string()), "build-01".to_string(), 2222)
    );
    assert_eq!(
        ConnectionBuilder::parse_target("build-01"),
        (None, "build-01".to_string(), 22)
    );
    assert_eq!(
        ConnectionBuilder::parse_target("root@10.0.0.5"),
        (Some("root".to_string()), "10.0.0.5".to_string(), 22)
    );
    assert_eq!(
        ConnectionBuilder::parse_target("[::1]:2200"),
        (None, "::1".to_string(), 2200)
    );
    assert_eq!(
        ConnectionBuilder::parse_target("fe80::1"),
        (None, "fe80::1".to_string(), 22)
    );
}

#[test]
fn test_builder_configuration() {
    let builder = ConnectionBuilder::new("dev@box:2022")
        .with_key("/home/dev/.ssh/id_ed25519")
        .with_ssh_option("ServerAliveInterval", "30")
        .with_relay_port(9000)
        .with_remote_dir("/opt/tether")
        .with_request_timeout(Duration::from_secs(5));

    assert_eq!(builder.target(), "dev@box:2022");
    assert_eq!(builder.ssh_config().host, "box");
    assert_eq!(builder.ssh_config().port, 2022);
    assert_eq!(builder.ssh_config().username.as_deref(), Some("dev"));
    assert_eq!(builder.ssh_config().options.get("ServerAliveInterval").unwrap(), "30");
    assert_eq!(builder.config().bootstrap.relay_port, 9000);
    assert_eq!(builder.config().bootstrap.remote_dir, "/opt/tether");
    assert_eq!(builder.config().request_timeout, Duration::from_secs(5));
    assert_eq!(builder.config().negotiate.direct_timeout, Duration::from_secs(5));
    assert_eq!(builder.config().bootstrap.probe_attempts, 15);
}

#[tokio::test]
async fn test_empty_host_is_rejected() {
    let result = ConnectionBuilder::new("user@").connect().await;
    assert!(matches!(result, Err(TetherError::Configuration(_))));
}

#[tokio::test]
async fn test_running_relay_connects_directly() {
    let shell = StubShell::new(true);
    let dialer = RelayDialer::default();

    let connection = Connection::connect_with(&shell, &dialer, "box", ClientConfig::default())
        .await
        .unwrap();

    assert_eq!(connection.kind(), ChannelKind::Direct);
    let outcome = connection.bootstrap_outcome().unwrap();
    assert!(!outcome.deployed && !outcome.started);
    assert_eq!(shell.probes.load(Ordering::SeqCst), 1);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    assert_eq!(shell.tunnels.load(Ordering::SeqCst), 0);
    assert_eq!(connection.greeting().version, "2.0");

    connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_port_uses_tunnel() {
    let shell = StubShell::new(true);
    let dialer = BlackholeDialer::default();

    let connection = Connection::connect_with(&shell, &dialer, "box", ClientConfig::default())
        .await
        .unwrap();

    assert_eq!(connection.kind(), ChannelKind::Tunneled);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    assert_eq!(shell.tunnels.load(Ordering::SeqCst), 1);
    assert!(!connection.greeting().pty_available);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_timeout_skips_negotiation() {
    let artifact = tempfile::NamedTempFile::new().unwrap();
    let shell = StubShell::new(false);
    let dialer = RelayDialer::default();
    let config = ClientConfig {
        bootstrap: BootstrapConfig::default().with_artifact(artifact.path()),
        ..Default::default()
    };

    let result = Connection::connect_with(&shell, &dialer, "box", config).await;

    match result {
        Err(TetherError::Transport(TransportError::BootstrapTimeout { attempts, .. })) => assert_eq!(attempts, 15),
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("connected without a relay"),
    }
    assert_eq!(shell.probes.load(Ordering::SeqCst), 16);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    assert_eq!(shell.tunnels.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_over_stream_reports_direct() {
    let connection = Connection::over_stream(spawn_relay(), &ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(connection.kind(), ChannelKind::Direct);
    assert!(!connection.is_closed());

    let info = connection.system_info().await.unwrap();
    assert_eq!(info.sessions, 0);
    assert_eq!(info.pid, connection.greeting().pid);

    connection.close().await;
    assert!(connection.is_closed());
    assert!(matches!(connection.system_info().await, Err(TetherError::Closed)));
}
