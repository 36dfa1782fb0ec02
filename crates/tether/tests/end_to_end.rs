//! End-to-end tests: the client API against an in-process relay connection
//! loop, using piped-process sessions

#![cfg(unix)]

use anyhow::{Context, Result};
use proptest::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use tether::proto::{BackendKind, CreateSessionParams, EntryKind, ErrorCode};
use tether::{ClientConfig, Connection, TerminalEvent, TetherError};
use tether_relay::{ConnectionLoop, RelayConfig, RelayInfo};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether=debug,tether_relay=debug")
        .with_test_writer()
        .try_init();
}

async fn connect() -> Result<(Connection, JoinHandle<anyhow::Result<()>>)> {
    connect_relay(true).await
}

async fn connect_relay(disable_pty: bool) -> Result<(Connection, JoinHandle<anyhow::Result<()>>)> {
    init_tracing();
    let config = RelayConfig {
        disable_pty,
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    };
    let info = RelayInfo::detect(&config);
    let (client, relay) = tokio::io::duplex(256 * 1024);
    let (reader, writer) = tokio::io::split(relay);
    let mut relay_loop = ConnectionLoop::with_io(reader, writer, &config, info);
    let relay_task = tokio::spawn(async move { relay_loop.run().await });

    let connection = Connection::over_stream(client, &ClientConfig::default())
        .await
        .context("Failed to connect to relay")?;
    Ok((connection, relay_task))
}

fn shell_session(cwd: Option<String>) -> CreateSessionParams {
    CreateSessionParams {
        cwd,
        shell: Some("/bin/sh".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_greeting_reports_capabilities() -> Result<()> {
    let (connection, _relay) = connect().await?;

    let greeting = connection.greeting();
    assert_eq!(greeting.version, "2.0");
    assert!(!greeting.pty_available);
    assert_eq!(greeting.shell, "/bin/sh");
    assert_eq!(greeting.pid, std::process::id());
    Ok(())
}

#[tokio::test]
async fn test_filesystem_operations() -> Result<()> {
    let (connection, _relay) = connect().await?;
    let dir = tempfile::tempdir()?;
    let root = dir.path().to_string_lossy().to_string();

    connection
        .write_file(&format!("{}/nested/deeper/notes.txt", root), "line one\nline two\n")
        .await?;
    connection.write_file(&format!("{}/b.txt", root), "b").await?;
    std::os::unix::fs::symlink(dir.path().join("b.txt"), dir.path().join("a-link"))?;

    let content = connection.read_file(&format!("{}/nested/deeper/notes.txt", root)).await?;
    assert_eq!(content, "line one\nline two\n");

    let entries = connection.read_directory(&root).await?;
    let listing: Vec<(&str, EntryKind)> = entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
    assert_eq!(
        listing,
        vec![
            ("a-link", EntryKind::Symlink),
            ("b.txt", EntryKind::File),
            ("nested", EntryKind::Directory),
        ]
    );

    let stat = connection.stat(&format!("{}/b.txt", root)).await?;
    assert_eq!(stat.kind, EntryKind::File);
    assert_eq!(stat.size, 1);
    assert!(stat.mtime > 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_and_forbidden_paths_are_distinguished() -> Result<()> {
    let (connection, _relay) = connect().await?;

    let missing = connection.stat("/missing/path").await.unwrap_err();
    assert!(missing.is_not_found(), "unexpected error: {}", missing);

    if nix::unistd::Uid::effective().is_root() {
        // root is never denied
        return Ok(());
    }

    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir()?;
    let locked = dir.path().join("locked");
    std::fs::create_dir(&locked)?;
    std::fs::write(locked.join("secret"), "x")?;
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000))?;

    let denied = connection
        .stat(&locked.join("secret").to_string_lossy())
        .await
        .unwrap_err();
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755))?;

    assert!(denied.is_permission_denied(), "unexpected error: {}", denied);
    assert!(!denied.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_execute() -> Result<()> {
    let (connection, _relay) = connect().await?;
    let dir = tempfile::tempdir()?;

    let output = connection
        .execute("pwd; echo oops >&2; exit 4", Some(&dir.path().to_string_lossy()), None)
        .await?;
    assert_eq!(output.exit_code, Some(4));
    assert!(output.stdout.trim_end().ends_with(&*dir.path().file_name().unwrap().to_string_lossy()));
    assert_eq!(output.stderr, "oops\n");

    let err = connection
        .execute("sleep 5", None, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&ErrorCode::Timeout));
    Ok(())
}

#[tokio::test]
async fn test_session_output_and_exit() -> Result<()> {
    let (connection, _relay) = connect().await?;
    let dir = tempfile::tempdir()?;

    let mut session = connection
        .create_session(shell_session(Some(dir.path().to_string_lossy().to_string())))
        .await?;
    // sent before the ready frame; held back by the proxy
    session.write("echo hello-from-relay; pwd; exit 3\n")?;
    session.resize(100, 30)?;

    let ready = timeout(WAIT, session.wait_ready()).await??;
    assert_eq!(ready.backend, BackendKind::Spawn);
    assert!(session.is_ready());

    let events = session.take_events().context("events already taken")?;
    let (output, end) = timeout(WAIT, events.collect_output()).await?;
    assert!(output.contains("hello-from-relay"), "output: {:?}", output);
    assert!(output.contains(&*dir.path().file_name().unwrap().to_string_lossy()));
    assert_eq!(
        end,
        Some(TerminalEvent::Exit {
            code: Some(3),
            signal: None
        })
    );

    // late input and repeated kills are quiet
    session.write("echo too late\n")?;
    session.kill(None)?;
    session.kill(Some("SIGKILL"))?;
    assert_eq!(connection.pending_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_terminal_session_over_pty() -> Result<()> {
    let (connection, _relay) = connect_relay(false).await?;
    if !connection.greeting().pty_available {
        eprintln!("no pseudo-terminal available, skipping");
        return Ok(());
    }

    let mut session = connection.create_session(shell_session(None)).await?;
    // queued until ready, then applied in order
    session.resize(100, 30)?;
    session.write("stty size; sleep 3 &\nexit 5\n")?;

    let ready = timeout(WAIT, session.wait_ready()).await??;
    assert_eq!(ready.backend, BackendKind::Pty);

    let (output, end) = timeout(WAIT, session.take_events().unwrap().collect_output()).await?;
    assert!(output.contains("30 100"), "output: {:?}", output);
    assert_eq!(
        end,
        Some(TerminalEvent::Exit {
            code: Some(5),
            signal: None
        })
    );
    assert_eq!(connection.system_info().await?.sessions, 0);
    Ok(())
}

#[tokio::test]
async fn test_kill_reports_signal() -> Result<()> {
    let (connection, _relay) = connect().await?;

    let mut session = connection.create_session(shell_session(None)).await?;
    timeout(WAIT, session.wait_ready()).await??;
    session.kill(None)?;
    session.kill(None)?;

    let (_, end) = timeout(WAIT, session.take_events().unwrap().collect_output()).await?;
    assert_eq!(
        end,
        Some(TerminalEvent::Exit {
            code: None,
            signal: Some("SIGTERM".to_string())
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_session_env_override() -> Result<()> {
    let (connection, _relay) = connect().await?;

    let mut params = shell_session(None);
    params.env = HashMap::from([("TETHER_TEST_VALUE".to_string(), "forty-two".to_string())]);
    let mut session = connection.create_session(params).await?;
    session.write("echo \"$TETHER_TEST_VALUE\"; exit\n")?;

    let (output, _) = timeout(WAIT, session.take_events().unwrap().collect_output()).await?;
    assert!(output.contains("forty-two"), "output: {:?}", output);
    Ok(())
}

#[tokio::test]
async fn test_unusable_shell_fails_session() -> Result<()> {
    let (connection, _relay) = connect().await?;

    let mut session = connection
        .create_session(CreateSessionParams {
            shell: Some("/nonexistent/shell".to_string()),
            ..Default::default()
        })
        .await?;

    let err = timeout(WAIT, session.wait_ready()).await?.unwrap_err();
    assert_eq!(err.code(), Some(&ErrorCode::SessionCreate));
    assert!(matches!(session.next_event().await, Some(TerminalEvent::Failed(_))));
    Ok(())
}

#[tokio::test]
async fn test_close_ends_every_session() -> Result<()> {
    let (connection, relay) = connect().await?;

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let mut session = connection.create_session(shell_session(None)).await?;
        timeout(WAIT, session.wait_ready()).await??;
        sessions.push(session);
    }
    assert_eq!(connection.system_info().await?.sessions, 3);

    connection.close().await;

    for session in &mut sessions {
        match timeout(WAIT, session.next_event()).await? {
            Some(TerminalEvent::Ready(_)) => match session.next_event().await {
                Some(TerminalEvent::Failed(details)) => assert_eq!(details.code, ErrorCode::Closed),
                other => panic!("unexpected event: {:?}", other),
            },
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(session.write("ls\n"), Err(TetherError::Closed)));
    }

    // the relay sees EOF, kills its sessions and returns
    timeout(WAIT, relay).await??.context("relay loop failed")?;
    assert!(matches!(connection.read_file("/etc/hostname").await, Err(TetherError::Closed)));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_write_then_read_returns_content(content in "(?s).{0,256}") {
        let read_back = tokio_test::block_on(async {
            let (connection, _relay) = connect().await.unwrap();
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("roundtrip.txt").to_string_lossy().to_string();
            connection.write_file(&path, &content).await.unwrap();
            connection.read_file(&path).await.unwrap()
        });
        prop_assert_eq!(read_back, content);
    }
}
