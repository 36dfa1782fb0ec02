//! Request handlers for single-shot methods

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, UNIX_EPOCH};
use tether_proto::{
    DirEntry, EntryKind, ErrorCode, ErrorDetails, ExecOutput, ExecParams, FileContent, FileStat, Method,
    PathParams, WriteFileParams,
};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, warn};

/// Handler trait for single-shot methods
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one call and produce its result payload
    async fn handle(&self, method: Method, params: Value) -> Result<Value, ErrorDetails>;
}

/// Decode method parameters, reporting mismatches as `InvalidParams`
pub fn decode<T: DeserializeOwned>(method: Method, params: Value) -> Result<T, ErrorDetails> {
    serde_json::from_value(params).map_err(|e| {
        ErrorDetails::new(ErrorCode::InvalidParams, format!("invalid params for {}: {}", method, e))
            .with_context("method", method.as_str())
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ErrorDetails> {
    serde_json::to_value(value).map_err(|e| ErrorDetails::new(ErrorCode::InternalError, e.to_string()))
}

/// Map a failed filesystem operation onto the wire error codes
fn fs_error(err: anyhow::Error, path: &str) -> ErrorDetails {
    match err.downcast_ref::<std::io::Error>() {
        Some(io) => ErrorDetails::new(ErrorCode::from_io_kind(io.kind()), format!("{:#}", err))
            .with_context("path", path),
        None => ErrorDetails::new(ErrorCode::Io, format!("{:#}", err)).with_context("path", path),
    }
}

/// Handler for `fs.*` methods
pub struct FsHandler;

#[async_trait]
impl Handler for FsHandler {
    async fn handle(&self, method: Method, params: Value) -> Result<Value, ErrorDetails> {
        match method {
            Method::ReadDir => {
                let PathParams { path } = decode(method, params)?;
                debug!("Listing directory: {}", path);
                let entries = read_dir(Path::new(&path)).await.map_err(|e| fs_error(e, &path))?;
                encode(&entries)
            }
            Method::ReadFile => {
                let PathParams { path } = decode(method, params)?;
                debug!("Reading file: {}", path);
                let content = read_file(Path::new(&path)).await.map_err(|e| fs_error(e, &path))?;
                encode(&FileContent { content })
            }
            Method::WriteFile => {
                let WriteFileParams { path, content } = decode(method, params)?;
                debug!("Writing file: {} ({} bytes)", path, content.len());
                write_file(Path::new(&path), &content)
                    .await
                    .map_err(|e| fs_error(e, &path))?;
                Ok(Value::Null)
            }
            Method::Stat => {
                let PathParams { path } = decode(method, params)?;
                let stat = stat(Path::new(&path)).await.map_err(|e| fs_error(e, &path))?;
                encode(&stat)
            }
            other => Err(ErrorDetails::new(
                ErrorCode::MethodNotFound,
                format!("FsHandler does not handle {}", other),
            )),
        }
    }
}

async fn read_dir(path: &Path) -> Result<Vec<DirEntry>> {
    let mut dir = fs::read_dir(path)
        .await
        .with_context(|| format!("failed to read directory {}", path.display()))?;

    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await.context("failed to read directory entry")? {
        let name = entry.file_name().to_string_lossy().to_string();
        // DirEntry::file_type does not follow links
        let kind = match entry.file_type().await {
            Ok(file_type) => EntryKind::from_file_type(file_type),
            Err(e) => {
                warn!("could not classify {}: {}", name, e);
                EntryKind::File
            }
        };
        entries.push(DirEntry { name, kind });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn read_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            debug!("{} is not valid UTF-8, decoding lossily", path.display());
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    })
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

async fn stat(path: &Path) -> Result<FileStat> {
    let metadata = fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };

    Ok(FileStat {
        kind: EntryKind::from_file_type(metadata.file_type()),
        size: metadata.len(),
        mtime,
        mode,
    })
}

/// Handler for `terminal.exec`
pub struct ExecHandler {
    default_timeout: Duration,
}

impl ExecHandler {
    /// Create a handler bounding commands by `default_timeout` unless a
    /// request asks for less
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    async fn run(&self, params: ExecParams) -> Result<ExecOutput, ErrorDetails> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&params.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn().map_err(|e| {
            error!("failed to spawn `{}`: {}", params.command, e);
            ErrorDetails::new(ErrorCode::from_io_kind(e.kind()), format!("failed to spawn command: {}", e))
        })?;

        let budget = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        // kill_on_drop reaps the child when the timeout drops the future
        match tokio::time::timeout(budget, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            }),
            Ok(Err(e)) => Err(ErrorDetails::new(ErrorCode::Io, format!("command failed: {}", e))),
            Err(_) => Err(ErrorDetails::new(
                ErrorCode::Timeout,
                format!("command timed out after {}ms", budget.as_millis()),
            )
            .with_context("command", params.command)),
        }
    }
}

#[async_trait]
impl Handler for ExecHandler {
    async fn handle(&self, method: Method, params: Value) -> Result<Value, ErrorDetails> {
        match method {
            Method::TerminalExec => {
                let params: ExecParams = decode(method, params)?;
                debug!("Executing: {}", params.command);
                let output = self.run(params).await?;
                encode(&output)
            }
            other => Err(ErrorDetails::new(
                ErrorCode::MethodNotFound,
                format!("ExecHandler does not handle {}", other),
            )),
        }
    }
}
