//! Relay bootstrap: probe, deploy, start and readiness polling

use crate::error::Diagnostics;
use crate::transport::{shell_quote, RemoteShell};
use crate::TransportError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_proto::{Greeting, DEFAULT_RELAY_PORT};
use tracing::{debug, info, warn};

/// File name of the relay executable inside the remote directory
pub const RELAY_BINARY: &str = "tether-relay";

/// Append-only log the started relay writes to
pub const RELAY_LOG: &str = "relay.log";

/// Deployment manifest written next to the artifact
pub const MANIFEST: &str = "manifest.json";

/// Bootstrap settings
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Remote working directory (relative paths resolve against the login directory)
    pub remote_dir: String,
    /// Port the relay serves on
    pub relay_port: u16,
    /// Local relay executable to deploy
    pub artifact_path: PathBuf,
    /// Command run in the remote directory after upload
    pub install_command: Option<String>,
    /// Readiness probes after start
    pub probe_attempts: u32,
    /// Delay before each readiness probe
    pub probe_delay: Duration,
    /// How long the remote probe waits for a greeting
    pub probe_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            remote_dir: ".tether".to_string(),
            relay_port: DEFAULT_RELAY_PORT,
            artifact_path: PathBuf::from("target/release/tether-relay"),
            install_command: None,
            probe_attempts: 15,
            probe_delay: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl BootstrapConfig {
    /// Set the remote directory
    pub fn with_remote_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_dir = dir.into();
        self
    }

    /// Set the relay port
    pub fn with_relay_port(mut self, port: u16) -> Self {
        self.relay_port = port;
        self
    }

    /// Set the local artifact
    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = path.into();
        self
    }

    /// Set the post-upload install command
    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), name)
    }
}

/// What was found on the remote host when the first probe failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDeploymentState {
    /// No relay executable in the remote directory
    NotDeployed,
    /// Executable present, no relay process
    DeployedNotRunning,
    /// A relay process exists but did not answer the probe
    RunningUnresponsive,
    /// A relay answered the probe
    RunningReady,
}

/// Platform information detected from remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Operating system (e.g., "Linux", "Darwin")
    pub os: String,
    /// Architecture (e.g., "x86_64", "aarch64")
    pub arch: String,
}

impl PlatformInfo {
    /// Parse `uname -sm` output
    pub fn parse(uname: &str) -> Option<Self> {
        let mut parts = uname.split_whitespace();
        let os = parts.next()?.to_string();
        let arch = parts.next()?.to_string();
        Some(Self { os, arch })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    name: &'a str,
    version: &'a str,
    os: &'a str,
    arch: &'a str,
    deployed_at: u64,
}

/// Result of a successful bootstrap
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    /// Remote state before any action was taken
    pub state: RemoteDeploymentState,
    /// Whether the artifact was uploaded
    pub deployed: bool,
    /// Whether a relay process was launched
    pub started: bool,
    /// Probes made, including the first
    pub probes: u32,
    /// Platform detected during deploy
    pub platform: Option<PlatformInfo>,
    /// Greeting returned by the answering relay
    pub greeting: Greeting,
}

/// Bootstrap orchestrator
pub struct Bootstrap {
    config: BootstrapConfig,
}

impl Bootstrap {
    /// Create a new bootstrap instance
    pub fn new(config: BootstrapConfig) -> Self {
        Self { config }
    }

    /// Bootstrap settings
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Make sure a relay answers on the configured port
    pub async fn run(&self, shell: &dyn RemoteShell) -> Result<BootstrapOutcome, TransportError> {
        let host = shell.connection_info().host;
        info!("Bootstrapping relay on {} port {}", host, self.config.relay_port);

        if let Some(greeting) = self.probe(shell).await? {
            info!("Relay {} already running (pid {})", greeting.relay_version, greeting.pid);
            return Ok(BootstrapOutcome {
                state: RemoteDeploymentState::RunningReady,
                deployed: false,
                started: false,
                probes: 1,
                platform: None,
                greeting,
            });
        }

        let state = self.assess(shell).await?;
        debug!("Remote state: {:?}", state);

        let platform = self.deploy(shell).await?;
        self.start(shell).await?;
        let (greeting, polls) = self.poll(shell).await?;

        info!("Relay ready after {} probes (pid {})", polls, greeting.pid);
        Ok(BootstrapOutcome {
            state,
            deployed: true,
            started: true,
            probes: polls + 1,
            platform: Some(platform),
            greeting,
        })
    }

    /// Run the relay's probe subcommand remotely; `None` when nothing answers
    pub async fn probe(&self, shell: &dyn RemoteShell) -> Result<Option<Greeting>, TransportError> {
        let command = format!(
            "{} probe --port {} --timeout-ms {} 2>/dev/null",
            shell_quote(&self.config.remote_path(RELAY_BINARY)),
            self.config.relay_port,
            self.config.probe_timeout.as_millis()
        );
        let output = shell.exec(&command).await?;
        if !output.success() {
            debug!("Probe exited with {:?}", output.exit_code);
            return Ok(None);
        }

        let line = output.stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        match serde_json::from_str::<Greeting>(line) {
            Ok(greeting) => Ok(Some(greeting)),
            Err(e) => {
                warn!("Probe printed an unreadable greeting: {}", e);
                Ok(None)
            }
        }
    }

    async fn assess(&self, shell: &dyn RemoteShell) -> Result<RemoteDeploymentState, TransportError> {
        let command = format!(
            "test -x {} && echo deployed; ps -eo args | grep -q '[t]ether-relay serve' && echo running; true",
            shell_quote(&self.config.remote_path(RELAY_BINARY))
        );
        let stdout = shell.exec(&command).await?.stdout;
        let state = if stdout.contains("running") {
            RemoteDeploymentState::RunningUnresponsive
        } else if stdout.contains("deployed") {
            RemoteDeploymentState::DeployedNotRunning
        } else {
            RemoteDeploymentState::NotDeployed
        };
        Ok(state)
    }

    /// Upload the artifact and manifest, then run the install command
    pub async fn deploy(&self, shell: &dyn RemoteShell) -> Result<PlatformInfo, TransportError> {
        let artifact = &self.config.artifact_path;
        if tokio::fs::metadata(artifact).await.is_err() {
            return Err(TransportError::MissingArtifact(artifact.clone()));
        }

        let dir = shell_quote(&self.config.remote_dir);
        self.step(shell, &format!("mkdir -p {}", dir), "create remote directory").await?;

        let uname = self.step(shell, "uname -sm", "detect platform").await?;
        let platform = PlatformInfo::parse(&uname)
            .ok_or_else(|| self.deployment_error(format!("unexpected uname output: {:?}", uname.trim())))?;
        debug!("Detected platform: {} {}", platform.os, platform.arch);

        // Upload beside the live binary, then rename over it
        let staged = self.config.remote_path(&format!("{}.new", RELAY_BINARY));
        info!("Uploading {} for {} {}", artifact.display(), platform.os, platform.arch);
        shell.upload(artifact, &staged).await?;
        self.step(
            shell,
            &format!(
                "chmod 755 {} && mv -f {} {}",
                shell_quote(&staged),
                shell_quote(&staged),
                shell_quote(&self.config.remote_path(RELAY_BINARY))
            ),
            "install relay executable",
        )
        .await?;

        let deployed_at = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let manifest = Manifest {
            name: RELAY_BINARY,
            version: env!("CARGO_PKG_VERSION"),
            os: &platform.os,
            arch: &platform.arch,
            deployed_at,
        };
        let manifest = serde_json::to_string(&manifest)
            .map_err(|e| self.deployment_error(format!("manifest encoding failed: {}", e)))?;
        self.step(
            shell,
            &format!(
                "printf '%s\\n' {} > {}",
                shell_quote(&manifest),
                shell_quote(&self.config.remote_path(MANIFEST))
            ),
            "write manifest",
        )
        .await?;

        if let Some(install) = &self.config.install_command {
            info!("Running install command: {}", install);
            let output = shell.exec(&format!("cd {} && {}", dir, install)).await?;
            if !output.success() {
                let diagnostics = Diagnostics {
                    process_listing: None,
                    log_tail: Some(format!("{}{}", output.stdout, output.stderr)).filter(|s| !s.trim().is_empty()),
                };
                return Err(TransportError::Deployment {
                    message: format!("install command exited with {:?}", output.exit_code),
                    diagnostics,
                });
            }
        }

        Ok(platform)
    }

    /// Stop any stale relay and launch a detached one
    pub async fn start(&self, shell: &dyn RemoteShell) -> Result<(), TransportError> {
        let port = self.config.relay_port;

        // The bracket keeps pkill from matching its own command line
        shell
            .exec(&format!("pkill -f '[t]ether-relay serve --port {}' || true", port))
            .await?;

        let launch = format!(
            "cd {} && nohup ./{} serve --port {} >> {} 2>&1 < /dev/null &",
            shell_quote(&self.config.remote_dir),
            RELAY_BINARY,
            port,
            RELAY_LOG
        );
        info!("Starting relay on port {}", port);
        self.step(shell, &launch, "start relay").await?;
        Ok(())
    }

    /// Probe until the relay answers or attempts run out
    async fn poll(&self, shell: &dyn RemoteShell) -> Result<(Greeting, u32), TransportError> {
        let attempts = self.config.probe_attempts;
        let midpoint = attempts.div_ceil(2);
        let mut captured = Diagnostics::default();

        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.probe_delay).await;
            if let Some(greeting) = self.probe(shell).await? {
                return Ok((greeting, attempt));
            }
            debug!("Relay not ready (attempt {}/{})", attempt, attempts);
            if attempt == midpoint {
                captured = self.capture_diagnostics(shell).await;
                warn!("Relay still not ready after {} probes\n{}", attempt, captured);
            }
        }

        let last = self.capture_diagnostics(shell).await;
        let diagnostics = if last.is_empty() { captured } else { last };
        Err(TransportError::BootstrapTimeout { attempts, diagnostics })
    }

    /// Process listing and log tail from the remote host; best effort
    pub async fn capture_diagnostics(&self, shell: &dyn RemoteShell) -> Diagnostics {
        let mut diagnostics = Diagnostics::default();

        match shell.exec("ps -eo pid,args | grep '[t]ether-relay'").await {
            Ok(out) if !out.stdout.trim().is_empty() => diagnostics.process_listing = Some(out.stdout),
            Ok(_) => diagnostics.process_listing = Some("no relay process".to_string()),
            Err(e) => warn!("Process listing failed: {}", e),
        }

        let tail = format!("tail -n 50 {}", shell_quote(&self.config.remote_path(RELAY_LOG)));
        match shell.exec(&tail).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => diagnostics.log_tail = Some(out.stdout),
            Ok(_) => {}
            Err(e) => warn!("Log tail failed: {}", e),
        }

        diagnostics
    }

    async fn step(&self, shell: &dyn RemoteShell, command: &str, what: &str) -> Result<String, TransportError> {
        let output = shell.exec(command).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(self.deployment_error(format!(
                "{} failed ({:?}): {}",
                what,
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    fn deployment_error(&self, message: String) -> TransportError {
        TransportError::Deployment {
            message,
            diagnostics: Diagnostics::default(),
        }
    }
}
