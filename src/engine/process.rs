//! Engine process supervision.
//!
//! A launched engine runs under a supervisor task that forwards its output to
//! `tracing`, reports readiness once the engine prints its listening marker,
//! and kills the child when the owning [`EngineProcess`] handle is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::transport::{EngineTransport, HttpTransport};
use crate::config::EngineSettings;
use crate::error::{EngineError, SpawnError};
use crate::types::{ClientId, ClientKind};

/// What to launch: which client the process backs and where it listens.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub client_id: ClientId,
    pub kind: ClientKind,
    pub port: u16,
}

/// Handle to a ready engine process. Dropping it terminates the process.
#[derive(Debug)]
pub struct EngineProcess {
    port: u16,
    _kill: Option<oneshot::Sender<()>>,
}

impl EngineProcess {
    /// A handle with no supervised child, for engines managed elsewhere.
    pub fn detached(port: u16) -> Self {
        Self {
            port,
            _kill: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Starts engine processes and builds transports to reach them.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Resolves once the engine is ready to accept API calls.
    async fn launch(&self, spec: LaunchSpec) -> Result<EngineProcess, SpawnError>;

    fn connect(&self, port: u16) -> Arc<dyn EngineTransport>;
}

/// Launches the engine binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    settings: EngineSettings,
    http: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(settings: EngineSettings) -> Result<Self, SpawnError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self { settings, http })
    }

    pub fn session_dir(&self, spec: &LaunchSpec) -> PathBuf {
        self.settings
            .session_root
            .join(spec.kind.as_str())
            .join(spec.client_id.to_string())
    }

    /// Fixed daemon options, a fresh session under `session_dir`, and the port.
    pub fn command_args(&self, spec: &LaunchSpec) -> Vec<String> {
        vec![
            "-daemon".into(),
            "-config".into(),
            format!("api.key={}", self.settings.api_key),
            "-newsession".into(),
            self.session_dir(spec).join("data").display().to_string(),
            "-port".into(),
            spec.port.to_string(),
        ]
    }
}

#[async_trait]
impl EngineLauncher for ProcessSupervisor {
    async fn launch(&self, spec: LaunchSpec) -> Result<EngineProcess, SpawnError> {
        tokio::fs::create_dir_all(self.session_dir(&spec)).await?;

        let mut child = Command::new(&self.settings.binary)
            .args(self.command_args(&spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("engine stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("engine stderr not captured"))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let span = info_span!(
            "engine",
            client_id = %spec.client_id,
            port = spec.port,
            kind = spec.kind.as_str()
        );
        let marker = self.settings.ready_marker.clone();
        let kind = spec.kind;
        tokio::spawn(
            async move {
                let mut child = child;
                let mut kill_rx = kill_rx;
                let mut ready_tx = Some(ready_tx);
                let mut out = OutputLines::new(stdout, stderr);

                loop {
                    tokio::select! {
                        line = out.next(), if out.is_open() => {
                            let Some((is_err, line)) = line else { continue };
                            log_output(kind, is_err, &line);
                            if !is_err && line.contains(&marker) {
                                if let Some(tx) = ready_tx.take() {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                        }
                        status = child.wait() => {
                            let code = status.ok().and_then(|s| s.code());
                            info!(code = ?code, "engine {} process exited", kind.as_str());
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Err(SpawnError::ExitedEarly { kind: kind.as_str(), code }));
                            }
                            break;
                        }
                        _ = &mut kill_rx => {
                            if let Err(e) = child.kill().await {
                                warn!(error = %e, "failed to kill engine process");
                            }
                            debug!("engine process killed");
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Err(SpawnError::ExitedEarly { kind: kind.as_str(), code: None }));
                            }
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        );

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(client_id = %spec.client_id, port = spec.port, pid = ?pid, "engine ready");
                Ok(EngineProcess {
                    port: spec.port,
                    _kill: Some(kill_tx),
                })
            }
            Ok(Err(e)) => {
                error!(client_id = %spec.client_id, error = %e, "engine failed to start");
                Err(e)
            }
            Err(_) => Err(SpawnError::ExitedEarly {
                kind: spec.kind.as_str(),
                code: None,
            }),
        }
    }

    fn connect(&self, port: u16) -> Arc<dyn EngineTransport> {
        Arc::new(HttpTransport::new(
            self.http.clone(),
            &self.settings.host,
            port,
            self.settings.api_key.clone(),
        ))
    }
}

/// Merged line reader over the child's stdout and stderr.
struct OutputLines {
    stdout: Option<tokio::io::Lines<BufReader<ChildStdout>>>,
    stderr: Option<tokio::io::Lines<BufReader<ChildStderr>>>,
}

impl OutputLines {
    fn new(stdout: ChildStdout, stderr: ChildStderr) -> Self {
        Self {
            stdout: Some(BufReader::new(stdout).lines()),
            stderr: Some(BufReader::new(stderr).lines()),
        }
    }

    fn is_open(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// Next line tagged with whether it came from stderr. `None` when a stream closed.
    async fn next(&mut self) -> Option<(bool, String)> {
        let line = match (self.stdout.as_mut(), self.stderr.as_mut()) {
            (Some(out), Some(err)) => tokio::select! {
                l = out.next_line() => (false, l),
                l = err.next_line() => (true, l),
            },
            (Some(out), None) => (false, out.next_line().await),
            (None, Some(err)) => (true, err.next_line().await),
            (None, None) => return None,
        };
        match line {
            (is_err, Ok(Some(text))) => Some((is_err, text)),
            (is_err, _) => {
                if is_err {
                    self.stderr = None;
                } else {
                    self.stdout = None;
                }
                None
            }
        }
    }
}

fn log_output(kind: ClientKind, is_err: bool, line: &str) {
    match (kind, is_err) {
        (ClientKind::Shared, false) => info!(target: "engine::shared", "{line}"),
        (ClientKind::Shared, true) => error!(target: "engine::shared", "{line}"),
        (ClientKind::Exclusive, false) => info!(target: "engine::exclusive", "{line}"),
        (ClientKind::Exclusive, true) => error!(target: "engine::exclusive", "{line}"),
    }
}
