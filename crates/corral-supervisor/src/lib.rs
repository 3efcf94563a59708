//! Child-process supervision.
//!
//! The supervisor owns the OS side of every agent: it spawns the child
//! with the agent environment overlay, streams its output, enforces the
//! graceful-stop protocol, and reports every exit on the bus.

use corral_bus::{Event, EventBus};
use corral_core::{AgentId, CorralError, CorralResult, ErrorSeverity};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(30);
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub agent_id: AgentId,
    pub agent_kind: String,
    pub agent_name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Agent-specific overlay on the inherited environment.
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Passed once as `--config <json>`; the child reads it at startup.
    pub config: serde_json::Value,
}

impl SpawnSpec {
    pub fn new(agent_id: AgentId, program: impl Into<String>) -> Self {
        Self {
            agent_id,
            agent_kind: String::new(),
            agent_name: String::new(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            log_dir: None,
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM; the child is expected to exit within the grace window.
    Soft,
    /// SIGKILL.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub source: OutputSource,
    pub line: String,
}

/// Handle to one supervised child. Reaping happens on a background task
/// the moment the child exits; waiters only observe the recorded code.
pub struct ProcessHandle {
    pub agent_id: AgentId,
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    output: Mutex<Option<mpsc::Receiver<OutputLine>>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The line stream of the child's stdout and stderr. Can be taken once.
    pub async fn output(&self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output.lock().await.take()
    }

    /// Exit code, if the child has already been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_code().is_none()
    }
}

/// Spawns and reaps agent processes.
#[derive(Clone)]
pub struct Supervisor {
    bus: EventBus,
    grace_timeout: Duration,
}

impl Supervisor {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            grace_timeout: DEFAULT_GRACE_TIMEOUT,
        }
    }

    pub fn with_grace_timeout(mut self, grace_timeout: Duration) -> Self {
        self.grace_timeout = grace_timeout;
        self
    }

    pub fn grace_timeout(&self) -> Duration {
        self.grace_timeout
    }

    /// Spawn the child with piped stdio and the agent environment overlay
    /// (`AGENT_ID`, `AGENT_TYPE`, `AGENT_NAME`, `WORKING_DIR`, `LOG_DIR`).
    /// Every exit is reaped and published as `process:exit`; a non-zero
    /// code additionally raises `agent:error {kind: process_exit}`.
    pub async fn spawn(&self, spec: SpawnSpec) -> CorralResult<ProcessHandle> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.env("AGENT_ID", spec.agent_id.to_string());
        cmd.env("AGENT_TYPE", &spec.agent_kind);
        cmd.env("AGENT_NAME", &spec.agent_name);
        if let Some(dir) = &spec.working_dir {
            cmd.env("WORKING_DIR", dir.as_os_str());
            cmd.current_dir(dir);
        }
        if let Some(dir) = &spec.log_dir {
            cmd.env("LOG_DIR", dir.as_os_str());
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if !spec.config.is_null() {
            cmd.arg("--config").arg(spec.config.to_string());
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            CorralError::ProcessFailed(format!("spawn '{}' failed: {e}", spec.program))
        })?;
        let pid = child.id().ok_or_else(|| {
            CorralError::ProcessFailed(format!("'{}' exited before it could be tracked", spec.program))
        })?;

        info!(agent_id = %spec.agent_id, pid, program = %spec.program, "spawned agent process");

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, OutputSource::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, OutputSource::Stderr, tx);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let bus = self.bus.clone();
        let agent_id = spec.agent_id;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(agent_id = %agent_id, pid, error = %e, "wait on agent process failed");
                    -1
                }
            };
            info!(agent_id = %agent_id, pid, code, "agent process exited");
            bus.publish(Event::ProcessExit {
                agent_id,
                exit_code: code,
            });
            if code != 0 {
                bus.publish(Event::AgentError {
                    agent_id,
                    kind: "process_exit".to_string(),
                    message: format!("process exited with code {code}"),
                    severity: ErrorSeverity::High,
                });
            }
            let _ = exit_tx.send(Some(code));
        });

        Ok(ProcessHandle {
            agent_id: spec.agent_id,
            pid,
            exit: exit_rx,
            output: Mutex::new(Some(rx)),
        })
    }

    pub fn signal(&self, handle: &ProcessHandle, kind: SignalKind) -> CorralResult<()> {
        let signal = match kind {
            SignalKind::Soft => Signal::SIGTERM,
            SignalKind::Hard => Signal::SIGKILL,
        };
        debug!(agent_id = %handle.agent_id, pid = handle.pid, ?signal, "signalling agent process");
        kill(Pid::from_raw(handle.pid as i32), signal)
            .map_err(|e| CorralError::ProcessFailed(format!("signal pid {}: {e}", handle.pid)))
    }

    /// Wait for the recorded exit code, up to `timeout`.
    pub async fn wait_exit(&self, handle: &ProcessHandle, timeout: Duration) -> CorralResult<i32> {
        let mut exit = handle.exit.clone();
        let wait = async {
            loop {
                if let Some(code) = *exit.borrow() {
                    return Ok(code);
                }
                if exit.changed().await.is_err() {
                    return Err(CorralError::ProcessFailed(format!(
                        "supervisor lost track of pid {}",
                        handle.pid
                    )));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CorralError::Timeout(format!(
                "pid {} did not exit within {:?}",
                handle.pid, timeout
            ))),
        }
    }

    /// Graceful stop protocol: soft-terminate, wait out the grace window,
    /// hard-kill whatever is left, always reap.
    pub async fn stop(&self, handle: &ProcessHandle) -> CorralResult<i32> {
        if let Some(code) = handle.exit_code() {
            return Ok(code);
        }

        self.signal(handle, SignalKind::Soft)?;
        match self.wait_exit(handle, self.grace_timeout).await {
            Ok(code) => Ok(code),
            Err(CorralError::Timeout(_)) => {
                warn!(agent_id = %handle.agent_id, pid = handle.pid,
                    "agent ignored soft terminate, killing");
                self.signal(handle, SignalKind::Hard)?;
                self.wait_exit(handle, Duration::from_secs(5)).await
            }
            Err(other) => Err(other),
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // A signal death carries no code; report 128 + signal, the shell
        // convention.
        status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

fn spawn_line_reader<R>(reader: R, source: OutputSource, tx: mpsc::Sender<OutputLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(OutputLine { source, line }).await.is_err() {
                break;
            }
        }
    });
}
