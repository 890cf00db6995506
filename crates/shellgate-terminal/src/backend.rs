/// Execution backend abstraction for PTY and container implementations
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shellgate_types::{GateError, OutputKind, ResourceLimits, SessionId, DEFAULT_COLS, DEFAULT_ROWS};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of a backend's output channel, in events
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Everything a backend needs to bring up one isolated shell
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub session_id: SessionId,
    /// Host directory that becomes the shell's only writable area
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
    /// Shell program; the backend default when unset
    pub shell: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl BackendSpec {
    pub fn new(session_id: impl Into<SessionId>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            workspace: workspace.into(),
            limits: ResourceLimits::default(),
            shell: None,
            environment: BTreeMap::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Reference to one running backend instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle {
    /// Container id or PTY instance id
    pub id: String,
    pub session_id: SessionId,
    /// Where the workspace appears from inside the backend
    pub workdir: PathBuf,
}

impl BackendHandle {
    /// Translate a workspace-relative path to the backend's view of it
    pub fn backend_path(&self, relative: &Path) -> PathBuf {
        if relative.as_os_str().is_empty() {
            self.workdir.clone()
        } else {
            self.workdir.join(relative)
        }
    }
}

/// Unsolicited events from a running backend, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Output { kind: OutputKind, data: Vec<u8> },
    /// The shell exited on its own
    Exited { code: Option<i32> },
    /// The backend died underneath the shell (crash, OOM, container gone)
    Terminated { reason: String },
}

pub struct StartedBackend {
    pub handle: BackendHandle,
    /// Single-consumer output stream for the session pump
    pub output: mpsc::Receiver<BackendEvent>,
    /// The shell prints completion markers before each prompt. Without
    /// them, completion falls back to prompt matching.
    pub emits_markers: bool,
}

/// Result of the exit-code-bearing exec primitive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Exited within the grace period
    Graceful,
    /// Had to be force-removed
    Forced,
    /// Nothing was running under that handle
    AlreadyGone,
}

/// One instance owned by this service, as reported to the orphan sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInstance {
    pub id: String,
    pub session_id: Option<SessionId>,
    pub running: bool,
}

impl BackendInstance {
    /// Handle suitable for tearing down an instance found by listing
    pub fn handle(&self) -> BackendHandle {
        BackendHandle {
            id: self.id.clone(),
            session_id: self.session_id.clone().unwrap_or_default(),
            workdir: PathBuf::new(),
        }
    }
}

/// Bounds on operations that depend on backend responsiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendTimeouts {
    pub startup: Duration,
    pub write: Duration,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(10),
            write: Duration::from_secs(2),
        }
    }
}

/// Run `future` under `limit`, mapping expiry to `BackendUnresponsive`
pub async fn bounded<T, F>(operation: &str, limit: Duration, future: F) -> Result<T, GateError>
where
    F: Future<Output = Result<T, GateError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(GateError::unresponsive(operation, limit)),
    }
}

/// Execution backend trait - abstraction over PTY and container shells.
///
/// All operations take `&self` so one backend serves every session
/// concurrently. Calls that depend on the backend being responsive are
/// time-bounded and fail with `BackendUnresponsive` instead of hanging.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Bring up an isolated interactive shell
    async fn start(&self, spec: BackendSpec) -> Result<StartedBackend, GateError>;

    /// Write raw bytes to the shell's stdin. Fails if the shell is gone.
    async fn write(&self, handle: &BackendHandle, data: &[u8]) -> Result<(), GateError>;

    async fn resize(&self, handle: &BackendHandle, cols: u16, rows: u16) -> Result<(), GateError>;

    /// Interrupt the foreground program (Ctrl-C)
    async fn interrupt(&self, handle: &BackendHandle) -> Result<(), GateError> {
        self.write(handle, b"\x03").await
    }

    /// Graceful termination, then forced removal once `grace` elapses.
    /// Safe to call for handles that are already gone.
    async fn kill(&self, handle: &BackendHandle, grace: Duration) -> Result<KillOutcome, GateError>;

    /// Run a command non-interactively next to the shell and capture its
    /// output and exit status. Dropping the future before it resolves must
    /// stop the command.
    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecOutput, GateError>;

    /// All instances this service owns, for orphan reconciliation
    async fn list_instances(&self) -> Result<Vec<BackendInstance>, GateError>;

    /// Get backend name for logging
    fn backend_name(&self) -> &str;
}

/// Configuration for which backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local pseudo-terminal (default)
    #[default]
    Pty,
    /// One container per session
    Docker,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "pty" | "local" => Ok(Self::Pty),
            "docker" | "container" => Ok(Self::Docker),
            _ => Err(anyhow::anyhow!(
                "Invalid execution backend: '{}'. Valid options: 'pty', 'docker'",
                s
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pty => write!(f, "pty"),
            Self::Docker => write!(f, "docker"),
        }
    }
}
