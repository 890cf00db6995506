/// PTY-based execution backend (local shell processes)
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use shellgate_types::{GateError, NetworkPolicy, OutputKind, ResourceLimits, SessionId};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{
    bounded, BackendEvent, BackendHandle, BackendInstance, BackendSpec, BackendTimeouts,
    ExecOutput, ExecutionBackend, KillOutcome, StartedBackend, OUTPUT_CHANNEL_CAPACITY,
};
use crate::completion::{BASH_PS1, PLAIN_PS1, PROMPT_COMMAND};
use crate::pty_handler::PtyHandler;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PtyConfig {
    pub default_shell: String,
    pub path: String,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            default_shell: "bash".to_string(),
            path: DEFAULT_PATH.to_string(),
        }
    }
}

struct PtyInstance {
    session_id: SessionId,
    handler: Arc<Mutex<PtyHandler>>,
    pid: Option<u32>,
    shell: String,
    workspace: PathBuf,
    env: BTreeMap<String, String>,
    limits: ResourceLimits,
}

/// PTY backend: one local shell process per session, confined to its
/// workspace by working directory, environment and path validation.
pub struct PtyBackend {
    instances: DashMap<String, Arc<PtyInstance>>,
    config: PtyConfig,
    timeouts: BackendTimeouts,
    next_id: AtomicU64,
    network_warned: AtomicBool,
}

impl PtyBackend {
    pub fn new(config: PtyConfig, timeouts: BackendTimeouts) -> Self {
        Self {
            instances: DashMap::new(),
            config,
            timeouts,
            next_id: AtomicU64::new(1),
            network_warned: AtomicBool::new(false),
        }
    }

    fn instance(&self, handle: &BackendHandle) -> Result<Arc<PtyInstance>, GateError> {
        self.instances
            .get(&handle.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GateError::BackendClosed(format!("no shell for {}", handle.id)))
    }

    fn environment(&self, spec: &BackendSpec, is_bash: bool) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), spec.workspace.display().to_string());
        env.insert("PATH".to_string(), self.config.path.clone());
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
        let ps1 = if is_bash { BASH_PS1 } else { PLAIN_PS1 };
        env.insert("PS1".to_string(), ps1.to_string());
        env.insert("SHELLGATE_SESSION".to_string(), spec.session_id.clone());
        env.extend(spec.environment.clone());
        if is_bash {
            env.insert("PROMPT_COMMAND".to_string(), PROMPT_COMMAND.to_string());
        }
        env
    }

    fn check_isolation(&self, limits: &ResourceLimits) {
        if limits.network == NetworkPolicy::None && !self.network_warned.swap(true, Ordering::Relaxed) {
            warn!("pty backend cannot isolate the network; use the docker backend for network isolation");
        }
        if limits.cpu_shares.is_some() {
            debug!("pty backend ignores cpu shares");
        }
    }
}

/// Program and arguments, wrapped so the memory cap applies before the
/// shell starts
fn command_line(shell: &str, args: Vec<String>, limits: &ResourceLimits) -> (String, Vec<String>) {
    match limits.memory_bytes {
        Some(bytes) => {
            let mut wrapped = vec![
                "-c".to_string(),
                format!("ulimit -v {} 2>/dev/null; exec \"$0\" \"$@\"", bytes / 1024),
                shell.to_string(),
            ];
            wrapped.extend(args);
            ("/bin/sh".to_string(), wrapped)
        }
        None => (shell.to_string(), args),
    }
}

fn is_bash(shell: &str) -> bool {
    Path::new(shell).file_name().and_then(|n| n.to_str()) == Some("bash")
}

fn wait_for_exit(handler: &Mutex<PtyHandler>, limit: Duration) -> Option<Option<i32>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = handler.lock().try_wait() {
            return Some(status);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn signal_hangup(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // Interactive shells ignore SIGTERM but exit on SIGHUP
    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = kill(pid, Signal::SIGHUP) {
        debug!("SIGHUP to {} failed: {}", pid, e);
    }
    let _ = kill(pid, Signal::SIGTERM);
}

#[cfg(not(unix))]
fn signal_hangup(_pid: u32) {}

fn spawn_reader(
    id: String,
    mut reader: Box<dyn Read + Send>,
    handler: Arc<Mutex<PtyHandler>>,
    tx: mpsc::Sender<BackendEvent>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", id))
        .spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let event = BackendEvent::Output {
                            kind: OutputKind::Stdout,
                            data: buffer[..n].to_vec(),
                        };
                        if tx.blocking_send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    // EIO once the child side closes
                    Err(_) => break,
                }
            }
            let code = wait_for_exit(&handler, Duration::from_secs(1)).flatten();
            debug!(backend_id = %id, ?code, "pty reader finished");
            let _ = tx.blocking_send(BackendEvent::Exited { code });
        })
        .map(|_| ())
}

#[async_trait]
impl ExecutionBackend for PtyBackend {
    async fn start(&self, spec: BackendSpec) -> Result<StartedBackend, GateError> {
        if !spec.workspace.is_dir() {
            return Err(GateError::BackendCreateFailed(format!(
                "workspace {} is not a directory",
                spec.workspace.display()
            )));
        }
        self.check_isolation(&spec.limits);

        let shell = spec
            .shell
            .clone()
            .unwrap_or_else(|| self.config.default_shell.clone());
        let bash = is_bash(&shell);
        let args = if bash {
            vec!["--noprofile".to_string(), "--norc".to_string(), "-i".to_string()]
        } else {
            vec!["-i".to_string()]
        };
        let env = self.environment(&spec, bash);
        let (program, args) = command_line(&shell, args, &spec.limits);

        let spawn_env = env.clone();
        let workspace = spec.workspace.clone();
        let (cols, rows) = (spec.cols, spec.rows);
        let spawned = bounded("start", self.timeouts.startup, async move {
            tokio::task::spawn_blocking(move || {
                PtyHandler::spawn(&program, &args, &workspace, &spawn_env, cols, rows)
            })
            .await
            .map_err(|e| GateError::BackendCreateFailed(e.to_string()))?
            .map_err(|e| GateError::BackendCreateFailed(format!("{:#}", e)))
        })
        .await;
        let (handler, reader) = match spawned {
            Ok(pair) => pair,
            Err(GateError::BackendUnresponsive { .. }) => {
                return Err(GateError::BackendCreateFailed(format!(
                    "shell did not start within {:?}",
                    self.timeouts.startup
                )))
            }
            Err(e) => return Err(e),
        };

        let id = format!("pty-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let pid = handler.process_id();
        let handler = Arc::new(Mutex::new(handler));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        if let Err(e) = spawn_reader(id.clone(), reader, handler.clone(), tx) {
            let _ = handler.lock().kill();
            return Err(GateError::BackendCreateFailed(format!("reader thread: {}", e)));
        }

        self.instances.insert(
            id.clone(),
            Arc::new(PtyInstance {
                session_id: spec.session_id.clone(),
                handler,
                pid,
                shell,
                workspace: spec.workspace.clone(),
                env,
                limits: spec.limits.clone(),
            }),
        );
        info!(session_id = %spec.session_id, backend_id = %id, ?pid, "pty shell started");

        Ok(StartedBackend {
            handle: BackendHandle {
                id,
                session_id: spec.session_id,
                workdir: spec.workspace,
            },
            output: rx,
            emits_markers: bash,
        })
    }

    async fn write(&self, handle: &BackendHandle, data: &[u8]) -> Result<(), GateError> {
        let instance = self.instance(handle)?;
        if let Some(code) = instance.handler.lock().try_wait() {
            return Err(GateError::BackendClosed(format!(
                "shell exited with status {:?}",
                code
            )));
        }

        let data = data.to_vec();
        let handler = instance.handler.clone();
        bounded("write", self.timeouts.write, async move {
            tokio::task::spawn_blocking(move || handler.lock().write(&data))
                .await
                .map_err(|e| GateError::BackendClosed(e.to_string()))?
                .map_err(|e| GateError::BackendClosed(format!("{:#}", e)))
        })
        .await
    }

    async fn resize(&self, handle: &BackendHandle, cols: u16, rows: u16) -> Result<(), GateError> {
        let instance = self.instance(handle)?;
        let result = instance.handler.lock().resize(cols, rows);
        result.map_err(|e| GateError::BackendClosed(format!("{:#}", e)))
    }

    async fn kill(&self, handle: &BackendHandle, grace: Duration) -> Result<KillOutcome, GateError> {
        let Some((_, instance)) = self.instances.remove(&handle.id) else {
            return Ok(KillOutcome::AlreadyGone);
        };

        if instance.handler.lock().try_wait().is_some() {
            return Ok(KillOutcome::Graceful);
        }
        if let Some(pid) = instance.pid {
            signal_hangup(pid);
        }

        let handler = instance.handler.clone();
        let exited = tokio::task::spawn_blocking(move || wait_for_exit(&handler, grace).is_some())
            .await
            .unwrap_or(false);
        if exited {
            info!(backend_id = %handle.id, "pty shell terminated");
            return Ok(KillOutcome::Graceful);
        }

        warn!(backend_id = %handle.id, ?grace, "pty shell ignored hangup, killing");
        let killed = instance.handler.lock().kill();
        if let Err(e) = killed {
            // Usually the process exited between the checks
            debug!(backend_id = %handle.id, "forced kill: {:#}", e);
        }
        Ok(KillOutcome::Forced)
    }

    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecOutput, GateError> {
        let instance = self.instance(handle)?;
        let (program, args) = command_line(
            &instance.shell,
            vec!["-c".to_string(), command.to_string()],
            &instance.limits,
        );

        let mut env = instance.env.clone();
        env.remove("PROMPT_COMMAND");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&args)
            .current_dir(cwd.unwrap_or(instance.workspace.as_path()))
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| GateError::BackendClosed(format!("exec failed: {}", e)))?,
            Err(_) => return Err(GateError::unresponsive("exec", timeout)),
        };

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn list_instances(&self) -> Result<Vec<BackendInstance>, GateError> {
        Ok(self
            .instances
            .iter()
            .map(|entry| BackendInstance {
                id: entry.key().clone(),
                session_id: Some(entry.value().session_id.clone()),
                running: entry.value().handler.lock().try_wait().is_none(),
            })
            .collect())
    }

    fn backend_name(&self) -> &str {
        "pty"
    }
}

impl Drop for PtyBackend {
    fn drop(&mut self) {
        // Kill all shells on drop
        for entry in self.instances.iter() {
            let _ = entry.value().handler.lock().kill();
        }
    }
}
