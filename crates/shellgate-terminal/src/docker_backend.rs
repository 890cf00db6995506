// Container-per-session execution backend built on the Docker API

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use shellgate_types::{GateError, NetworkPolicy, OutputKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{
    bounded, BackendEvent, BackendHandle, BackendInstance, BackendSpec, BackendTimeouts,
    ExecOutput, ExecutionBackend, KillOutcome, StartedBackend, OUTPUT_CHANNEL_CAPACITY,
};
use crate::completion::{BASH_PS1, PLAIN_PS1, PROMPT_COMMAND};

pub const MANAGED_LABEL: &str = "shellgate.managed";
pub const SESSION_LABEL: &str = "shellgate.session";
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Runs `$1` under the shell `$0` after printing its own pid, so a
/// cancelled exec can be found and killed inside the container.
const EXEC_WRAPPER: &str = r#"echo "$$"; exec "$0" -c "$1""#;
const EXEC_KILL_GRACE_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    pub default_shell: String,
    /// Pull the image when it is not present locally
    pub pull_missing: bool,
    pub pids_limit: Option<i64>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "debian:bookworm-slim".to_string(),
            default_shell: "/bin/bash".to_string(),
            pull_missing: true,
            pids_limit: Some(256),
        }
    }
}

struct DockerShell {
    exec_id: String,
    shell: String,
    input: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    pump: JoinHandle<()>,
}

/// One container per session: `sleep infinity` keeps it alive, the shell
/// runs as an attached TTY exec, and the workspace bind mount is the only
/// writable path. The root filesystem is read-only and has no scratch mounts.
pub struct DockerBackend {
    docker: Docker,
    config: DockerConfig,
    timeouts: BackendTimeouts,
    shells: DashMap<String, Arc<DockerShell>>,
}

/// Kills the exec's process in the container when the exec future is
/// dropped before it finished (timeout or command kill).
struct ExecGuard {
    docker: Docker,
    container_id: String,
    pid: Option<u32>,
    finished: bool,
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(pid) = self.pid else {
            debug!("cancelled exec in {} never reported a pid", self.container_id);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        runtime.spawn(async move {
            if let Err(e) = kill_exec_process(&docker, &container_id, pid).await {
                warn!("Failed to kill exec {} in {}: {}", pid, container_id, e);
            }
        });
    }
}

fn exec_kill_script(pid: u32) -> String {
    format!(
        "kill -TERM {pid} 2>/dev/null; sleep {grace}; kill -KILL {pid} 2>/dev/null; true",
        pid = pid,
        grace = EXEC_KILL_GRACE_SECS
    )
}

async fn kill_exec_process(docker: &Docker, container_id: &str, pid: u32) -> Result<(), GateError> {
    debug!("Killing cancelled exec {} in {}", pid, container_id);
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), exec_kill_script(pid)]),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| docker_error("create kill exec", e))?;
    docker
        .start_exec(
            &exec.id,
            Some(StartExecOptions {
                detach: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| docker_error("start kill exec", e))?;
    Ok(())
}

fn docker_error(context: &str, err: bollard::errors::Error) -> GateError {
    GateError::BackendClosed(format!("{}: {}", context, err))
}

fn container_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("shellgate-{}", safe)
}

fn is_bash(shell: &str) -> bool {
    shell.rsplit('/').next() == Some("bash")
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(err, bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code)
}

impl DockerBackend {
    pub async fn connect(config: DockerConfig, timeouts: BackendTimeouts) -> Result<Self, GateError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| GateError::Configuration(format!("docker connection: {}", e)))?;

        // Test the connection
        bounded("ping", timeouts.startup, async {
            docker
                .ping()
                .await
                .map_err(|e| GateError::Configuration(format!("docker ping: {}", e)))
        })
        .await?;

        info!("Successfully connected to Docker daemon");
        Ok(Self {
            docker,
            config,
            timeouts,
            shells: DashMap::new(),
        })
    }

    async fn ensure_image_available(&self) -> Result<(), GateError> {
        let image = self.config.image.as_str();
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters: {
                    let mut filters = HashMap::new();
                    filters.insert("reference".to_string(), vec![image.to_string()]);
                    filters
                },
                ..Default::default()
            }))
            .await
            .map_err(|e| GateError::BackendCreateFailed(format!("list images: {}", e)))?;

        if !images.is_empty() {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }
        if !self.config.pull_missing {
            return Err(GateError::BackendCreateFailed(format!("image {} not present", image)));
        }

        info!("Pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                error!("Failed to pull image {}: {}", image, e);
                return Err(GateError::BackendCreateFailed(format!("pull {}: {}", image, e)));
            }
        }
        Ok(())
    }

    fn container_config(
        config: &DockerConfig,
        spec: &BackendSpec,
        shell_env: &[String],
    ) -> Config<String> {
        let mounts = vec![Mount {
            target: Some(CONTAINER_WORKSPACE.to_string()),
            source: Some(spec.workspace.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];

        let network_mode = match spec.limits.network {
            NetworkPolicy::None => "none",
            NetworkPolicy::Bridge => "bridge",
        };

        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: spec.limits.memory_bytes.map(|m| m as i64),
            cpu_shares: spec.limits.cpu_shares.map(|c| c as i64),
            network_mode: Some(network_mode.to_string()),
            readonly_rootfs: Some(true),
            pids_limit: config.pids_limit,
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false), // We want to manage lifecycle manually
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            entrypoint: Some(vec!["sleep".to_string()]),
            cmd: Some(vec!["infinity".to_string()]),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            env: Some(shell_env.to_vec()),
            host_config: Some(host_config),
            labels: Some(HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (SESSION_LABEL.to_string(), spec.session_id.clone()),
            ])),
            ..Default::default()
        }
    }

    async fn create_container(&self, spec: &BackendSpec, env: &[String]) -> Result<String, GateError> {
        let name = container_name(&spec.session_id);
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let created = match self
            .docker
            .create_container(Some(options.clone()), Self::container_config(&self.config, spec, env))
            .await
        {
            Ok(created) => created,
            Err(e) if is_status(&e, 409) => {
                // Left over from a previous run under the same session id
                warn!("Container {} already exists, replacing it", name);
                self.remove(&name).await?;
                self.docker
                    .create_container(Some(options), Self::container_config(&self.config, spec, env))
                    .await
                    .map_err(|e| GateError::BackendCreateFailed(format!("create {}: {}", name, e)))?
            }
            Err(e) => {
                return Err(GateError::BackendCreateFailed(format!("create {}: {}", name, e)));
            }
        };

        info!("Created container {} with ID {}", name, created.id);
        Ok(created.id)
    }

    /// Start the container and attach the interactive shell
    async fn launch(
        &self,
        container_id: &str,
        spec: &BackendSpec,
        shell: &str,
        env: Vec<String>,
    ) -> Result<StartedBackend, GateError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| GateError::BackendCreateFailed(format!("start: {}", e)))?;

        let mut cmd = vec![shell.to_string()];
        if is_bash(shell) {
            cmd.extend(["--noprofile", "--norc", "-i"].map(String::from));
        } else {
            cmd.push("-i".to_string());
        }

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    working_dir: Some(CONTAINER_WORKSPACE.to_string()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| GateError::BackendCreateFailed(format!("create exec: {}", e)))?;

        let StartExecResults::Attached { output, input } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| GateError::BackendCreateFailed(format!("start exec: {}", e)))?
        else {
            return Err(GateError::BackendCreateFailed("shell exec detached".to_string()));
        };

        if let Err(e) = self
            .docker
            .resize_exec(
                &exec.id,
                ResizeExecOptions {
                    height: spec.rows,
                    width: spec.cols,
                },
            )
            .await
        {
            debug!("Initial resize failed: {}", e);
        }

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump_output(
            self.docker.clone(),
            container_id.to_string(),
            exec.id.clone(),
            output,
            tx,
        ));

        self.shells.insert(
            container_id.to_string(),
            Arc::new(DockerShell {
                exec_id: exec.id,
                shell: shell.to_string(),
                input: Mutex::new(input),
                pump,
            }),
        );

        Ok(StartedBackend {
            handle: BackendHandle {
                id: container_id.to_string(),
                session_id: spec.session_id.clone(),
                workdir: PathBuf::from(CONTAINER_WORKSPACE),
            },
            output: rx,
            emits_markers: is_bash(shell),
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), GateError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                info!("Successfully removed container {}", container_id);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} was already removed", container_id);
                Ok(())
            }
            Err(e) => Err(docker_error("remove container", e)),
        }
    }

    fn shell_env(spec: &BackendSpec, bash: bool) -> Vec<String> {
        let mut env: Vec<String> = vec![
            format!("HOME={}", CONTAINER_WORKSPACE),
            "TERM=xterm-256color".to_string(),
            "LANG=C.UTF-8".to_string(),
            format!("PS1={}", if bash { BASH_PS1 } else { PLAIN_PS1 }),
            format!("SHELLGATE_SESSION={}", spec.session_id),
        ];
        env.extend(spec.environment.iter().map(|(k, v)| format!("{}={}", k, v)));
        if bash {
            env.push(format!("PROMPT_COMMAND={}", PROMPT_COMMAND));
        }
        env
    }
}

/// Forward exec output until the stream ends, then work out why it ended
async fn pump_output(
    docker: Docker,
    container_id: String,
    exec_id: String,
    mut output: Pin<Box<dyn futures_util::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
    tx: mpsc::Sender<BackendEvent>,
) {
    while let Some(item) = output.next().await {
        let event = match item {
            Ok(LogOutput::StdErr { message }) => BackendEvent::Output {
                kind: OutputKind::Stderr,
                data: message.to_vec(),
            },
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                BackendEvent::Output {
                    kind: OutputKind::Stdout,
                    data: message.to_vec(),
                }
            }
            Ok(LogOutput::StdIn { .. }) => continue,
            Err(e) => {
                warn!("Error reading shell output from {}: {}", container_id, e);
                break;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }

    let container = docker.inspect_container(&container_id, None).await;
    let event = match container.ok().and_then(|c| c.state) {
        Some(state) if state.oom_killed == Some(true) => BackendEvent::Terminated {
            reason: "container killed: out of memory".to_string(),
        },
        Some(state) if state.running != Some(true) => BackendEvent::Terminated {
            reason: format!("container exited with status {}", state.exit_code.unwrap_or(-1)),
        },
        Some(_) => {
            let code = docker
                .inspect_exec(&exec_id)
                .await
                .ok()
                .and_then(|e| e.exit_code)
                .map(|c| c as i32);
            BackendEvent::Exited { code }
        }
        None => BackendEvent::Terminated {
            reason: "container disappeared".to_string(),
        },
    };
    let _ = tx.send(event).await;
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn start(&self, spec: BackendSpec) -> Result<StartedBackend, GateError> {
        info!("Creating container for session {}", spec.session_id);
        let shell = spec
            .shell
            .clone()
            .unwrap_or_else(|| self.config.default_shell.clone());
        let env = Self::shell_env(&spec, is_bash(&shell));

        let prepared = bounded("start", self.timeouts.startup, async {
            self.ensure_image_available().await?;
            self.create_container(&spec, &env).await
        })
        .await;
        let container_id = prepared.map_err(|e| match e {
            GateError::BackendUnresponsive { .. } => {
                GateError::BackendCreateFailed(format!("container not created within {:?}", self.timeouts.startup))
            }
            other => other,
        })?;

        let launched = bounded(
            "start",
            self.timeouts.startup,
            self.launch(&container_id, &spec, &shell, env),
        )
        .await;
        match launched {
            Ok(started) => Ok(started),
            Err(e) => {
                // All-or-nothing: no container outlives a failed start
                if let Some((_, shell)) = self.shells.remove(&container_id) {
                    shell.pump.abort();
                }
                if let Err(cleanup) = self.remove(&container_id).await {
                    warn!("Failed to clean up container {}: {}", container_id, cleanup);
                }
                Err(match e {
                    GateError::BackendCreateFailed(_) => e,
                    other => GateError::BackendCreateFailed(other.to_string()),
                })
            }
        }
    }

    async fn write(&self, handle: &BackendHandle, data: &[u8]) -> Result<(), GateError> {
        let shell = self
            .shells
            .get(&handle.id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GateError::BackendClosed(format!("no shell for {}", handle.id)))?;
        if shell.pump.is_finished() {
            return Err(GateError::BackendClosed("shell has exited".to_string()));
        }
        bounded("write", self.timeouts.write, async {
            let mut input = shell.input.lock().await;
            input
                .write_all(data)
                .await
                .map_err(|e| GateError::BackendClosed(e.to_string()))?;
            input
                .flush()
                .await
                .map_err(|e| GateError::BackendClosed(e.to_string()))
        })
        .await
    }

    async fn resize(&self, handle: &BackendHandle, cols: u16, rows: u16) -> Result<(), GateError> {
        let exec_id = self
            .shells
            .get(&handle.id)
            .map(|shell| shell.exec_id.clone())
            .ok_or_else(|| GateError::BackendClosed(format!("no shell for {}", handle.id)))?;
        bounded("resize", self.timeouts.write, async {
            self.docker
                .resize_exec(
                    &exec_id,
                    ResizeExecOptions {
                        height: rows,
                        width: cols,
                    },
                )
                .await
                .map_err(|e| docker_error("resize exec", e))
        })
        .await
    }

    async fn kill(&self, handle: &BackendHandle, grace: Duration) -> Result<KillOutcome, GateError> {
        let tracked = self.shells.remove(&handle.id);
        if let Some((_, ref shell)) = tracked {
            shell.pump.abort();
        }

        info!("Stopping container {}", handle.id);
        let stop = self.docker.stop_container(
            &handle.id,
            Some(StopContainerOptions {
                t: grace.as_secs().max(1) as i64,
            }),
        );
        let outcome = match tokio::time::timeout(grace + Duration::from_secs(2), stop).await {
            Ok(Ok(_)) => KillOutcome::Graceful,
            Ok(Err(e)) if is_status(&e, 304) => {
                debug!("Container {} was already stopped", handle.id);
                KillOutcome::Graceful
            }
            Ok(Err(e)) if is_status(&e, 404) => {
                return Ok(if tracked.is_some() {
                    KillOutcome::Graceful
                } else {
                    KillOutcome::AlreadyGone
                });
            }
            Ok(Err(e)) => {
                warn!("Stopping container {} failed: {}", handle.id, e);
                KillOutcome::Forced
            }
            Err(_) => {
                warn!("Container {} did not stop within {:?}", handle.id, grace);
                KillOutcome::Forced
            }
        };

        bounded("remove", self.timeouts.startup, self.remove(&handle.id)).await?;
        Ok(outcome)
    }

    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecOutput, GateError> {
        let shell = self
            .shells
            .get(&handle.id)
            .map(|s| s.shell.clone())
            .unwrap_or_else(|| self.config.default_shell.clone());
        let working_dir = cwd
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| CONTAINER_WORKSPACE.to_string());

        bounded("exec", timeout, async {
            let exec = self
                .docker
                .create_exec(
                    &handle.id,
                    CreateExecOptions {
                        cmd: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            EXEC_WRAPPER.to_string(),
                            shell,
                            command.to_string(),
                        ]),
                        working_dir: Some(working_dir),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| docker_error("create exec", e))?;

            let mut guard = ExecGuard {
                docker: self.docker.clone(),
                container_id: handle.id.clone(),
                pid: None,
                finished: false,
            };
            let mut result = ExecOutput::default();
            // First stdout line is the wrapper's pid
            let mut pid_line = Some(String::new());
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| docker_error("start exec", e))?
            {
                while let Some(Ok(msg)) = output.next().await {
                    match msg {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            let text = String::from_utf8_lossy(&message);
                            let Some(header) = pid_line.as_mut() else {
                                result.stdout.push_str(&text);
                                continue;
                            };
                            header.push_str(&text);
                            if let Some((line, rest)) = header.split_once('\n') {
                                guard.pid = line.trim().parse().ok();
                                if guard.pid.is_none() {
                                    warn!("exec in {} did not report its pid", handle.id);
                                }
                                result.stdout.push_str(rest);
                                pid_line = None;
                            }
                        }
                        LogOutput::StdErr { message } => {
                            result.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            if let Some(partial) = pid_line {
                result.stdout.push_str(&partial);
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| docker_error("inspect exec", e))?;
            guard.finished = true;
            result.exit_code = inspect.exit_code.map(|c| c as i32);
            Ok(result)
        })
        .await
    }

    async fn list_instances(&self) -> Result<Vec<BackendInstance>, GateError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: {
                    let mut filters = HashMap::new();
                    filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);
                    filters
                },
                ..Default::default()
            }))
            .await
            .map_err(|e| docker_error("list containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let session_id = c.labels.as_ref().and_then(|l| l.get(SESSION_LABEL).cloned());
                Some(BackendInstance {
                    id,
                    session_id,
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    fn backend_name(&self) -> &str {
        "docker"
    }
}
