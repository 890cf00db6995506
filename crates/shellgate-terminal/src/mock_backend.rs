//! In-process simulated shell for tests.
//!
//! Behaves like an interactive shell behind a terminal: typed bytes are
//! echoed, Enter runs the line, and every completed command is followed by
//! the exit marker and a `$ ` prompt (just the prompt with
//! `MockOptions::plain_prompt`). The command set is tiny:
//!
//! | line            | effect                                          |
//! |-----------------|-------------------------------------------------|
//! | `echo ARGS`     | prints ARGS                                     |
//! | `pwd`, `ls`, `cat FILE`, `true`, `false` | what you would expect  |
//! | `fail N`        | completes with status N                         |
//! | `sleep SECS`    | completes after SECS                            |
//! | `hang`          | runs until Ctrl-C (status 130)                  |
//! | `ask`           | prints `Proceed? [y/N] ` and waits for a line   |
//! | `login`         | prints `Password: ` and reads a line unechoed   |
//! | `exit N`        | the shell exits                                 |
//! | `crash`         | the backend dies underneath the shell           |
//!
//! `( cd -- 'DIR' && CMD )` is understood so working-directory dispatch can
//! be exercised.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use shellgate_types::{GateError, OutputKind, SessionId};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{
    bounded, BackendEvent, BackendHandle, BackendInstance, BackendSpec, BackendTimeouts,
    ExecOutput, ExecutionBackend, KillOutcome, StartedBackend, OUTPUT_CHANNEL_CAPACITY,
};
use crate::completion::MARKER_PREFIX;

const PROMPT: &str = "$ ";

/// Failure knobs, adjustable while the backend is in use
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    pub fail_start: bool,
    pub start_delay: Option<Duration>,
    /// `kill` waits out the whole grace period and reports a forced removal
    pub hang_on_kill: bool,
    /// `write` never completes
    pub stall_writes: bool,
    /// Behave like a shell without `PROMPT_COMMAND`: prompts carry no marker
    pub plain_prompt: bool,
}

enum Job {
    Sleep(JoinHandle<()>),
    Hang,
    Ask,
    Password,
}

#[derive(Default)]
struct ShellState {
    line: String,
    job: Option<Job>,
    input_log: Vec<u8>,
    size: (u16, u16),
    exited: bool,
}

struct MockShell {
    session_id: SessionId,
    workspace: PathBuf,
    markers: bool,
    tx: mpsc::Sender<BackendEvent>,
    state: Mutex<ShellState>,
}

enum Outcome {
    Done { stdout: String, code: i32 },
    Exit(i32),
    Crash,
    Hang,
    Sleep(Duration),
    Ask,
    Password,
}

fn done(stdout: impl Into<String>, code: i32) -> Outcome {
    Outcome::Done {
        stdout: stdout.into(),
        code,
    }
}

fn unquote(word: &str) -> String {
    word.trim_matches('\'').trim_matches('"').to_string()
}

/// Run one line of the toy command language
fn interpret(line: &str, cwd: &Path) -> Outcome {
    let mut line = line.trim();
    if let Some(inner) = line.strip_prefix('(').and_then(|l| l.strip_suffix(')')) {
        line = inner.trim();
    }

    let mut output = String::new();
    let mut dir = cwd.to_path_buf();
    for segment in line.split("&&").map(str::trim) {
        let words: Vec<&str> = segment.split_whitespace().collect();
        let outcome = match words.as_slice() {
            [] => done("", 0),
            ["cd", "--", target] | ["cd", target] => {
                let target = dir.join(unquote(target));
                if target.is_dir() {
                    dir = target;
                    done("", 0)
                } else {
                    done(format!("cd: {}: No such file or directory\n", target.display()), 1)
                }
            }
            ["echo", rest @ ..] => done(format!("{}\n", rest.join(" ")), 0),
            ["pwd"] => done(format!("{}\n", dir.display()), 0),
            ["true"] => done("", 0),
            ["false"] => done("", 1),
            ["ls"] => {
                let mut names: Vec<String> = std::fs::read_dir(&dir)
                    .map(|entries| {
                        entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.file_name().to_string_lossy().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                names.sort();
                done(names.iter().map(|n| format!("{}\n", n)).collect::<String>(), 0)
            }
            ["cat", file] => match std::fs::read_to_string(dir.join(file)) {
                Ok(content) => done(content, 0),
                Err(e) => done(format!("cat: {}: {}\n", file, e), 1),
            },
            ["fail", code] => done("", code.parse().unwrap_or(1)),
            ["exit"] => Outcome::Exit(0),
            ["exit", code] => Outcome::Exit(code.parse().unwrap_or(0)),
            ["crash"] => Outcome::Crash,
            ["hang"] => Outcome::Hang,
            ["sleep", secs] => Outcome::Sleep(Duration::from_secs_f64(secs.parse().unwrap_or(0.0))),
            ["ask"] => Outcome::Ask,
            ["login"] => Outcome::Password,
            [program, ..] => done(format!("mock: {}: command not found\n", program), 127),
        };
        match outcome {
            Outcome::Done { stdout, code } => {
                output.push_str(&stdout);
                if code != 0 {
                    return done(output, code);
                }
            }
            other => return other,
        }
    }
    done(output, 0)
}

fn terminal_text(text: &str) -> Vec<u8> {
    text.replace('\n', "\r\n").into_bytes()
}

fn output(bytes: Vec<u8>) -> BackendEvent {
    BackendEvent::Output {
        kind: OutputKind::Stdout,
        data: bytes,
    }
}

fn completion(markers: bool, code: i32) -> BackendEvent {
    if markers {
        output(format!("{}{}\x07{}", MARKER_PREFIX, code, PROMPT).into_bytes())
    } else {
        output(PROMPT.as_bytes().to_vec())
    }
}

/// Counts an exec whose future was dropped before it finished
struct ExecCancelGuard<'a> {
    cancelled: &'a AtomicUsize,
    finished: bool,
}

impl Drop for ExecCancelGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockShell {
    /// Feed typed bytes; returns the events the terminal would show
    fn input(self: &Arc<Self>, data: &[u8]) -> Vec<BackendEvent> {
        let mut state = self.state.lock();
        state.input_log.extend_from_slice(data);
        let mut events = Vec::new();
        let mut echo = Vec::new();

        for ch in String::from_utf8_lossy(data).chars() {
            match ch {
                '\x03' => {
                    echo.extend_from_slice(b"^C\r\n");
                    events.push(output(std::mem::take(&mut echo)));
                    state.line.clear();
                    if let Some(Job::Sleep(task)) = state.job.take() {
                        task.abort();
                    }
                    events.push(completion(self.markers, 130));
                }
                '\x15' => state.line.clear(),
                '\r' | '\n' => {
                    let line = std::mem::take(&mut state.line);
                    if !matches!(state.job, Some(Job::Password)) {
                        echo.extend_from_slice(b"\r\n");
                    }
                    events.push(output(std::mem::take(&mut echo)));
                    self.submit(&mut state, &line, &mut events);
                    if state.exited {
                        break;
                    }
                }
                c => {
                    state.line.push(c);
                    if !matches!(state.job, Some(Job::Password)) {
                        let mut buf = [0u8; 4];
                        echo.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
        }
        if !echo.is_empty() {
            events.push(output(echo));
        }
        events.retain(|e| !matches!(e, BackendEvent::Output { data, .. } if data.is_empty()));
        events
    }

    fn submit(self: &Arc<Self>, state: &mut ShellState, line: &str, events: &mut Vec<BackendEvent>) {
        match state.job.take() {
            Some(Job::Ask) | Some(Job::Password) => {
                events.push(output(terminal_text(&format!("answered: {}\n", line.trim()))));
                events.push(completion(self.markers, 0));
                return;
            }
            Some(job @ Job::Hang) | Some(job @ Job::Sleep(_)) => {
                // Typeahead is ignored while a program holds the terminal
                state.job = Some(job);
                return;
            }
            None => {}
        }

        match interpret(line, &self.workspace) {
            Outcome::Done { stdout, code } => {
                events.push(output(terminal_text(&stdout)));
                events.push(completion(self.markers, code));
            }
            Outcome::Exit(code) => {
                state.exited = true;
                events.push(BackendEvent::Exited { code: Some(code) });
            }
            Outcome::Crash => {
                state.exited = true;
                events.push(BackendEvent::Terminated {
                    reason: "simulated backend crash".to_string(),
                });
            }
            Outcome::Hang => state.job = Some(Job::Hang),
            Outcome::Sleep(duration) => {
                let shell = Arc::clone(self);
                state.job = Some(Job::Sleep(tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let finished = matches!(shell.state.lock().job.take(), Some(Job::Sleep(_)));
                    if finished {
                        let _ = shell.tx.send(completion(shell.markers, 0)).await;
                    }
                })));
            }
            Outcome::Ask => {
                events.push(output(b"Proceed? [y/N] ".to_vec()));
                state.job = Some(Job::Ask);
            }
            Outcome::Password => {
                events.push(output(b"Password: ".to_vec()));
                state.job = Some(Job::Password);
            }
        }
    }

    fn abort_job(&self) {
        if let Some(Job::Sleep(task)) = self.state.lock().job.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
pub struct MockBackend {
    options: Mutex<MockOptions>,
    timeouts: BackendTimeouts,
    shells: DashMap<String, Arc<MockShell>>,
    orphans: DashMap<String, BackendInstance>,
    next_id: AtomicU64,
    started: AtomicUsize,
    cancelled_execs: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MockOptions) -> Self {
        Self {
            options: Mutex::new(options),
            ..Default::default()
        }
    }

    pub fn with_timeouts(mut self, timeouts: BackendTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn set_options(&self, options: MockOptions) {
        *self.options.lock() = options;
    }

    pub fn update_options(&self, update: impl FnOnce(&mut MockOptions)) {
        update(&mut self.options.lock());
    }

    /// Shells currently alive
    pub fn live_count(&self) -> usize {
        self.shells.len()
    }

    /// Successful starts since creation
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Everything written to the shell behind `handle`
    pub fn written(&self, handle: &BackendHandle) -> String {
        self.shells
            .get(&handle.id)
            .map(|shell| String::from_utf8_lossy(&shell.state.lock().input_log).to_string())
            .unwrap_or_default()
    }

    /// Pretend an instance was left behind by an earlier process
    pub fn inject_orphan(&self, session_id: Option<&str>) -> String {
        let id = format!("orphan-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.orphans.insert(
            id.clone(),
            BackendInstance {
                id: id.clone(),
                session_id: session_id.map(str::to_string),
                running: true,
            },
        );
        id
    }

    /// Captured commands stopped before they finished (killed or timed out)
    pub fn cancelled_execs(&self) -> usize {
        self.cancelled_execs.load(Ordering::SeqCst)
    }

    pub fn has_instance(&self, id: &str) -> bool {
        self.shells.contains_key(id) || self.orphans.contains_key(id)
    }

    /// Kill the backend underneath a running shell
    pub async fn crash(&self, handle: &BackendHandle) {
        if let Some((_, shell)) = self.shells.remove(&handle.id) {
            shell.abort_job();
            let _ = shell
                .tx
                .send(BackendEvent::Terminated {
                    reason: "simulated backend crash".to_string(),
                })
                .await;
        }
    }

    fn shell(&self, handle: &BackendHandle) -> Result<Arc<MockShell>, GateError> {
        self.shells
            .get(&handle.id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GateError::BackendClosed(format!("shell {} is not running", handle.id)))
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn start(&self, spec: BackendSpec) -> Result<StartedBackend, GateError> {
        let options = self.options.lock().clone();
        if let Some(delay) = options.start_delay {
            bounded("start", self.timeouts.startup, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await
            .map_err(|e| GateError::BackendCreateFailed(e.to_string()))?;
        }
        if options.fail_start {
            return Err(GateError::BackendCreateFailed("simulated start failure".to_string()));
        }
        if !spec.workspace.is_dir() {
            return Err(GateError::BackendCreateFailed(format!(
                "workspace {} does not exist",
                spec.workspace.display()
            )));
        }

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let markers = !options.plain_prompt;
        // First prompt
        let _ = tx.try_send(completion(markers, 0));

        let shell = Arc::new(MockShell {
            session_id: spec.session_id.clone(),
            workspace: spec.workspace.clone(),
            markers,
            tx,
            state: Mutex::new(ShellState {
                size: (spec.cols, spec.rows),
                ..Default::default()
            }),
        });
        self.shells.insert(id.clone(), shell);
        self.started.fetch_add(1, Ordering::SeqCst);

        Ok(StartedBackend {
            handle: BackendHandle {
                id,
                session_id: spec.session_id,
                workdir: spec.workspace,
            },
            output: rx,
            emits_markers: markers,
        })
    }

    async fn write(&self, handle: &BackendHandle, data: &[u8]) -> Result<(), GateError> {
        if self.options.lock().stall_writes {
            return bounded("write", self.timeouts.write, std::future::pending()).await;
        }
        let shell = self.shell(handle)?;
        let events = shell.input(data);
        for event in events {
            let _ = shell.tx.send(event).await;
        }
        if shell.state.lock().exited {
            self.shells.remove(&handle.id);
        }
        Ok(())
    }

    async fn resize(&self, handle: &BackendHandle, cols: u16, rows: u16) -> Result<(), GateError> {
        self.shell(handle)?.state.lock().size = (cols, rows);
        Ok(())
    }

    async fn kill(&self, handle: &BackendHandle, grace: Duration) -> Result<KillOutcome, GateError> {
        let Some((_, shell)) = self.shells.remove(&handle.id) else {
            return Ok(if self.orphans.remove(&handle.id).is_some() {
                KillOutcome::Graceful
            } else {
                KillOutcome::AlreadyGone
            });
        };
        shell.abort_job();
        let _ = shell.tx.try_send(BackendEvent::Exited { code: None });
        tracing::debug!(session_id = %shell.session_id, id = %handle.id, "mock shell killed");

        if self.options.lock().hang_on_kill {
            tokio::time::sleep(grace).await;
            return Ok(KillOutcome::Forced);
        }
        Ok(KillOutcome::Graceful)
    }

    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &str,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecOutput, GateError> {
        let shell = self.shell(handle)?;
        let dir = cwd.map(Path::to_path_buf).unwrap_or_else(|| shell.workspace.clone());

        bounded("exec", timeout, async {
            let mut guard = ExecCancelGuard {
                cancelled: &self.cancelled_execs,
                finished: false,
            };
            let result = match interpret(command, &dir) {
                Outcome::Done { stdout, code } => Ok(ExecOutput {
                    stdout,
                    stderr: String::new(),
                    exit_code: Some(code),
                }),
                Outcome::Exit(code) => Ok(ExecOutput {
                    exit_code: Some(code),
                    ..Default::default()
                }),
                Outcome::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(ExecOutput {
                        exit_code: Some(0),
                        ..Default::default()
                    })
                }
                Outcome::Hang => std::future::pending().await,
                Outcome::Ask | Outcome::Password => Ok(ExecOutput {
                    stderr: "no terminal for prompt\n".to_string(),
                    exit_code: Some(1),
                    ..Default::default()
                }),
                Outcome::Crash => Err(GateError::BackendClosed("simulated backend crash".to_string())),
            };
            guard.finished = true;
            result
        })
        .await
    }

    async fn list_instances(&self) -> Result<Vec<BackendInstance>, GateError> {
        let mut instances: Vec<BackendInstance> = self
            .shells
            .iter()
            .map(|entry| BackendInstance {
                id: entry.key().clone(),
                session_id: Some(entry.value().session_id.clone()),
                running: true,
            })
            .collect();
        instances.extend(self.orphans.iter().map(|entry| entry.value().clone()));
        Ok(instances)
    }

    fn backend_name(&self) -> &str {
        "mock"
    }
}
