use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shellgate_policy::{
    classify, ApprovalGate, ApprovalOutcome, ApprovalRequest, GateDecision, PolicyManager,
    PromptAnswer,
};
use shellgate_terminal::{
    BackendEvent, BackendHandle, CompletionScanner, ExecOutput, ExecutionBackend, KillOutcome,
    ScanEvent, StartedBackend, WorkspaceGuard,
};
use shellgate_types::{
    Classification, Command, CommandId, CommandOrigin, CommandRequest, CommandState,
    ConnectionId, DispatchKind, ExecutionMode, GateError, OutputChunk, OutputKind,
    ResourceLimits, Safety, SessionId, SessionSummary,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{CommandStatus, SessionEvent};
use crate::input_gate::{InputAction, InputGate, LineMode, CLEAR_LINE};
use crate::queue::CommandQueue;
use crate::scrollback::OutputBuffer;

const EVENT_CAPACITY: usize = 1024;
const INPUT_CAPACITY: usize = 256;

/// Extra time on top of the kill grace before a kill call is abandoned
const KILL_SLACK: Duration = Duration::from_secs(2);

/// Per-session tunables, supplied by the registry
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub scrollback_bytes: usize,
    pub kill_grace: Duration,
    /// Complete commands on prompt-looking output when the shell emits no
    /// exit markers
    pub prompt_fallback: bool,
}

/// A backend's unsolicited death, reported to the registry
#[derive(Debug, Clone)]
pub struct Termination {
    pub session_id: SessionId,
    pub backend_id: String,
    pub reason: String,
}

/// Result of the synchronous execute call
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub command: Command,
    pub output: ExecOutput,
}

enum InputMsg {
    Bytes(Vec<u8>),
    Decision {
        command_id: CommandId,
        outcome: ApprovalOutcome,
    },
}

/// Whether a submitted line can go to the shell right away
enum LineVerdict {
    Release(Vec<u8>),
    Held,
}

struct SessionState {
    queue: CommandQueue,
    input: InputGate,
    watcher: shellgate_policy::PromptWatcher,
    scrollback: OutputBuffer,
    /// Typed line awaiting approval and what kind of line it is
    held: Option<(CommandId, LineMode)>,
    owner: Option<ConnectionId>,
    detached_at: Option<Instant>,
    terminated: Option<String>,
    /// Timeout timers and captured executions, by command
    tasks: HashMap<CommandId, JoinHandle<()>>,
}

impl SessionState {
    fn line_mode(&self) -> LineMode {
        if self.queue.interactive_running() == 0 {
            LineMode::Command
        } else if self.watcher.pending().is_some() {
            LineMode::Answer
        } else {
            LineMode::Passthrough
        }
    }

    fn abort_task(&mut self, id: CommandId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }
}

/// One terminal session bound to exactly one backend instance.
///
/// Output is pumped by a dedicated task; all writes to the shell go through
/// a single input worker so they reach the backend in the order they were
/// made.
pub struct Session {
    id: SessionId,
    workspace: PathBuf,
    guard: WorkspaceGuard,
    limits: ResourceLimits,
    created_at: DateTime<Utc>,
    handle: BackendHandle,
    backend: Arc<dyn ExecutionBackend>,
    policy: PolicyManager,
    gate: ApprovalGate,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    input_tx: mpsc::Sender<InputMsg>,
    write_lock: tokio::sync::Mutex<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    terminations: mpsc::UnboundedSender<Termination>,
    shut_down: AtomicBool,
    kill_grace: Duration,
}

impl Session {
    /// Wrap a started backend and spawn the session's pump and input
    /// worker
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        id: SessionId,
        workspace: PathBuf,
        limits: ResourceLimits,
        started: StartedBackend,
        backend: Arc<dyn ExecutionBackend>,
        policy: PolicyManager,
        options: &SessionOptions,
        terminations: mpsc::UnboundedSender<Termination>,
    ) -> Result<Arc<Self>, GateError> {
        let guard = WorkspaceGuard::new(&workspace)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);

        let session = Arc::new(Self {
            id,
            workspace,
            guard,
            limits,
            created_at: Utc::now(),
            handle: started.handle,
            backend,
            policy,
            gate: ApprovalGate::new(),
            state: Mutex::new(SessionState {
                queue: CommandQueue::new(),
                input: InputGate::new(),
                watcher: Default::default(),
                scrollback: OutputBuffer::new(options.scrollback_bytes),
                held: None,
                owner: None,
                detached_at: None,
                terminated: None,
                tasks: HashMap::new(),
            }),
            events,
            input_tx,
            write_lock: tokio::sync::Mutex::new(()),
            workers: Mutex::new(Vec::new()),
            terminations,
            shut_down: AtomicBool::new(false),
            kill_grace: options.kill_grace,
        });

        let pump = tokio::spawn(Arc::clone(&session).pump(started.output, options.prompt_fallback));
        let input = tokio::spawn(Arc::clone(&session).input_worker(input_rx));
        session.workers.lock().extend([pump, input]);
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_terminated(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst) || self.state.lock().terminated.is_some()
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state.lock();
        SessionSummary {
            session_id: self.id.clone(),
            workspace: self.workspace.clone(),
            active: state.terminated.is_none() && !self.shut_down.load(Ordering::SeqCst),
            created_at: self.created_at,
            backend_id: Some(self.handle.id.clone()),
            pending_approvals: self.gate.pending_count(),
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Make `connection` the owner. Returns the connection it replaced.
    pub fn attach(&self, connection: ConnectionId) -> Option<ConnectionId> {
        let mut state = self.state.lock();
        state.detached_at = None;
        state.owner.replace(connection)
    }

    /// Detach `connection` if it still owns the session
    pub fn detach(&self, connection: ConnectionId) -> bool {
        let mut state = self.state.lock();
        if state.owner != Some(connection) {
            return false;
        }
        state.owner = None;
        state.detached_at = Some(Instant::now());
        true
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.state.lock().owner
    }

    /// How long the session has been without an owner since it last had
    /// one
    pub fn detached_for(&self) -> Option<Duration> {
        self.state.lock().detached_at.map(|at| at.elapsed())
    }

    /// Subscribe to session events. With `replay`, also returns the
    /// retained output; nothing is missed or repeated between the two.
    pub fn subscribe(&self, replay: bool) -> (Vec<OutputChunk>, broadcast::Receiver<SessionEvent>) {
        let state = self.state.lock();
        let receiver = self.events.subscribe();
        let history = if replay {
            state.scrollback.snapshot()
        } else {
            Vec::new()
        };
        (history, receiver)
    }

    /// Retained output after `seq`, for subscribers that fell behind
    pub fn output_since(&self, seq: u64) -> Vec<OutputChunk> {
        self.state.lock().scrollback.since(seq)
    }

    /// Sequence number of the newest output chunk, 0 before any output
    pub fn output_cursor(&self) -> u64 {
        self.state.lock().scrollback.last_seq()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().queue.list()
    }

    pub fn command(&self, id: CommandId) -> Option<Command> {
        self.state.lock().queue.get(id).cloned()
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.gate.pending()
    }

    /// Classify a command and either queue it or park it for approval
    pub async fn submit(
        self: &Arc<Self>,
        mut request: CommandRequest,
        origin: CommandOrigin,
    ) -> Result<Command, GateError> {
        self.ensure_live()?;
        if request.command.trim().is_empty() {
            return Err(GateError::rejected("empty command"));
        }
        if let Some(ref dir) = request.working_directory {
            self.guard.resolve(dir)?;
        }
        if request.mode == Some(ExecutionMode::Independent) {
            // Concurrent commands cannot share the interactive shell
            request.dispatch = DispatchKind::Captured;
        }

        let policy = self.policy.snapshot();
        let classification = classify(&request.command, &policy);
        let mut command = Command::new(
            self.id.clone(),
            request,
            origin,
            ExecutionMode::Sequential,
            classification,
        );
        let id = command.id;
        let decision = self.gate.submit(&mut command, &policy)?;
        info!(
            session_id = %self.id,
            command_id = %id,
            safety = %command.classification().safety,
            state = %command.state(),
            "command submitted"
        );

        match decision {
            GateDecision::Proceed => {
                {
                    let mut state = self.state.lock();
                    state.queue.insert(command);
                    let approved = state.queue.approve(id)?;
                    self.publish_status(&approved);
                }
                self.dispatch_ready().await;
            }
            GateDecision::Pending(ticket) => {
                {
                    let mut state = self.state.lock();
                    state.queue.insert(command);
                }
                self.publish_approval(id);
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = ticket.wait().await;
                    session.on_approval(id, outcome).await;
                });
            }
        }

        self.command(id).ok_or(GateError::CommandNotFound(id))
    }

    /// Run a command through the exit-code-bearing exec primitive and wait
    /// for it, approval included
    pub async fn execute(self: &Arc<Self>, request: CommandRequest) -> Result<ExecuteResult, GateError> {
        let command = self.submit(request.captured(), CommandOrigin::Api).await?;
        let done = self.state.lock().queue.wait_for(command.id)?;
        let command = done
            .await
            .map_err(|_| GateError::SessionTerminated(self.id.clone()))?;

        if command.state() == CommandState::Rejected {
            return Err(GateError::rejected(
                command.failure_reason.clone().unwrap_or_default(),
            ));
        }
        let mut output = self
            .state
            .lock()
            .queue
            .output(command.id)
            .cloned()
            .unwrap_or_default();
        if let Some(ref reason) = command.failure_reason {
            if output.stderr.is_empty() {
                output.stderr = reason.clone();
            }
        }
        Ok(ExecuteResult { command, output })
    }

    pub fn confirm(&self, command_id: CommandId) -> Result<(), GateError> {
        self.gate.confirm(command_id)
    }

    pub fn deny(&self, command_id: CommandId, reason: Option<String>) -> Result<(), GateError> {
        self.gate.deny(command_id, reason)
    }

    /// Kill the running command (or `target`), discarding queued ones.
    /// Returns every command whose state changed.
    pub async fn kill_command(self: &Arc<Self>, target: Option<CommandId>) -> Result<Vec<Command>, GateError> {
        self.ensure_live()?;
        if let Some(id) = target {
            if self.gate.is_pending(id) {
                self.gate.deny(id, Some("killed before approval".to_string()))?;
                return Ok(Vec::new());
            }
        }

        // Held until the interrupt is written so nothing dispatched in
        // between reaches the interrupted program
        let write = self.write_lock.lock().await;
        let plan = {
            let mut state = self.state.lock();
            let plan = state.queue.kill(target)?;
            for command in plan.killed.iter().chain(plan.discarded.iter()) {
                state.abort_task(command.id);
                self.publish_status(command);
            }
            plan
        };
        info!(
            session_id = %self.id,
            killed = plan.killed.len(),
            discarded = plan.discarded.len(),
            "kill requested"
        );

        if plan.interrupt {
            if let Err(e) = self.backend.interrupt(&self.handle).await {
                self.write_failed(e);
            }
        }
        drop(write);

        let mut changed = plan.killed;
        changed.extend(plan.discarded);
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Terminal I/O
    // ------------------------------------------------------------------

    /// Queue raw keyboard input. Applied in order by the input worker.
    pub async fn input(&self, data: Vec<u8>) -> Result<(), GateError> {
        self.ensure_live()?;
        self.input_tx
            .send(InputMsg::Bytes(data))
            .await
            .map_err(|_| GateError::SessionTerminated(self.id.clone()))
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), GateError> {
        self.ensure_live()?;
        match self.backend.resize(&self.handle, cols, rows).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.write_failed(e.clone());
                Err(e)
            }
        }
    }

    /// Tear down: end every command, reject pending approvals and kill the
    /// backend, forcing it after the grace period. Only the first call does
    /// anything; later calls return `None`.
    pub async fn shutdown(&self, reason: &str) -> Option<KillOutcome> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return None;
        }

        let (ended, tasks) = {
            let mut state = self.state.lock();
            state.terminated = Some(reason.to_string());
            let ended = state.queue.shut_down(reason);
            let tasks: Vec<JoinHandle<()>> = state.tasks.drain().map(|(_, t)| t).collect();
            (ended, tasks)
        };
        for task in tasks {
            task.abort();
        }
        let rejected = self.gate.reject_all(reason);
        for command in &ended {
            self.publish_status(command);
        }
        debug!(session_id = %self.id, ended = ended.len(), rejected, "session commands ended");

        let grace = self.kill_grace;
        let outcome = match tokio::time::timeout(grace + KILL_SLACK, self.backend.kill(&self.handle, grace)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(session_id = %self.id, error = %e, "backend kill failed");
                KillOutcome::Forced
            }
            Err(_) => {
                warn!(session_id = %self.id, "backend kill did not return within grace");
                KillOutcome::Forced
            }
        };

        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        let _ = self.events.send(SessionEvent::Terminated {
            reason: reason.to_string(),
        });
        info!(session_id = %self.id, ?outcome, reason, "session shut down");
        Some(outcome)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_live(&self) -> Result<(), GateError> {
        if self.is_terminated() {
            Err(GateError::SessionTerminated(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn publish_status(&self, command: &Command) {
        let _ = self
            .events
            .send(SessionEvent::CommandStatus(CommandStatus::of(command)));
    }

    fn publish_approval(&self, id: CommandId) {
        if let Some(request) = self.gate.pending().into_iter().find(|r| r.command_id == id) {
            let _ = self.events.send(SessionEvent::ApprovalRequired(request));
        }
    }

    fn publish_error(&self, message: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Error {
            message: message.into(),
        });
    }

    /// The backend died or stopped responding; let the registry reap the
    /// session
    fn backend_lost(&self, reason: String) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        warn!(session_id = %self.id, reason = %reason, "backend lost");
        let _ = self.terminations.send(Termination {
            session_id: self.id.clone(),
            backend_id: self.handle.id.clone(),
            reason,
        });
    }

    fn write_failed(&self, error: GateError) {
        self.publish_error(error.to_string());
        if matches!(
            error,
            GateError::BackendUnresponsive { .. } | GateError::BackendClosed(_)
        ) {
            self.backend_lost(error.to_string());
        }
    }

    async fn write_backend(&self, bytes: &[u8]) -> Result<(), GateError> {
        self.backend.write(&self.handle, bytes).await.map_err(|e| {
            self.write_failed(e.clone());
            e
        })
    }

    async fn pump(self: Arc<Self>, mut output: mpsc::Receiver<BackendEvent>, prompt_fallback: bool) {
        let mut scanner = CompletionScanner::new(prompt_fallback);
        while let Some(event) = output.recv().await {
            match event {
                BackendEvent::Output { kind, data } => {
                    let mut progressed = false;
                    {
                        let mut state = self.state.lock();
                        for item in scanner.feed(&data) {
                            match item {
                                ScanEvent::Text(text) => {
                                    if let Some(prompt) = state.watcher.observe(&text) {
                                        debug!(session_id = %self.id, kind = ?prompt.kind, "interactive prompt detected");
                                    }
                                    let chunk = state.scrollback.push(kind, text);
                                    let _ = self.events.send(SessionEvent::Output(chunk));
                                }
                                ScanEvent::Completed { exit_code } => {
                                    let was_ready = state.queue.shell_ready();
                                    if let Some(command) = state.queue.on_marker(exit_code) {
                                        state.abort_task(command.id);
                                        state.watcher.reset();
                                        self.publish_status(&command);
                                        progressed = true;
                                    }
                                    progressed |= !was_ready;
                                }
                            }
                        }
                    }
                    if progressed {
                        self.dispatch_ready().await;
                    }
                }
                BackendEvent::Exited { code } => {
                    let status = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                    self.backend_lost(format!("shell exited with status {}", status));
                    return;
                }
                BackendEvent::Terminated { reason } => {
                    self.backend_lost(reason);
                    return;
                }
            }
        }
        self.backend_lost("backend output closed".to_string());
    }

    /// Start whatever the queue allows
    async fn dispatch_ready(self: &Arc<Self>) {
        let ready = {
            let mut state = self.state.lock();
            if state.terminated.is_some() {
                return;
            }
            let defer = state.input.is_held();
            state.queue.take_ready(defer)
        };

        for command in ready {
            self.publish_status(&command);
            match command.dispatch {
                DispatchKind::Captured => self.spawn_captured(command),
                DispatchKind::Interactive => {
                    self.arm_timeout(&command);
                    self.write_interactive(command).await;
                }
            }
        }
    }

    /// Where a command should run, as the backend sees it
    fn backend_dir(&self, dir: &Path) -> Result<PathBuf, GateError> {
        let relative = self.guard.relative(dir)?;
        Ok(self.handle.backend_path(&relative))
    }

    async fn write_interactive(self: &Arc<Self>, command: Command) {
        let text = match command.working_dir {
            Some(ref dir) => match self.backend_dir(dir) {
                Ok(path) => format!(
                    "( cd -- {} && {} )",
                    shell_escape::escape(path.to_string_lossy()),
                    command.text
                ),
                Err(e) => {
                    self.end_running(command.id, &e.to_string());
                    return;
                }
            },
            None => command.text.clone(),
        };

        let _write = self.write_lock.lock().await;
        let mut bytes = Vec::with_capacity(text.len() + 3);
        {
            let mut state = self.state.lock();
            if state.input.has_partial_line() {
                bytes.extend_from_slice(CLEAR_LINE);
                state.input.discard_line();
            }
        }
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(b'\r');

        debug!(session_id = %self.id, command_id = %command.id, "dispatching to shell");
        if let Err(e) = self.write_backend(&bytes).await {
            self.end_running(command.id, &e.to_string());
        }
    }

    fn end_running(&self, id: CommandId, reason: &str) {
        let mut state = self.state.lock();
        state.abort_task(id);
        if let Some(command) = state.queue.fail(id, reason) {
            self.publish_status(&command);
        }
    }

    fn spawn_captured(self: &Arc<Self>, command: Command) {
        let session = Arc::clone(self);
        let id = command.id;
        // Registered under the lock so the task cannot settle first
        let mut state = self.state.lock();
        let task = tokio::spawn(async move {
            let timeout = session.policy.snapshot().command_timeout();
            let result = match command.working_dir {
                Some(ref dir) => match session.backend_dir(dir) {
                    Ok(path) => {
                        session
                            .backend
                            .exec(&session.handle, &command.text, Some(path.as_path()), timeout)
                            .await
                    }
                    Err(e) => Err(e),
                },
                None => {
                    session
                        .backend
                        .exec(&session.handle, &command.text, None, timeout)
                        .await
                }
            };
            session.finish_captured(id, result).await;
        });
        state.tasks.insert(id, task);
    }

    async fn finish_captured(self: &Arc<Self>, id: CommandId, result: Result<ExecOutput, GateError>) {
        {
            let mut state = self.state.lock();
            state.tasks.remove(&id);
            let finished = match result {
                Ok(output) => {
                    for (kind, text) in [
                        (OutputKind::Stdout, &output.stdout),
                        (OutputKind::Stderr, &output.stderr),
                    ] {
                        if !text.is_empty() {
                            let chunk = state.scrollback.push(kind, text.replace('\n', "\r\n"));
                            let _ = self.events.send(SessionEvent::Output(chunk));
                        }
                    }
                    state.queue.complete_captured(id, output)
                }
                Err(GateError::BackendUnresponsive { .. }) => state.queue.fail(id, "command timed out"),
                Err(e) => {
                    if e.is_session_fatal() {
                        self.backend_lost(e.to_string());
                    }
                    state.queue.fail(id, &e.to_string())
                }
            };
            if let Some(command) = finished {
                self.publish_status(&command);
            }
        }
        self.dispatch_ready().await;
    }

    fn arm_timeout(self: &Arc<Self>, command: &Command) {
        if command.origin == CommandOrigin::Interactive {
            // Typed programs belong to the user
            return;
        }
        let limit = self.policy.snapshot().command_timeout();
        let session = Arc::clone(self);
        let id = command.id;
        let mut state = self.state.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            session.expire(id).await;
        });
        state.tasks.insert(id, timer);
    }

    async fn expire(self: &Arc<Self>, id: CommandId) {
        {
            let _write = self.write_lock.lock().await;
            let expired = {
                let mut state = self.state.lock();
                state.tasks.remove(&id);
                if state.queue.get(id).map(Command::state) != Some(CommandState::Running) {
                    return;
                }
                state.queue.fail(id, "command timed out")
            };
            if let Some(command) = expired {
                warn!(session_id = %self.id, command_id = %id, "command timed out");
                self.publish_status(&command);
                if let Err(e) = self.backend.interrupt(&self.handle).await {
                    self.write_failed(e);
                }
            }
        }
        self.dispatch_ready().await;
    }

    async fn on_approval(self: &Arc<Self>, id: CommandId, outcome: ApprovalOutcome) {
        let result = {
            let mut state = self.state.lock();
            match outcome {
                ApprovalOutcome::Approved => state.queue.approve(id).map(Some),
                ApprovalOutcome::Rejected { ref reason } => {
                    warn!(session_id = %self.id, command_id = %id, reason = %reason, "command rejected");
                    Ok(state.queue.reject(id, reason))
                }
            }
        };
        match result {
            Ok(Some(command)) => self.publish_status(&command),
            Ok(None) => {}
            Err(e) => debug!(session_id = %self.id, command_id = %id, error = %e, "stale approval"),
        }
        self.dispatch_ready().await;
    }

    // ------------------------------------------------------------------
    // Interactive input
    // ------------------------------------------------------------------

    async fn input_worker(self: Arc<Self>, mut messages: mpsc::Receiver<InputMsg>) {
        while let Some(message) = messages.recv().await {
            match message {
                InputMsg::Bytes(data) => self.process_input(data).await,
                InputMsg::Decision { command_id, outcome } => {
                    self.resolve_typed(command_id, outcome).await
                }
            }
        }
    }

    async fn process_input(self: &Arc<Self>, data: Vec<u8>) {
        let _write = self.write_lock.lock().await;
        let mut pending = data;
        loop {
            let actions = {
                let mut state = self.state.lock();
                let mode = state.line_mode();
                state.input.feed(&pending, mode)
            };

            let mut resume = false;
            for action in actions {
                match action {
                    InputAction::Forward(bytes) => {
                        if self.write_backend(&bytes).await.is_err() {
                            return;
                        }
                    }
                    InputAction::Overflow { dropped } => {
                        self.publish_error(format!(
                            "{} bytes of input dropped while a line awaits approval",
                            dropped
                        ));
                    }
                    InputAction::Submit {
                        line,
                        mode,
                        unverifiable,
                    } => match self.judge_line(line, mode, unverifiable) {
                        LineVerdict::Release(bytes) => {
                            if self.write_backend(&bytes).await.is_err() {
                                return;
                            }
                            resume = true;
                        }
                        LineVerdict::Held => {}
                    },
                }
            }

            let backlog = if resume {
                self.state.lock().input.take_backlog()
            } else {
                Vec::new()
            };
            if backlog.is_empty() {
                break;
            }
            pending = backlog;
        }
    }

    /// Decide a completed typed line
    fn judge_line(self: &Arc<Self>, line: String, mode: LineMode, unverifiable: Option<&'static str>) -> LineVerdict {
        let policy = self.policy.snapshot();
        let mut state = self.state.lock();

        let classification = match mode {
            LineMode::Command => match unverifiable {
                Some(reason) => Classification {
                    safety: Safety::Unsafe,
                    requires_approval: true,
                    reason: reason.to_string(),
                },
                None => classify(&line, &policy),
            },
            _ => match state.watcher.answer(&line) {
                PromptAnswer::NeedsApproval(classification) => classification,
                PromptAnswer::Secret | PromptAnswer::PassThrough | PromptAnswer::NoPrompt => {
                    return LineVerdict::Release(state.input.resolve(true));
                }
            },
        };

        let mut command = Command::new(
            self.id.clone(),
            CommandRequest::new(line),
            CommandOrigin::Interactive,
            ExecutionMode::Sequential,
            classification,
        );
        let id = command.id;
        let decision = match self.gate.submit(&mut command, &policy) {
            Ok(decision) => decision,
            Err(e) => {
                self.publish_error(e.to_string());
                return LineVerdict::Release(state.input.resolve(false));
            }
        };
        state.queue.insert(command);

        match decision {
            GateDecision::Proceed => {
                let started = match mode {
                    LineMode::Command => state.queue.start_typed(id),
                    _ => state.queue.deliver(id),
                };
                match started {
                    Ok(command) => self.publish_status(&command),
                    Err(e) => debug!(session_id = %self.id, error = %e, "typed line bookkeeping failed"),
                }
                LineVerdict::Release(state.input.resolve(true))
            }
            GateDecision::Pending(ticket) => {
                state.held = Some((id, mode));
                drop(state);
                self.publish_approval(id);
                let input = self.input_tx.clone();
                tokio::spawn(async move {
                    let outcome = ticket.wait().await;
                    let _ = input
                        .send(InputMsg::Decision {
                            command_id: id,
                            outcome,
                        })
                        .await;
                });
                LineVerdict::Held
            }
        }
    }

    async fn resolve_typed(self: &Arc<Self>, id: CommandId, outcome: ApprovalOutcome) {
        let bytes = {
            let _write = self.write_lock.lock().await;
            let bytes = {
                let mut state = self.state.lock();
                let mode = match state.held {
                    Some((held, mode)) if held == id => mode,
                    _ => return,
                };
                state.held = None;
                if state.terminated.is_some() {
                    return;
                }

                match outcome {
                    ApprovalOutcome::Approved => {
                        let started = match mode {
                            LineMode::Command => state.queue.start_typed(id),
                            _ => state.queue.deliver(id),
                        };
                        if let Ok(ref command) = started {
                            self.publish_status(command);
                        }
                        state.input.resolve(true)
                    }
                    ApprovalOutcome::Rejected { reason } => {
                        warn!(session_id = %self.id, command_id = %id, reason = %reason, "typed command rejected");
                        if let Some(command) = state.queue.reject(id, &reason) {
                            self.publish_status(&command);
                        }
                        self.publish_error(GateError::rejected(reason).to_string());
                        state.input.resolve(false)
                    }
                }
            };
            if self.write_backend(&bytes).await.is_err() {
                return;
            }
            bytes
        };
        debug!(session_id = %self.id, released = bytes.len(), "typed line resolved");

        let backlog = self.state.lock().input.take_backlog();
        if !backlog.is_empty() {
            self.process_input(backlog).await;
        }
        self.dispatch_ready().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("workspace", &self.workspace)
            .field("backend", &self.handle.id)
            .finish()
    }
}
