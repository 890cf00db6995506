use shellgate_terminal::ExecOutput;
use shellgate_types::{Command, CommandId, CommandState, DispatchKind, ExecutionMode, GateError};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;

/// Finished commands kept for listing before the oldest are forgotten
const HISTORY_LIMIT: usize = 1000;

/// What a kill did
#[derive(Debug, Default)]
pub struct KillPlan {
    pub killed: Vec<Command>,
    pub discarded: Vec<Command>,
    /// A command running in the interactive shell was killed; the shell
    /// needs an interrupt
    pub interrupt: bool,
}

/// Per-session command bookkeeping and dispatch ordering.
///
/// Approved sequential commands wait in FIFO order until nothing is in
/// flight; independent commands leave the queue as soon as they are
/// approved. Commands written to the interactive shell complete in the
/// order they were written, one exit marker each. A killed or timed-out
/// command stays at its place in that order until its marker arrives so
/// the marker cannot complete a later command.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: HashMap<CommandId, Command>,
    order: VecDeque<CommandId>,
    waiting: VecDeque<CommandId>,
    interactive: VecDeque<CommandId>,
    captured: HashSet<CommandId>,
    outputs: HashMap<CommandId, ExecOutput>,
    waiters: HashMap<CommandId, Vec<oneshot::Sender<Command>>>,
    shell_ready: bool,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, command: Command) {
        self.order.push_back(command.id);
        self.commands.insert(command.id, command);
        self.prune();
    }

    pub fn get(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    /// All known commands in submission order
    pub fn list(&self) -> Vec<Command> {
        self.order
            .iter()
            .filter_map(|id| self.commands.get(id).cloned())
            .collect()
    }

    pub fn output(&self, id: CommandId) -> Option<&ExecOutput> {
        self.outputs.get(&id)
    }

    pub fn shell_ready(&self) -> bool {
        self.shell_ready
    }

    /// Commands currently executing
    pub fn in_flight(&self) -> usize {
        self.captured.len() + self.interactive_running()
    }

    /// Commands executing in the interactive shell
    pub fn interactive_running(&self) -> usize {
        self.interactive
            .iter()
            .filter(|id| self.state(**id) == Some(CommandState::Running))
            .count()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    fn state(&self, id: CommandId) -> Option<CommandState> {
        self.commands.get(&id).map(Command::state)
    }

    /// Mark an approved command ready for dispatch
    pub fn approve(&mut self, id: CommandId) -> Result<Command, GateError> {
        let command = self.commands.get_mut(&id).ok_or(GateError::CommandNotFound(id))?;
        if command.state() != CommandState::Approved {
            command.transition(CommandState::Approved)?;
        }
        self.waiting.push_back(id);
        Ok(command.clone())
    }

    /// Pull everything that may start now and mark it running.
    ///
    /// Commands bound for the interactive shell stay queued until its first
    /// prompt has been seen, and while `defer_interactive` is set (someone
    /// is typing into it). Captured commands never wait on the shell.
    pub fn take_ready(&mut self, defer_interactive: bool) -> Vec<Command> {
        let busy = self.in_flight() > 0;
        let mut ready = Vec::new();

        let independent: Vec<CommandId> = self
            .waiting
            .iter()
            .copied()
            .filter(|id| {
                self.commands
                    .get(id)
                    .map_or(false, |c| c.mode == ExecutionMode::Independent)
            })
            .collect();
        self.waiting.retain(|id| !independent.contains(id));
        for id in independent {
            ready.extend(self.start(id));
        }

        if !busy && ready.is_empty() {
            let head_deferred = self.waiting.front().and_then(|id| self.commands.get(id)).map_or(
                false,
                |c| {
                    c.dispatch == DispatchKind::Interactive && (defer_interactive || !self.shell_ready)
                },
            );
            if !head_deferred {
                if let Some(id) = self.waiting.pop_front() {
                    ready.extend(self.start(id));
                }
            }
        }
        ready
    }

    fn start(&mut self, id: CommandId) -> Option<Command> {
        let command = self.commands.get_mut(&id)?;
        command.transition(CommandState::Running).ok()?;
        match command.dispatch {
            DispatchKind::Captured => {
                self.captured.insert(id);
            }
            DispatchKind::Interactive => self.interactive.push_back(id),
        }
        Some(command.clone())
    }

    /// A typed line was released to the shell
    pub fn start_typed(&mut self, id: CommandId) -> Result<Command, GateError> {
        let command = self.commands.get_mut(&id).ok_or(GateError::CommandNotFound(id))?;
        if command.state() == CommandState::PendingApproval || command.state() == CommandState::Idle {
            command.transition(CommandState::Approved)?;
        }
        command.transition(CommandState::Running)?;
        let command = command.clone();
        self.interactive.push_back(id);
        Ok(command)
    }

    /// An approved answer to a program's question was delivered; it has
    /// no exit status of its own
    pub fn deliver(&mut self, id: CommandId) -> Result<Command, GateError> {
        let command = self.commands.get_mut(&id).ok_or(GateError::CommandNotFound(id))?;
        if command.state() != CommandState::Approved {
            command.transition(CommandState::Approved)?;
        }
        command.transition(CommandState::Running)?;
        command.finish(None)?;
        let command = command.clone();
        self.settled(&command);
        Ok(command)
    }

    /// The shell printed an exit marker. Returns the command it completed.
    pub fn on_marker(&mut self, exit_code: Option<i32>) -> Option<Command> {
        if !self.shell_ready {
            // The first prompt after startup
            self.shell_ready = true;
            return None;
        }
        let id = self.interactive.pop_front()?;
        let command = self.commands.get_mut(&id)?;
        if command.state() != CommandState::Running {
            // Already killed or timed out; this was its marker
            return None;
        }
        command.finish(exit_code).ok()?;
        let command = command.clone();
        self.settled(&command);
        Some(command)
    }

    /// A captured command returned
    pub fn complete_captured(&mut self, id: CommandId, output: ExecOutput) -> Option<Command> {
        self.captured.remove(&id);
        let exit_code = output.exit_code;
        self.outputs.insert(id, output);
        let command = self.commands.get_mut(&id)?;
        command.finish(exit_code).ok()?;
        let command = command.clone();
        self.settled(&command);
        Some(command)
    }

    /// Fail a running command. Interactive commands keep their place in
    /// the marker order.
    pub fn fail(&mut self, id: CommandId, reason: &str) -> Option<Command> {
        self.end(id, CommandState::Failed, reason)
    }

    /// Reject a command whose approval was denied
    pub fn reject(&mut self, id: CommandId, reason: &str) -> Option<Command> {
        self.end(id, CommandState::Rejected, reason)
    }

    /// Put a command that was never started to rest
    pub fn discard(&mut self, id: CommandId, reason: &str) -> Option<Command> {
        self.waiting.retain(|w| *w != id);
        self.end(id, CommandState::Discarded, reason)
    }

    fn end(&mut self, id: CommandId, state: CommandState, reason: &str) -> Option<Command> {
        self.captured.remove(&id);
        let command = self.commands.get_mut(&id)?;
        command.end_with(state, reason).ok()?;
        let command = command.clone();
        self.settled(&command);
        Some(command)
    }

    /// Kill one command, or every running command when `target` is
    /// `None`. Commands queued behind a killed command are discarded.
    pub fn kill(&mut self, target: Option<CommandId>) -> Result<KillPlan, GateError> {
        let mut plan = KillPlan::default();

        let victims: Vec<CommandId> = match target {
            None => self
                .interactive
                .iter()
                .chain(self.captured.iter())
                .copied()
                .filter(|id| self.state(*id) == Some(CommandState::Running))
                .collect(),
            Some(id) => match self.state(id) {
                None => return Err(GateError::CommandNotFound(id)),
                Some(CommandState::Running) => vec![id],
                Some(CommandState::Approved) => {
                    plan.discarded.extend(self.discard(id, "killed before dispatch"));
                    return Ok(plan);
                }
                Some(state) => {
                    return Err(GateError::InvalidTransition {
                        from: state,
                        to: CommandState::Killed,
                    })
                }
            },
        };

        for id in victims {
            if self.interactive.contains(&id) {
                plan.interrupt = true;
            }
            plan.killed.extend(self.end(id, CommandState::Killed, "killed by user"));
        }
        let queued: Vec<CommandId> = self.waiting.drain(..).collect();
        for id in queued {
            plan.discarded.extend(self.end(id, CommandState::Discarded, "discarded by kill"));
        }
        Ok(plan)
    }

    /// End everything for session teardown
    pub fn shut_down(&mut self, reason: &str) -> Vec<Command> {
        let mut ended = Vec::new();
        let ids: Vec<CommandId> = self.order.iter().copied().collect();
        for id in ids {
            let next = match self.state(id) {
                Some(CommandState::Running) => CommandState::Failed,
                Some(CommandState::Approved) | Some(CommandState::PendingApproval) => CommandState::Discarded,
                _ => continue,
            };
            ended.extend(self.end(id, next, reason));
        }
        self.waiting.clear();
        self.interactive.clear();
        self.captured.clear();
        ended
    }

    /// Resolves with the command once it reaches a terminal state
    pub fn wait_for(&mut self, id: CommandId) -> Result<oneshot::Receiver<Command>, GateError> {
        let command = self.commands.get(&id).ok_or(GateError::CommandNotFound(id))?;
        let (tx, rx) = oneshot::channel();
        if command.state().is_terminal() {
            let _ = tx.send(command.clone());
        } else {
            self.waiters.entry(id).or_default().push(tx);
        }
        Ok(rx)
    }

    fn settled(&mut self, command: &Command) {
        for waiter in self.waiters.remove(&command.id).unwrap_or_default() {
            let _ = waiter.send(command.clone());
        }
    }

    fn prune(&mut self) {
        while self.order.len() > HISTORY_LIMIT {
            let oldest_done = self
                .order
                .iter()
                .position(|id| self.state(*id).map_or(true, CommandState::is_terminal));
            let Some(pos) = oldest_done else { break };
            if let Some(id) = self.order.remove(pos) {
                if self.interactive.contains(&id) {
                    // Still owed a marker
                    self.order.push_back(id);
                    break;
                }
                self.commands.remove(&id);
                self.outputs.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shellgate_types::{Classification, CommandOrigin, CommandRequest, Safety};

    fn command(text: &str, mode: ExecutionMode, dispatch: DispatchKind) -> Command {
        let mut request = CommandRequest::new(text).with_mode(mode);
        request.dispatch = dispatch;
        Command::new(
            "s1".to_string(),
            request,
            CommandOrigin::Agent,
            ExecutionMode::Sequential,
            Classification {
                safety: Safety::Safe,
                requires_approval: false,
                reason: "test".to_string(),
            },
        )
    }

    fn approved(queue: &mut CommandQueue, text: &str, mode: ExecutionMode, dispatch: DispatchKind) -> CommandId {
        let cmd = command(text, mode, dispatch);
        let id = cmd.id;
        queue.insert(cmd);
        queue.approve(id).unwrap();
        id
    }

    fn ready_queue() -> CommandQueue {
        let mut queue = CommandQueue::new();
        assert!(queue.on_marker(Some(0)).is_none());
        assert!(queue.shell_ready());
        queue
    }

    #[test]
    fn test_sequential_waits_for_previous() {
        let mut queue = ready_queue();
        let a = approved(&mut queue, "a", ExecutionMode::Sequential, DispatchKind::Interactive);
        let b = approved(&mut queue, "b", ExecutionMode::Sequential, DispatchKind::Interactive);

        let first: Vec<CommandId> = queue.take_ready(false).iter().map(|c| c.id).collect();
        assert_eq!(first, vec![a]);
        assert!(queue.take_ready(false).is_empty());

        let done = queue.on_marker(Some(0)).unwrap();
        assert_eq!((done.id, done.state()), (a, CommandState::Completed));

        let second: Vec<CommandId> = queue.take_ready(false).iter().map(|c| c.id).collect();
        assert_eq!(second, vec![b]);
        let failed = queue.on_marker(Some(2)).unwrap();
        assert_eq!(failed.state(), CommandState::Failed);
        assert_eq!(failed.exit_code, Some(2));
    }

    #[test]
    fn test_independent_dispatches_immediately() {
        let mut queue = ready_queue();
        let a = approved(&mut queue, "a", ExecutionMode::Sequential, DispatchKind::Interactive);
        queue.take_ready(false);
        let b = approved(&mut queue, "b", ExecutionMode::Independent, DispatchKind::Captured);

        let ready: Vec<CommandId> = queue.take_ready(false).iter().map(|c| c.id).collect();
        assert_eq!(ready, vec![b]);
        assert_eq!(queue.in_flight(), 2);

        let output = ExecOutput {
            stdout: "ok".to_string(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(queue.complete_captured(b, output).unwrap().state(), CommandState::Completed);
        assert_eq!(queue.output(b).unwrap().stdout, "ok");
        assert_eq!(queue.get(a).unwrap().state(), CommandState::Running);
    }

    #[test]
    fn test_kill_swallows_marker_and_discards_queue() {
        let mut queue = ready_queue();
        let a = approved(&mut queue, "hang", ExecutionMode::Sequential, DispatchKind::Interactive);
        queue.take_ready(false);
        let b = approved(&mut queue, "b", ExecutionMode::Sequential, DispatchKind::Interactive);

        let plan = queue.kill(None).unwrap();
        assert!(plan.interrupt);
        assert_eq!(plan.killed[0].id, a);
        assert_eq!(plan.discarded[0].id, b);

        // the interrupted command's marker reports success; it stays killed
        assert!(queue.on_marker(Some(0)).is_none());
        assert_eq!(queue.get(a).unwrap().state(), CommandState::Killed);

        let c = approved(&mut queue, "c", ExecutionMode::Sequential, DispatchKind::Interactive);
        assert_eq!(queue.take_ready(false)[0].id, c);
        assert_eq!(queue.on_marker(Some(0)).unwrap().id, c);
    }

    #[test]
    fn test_kill_errors() {
        let mut queue = ready_queue();
        assert!(matches!(
            queue.kill(Some(uuid::Uuid::new_v4())),
            Err(GateError::CommandNotFound(_))
        ));
        let a = approved(&mut queue, "a", ExecutionMode::Sequential, DispatchKind::Interactive);
        queue.take_ready(false);
        queue.on_marker(Some(0));
        assert!(matches!(
            queue.kill(Some(a)),
            Err(GateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_deferred_interactive_head() {
        let mut queue = ready_queue();
        let a = approved(&mut queue, "a", ExecutionMode::Sequential, DispatchKind::Interactive);
        assert!(queue.take_ready(true).is_empty());
        assert_eq!(queue.take_ready(false)[0].id, a);
    }

    #[test]
    fn test_captured_does_not_wait_for_first_prompt() {
        let mut queue = CommandQueue::new();
        let typed = approved(&mut queue, "a", ExecutionMode::Sequential, DispatchKind::Interactive);
        assert!(queue.take_ready(false).is_empty());
        assert_eq!(queue.get(typed).unwrap().state(), CommandState::Approved);

        let mut queue = CommandQueue::new();
        let captured = approved(&mut queue, "b", ExecutionMode::Sequential, DispatchKind::Captured);
        assert_eq!(queue.take_ready(false)[0].id, captured);
        assert!(!queue.shell_ready());
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_completion() {
        let mut queue = ready_queue();
        let a = approved(&mut queue, "a", ExecutionMode::Sequential, DispatchKind::Interactive);
        let waiter = queue.wait_for(a).unwrap();
        queue.take_ready(false);
        queue.on_marker(Some(1));
        assert_eq!(waiter.await.unwrap().state(), CommandState::Failed);
    }

    #[test]
    fn test_shut_down_ends_everything() {
        let mut queue = ready_queue();
        let a = approved(&mut queue, "a", ExecutionMode::Sequential, DispatchKind::Interactive);
        queue.take_ready(false);
        let b = approved(&mut queue, "b", ExecutionMode::Sequential, DispatchKind::Interactive);

        let ended = queue.shut_down("session destroyed");
        assert_eq!(ended.len(), 2);
        assert_eq!(queue.get(a).unwrap().state(), CommandState::Failed);
        assert_eq!(queue.get(b).unwrap().state(), CommandState::Discarded);
        assert_eq!(queue.in_flight(), 0);
    }
}
