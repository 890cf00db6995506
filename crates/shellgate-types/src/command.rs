use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::{Classification, CommandId, ExecutionMode, GateError, SessionId};

/// Lifecycle state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// The instant before classification
    Idle,
    PendingApproval,
    /// Approved and waiting in the queue for dispatch
    Approved,
    Running,
    Completed,
    Failed,
    Killed,
    /// Approval was denied or timed out
    Rejected,
    /// Dropped from the queue before dispatch
    Discarded,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed
                | CommandState::Failed
                | CommandState::Killed
                | CommandState::Rejected
                | CommandState::Discarded
        )
    }

    pub fn can_transition_to(self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Idle, PendingApproval)
                | (Idle, Approved)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (PendingApproval, Discarded)
                | (Approved, Running)
                | (Approved, Discarded)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Killed)
        )
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandState::Idle => "idle",
            CommandState::PendingApproval => "pending_approval",
            CommandState::Approved => "approved",
            CommandState::Running => "running",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Killed => "killed",
            CommandState::Rejected => "rejected",
            CommandState::Discarded => "discarded",
        };
        write!(f, "{}", name)
    }
}

/// Who issued a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    /// Submitted by an agent with optional reasoning
    Agent,
    /// A line typed into the interactive terminal
    Interactive,
    /// Synchronous execute call through the management API
    Api,
}

/// How the queue hands a command to the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    /// Written to the interactive shell's stdin
    #[default]
    Interactive,
    /// Run through the backend's exec primitive with a captured exit status
    Captured,
}

/// Request to run a command in a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub expectation: Option<String>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub dispatch: DispatchKind,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn captured(mut self) -> Self {
        self.dispatch = DispatchKind::Captured;
        self
    }
}

/// One execution attempt of a shell command.
///
/// The classification is fixed at construction; only the lifecycle fields
/// change afterwards, and only along valid transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub session_id: SessionId,
    pub text: String,
    pub working_dir: Option<PathBuf>,
    pub reasoning: Option<String>,
    pub expectation: Option<String>,
    pub origin: CommandOrigin,
    pub dispatch: DispatchKind,
    pub mode: ExecutionMode,
    classification: Classification,
    state: CommandState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

impl Command {
    pub fn new(
        session_id: SessionId,
        request: CommandRequest,
        origin: CommandOrigin,
        default_mode: ExecutionMode,
        classification: Classification,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            text: request.command,
            working_dir: request.working_directory,
            reasoning: request.reasoning,
            expectation: request.expectation,
            origin,
            dispatch: request.dispatch,
            mode: request.mode.unwrap_or(default_mode),
            classification,
            state: CommandState::Idle,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            failure_reason: None,
        }
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn requires_approval(&self) -> bool {
        self.classification.requires_approval
    }

    /// Move to `next`, stamping timestamps. Terminal states are final.
    pub fn transition(&mut self, next: CommandState) -> Result<CommandState, GateError> {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            return Err(GateError::InvalidTransition {
                from: previous,
                to: next,
            });
        }
        self.state = next;
        match next {
            CommandState::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(previous)
    }

    /// Complete a running command from the backend's reported exit status.
    /// An unknown status counts as success.
    pub fn finish(&mut self, exit_code: Option<i32>) -> Result<CommandState, GateError> {
        let next = match exit_code {
            Some(code) if code != 0 => CommandState::Failed,
            _ => CommandState::Completed,
        };
        self.transition(next)?;
        self.exit_code = exit_code;
        Ok(next)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), GateError> {
        self.transition(CommandState::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn end_with(&mut self, next: CommandState, reason: impl Into<String>) -> Result<(), GateError> {
        self.transition(next)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}
