use serde::Serialize;
use shellgate_policy::ApprovalRequest;
use shellgate_types::{Command, CommandId, CommandState, OutputChunk};

/// Typed events a session publishes to its subscribers, in the order they
/// happened
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output(OutputChunk),
    ApprovalRequired(ApprovalRequest),
    CommandStatus(CommandStatus),
    /// A refusal that did not change any command's state
    Error { message: String },
    /// The session is gone; published once
    Terminated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    pub command_id: CommandId,
    pub command: String,
    pub state: CommandState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CommandStatus {
    pub fn of(command: &Command) -> Self {
        Self {
            command_id: command.id,
            command: command.text.clone(),
            state: command.state(),
            exit_code: command.exit_code,
            reason: command.failure_reason.clone(),
        }
    }
}
