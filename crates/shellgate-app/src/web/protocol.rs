use serde::{Deserialize, Serialize};
use shellgate_session::{CommandStatus, SessionEvent};
use shellgate_types::{CommandId, CommandRequest, ExecutionMode, Safety, SessionId};
use std::path::PathBuf;

/// Close code sent to connections refused by admission control
pub const CLOSE_RATE_LIMITED: u16 = 4429;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Keystrokes for the shell
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    /// Client-side scrollback reset; echoed back, the shell is not touched
    Clear,
    Command {
        command: String,
        #[serde(default)]
        working_directory: Option<PathBuf>,
        #[serde(default)]
        reasoning: Option<String>,
        #[serde(default)]
        expectation: Option<String>,
        #[serde(default)]
        mode: Option<ExecutionMode>,
    },
    Approve { command_id: CommandId },
    Deny {
        command_id: CommandId,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Kill the running command, or a specific one
    Kill {
        #[serde(default)]
        command_id: Option<CommandId>,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        session_id: SessionId,
        workspace: String,
    },
    Output {
        data: String,
        seq: u64,
    },
    Clear,
    Error {
        message: String,
    },
    ApprovalRequired {
        command_id: CommandId,
        command: String,
        safety: Safety,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    CommandStatus {
        command_id: CommandId,
        command: String,
        state: shellgate_types::CommandState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SessionTerminated {
        reason: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }
}

impl From<CommandStatus> for ServerMessage {
    fn from(status: CommandStatus) -> Self {
        ServerMessage::CommandStatus {
            command_id: status.command_id,
            command: status.command,
            state: status.state,
            exit_code: status.exit_code,
            reason: status.reason,
        }
    }
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Output(chunk) => ServerMessage::Output {
                data: chunk.data,
                seq: chunk.seq,
            },
            SessionEvent::ApprovalRequired(request) => ServerMessage::ApprovalRequired {
                command_id: request.command_id,
                command: request.command,
                safety: request.safety,
                reason: request.reason,
                reasoning: request.reasoning,
            },
            SessionEvent::CommandStatus(status) => status.into(),
            SessionEvent::Error { message } => ServerMessage::Error { message },
            SessionEvent::Terminated { reason } => ServerMessage::SessionTerminated { reason },
        }
    }
}

/// Build the queue request for a `command` message; `None` for other kinds
pub fn command_request(message: ClientMessage) -> Option<CommandRequest> {
    match message {
        ClientMessage::Command {
            command,
            working_directory,
            reasoning,
            expectation,
            mode,
        } => Some(CommandRequest {
            command,
            working_directory,
            reasoning,
            expectation,
            mode,
            ..Default::default()
        }),
        _ => None,
    }
}
