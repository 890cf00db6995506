use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shellgate_types::{Command, CommandId, CommandState, GateError, Safety};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::Policy;

/// Final answer for a parked command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected { reason: String },
}

/// What the gate shows to whoever can confirm or deny
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub command_id: CommandId,
    pub command: String,
    pub safety: Safety,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl ApprovalRequest {
    fn for_command(command: &Command) -> Self {
        Self {
            command_id: command.id,
            command: command.text.clone(),
            safety: command.classification().safety,
            reason: command.classification().reason.clone(),
            reasoning: command.reasoning.clone(),
            requested_at: Utc::now(),
        }
    }
}

struct PendingApproval {
    request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalOutcome>,
}

type PendingMap = Arc<Mutex<HashMap<CommandId, PendingApproval>>>;

pub enum GateDecision {
    /// No approval needed, the command is `approved`
    Proceed,
    /// The command is `pending_approval`; await the ticket
    Pending(ApprovalTicket),
}

/// Handle for one parked command
pub struct ApprovalTicket {
    command_id: CommandId,
    receiver: oneshot::Receiver<ApprovalOutcome>,
    timeout: Option<Duration>,
    pending: PendingMap,
}

impl ApprovalTicket {
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Wait for confirmation, denial or the approval timeout
    pub async fn wait(self) -> ApprovalOutcome {
        let ApprovalTicket {
            command_id,
            receiver,
            timeout,
            pending,
        } = self;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    pending.lock().remove(&command_id);
                    return ApprovalOutcome::Rejected {
                        reason: "approval timed out".to_string(),
                    };
                }
            },
            None => receiver.await,
        };

        received.unwrap_or_else(|_| ApprovalOutcome::Rejected {
            reason: "approval gate closed".to_string(),
        })
    }
}

/// Parks commands that need human confirmation.
///
/// One gate per session. Each command gets its own responder, so deciding
/// one command never touches another. The gate performs no I/O; callers
/// surface [`ApprovalRequest`]s however they like.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    pending: PendingMap,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a freshly classified command to `approved` or park it in
    /// `pending_approval`.
    pub fn submit(&self, command: &mut Command, policy: &Policy) -> Result<GateDecision, GateError> {
        if !command.requires_approval() {
            command.transition(CommandState::Approved)?;
            return Ok(GateDecision::Proceed);
        }

        command.transition(CommandState::PendingApproval)?;
        let (responder, receiver) = oneshot::channel();
        let request = ApprovalRequest::for_command(command);
        tracing::info!(
            command_id = %command.id,
            session_id = %command.session_id,
            safety = %request.safety,
            reason = %request.reason,
            "command awaiting approval"
        );
        self.pending
            .lock()
            .insert(command.id, PendingApproval { request, responder });

        Ok(GateDecision::Pending(ApprovalTicket {
            command_id: command.id,
            receiver,
            timeout: policy.approval_timeout(),
            pending: self.pending.clone(),
        }))
    }

    pub fn confirm(&self, command_id: CommandId) -> Result<(), GateError> {
        self.resolve(command_id, ApprovalOutcome::Approved)
    }

    pub fn deny(&self, command_id: CommandId, reason: Option<String>) -> Result<(), GateError> {
        let reason = reason.unwrap_or_else(|| "denied by user".to_string());
        self.resolve(command_id, ApprovalOutcome::Rejected { reason })
    }

    fn resolve(&self, command_id: CommandId, outcome: ApprovalOutcome) -> Result<(), GateError> {
        let entry = self
            .pending
            .lock()
            .remove(&command_id)
            .ok_or(GateError::CommandNotFound(command_id))?;
        tracing::debug!(command_id = %command_id, ?outcome, "approval resolved");
        entry
            .responder
            .send(outcome)
            .map_err(|_| GateError::CommandNotFound(command_id))
    }

    /// Reject everything still parked. Returns how many were rejected.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingApproval> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(ApprovalOutcome::Rejected {
                reason: reason.to_string(),
            });
        }
        count
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, command_id: CommandId) -> bool {
        self.pending.lock().contains_key(&command_id)
    }
}
