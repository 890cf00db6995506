//! Core types shared by the shellgate crates
//!
//! Sessions, commands, output chunks, resource limits and the error taxonomy
//! used across the policy, terminal, session and app crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub mod ansi;
pub mod command;
pub mod error;

pub use command::{Command, CommandOrigin, CommandRequest, CommandState, DispatchKind};
pub use error::GateError;

// ============================================================================
// Constants
// ============================================================================

/// Default cap on concurrently live sessions
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 5;

/// Default per-command timeout (5 minutes)
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 300_000;

/// Default scrollback bound per session, in bytes of output text
pub const DEFAULT_SCROLLBACK_BYTES: usize = 1024 * 1024;

/// Default pseudo-terminal size
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque session identifier. Clients may choose it (for idempotent retries)
/// or let the registry generate one.
pub type SessionId = String;

/// Command identifier, unique per execution attempt
pub type CommandId = Uuid;

/// Identifier of one transport connection
pub type ConnectionId = Uuid;

/// Generate a fresh session identifier
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Safety classification
// ============================================================================

/// Safety verdict for a command, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Safety {
    Safe,
    Unsafe,
    Dangerous,
}

impl std::fmt::Display for Safety {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Safety::Safe => write!(f, "safe"),
            Safety::Unsafe => write!(f, "unsafe"),
            Safety::Dangerous => write!(f, "dangerous"),
        }
    }
}

/// Result of classifying a command string against a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub safety: Safety,
    pub requires_approval: bool,
    pub reason: String,
}

// ============================================================================
// Execution modes and limits
// ============================================================================

/// How a session's queue dispatches approved commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Command n+1 waits until command n reaches a terminal state
    #[default]
    Sequential,
    /// Commands dispatch as soon as they are approved
    Independent,
}

/// Network access granted to a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    #[default]
    None,
    Bridge,
}

/// Resource caps applied to one backend instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub network: NetworkPolicy,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: Some(512 * 1024 * 1024),
            cpu_shares: Some(512),
            network: NetworkPolicy::None,
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// Origin of an output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    System,
}

/// One immutable piece of session output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    pub seq: u64,
    pub kind: OutputKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Session summaries
// ============================================================================

/// Session listing entry exposed to UI and agent collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub workspace: PathBuf,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub pending_approvals: usize,
}
