//! Command policy, safety classification and approval gating

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shellgate_types::{
    Classification, GateError, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_MAX_CONCURRENT_SESSIONS,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod approval;
pub mod classifier;
pub mod lexer;
pub mod prompt_watch;

pub use approval::{ApprovalGate, ApprovalOutcome, ApprovalRequest, ApprovalTicket, GateDecision};
pub use classifier::classify;
pub use prompt_watch::{DetectedPrompt, PromptAnswer, PromptKind, PromptWatcher};

const DEFAULT_WHITELIST: &[&str] = &[
    "ls", "pwd", "cd", "echo", "cat", "head", "tail", "less", "wc", "grep", "rg", "tree",
    "which", "whoami", "date", "uname", "id", "du", "df", "stat", "file", "sort", "uniq",
    "diff", "clear", "history", "git status", "git log", "git diff", "git branch", "git show",
    "python --version", "python3 --version", "node --version", "npm --version",
    "cargo --version", "rustc --version",
];

const DEFAULT_BLACKLIST: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "fdisk", "shred", "shutdown", "reboot", "halt", "poweroff",
    "killall", "pkill", "chmod", "chown", "sudo", "su", "doas", "mount", "umount",
    "git push --force", "git reset --hard", "git clean",
];

/// Process-wide command policy.
///
/// Read by the approval gate on every classification. Updates apply to
/// commands classified afterwards; in-flight commands keep their verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    /// Whitelisted commands run without confirmation
    pub auto_approve_mode: bool,
    pub max_concurrent_sessions: usize,
    pub command_timeout_ms: u64,
    /// Pending approvals are rejected after this long; unset means wait forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timeout_ms: Option<u64>,
    pub safe_command_whitelist: BTreeSet<String>,
    pub dangerous_command_blacklist: BTreeSet<String>,
    pub allowed_workspace_roots: BTreeSet<PathBuf>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            auto_approve_mode: false,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            approval_timeout_ms: None,
            safe_command_whitelist: DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect(),
            dangerous_command_blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            allowed_workspace_roots: BTreeSet::new(),
        }
    }
}

impl Policy {
    /// Load policy from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        let policy: Policy = toml::from_str(&content)
            .with_context(|| format!("failed to parse policy file {}", path.display()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Save policy to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), GateError> {
        if self.max_concurrent_sessions == 0 {
            return Err(GateError::Configuration(
                "maxConcurrentSessions must be at least 1".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(GateError::Configuration(
                "commandTimeoutMs must be positive".to_string(),
            ));
        }
        let blank = self
            .safe_command_whitelist
            .iter()
            .chain(self.dangerous_command_blacklist.iter())
            .any(|entry| entry.trim().is_empty());
        if blank {
            return Err(GateError::Configuration(
                "whitelist and blacklist entries must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        self.approval_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_auto_approve(mut self, enabled: bool) -> Self {
        self.auto_approve_mode = enabled;
        self
    }
}

/// Shared, runtime-mutable policy holder.
///
/// Readers take a cheap `Arc<Policy>` snapshot so a classification never
/// observes a half-applied update.
#[derive(Clone, Debug)]
pub struct PolicyManager {
    current: Arc<RwLock<Arc<Policy>>>,
    policy_file: Option<PathBuf>,
}

impl PolicyManager {
    pub fn new(policy: Policy) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(policy))),
            policy_file: None,
        }
    }

    /// Create a policy manager backed by a file, writing the default policy
    /// there if the file does not exist yet.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let policy = if path_buf.exists() {
            Policy::load_from_file(&path_buf)?
        } else {
            let policy = Policy::default();
            if let Some(parent) = path_buf.parent() {
                std::fs::create_dir_all(parent)?;
            }
            policy.save_to_file(&path_buf)?;
            tracing::info!(path = %path_buf.display(), "created default policy file");
            policy
        };

        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(policy))),
            policy_file: Some(path_buf),
        })
    }

    pub fn snapshot(&self) -> Arc<Policy> {
        self.current.read().clone()
    }

    /// Replace the policy. Persists to the policy file when one is configured.
    pub fn update(&self, policy: Policy) -> Result<Arc<Policy>> {
        policy.validate()?;
        if let Some(ref path) = self.policy_file {
            policy.save_to_file(path)?;
        }
        let policy = Arc::new(policy);
        *self.current.write() = policy.clone();
        tracing::info!(
            auto_approve = policy.auto_approve_mode,
            max_sessions = policy.max_concurrent_sessions,
            "policy updated"
        );
        Ok(policy)
    }

    pub fn classify(&self, command: &str) -> Classification {
        classify(command, &self.snapshot())
    }

    pub fn policy_file(&self) -> Option<&Path> {
        self.policy_file.as_deref()
    }
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use shellgate_types::Safety;
    use tempfile::TempDir;

    #[test]
    fn test_from_file_creates_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("policy.toml");

        let manager = PolicyManager::from_file(&path).unwrap();
        assert!(path.exists());
        assert_eq!(*manager.snapshot(), Policy::default());

        let reloaded = Policy::load_from_file(&path).unwrap();
        assert_eq!(reloaded, Policy::default());
    }

    #[test]
    fn test_update_persists_and_applies() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.toml");
        let manager = PolicyManager::from_file(&path).unwrap();

        let before = manager.classify("ls -la");
        assert!(before.requires_approval);

        manager
            .update(Policy::default().with_auto_approve(true))
            .unwrap();
        let after = manager.classify("ls -la");
        assert_eq!(after.safety, Safety::Safe);
        assert!(!after.requires_approval);

        let on_disk = Policy::load_from_file(&path).unwrap();
        assert!(on_disk.auto_approve_mode);
    }

    #[test]
    fn test_snapshot_is_stable_across_update() {
        let manager = PolicyManager::default();
        let snapshot = manager.snapshot();
        manager
            .update(Policy::default().with_auto_approve(true))
            .unwrap();
        assert!(!snapshot.auto_approve_mode);
        assert!(manager.snapshot().auto_approve_mode);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let manager = PolicyManager::default();
        let policy = Policy {
            max_concurrent_sessions: 0,
            ..Policy::default()
        };
        assert!(manager.update(policy).is_err());
        assert_eq!(manager.snapshot().max_concurrent_sessions, 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let policy: Policy = toml::from_str("autoApproveMode = true\napprovalTimeoutMs = 30000").unwrap();
        assert!(policy.auto_approve_mode);
        assert_eq!(policy.approval_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(policy.command_timeout(), Duration::from_millis(300_000));
        assert!(policy.dangerous_command_blacklist.contains("rm"));
    }
}
