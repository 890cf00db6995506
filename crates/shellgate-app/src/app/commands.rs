use anyhow::{Context, Result};
use shellgate_policy::PolicyManager;

use crate::config::ShellgateConfig;

/// `shellgate config`: the effective configuration as TOML
pub fn print_config(config: &ShellgateConfig, policy: &PolicyManager) -> Result<String> {
    let mut effective = config.clone();
    effective.policy = policy.snapshot().as_ref().clone();
    effective.to_toml()
}

/// `shellgate classify`: the verdict for one command line as JSON
pub fn classify(policy: &PolicyManager, command: &str, auto_approve: bool) -> Result<String> {
    let snapshot = policy.snapshot().as_ref().clone();
    let policy = if auto_approve {
        snapshot.with_auto_approve(true)
    } else {
        snapshot
    };
    let verdict = shellgate_policy::classify(command, &policy);
    serde_json::to_string_pretty(&verdict).context("failed to encode classification")
}
