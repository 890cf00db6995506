use anyhow::{Context, Result};
use shellgate_policy::PolicyManager;
use shellgate_session::SessionRegistry;
use shellgate_terminal::{create_backend, WorkspaceAllocator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::ShellgateConfig;
use crate::web::{WebServer, WebServerConfig};

/// The configured policy, or the standalone policy file when one is given
pub fn policy_manager(config: &ShellgateConfig, policy_file: Option<&Path>) -> Result<PolicyManager> {
    match policy_file {
        Some(path) => PolicyManager::from_file(path)
            .with_context(|| format!("failed to load policy from {}", path.display())),
        None => Ok(PolicyManager::new(config.policy.clone())),
    }
}

/// Run the web server
pub async fn run_web_server(config: ShellgateConfig, policy: PolicyManager) -> Result<()> {
    let addr = config.bind_addr()?;
    let workspace_root = &config.registry.workspace_root;
    std::fs::create_dir_all(workspace_root)
        .with_context(|| format!("failed to create workspace root {}", workspace_root.display()))?;

    let backend = create_backend(&config.backend_settings())
        .await
        .context("failed to initialize execution backend")?;

    let registry = SessionRegistry::new(
        backend,
        policy.clone(),
        WorkspaceAllocator::new(workspace_root),
        config.registry_config(),
    );
    registry.start_background();

    let snapshot = policy.snapshot();
    info!(
        %addr,
        backend = ?config.backend.kind,
        workspace_root = %workspace_root.display(),
        auto_approve = snapshot.auto_approve_mode,
        max_sessions = snapshot.max_concurrent_sessions,
        "starting shellgate"
    );

    let server = WebServer::new(
        WebServerConfig {
            bind_addr: addr,
            static_dir: config.server.static_dir.clone(),
            max_connections: config.rate_limit.max_connections,
            cooldown: Duration::from_millis(config.rate_limit.cooldown_ms),
        },
        Arc::clone(&registry),
    );
    server.start().await?;

    // Sessions are already gone after a signal; this covers server errors
    registry.shutdown_all().await;
    info!("shellgate stopped");
    Ok(())
}
