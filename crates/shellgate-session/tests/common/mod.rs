#![allow(dead_code)]

use shellgate_policy::{Policy, PolicyManager};
use shellgate_session::{RegistryConfig, Session, SessionEvent, SessionRegistry};
use shellgate_terminal::{MockBackend, MockOptions, WorkspaceAllocator};
use shellgate_types::{Command, CommandId, CommandState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

/// Registry over a mock backend with workspaces in a temp directory
pub struct TestFixtures {
    pub temp_dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub policy: PolicyManager,
    pub registry: Arc<SessionRegistry>,
}

impl TestFixtures {
    pub fn new() -> Self {
        Self::with(test_policy, RegistryConfig::default(), MockOptions::default())
    }

    pub fn with(
        tweak_policy: impl FnOnce(&mut Policy),
        config: RegistryConfig,
        options: MockOptions,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut policy = Policy::default();
        policy
            .allowed_workspace_roots
            .insert(temp_dir.path().to_path_buf());
        tweak_policy(&mut policy);
        let policy = PolicyManager::new(policy);

        let backend = Arc::new(MockBackend::with_options(options));
        let registry = SessionRegistry::new(
            backend.clone(),
            policy.clone(),
            WorkspaceAllocator::new(temp_dir.path()),
            config,
        );
        Self {
            temp_dir,
            backend,
            policy,
            registry,
        }
    }

    pub async fn session(&self) -> Arc<Session> {
        let session = self
            .registry
            .create(Default::default())
            .await
            .expect("Failed to create session");
        wait_until("shell ready", || ready(&session)).await;
        session
    }
}

/// Auto-approve with the mock shell's programs whitelisted
pub fn test_policy(policy: &mut Policy) {
    policy.auto_approve_mode = true;
    for program in ["sleep", "hang", "fail", "ask", "login", "true", "false"] {
        policy.safe_command_whitelist.insert(program.to_string());
    }
}

/// The shell has printed its first prompt
fn ready(session: &Session) -> bool {
    session.summary().active && session.output_since(0).iter().any(|c| c.data.contains("$ "))
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a command to reach `state`
pub async fn wait_for_state(session: &Session, id: CommandId, state: CommandState) -> Command {
    wait_until(&format!("command to become {}", state), || {
        session.command(id).map(|c| c.state()) == Some(state)
    })
    .await;
    session.command(id).expect("command exists")
}

/// Wait for a command to reach any terminal state
pub async fn wait_settled(session: &Session, id: CommandId) -> Command {
    wait_until("command to settle", || {
        session.command(id).map_or(false, |c| c.state().is_terminal())
    })
    .await;
    session.command(id).expect("command exists")
}

pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for event")
}

/// Everything the session has printed so far, as one string
pub fn screen(session: &Session) -> String {
    session
        .output_since(0)
        .into_iter()
        .map(|chunk| chunk.data)
        .collect()
}
