// Execution backends for gated shell sessions
//
// This crate brings up isolated interactive shells (a local PTY or one Docker
// container per session), streams their output, detects command completion
// from the shell's exit markers, and keeps file access inside the session
// workspace.

pub mod backend;
pub mod completion;
mod docker_backend;
#[cfg(any(test, feature = "mock"))]
pub mod mock_backend;
mod pty_backend;
mod pty_handler;
pub mod workspace;

use std::sync::Arc;

// Re-export public API
pub use backend::{
    BackendEvent, BackendHandle, BackendInstance, BackendKind, BackendSpec, BackendTimeouts,
    ExecOutput, ExecutionBackend, KillOutcome, StartedBackend,
};
pub use completion::{CompletionScanner, ScanEvent};
pub use docker_backend::{DockerBackend, DockerConfig};
#[cfg(any(test, feature = "mock"))]
pub use mock_backend::{MockBackend, MockOptions};
pub use pty_backend::{PtyBackend, PtyConfig};
pub use workspace::{WorkspaceAllocator, WorkspaceGuard};

/// Backend selection plus the settings for each kind
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub pty: PtyConfig,
    pub docker: DockerConfig,
    pub timeouts: BackendTimeouts,
}

/// Construct the configured backend
pub async fn create_backend(
    settings: &BackendSettings,
) -> Result<Arc<dyn ExecutionBackend>, shellgate_types::GateError> {
    let backend: Arc<dyn ExecutionBackend> = match settings.kind {
        BackendKind::Pty => Arc::new(PtyBackend::new(settings.pty.clone(), settings.timeouts)),
        BackendKind::Docker => {
            Arc::new(DockerBackend::connect(settings.docker.clone(), settings.timeouts).await?)
        }
    };
    tracing::info!(backend = backend.backend_name(), "execution backend ready");
    Ok(backend)
}
