use parking_lot::Mutex;
use serde::Deserialize;
use shellgate_policy::PolicyManager;
use shellgate_terminal::{BackendSpec, ExecutionBackend, KillOutcome, WorkspaceAllocator};
use shellgate_types::{
    new_session_id, ConnectionId, GateError, ResourceLimits, SessionId, SessionSummary,
    DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_SCROLLBACK_BYTES,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::session::{Session, SessionOptions, Termination};

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a backend gets to exit before it is forced
    pub kill_grace: Duration,
    /// How long a detached session waits for its client to come back
    pub reconnect_grace: Duration,
    pub sweep_interval: Duration,
    pub scrollback_bytes: usize,
    /// Delete workspace directories when their session is destroyed
    pub cleanup_workspaces: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            reconnect_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            cleanup_workspaces: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Reusing an identifier returns the existing session
    pub session_id: Option<SessionId>,
    pub shell: Option<String>,
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub limits: Option<ResourceLimits>,
}

/// What one sweep cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions destroyed for being terminated or abandoned
    pub sessions: usize,
    /// Backend instances killed because no session owned them
    pub orphans: usize,
}

type Slot = Arc<OnceCell<Arc<Session>>>;

/// Maps session identifiers to live sessions and owns their lifecycle.
///
/// An entry is inserted before its backend is started, so a backend can
/// never be observed by the orphan sweep without its entry.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Slot>,
    /// Sessions holding a capacity slot, including ones still starting
    live: AtomicUsize,
    backend: Arc<dyn ExecutionBackend>,
    policy: PolicyManager,
    allocator: WorkspaceAllocator,
    config: RegistryConfig,
    terminations: mpsc::UnboundedSender<Termination>,
    pending_terminations: Mutex<Option<mpsc::UnboundedReceiver<Termination>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        policy: PolicyManager,
        allocator: WorkspaceAllocator,
        config: RegistryConfig,
    ) -> Arc<Self> {
        let (terminations, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sessions: DashMap::new(),
            live: AtomicUsize::new(0),
            backend,
            policy,
            allocator,
            config,
            terminations,
            pending_terminations: Mutex::new(Some(receiver)),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the termination reaper and the periodic orphan sweep
    pub fn start_background(self: &Arc<Self>) {
        let mut background = self.background.lock();
        if let Some(receiver) = self.pending_terminations.lock().take() {
            background.push(tokio::spawn(reap_terminations(Arc::downgrade(self), receiver)));
        }
        background.push(tokio::spawn(sweep_periodically(
            Arc::downgrade(self),
            self.config.sweep_interval,
        )));
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn policy(&self) -> &PolicyManager {
        &self.policy
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Sessions currently holding a capacity slot
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Create a session, or return the existing one for a known identifier.
    ///
    /// Creation is all-or-nothing: on failure no entry, backend or slot is
    /// left behind.
    pub async fn create(&self, request: CreateSessionRequest) -> Result<Arc<Session>, GateError> {
        let id = request.session_id.clone().unwrap_or_else(new_session_id);
        let slot: Slot = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut fresh = false;
        let result = slot
            .get_or_try_init(|| {
                fresh = true;
                self.build(id.clone(), request)
            })
            .await
            .cloned();

        match result {
            Ok(session) if !fresh => {
                debug!(session_id = %id, "returning existing session");
                Ok(session)
            }
            Ok(session) => {
                if !self.holds(&id, &slot) {
                    // Destroyed while it was starting
                    self.retire(&session, "session destroyed during creation").await;
                    return Err(GateError::SessionTerminated(id));
                }
                info!(session_id = %id, workspace = %session.workspace().display(), "session created");
                Ok(session)
            }
            Err(e) => {
                self.sessions
                    .remove_if(&id, |_, existing| Arc::ptr_eq(existing, &slot) && existing.get().is_none());
                warn!(session_id = %id, error = %e, "session creation failed");
                Err(e)
            }
        }
    }

    fn holds(&self, id: &str, slot: &Slot) -> bool {
        self.sessions
            .get(id)
            .map_or(false, |entry| Arc::ptr_eq(entry.value(), slot))
    }

    fn reserve_slot(&self, limit: usize) -> Result<(), GateError> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < limit).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|_| GateError::ResourceLimitExceeded { limit })
    }

    fn release_slot(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| live.checked_sub(1));
    }

    async fn build(&self, id: SessionId, request: CreateSessionRequest) -> Result<Arc<Session>, GateError> {
        let policy = self.policy.snapshot();
        self.reserve_slot(policy.max_concurrent_sessions)?;
        let result = self.launch(id, request, &policy.allowed_workspace_roots).await;
        if result.is_err() {
            self.release_slot();
        }
        result
    }

    async fn launch(
        &self,
        id: SessionId,
        request: CreateSessionRequest,
        allowed: &std::collections::BTreeSet<PathBuf>,
    ) -> Result<Arc<Session>, GateError> {
        let workspace = self
            .allocator
            .allocate(allowed, &id, request.working_directory.as_deref())?;
        let limits = request.limits.unwrap_or_default();

        let mut spec = BackendSpec::new(id.clone(), workspace.clone());
        spec.limits = limits.clone();
        spec.shell = request.shell;
        spec.environment = request.environment;
        spec.cols = request.cols.unwrap_or(DEFAULT_COLS);
        spec.rows = request.rows.unwrap_or(DEFAULT_ROWS);

        let started = self.backend.start(spec).await.map_err(|e| match e {
            GateError::BackendCreateFailed(_) => e,
            other => GateError::BackendCreateFailed(other.to_string()),
        })?;
        let handle = started.handle.clone();

        let options = SessionOptions {
            scrollback_bytes: self.config.scrollback_bytes,
            kill_grace: self.config.kill_grace,
            // The effective shell is the backend's call, not the request's
            prompt_fallback: !started.emits_markers,
        };
        match Session::launch(
            id,
            workspace,
            limits,
            started,
            Arc::clone(&self.backend),
            self.policy.clone(),
            &options,
            self.terminations.clone(),
        ) {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(kill_err) = self.backend.kill(&handle, self.config.kill_grace).await {
                    error!(backend_id = %handle.id, error = %kill_err, "failed to remove backend after setup error");
                }
                Err(GateError::BackendCreateFailed(e.to_string()))
            }
        }
    }

    /// A started session by identifier
    pub fn get(&self, id: &str) -> Result<Arc<Session>, GateError> {
        self.sessions
            .get(id)
            .and_then(|entry| entry.value().get().cloned())
            .ok_or_else(|| GateError::SessionNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .started()
            .iter()
            .map(|session| session.summary())
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    fn started(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    /// Bind a connection to a session; returns the session and the
    /// connection it displaced
    pub fn attach(&self, id: &str, connection: ConnectionId) -> Result<(Arc<Session>, Option<ConnectionId>), GateError> {
        let session = self.get(id)?;
        if session.is_terminated() {
            return Err(GateError::SessionTerminated(id.to_string()));
        }
        let previous = session.attach(connection);
        debug!(session_id = %id, %connection, replaced = ?previous, "connection attached");
        Ok((session, previous))
    }

    /// Transport loss: the session stays alive for the reconnect grace
    pub fn detach(&self, id: &str, connection: ConnectionId) {
        if let Ok(session) = self.get(id) {
            if session.detach(connection) {
                debug!(session_id = %id, %connection, "connection detached");
            }
        }
    }

    /// Destroy a session. Unknown or already destroyed sessions are a no-op.
    pub async fn destroy(&self, id: &str) -> Result<(), GateError> {
        self.destroy_with_reason(id, "session destroyed").await
    }

    async fn destroy_with_reason(&self, id: &str, reason: &str) -> Result<(), GateError> {
        let Some((_, slot)) = self.sessions.remove(id) else {
            return Ok(());
        };
        // Still starting: the creator sees its entry gone and cleans up
        if let Some(session) = slot.get() {
            self.retire(session, reason).await;
        }
        Ok(())
    }

    /// Shut a session down and give back what it held, once
    async fn retire(&self, session: &Arc<Session>, reason: &str) {
        let Some(outcome) = session.shutdown(reason).await else {
            return;
        };
        self.release_slot();
        let allowed = self.policy.snapshot().allowed_workspace_roots.clone();
        if let Err(e) = self
            .allocator
            .release(&allowed, session.workspace(), self.config.cleanup_workspaces)
        {
            warn!(session_id = %session.id(), error = %e, "failed to release workspace");
        }
        info!(session_id = %session.id(), ?outcome, reason, "session destroyed");
    }

    /// The backend died on its own
    async fn handle_termination(&self, termination: Termination) {
        let Termination {
            session_id,
            backend_id,
            reason,
        } = termination;
        let removed = self.sessions.remove_if(&session_id, |_, slot| {
            slot.get().map_or(false, |s| s.handle().id == backend_id)
        });
        if let Some((_, slot)) = removed {
            if let Some(session) = slot.get() {
                warn!(session_id = %session_id, reason = %reason, "session terminated by backend");
                self.retire(session, &reason).await;
            }
        }
    }

    /// Destroy abandoned and dead sessions, then kill backend instances
    /// that no session owns
    pub async fn sweep_orphans(&self) -> Result<SweepReport, GateError> {
        let mut report = SweepReport::default();

        for session in self.started() {
            let reason = if session.is_terminated() {
                Some("session terminated")
            } else if session
                .detached_for()
                .map_or(false, |idle| idle >= self.config.reconnect_grace)
            {
                Some("reconnect grace expired")
            } else {
                None
            };
            if let Some(reason) = reason {
                let removed = self.sessions.remove_if(session.id(), |_, slot| {
                    slot.get().map_or(false, |s| Arc::ptr_eq(s, &session))
                });
                if removed.is_some() {
                    self.retire(&session, reason).await;
                    report.sessions += 1;
                }
            }
        }

        let instances = self.backend.list_instances().await?;
        // Read the map after listing: any listed instance already has its
        // entry if it belongs to a session
        let mut owned = HashSet::new();
        let mut starting = HashSet::new();
        for entry in self.sessions.iter() {
            match entry.value().get() {
                Some(session) => {
                    owned.insert(session.handle().id.clone());
                }
                None => {
                    starting.insert(entry.key().clone());
                }
            }
        }

        for instance in instances {
            if owned.contains(&instance.id) {
                continue;
            }
            if instance
                .session_id
                .as_ref()
                .map_or(false, |id| starting.contains(id))
            {
                continue;
            }
            warn!(backend_id = %instance.id, session_id = ?instance.session_id, "removing orphaned backend");
            let grace = self.config.kill_grace;
            match tokio::time::timeout(grace * 2, self.backend.kill(&instance.handle(), grace)).await {
                Ok(Ok(KillOutcome::AlreadyGone)) => {}
                Ok(Ok(_)) => report.orphans += 1,
                Ok(Err(e)) => error!(backend_id = %instance.id, error = %e, "failed to remove orphan"),
                Err(_) => error!(backend_id = %instance.id, "timed out removing orphan"),
            }
        }

        if report != SweepReport::default() {
            info!(sessions = report.sessions, orphans = report.orphans, "sweep finished");
        }
        Ok(report)
    }

    /// Destroy every session, concurrently
    pub async fn shutdown_all(self: &Arc<Self>) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(count = ids.len(), "destroying all sessions");

        let mut teardown = JoinSet::new();
        for id in ids {
            let registry = Arc::clone(self);
            teardown.spawn(async move {
                let _ = registry.destroy_with_reason(&id, "server shutting down").await;
            });
        }
        while teardown.join_next().await.is_some() {}
    }
}

async fn reap_terminations(registry: Weak<SessionRegistry>, mut receiver: mpsc::UnboundedReceiver<Termination>) {
    while let Some(termination) = receiver.recv().await {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        registry.handle_termination(termination).await;
    }
}

async fn sweep_periodically(registry: Weak<SessionRegistry>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        if let Err(e) = registry.sweep_orphans().await {
            warn!(error = %e, "orphan sweep failed");
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("live", &self.live_count())
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}
