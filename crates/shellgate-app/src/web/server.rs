use anyhow::{Context, Result};
use axum::Router;
use shellgate_session::SessionRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::web::{rate_limit::ConnectionRateLimiter, routes};

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    pub bind_addr: SocketAddr,
    pub static_dir: Option<PathBuf>,
    pub max_connections: u32,
    pub cooldown: Duration,
}

/// Web server instance
pub struct WebServer {
    config: WebServerConfig,
    registry: Arc<SessionRegistry>,
    rate_limiter: Arc<ConnectionRateLimiter>,
}

impl WebServer {
    /// Create a new web server
    pub fn new(config: WebServerConfig, registry: Arc<SessionRegistry>) -> Self {
        let rate_limiter = Arc::new(ConnectionRateLimiter::new(
            config.max_connections,
            config.cooldown,
        ));
        Self {
            config,
            registry,
            rate_limiter,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<ConnectionRateLimiter> {
        &self.rate_limiter
    }

    /// Routes plus CORS, request tracing and the optional static client
    pub fn router(&self) -> Router {
        let app_state = routes::AppState {
            registry: Arc::clone(&self.registry),
            rate_limiter: Arc::clone(&self.rate_limiter),
        };
        let mut app = routes::create_router(app_state);

        if let Some(ref static_dir) = self.config.static_dir {
            if static_dir.exists() {
                info!(dir = %static_dir.display(), "serving static files");
                app = app.nest_service("/static", ServeDir::new(static_dir));
            } else {
                warn!(dir = %static_dir.display(), "static directory does not exist");
            }
        }

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        app.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind_addr))?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    /// Every session is destroyed before open connections are drained.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, "web server listening");
        info!("WebSocket endpoint: ws://{}/ws?sessionId=<id>", addr);

        let pruner = tokio::spawn(prune_periodically(
            Arc::clone(&self.rate_limiter),
            self.registry.config().sweep_interval,
        ));

        let app = self.router();
        let registry = Arc::clone(&self.registry);
        let drain = async move {
            shutdown.await;
            info!("shutting down, destroying all sessions");
            registry.shutdown_all().await;
        };

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(drain)
        .await;

        pruner.abort();
        served.context("web server failed")
    }
}

/// Forget clients whose connection count has drained
async fn prune_periodically(limiter: Arc<ConnectionRateLimiter>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let pruned = limiter.prune();
        if pruned > 0 {
            debug!(pruned, "pruned rate limiter entries");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
