#![allow(dead_code)]

use axum::{body::Body, http::Request, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use shellgate::web::{WebServer, WebServerConfig};
use shellgate_policy::{Policy, PolicyManager};
use shellgate_session::{RegistryConfig, SessionRegistry};
use shellgate_terminal::{MockBackend, WorkspaceAllocator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Full server over a mock backend, listening on an ephemeral port
pub struct TestServer {
    pub temp_dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub registry: Arc<SessionRegistry>,
    pub addr: SocketAddr,
    router: Router,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_rate_limit(10).await
    }

    pub async fn with_rate_limit(max_connections: u32) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut policy = Policy::default();
        policy.auto_approve_mode = true;
        policy
            .allowed_workspace_roots
            .insert(temp_dir.path().to_path_buf());
        for program in ["hang", "crash", "sleep", "true", "false"] {
            policy.safe_command_whitelist.insert(program.to_string());
        }

        let backend = Arc::new(MockBackend::new());
        let registry = SessionRegistry::new(
            backend.clone(),
            PolicyManager::new(policy),
            WorkspaceAllocator::new(temp_dir.path()),
            RegistryConfig::default(),
        );
        registry.start_background();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("listener has an address");
        let config = WebServerConfig {
            bind_addr: addr,
            static_dir: None,
            max_connections,
            cooldown: Duration::from_secs(60),
        };
        let router = WebServer::new(config.clone(), registry.clone()).router();
        let server = WebServer::new(config, registry.clone());

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_on(listener, async move {
            let _ = signal.await;
        }));

        Self {
            temp_dir,
            backend,
            registry,
            addr,
            router,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub async fn connect(&self, query: &str) -> WsClient {
        let url = format!("ws://{}/ws{}", self.addr, query);
        let (socket, _) = connect_async(url).await.expect("Failed to connect");
        socket
    }

    /// One HTTP request through the router, returning status and JSON body
    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (u16, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("valid request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = tokio::time::timeout(WAIT, &mut self.task).await;
    }
}

pub async fn send_json(socket: &mut WsClient, message: Value) {
    socket
        .send(Message::Text(message.to_string()))
        .await
        .expect("Failed to send");
}

pub async fn send_text(socket: &mut WsClient, text: &str) {
    socket
        .send(Message::Text(text.to_string()))
        .await
        .expect("Failed to send");
}

/// Next JSON frame; `None` once the server closed the connection
pub async fn next_json(socket: &mut WsClient) -> Option<Value> {
    let frame = tokio::time::timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(&text).expect("server sends JSON"))
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    frame.expect("timed out waiting for a frame")
}

/// Skip frames until one matches
pub async fn wait_for_json(socket: &mut WsClient, mut matches: impl FnMut(&Value) -> bool) -> Value {
    loop {
        match next_json(socket).await {
            Some(message) if matches(&message) => return message,
            Some(_) => continue,
            None => panic!("connection closed while waiting"),
        }
    }
}

pub fn is_type(message: &Value, kind: &str) -> bool {
    message["type"] == kind
}

/// Output text received until `needle` shows up
pub async fn read_output_until(socket: &mut WsClient, needle: &str) -> String {
    let mut screen = String::new();
    while !screen.contains(needle) {
        let message = wait_for_json(socket, |m| is_type(m, "output")).await;
        screen.push_str(message["data"].as_str().unwrap_or_default());
    }
    screen
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
