//! WebSocket stream multiplexer
//!
//! One connection carries one session. A writer task forwards session events
//! in the order the session published them, interleaved with direct replies
//! to this client; the reader applies client frames to the session one at a
//! time, so input reaches the shell in the order it was sent.

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    Sink, SinkExt, StreamExt,
};
use serde::Deserialize;
use shellgate_session::{CreateSessionRequest, Session, SessionEvent};
use shellgate_types::{CommandOrigin, ConnectionId, GateError, OutputChunk, SessionId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::web::protocol::{command_request, ClientMessage, ServerMessage, CLOSE_RATE_LIMITED};
use crate::web::routes::AppState;

/// Normal closure
const CLOSE_NORMAL: u16 = 1000;
/// The session could not be created or attached
const CLOSE_UNAVAILABLE: u16 = 1011;

/// Query parameters of `GET /ws`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Attach to (or create under) this identifier; a fresh session otherwise
    pub session_id: Option<SessionId>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub shell: Option<String>,
    /// Send the retained scrollback before live output
    #[serde(default)]
    pub replay: bool,
}

type WsSink = SplitSink<WebSocket, WsMessage>;

/// GET /ws - WebSocket endpoint
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let admission = state.rate_limiter.check(addr.ip());
    ws.on_upgrade(move |socket| async move {
        match admission {
            Ok(()) => handle_websocket(socket, state, params, addr).await,
            Err(e) => {
                warn!(client = %addr.ip(), error = %e, "connection refused");
                refuse(socket, &e, CLOSE_RATE_LIMITED, "rate limited").await;
            }
        }
    })
}

/// Tell the client why, then close with `code`
async fn refuse(mut socket: WebSocket, err: &GateError, code: u16, reason: &'static str) {
    let _ = send(&mut socket, &ServerMessage::error(err)).await;
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> Result<(), axum::Error>
where
    S: Sink<WsMessage, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(message) {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            warn!(error = %e, "failed to encode server message");
            Ok(())
        }
    }
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState, params: ConnectParams, addr: SocketAddr) {
    let connection: ConnectionId = Uuid::new_v4();
    let existed = params
        .session_id
        .as_deref()
        .map_or(false, |id| state.registry.get(id).is_ok());

    let request = CreateSessionRequest {
        session_id: params.session_id.clone(),
        shell: params.shell.clone(),
        cols: params.cols,
        rows: params.rows,
        ..Default::default()
    };
    let session = match state.registry.create(request).await {
        Ok(session) => session,
        Err(e) => {
            warn!(client = %addr.ip(), error = %e, "failed to open session");
            refuse(socket, &e, CLOSE_UNAVAILABLE, "session unavailable").await;
            return;
        }
    };
    let session = match state.registry.attach(session.id(), connection) {
        Ok((session, previous)) => {
            if let Some(previous) = previous {
                debug!(session_id = %session.id(), %previous, "replacing previous connection");
            }
            session
        }
        Err(e) => {
            refuse(socket, &e, CLOSE_UNAVAILABLE, "session unavailable").await;
            return;
        }
    };
    info!(
        session_id = %session.id(),
        client = %addr.ip(),
        %connection,
        reattached = existed,
        "client connected"
    );

    let (mut sink, stream) = socket.split();

    let connected = ServerMessage::Connected {
        session_id: session.id().to_string(),
        workspace: session.workspace().display().to_string(),
    };
    if send(&mut sink, &connected).await.is_err() {
        state.registry.detach(session.id(), connection);
        return;
    }
    if existed {
        if let (Some(cols), Some(rows)) = (params.cols, params.rows) {
            if let Err(e) = session.resize(cols, rows).await {
                let _ = send(&mut sink, &ServerMessage::error(e)).await;
            }
        }
    }

    // Without replay, output starts from now
    let cursor = session.output_cursor();
    let (history, events) = session.subscribe(params.replay);
    let cursor = history.last().map_or(cursor, |chunk| chunk.seq);
    for chunk in history {
        if send(&mut sink, &output_message(chunk)).await.is_err() {
            state.registry.detach(session.id(), connection);
            return;
        }
    }

    let (reply_tx, reply_rx) = mpsc::channel::<ServerMessage>(64);
    let writer = tokio::spawn(forward_events(
        Arc::clone(&session),
        sink,
        events,
        reply_rx,
        cursor,
    ));

    read_client_frames(stream, &session, &reply_tx).await;

    state.registry.detach(session.id(), connection);
    writer.abort();
    info!(session_id = %session.id(), %connection, "client disconnected");
}

fn output_message(chunk: OutputChunk) -> ServerMessage {
    ServerMessage::Output {
        data: chunk.data,
        seq: chunk.seq,
    }
}

/// Writer: session events and direct replies, in order, until either side ends
async fn forward_events(
    session: Arc<Session>,
    mut sink: WsSink,
    mut events: broadcast::Receiver<SessionEvent>,
    mut replies: mpsc::Receiver<ServerMessage>,
    mut last_seq: u64,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Output(chunk)) => {
                    if chunk.seq <= last_seq {
                        continue;
                    }
                    last_seq = chunk.seq;
                    if send(&mut sink, &output_message(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(SessionEvent::Terminated { reason }) => {
                    let _ = send(&mut sink, &ServerMessage::SessionTerminated { reason }).await;
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: "session terminated".into(),
                        })))
                        .await;
                    break;
                }
                Ok(event) => {
                    if send(&mut sink, &event.into()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Output is recoverable from the scrollback; other events are lost
                    warn!(session_id = %session.id(), skipped, "client fell behind, resyncing output");
                    for chunk in session.output_since(last_seq) {
                        last_seq = chunk.seq;
                        if send(&mut sink, &output_message(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            reply = replies.recv() => match reply {
                Some(message) => {
                    if send(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Reader: apply client frames to the session in arrival order
async fn read_client_frames(
    mut stream: SplitStream<WebSocket>,
    session: &Arc<Session>,
    replies: &mpsc::Sender<ServerMessage>,
) {
    while let Some(Ok(frame)) = stream.next().await {
        let result = match frame {
            WsMessage::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => handle_client_message(message, session, replies).await,
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "ignoring malformed client message");
                    Ok(())
                }
            },
            WsMessage::Binary(data) => session.input(data).await,
            WsMessage::Close(_) => break,
            _ => Ok(()),
        };
        if let Err(e) = result {
            if replies.send(ServerMessage::error(&e)).await.is_err() {
                break;
            }
        }
    }
}

/// Handle a message from a client
async fn handle_client_message(
    message: ClientMessage,
    session: &Arc<Session>,
    replies: &mpsc::Sender<ServerMessage>,
) -> Result<(), GateError> {
    match message {
        ClientMessage::Input { data } => session.input(data.into_bytes()).await,
        ClientMessage::Resize { cols, rows } => session.resize(cols, rows).await,
        ClientMessage::Clear => {
            let _ = replies.send(ServerMessage::Clear).await;
            Ok(())
        }
        message @ ClientMessage::Command { .. } => {
            let Some(request) = command_request(message) else {
                return Ok(());
            };
            session.submit(request, CommandOrigin::Agent).await.map(|_| ())
        }
        ClientMessage::Approve { command_id } => session.confirm(command_id),
        ClientMessage::Deny { command_id, reason } => session.deny(command_id, reason),
        ClientMessage::Kill { command_id } => session.kill_command(command_id).await.map(|_| ()),
    }
}
