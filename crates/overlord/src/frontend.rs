//! Operator Frontend: translates browser-originated HTTP/WebSocket requests
//! into Registry lookups and Agent Session mailbox commands.

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Form, Json};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use crate::error::Error;
use crate::monitor::MonitorSink;
use crate::registry::{AgentCommand, BrowserContext, Registry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub monitor: MonitorSink,
}

// ─── PTY ─────────────────────────────────────────────────────────

pub async fn pty_handler(
    Path(mid): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_pty(socket, mid, state))
}

async fn handle_pty(socket: WebSocket, mid: String, state: AppState) {
    info!("terminal request for {mid}");
    let Some(handle) = state.registry.lookup_agent(&mid) else {
        close_with_error(socket, Error::AgentNotFound(mid)).await;
        return;
    };

    let sid = park_browser_socket(&state.registry, socket);
    if handle
        .tx
        .send(AgentCommand::SpawnTerminal { cid: sid.clone() })
        .is_err()
    {
        warn!("agent {mid} mailbox closed before spawning terminal {sid}");
        state.registry.remove_pending(&sid);
    }
}

// ─── Logcat (live tail) ──────────────────────────────────────────

#[derive(Deserialize)]
pub struct LogcatQuery {
    filename: Option<String>,
}

pub async fn logcat_handler(
    Path(mid): Path<String>,
    Query(query): Query<LogcatQuery>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logcat(socket, mid, query.filename, state))
}

async fn handle_logcat(socket: WebSocket, mid: String, filename: Option<String>, state: AppState) {
    info!("logcat request for {mid}");
    let Some(handle) = state.registry.lookup_agent(&mid) else {
        close_with_error(socket, Error::AgentNotFound(mid)).await;
        return;
    };
    let Some(filename) = filename else {
        close_with_error(
            socket,
            Error::BadRequest(format!("No filename specified for logcat request {mid}")),
        )
        .await;
        return;
    };

    let sid = park_browser_socket(&state.registry, socket);
    if handle
        .tx
        .send(AgentCommand::SpawnLogcat {
            cid: sid.clone(),
            filename,
        })
        .is_err()
    {
        warn!("agent {mid} mailbox closed before spawning logcat {sid}");
        state.registry.remove_pending(&sid);
    }
}

// ─── Simple-logcat subscribe ─────────────────────────────────────

pub async fn slog_handler(
    Path((mid, cid)): Path<(String, String)>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_slog(socket, mid, cid, state))
}

async fn handle_slog(socket: WebSocket, mid: String, cid: String, state: AppState) {
    info!("simple-logcat subscribe for {mid}/{cid}");
    let Some(handle) = state.registry.lookup_slogcat(&mid, &cid) else {
        close_with_error(socket, Error::ClientNotFound(cid)).await;
        return;
    };

    if handle
        .attached
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        close_with_error(socket, Error::BadRequest(format!("stream {cid} already attached"))).await;
        return;
    }

    if let Err(err) = handle.tx.send(AgentCommand::ConnectLogcat { stream: socket }) {
        let AgentCommand::ConnectLogcat { stream } = err.0 else {
            unreachable!("SendError must carry back the exact value we sent")
        };
        close_with_error(stream, Error::ProtocolError(format!("agent session for {mid} is gone"))).await;
    }
}

// ─── Shell ───────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct ShellParams {
    command: Option<String>,
}

#[derive(Serialize)]
pub struct ShellResponse {
    pub error: String,
    pub output: String,
}

pub async fn shell_get(
    Path(mid): Path<String>,
    Query(query): Query<ShellParams>,
    State(state): State<AppState>,
) -> Json<ShellResponse> {
    run_shell(state, mid, query.command.unwrap_or_default()).await
}

pub async fn shell_post(
    Path(mid): Path<String>,
    Query(query): Query<ShellParams>,
    State(state): State<AppState>,
    Form(form): Form<ShellParams>,
) -> Json<ShellResponse> {
    let command = form.command.or(query.command).unwrap_or_default();
    run_shell(state, mid, command).await
}

async fn run_shell(state: AppState, mid: String, command: String) -> Json<ShellResponse> {
    info!("shell request for {mid}: {command}");
    let Some(handle) = state.registry.lookup_agent(&mid) else {
        return shell_error(Error::AgentNotFound(mid));
    };

    let (tx, rx) = oneshot::channel();
    if handle
        .tx
        .send(AgentCommand::Shell {
            command,
            reply: tx,
        })
        .is_err()
    {
        return shell_error(Error::ProtocolError(format!("agent {mid} is gone")));
    }

    match rx.await {
        Ok(bytes) => Json(ShellResponse {
            error: String::new(),
            output: String::from_utf8_lossy(&bytes).into_owned(),
        }),
        Err(_) => shell_error(Error::ProtocolError(format!(
            "agent {mid} closed without replying"
        ))),
    }
}

fn shell_error(err: Error) -> Json<ShellResponse> {
    Json(ShellResponse {
        error: err.to_string(),
        output: String::new(),
    })
}

// ─── Listing ─────────────────────────────────────────────────────

pub async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot_agents())
}

pub async fn list_slogcats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot_slogcats())
}

// ─── Monitor feed ────────────────────────────────────────────────

pub async fn monitor_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_monitor(socket, state.monitor.subscribe()))
}

async fn handle_monitor(socket: WebSocket, mut events: broadcast::Receiver<crate::monitor::MonitorMessage>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let text = serde_json::to_string(&event).unwrap_or_default();
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

async fn close_with_error(mut socket: WebSocket, err: Error) {
    warn!("{err}");
    let _ = socket.send(err.close_message()).await;
}

/// Parks an upgraded operator socket in the registry to await the agent's
/// matching `Spawn*` command, and spawns a task that reaps the pending
/// entry if the operator disconnects first.
fn park_browser_socket(registry: &Registry, socket: WebSocket) -> String {
    let (claim_tx, claim_rx) = oneshot::channel();
    let sid = registry.add_browser_context(BrowserContext::new(claim_tx));
    tokio::spawn(watch_pending_socket(
        registry.clone(),
        sid.clone(),
        socket,
        claim_rx,
    ));
    sid
}

/// Owns a parked operator socket for as long as it sits in `pending`: reads
/// it just to notice a close, and hands it back over `claim` the moment the
/// matching agent registration asks for it.
async fn watch_pending_socket(
    registry: Registry,
    sid: String,
    mut socket: WebSocket,
    mut claim: oneshot::Receiver<oneshot::Sender<WebSocket>>,
) {
    loop {
        tokio::select! {
            reply = &mut claim => {
                if let Ok(reply) = reply {
                    let _ = reply.send(socket);
                }
                return;
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        warn!("operator socket for pending context {sid} closed before the agent claimed it");
                        registry.remove_pending(&sid);
                        return;
                    }
                    _ => continue,
                }
            }
        }
    }
}
