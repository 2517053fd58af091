//! Agent Session: one task per accepted TCP connection from a ghost-agent
//! endpoint.
//!
//! Implements the session state machine:
//!
//! ```text
//! NEW --handshake--> READY(mode, mid, cid?) --Register OK--> LIVE
//!                                            --Register FAIL--> CLOSING
//! LIVE --peer EOF / proto err / Terminate--> CLOSING
//! CLOSING --cleanup done--> TERMINATED (Unregister called exactly once)
//! ```

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use overlord_protocol::{Frame, Mode};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{AgentCommand, AgentHandle, Registered, Registry};
use crate::wire;

/// Accepts the handshake on a freshly connected socket, drives it through
/// registration, and runs its mode-specific body until the connection
/// closes. Unregisters exactly once before returning, but only for a
/// session that actually registered — a rejected duplicate never owned an
/// entry and must not touch one.
pub async fn run(registry: Registry, stream: TcpStream, peer: SocketAddr) {
    let (mut read_half, mut write_half) = stream.into_split();

    let hello = match wire::read_hello(&mut read_half).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!("handshake failed from {peer}: {e}");
            return;
        }
    };

    let mode = hello.mode;
    let mid = hello.mid;
    let cid = hello.cid;
    let id = if matches!(mode, Mode::Agent) { &mid } else { &cid };

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = AgentHandle::new(cid.clone(), tx);

    match registry.register(mode, &mid, &cid, handle).await {
        Ok(Registered::Joined) => {
            info!("{} {} registered ({peer})", mode.as_str(), id);
            match mode {
                Mode::Agent => run_agent(read_half, write_half, rx).await,
                Mode::Slogcat => run_slogcat(read_half, write_half, rx).await,
                Mode::Terminal | Mode::Logcat => {
                    warn!("{} registered Joined instead of Paired; closing", mode.as_str());
                }
            }
        }
        Ok(Registered::Paired(ws)) => {
            info!("{} {} paired ({peer})", mode.as_str(), id);
            splice(read_half, write_half, ws).await;
        }
        Err(e) => {
            // This session never owned an entry, so there is nothing to
            // unregister: calling unregister(mode, mid, cid) here for a
            // rejected duplicate AGENT/SLOGCAT registration would instead
            // evict the incumbent that already holds that key.
            warn!("registration failed for {} {}: {e}", mode.as_str(), id);
            return;
        }
    }

    registry.unregister(mode, &mid, &cid);
    info!("{} {} unregistered", mode.as_str(), id);
}

/// AGENT-mode command loop: relays mailbox commands down the wire and waits
/// for the matching `ShellResult` when a `Shell` command is in flight.
/// Concurrently watches the socket for EOF/protocol errors so an idle
/// connection still notices its peer going away.
async fn run_agent(
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<AgentCommand>,
) {
    loop {
        tokio::select! {
            frame = wire::read_frame(&mut read_half) => {
                match frame {
                    Ok(Some(Frame::Close)) | Ok(None) => break,
                    Ok(Some(_)) => continue, // unsolicited frame outside a Shell round-trip; ignore
                    Err(e) => {
                        debug!("agent read error: {e}");
                        break;
                    }
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(AgentCommand::SpawnTerminal { cid }) => {
                        if wire::write_frame(&mut write_half, &Frame::SpawnTerminal { cid }).await.is_err() {
                            break;
                        }
                    }
                    Some(AgentCommand::SpawnLogcat { cid, filename }) => {
                        if wire::write_frame(&mut write_half, &Frame::SpawnLogcat { cid, filename }).await.is_err() {
                            break;
                        }
                    }
                    Some(AgentCommand::Shell { command, reply }) => {
                        if wire::write_frame(&mut write_half, &Frame::Shell { command }).await.is_err() {
                            let _ = reply.send(Vec::new());
                            break;
                        }
                        if !await_shell_result(&mut read_half, reply).await {
                            break;
                        }
                    }
                    Some(AgentCommand::ConnectLogcat { .. }) => {
                        warn!("ConnectLogcat sent to an AGENT-mode session; ignoring");
                    }
                    Some(AgentCommand::Terminate) | None => break,
                }
            }
        }
    }
}

/// Drains frames until the matching `ShellResult` arrives, forwards its
/// payload to `reply`, and reports whether the connection is still usable.
async fn await_shell_result(
    read_half: &mut OwnedReadHalf,
    reply: tokio::sync::oneshot::Sender<Vec<u8>>,
) -> bool {
    loop {
        match wire::read_frame(read_half).await {
            Ok(Some(Frame::ShellResult { output })) => {
                let _ = reply.send(output);
                return true;
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => {
                let _ = reply.send(Vec::new());
                return false;
            }
        }
    }
}

/// SLOGCAT-mode: wait for the one `ConnectLogcat` attach (the frontend
/// enforces the "only one attach" rule via `AgentHandle::attached` before
/// ever sending this), then splice until either side closes.
async fn run_slogcat(
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<AgentCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            AgentCommand::ConnectLogcat { stream } => {
                splice(read_half, write_half, stream).await;
                return;
            }
            AgentCommand::Terminate => return,
            _ => {}
        }
    }
}

/// Forwards bytes bidirectionally between the agent-plane TCP socket and the
/// operator's WebSocket until either side closes or errors: two concurrent
/// copy loops, `select!` on whichever finishes first.
async fn splice(mut tcp_read: OwnedReadHalf, mut tcp_write: OwnedWriteHalf, ws: WebSocket) {
    let (mut ws_sink, mut ws_stream) = ws.split();

    let tcp_to_ws = async {
        loop {
            match wire::read_frame(&mut tcp_read).await {
                Ok(Some(Frame::Data(bytes))) => {
                    if ws_sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Close)) | Ok(None) => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
                Ok(Some(_)) => continue,
                Err(e) => {
                    debug!("splice tcp read error: {e}");
                    break;
                }
            }
        }
    };

    let ws_to_tcp = async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            match msg {
                Message::Binary(bytes) => {
                    if wire::write_frame(&mut tcp_write, &Frame::Data(bytes.to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Message::Text(text) => {
                    if wire::write_frame(&mut tcp_write, &Frame::Data(text.into_bytes()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Message::Close(_) => {
                    let _ = wire::write_frame(&mut tcp_write, &Frame::Close).await;
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = tcp_to_ws => {}
        _ = ws_to_tcp => {}
    }
}
