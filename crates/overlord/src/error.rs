//! Error kinds for the registry and the operator frontend.
//!
//! Every kind a caller can observe is listed here, and
//! translation to wire-level responses (WebSocket close frame, or legacy
//! 200-status JSON body) happens at the frontend boundary, never inside the
//! registry itself.

use axum::extract::ws::{close_code, CloseFrame, Message};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate machine ID: {0}")]
    DuplicateAgent(String),

    #[error("duplicate client ID: {0}")]
    DuplicateSlogcatClient(String),

    #[error("client {0} registered without context")]
    NoContext(String),

    #[error("No client with mid {0}")]
    AgentNotFound(String),

    #[error("No client with cid {0}")]
    ClientNotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    ProtocolError(String),
}

impl Error {
    /// Builds the WebSocket close message a frontend endpoint sends before
    /// dropping the connection.
    pub fn close_message(&self) -> Message {
        Message::Close(Some(CloseFrame {
            code: close_code::PROTOCOL,
            reason: self.to_string().into(),
        }))
    }
}
