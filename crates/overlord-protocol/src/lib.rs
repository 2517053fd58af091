//! Wire types for the Overlord agent plane.
//!
//! This crate defines the handful of control messages and the opaque-byte
//! envelope the hub exchanges with a ghost-agent endpoint over its raw TCP
//! socket. The endpoint's own protocol (how it decides to open a PTY, tail a
//! file, or run a shell command) is out of scope here; this crate only
//! carries the messages the hub needs to drive that protocol and the bytes
//! that flow once a session is spliced.
//!
//! Frames are length-prefixed, bincode-encoded values. Encoding/decoding is
//! synchronous and allocation-based; the async read/write loop that puts
//! frames on the wire lives in the `overlord` crate so this crate has no
//! I/O dependency.

use serde::{Deserialize, Serialize};

/// The four roles a TCP connection from an endpoint can declare itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Long-lived control connection; one per endpoint.
    Agent,
    /// Spliced to a PTY request from the operator plane.
    Terminal,
    /// Spliced to a single log-tail request from the operator plane.
    Logcat,
    /// A standing log producer, subscribed to on demand by operators.
    Slogcat,
}

impl Mode {
    /// Short label used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Agent => "agent",
            Mode::Terminal => "terminal",
            Mode::Logcat => "logcat",
            Mode::Slogcat => "slogcat",
        }
    }
}

/// The handshake an endpoint sends immediately after connecting, declaring
/// which mode it registers as and which identifiers it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub mode: Mode,
    /// Machine ID. Populated for AGENT and SLOGCAT, empty otherwise.
    pub mid: String,
    /// Client ID. Empty for pure AGENT sessions.
    pub cid: String,
}

/// Frames exchanged over an agent-plane TCP socket after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Hub → endpoint: open a new sub-session carrying `cid` and register it
    /// as TERMINAL.
    SpawnTerminal { cid: String },
    /// Hub → endpoint: open a new sub-session carrying `cid` and register it
    /// as LOGCAT, tailing `filename`.
    SpawnLogcat { cid: String, filename: String },
    /// Hub → endpoint (AGENT mode only): run `command` and reply once with a
    /// `ShellResult`.
    Shell { command: String },
    /// Endpoint → hub: the completed output of a prior `Shell` frame.
    ShellResult { output: Vec<u8> },
    /// Either direction, TERMINAL/LOGCAT/SLOGCAT only: opaque splice payload.
    Data(Vec<u8>),
    /// Either direction: graceful end of this sub-session.
    Close,
}

/// Frames larger than this are rejected rather than allocated for.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encodes a `Hello` handshake as a length-prefixed buffer.
pub fn encode_hello(hello: &Hello) -> Result<Vec<u8>, bincode::Error> {
    encode_framed(hello)
}

/// Decodes a `Hello` handshake from its payload bytes (length prefix already
/// stripped by the caller's framed reader).
pub fn decode_hello(payload: &[u8]) -> Result<Hello, bincode::Error> {
    bincode::deserialize(payload)
}

/// Encodes a `Frame` as a length-prefixed buffer.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    encode_framed(frame)
}

/// Decodes a `Frame` from its payload bytes (length prefix already stripped).
pub fn decode_frame(payload: &[u8]) -> Result<Frame, bincode::Error> {
    bincode::deserialize(payload)
}

fn encode_framed<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(value)?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let hello = Hello {
            mode: Mode::Agent,
            mid: "host-01".into(),
            cid: String::new(),
        };
        let encoded = encode_hello(&hello).unwrap();
        let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        let decoded = decode_hello(&encoded[4..4 + len]).unwrap();
        assert_eq!(decoded.mid, "host-01");
        assert_eq!(decoded.mode, Mode::Agent);
    }

    #[test]
    fn frame_carries_opaque_bytes_unchanged() {
        let frame = Frame::Data(vec![0, 1, 2, 255, 254]);
        let encoded = encode_frame(&frame).unwrap();
        let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        match decode_frame(&encoded[4..4 + len]).unwrap() {
            Frame::Data(bytes) => assert_eq!(bytes, vec![0, 1, 2, 255, 254]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn shell_result_round_trips() {
        let frame = Frame::ShellResult {
            output: b"hi\n".to_vec(),
        };
        let encoded = encode_frame(&frame).unwrap();
        let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        match decode_frame(&encoded[4..4 + len]).unwrap() {
            Frame::ShellResult { output } => assert_eq!(output, b"hi\n"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
