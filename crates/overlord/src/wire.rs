//! Async length-prefixed framing on top of [`overlord_protocol`]'s
//! synchronous bincode encode/decode.
//!
//! The wire format is `[u32 big-endian length][bincode payload]`, read and
//! written directly on the split halves of the agent's TCP socket.

use overlord_protocol::{decode_frame, decode_hello, encode_frame, encode_hello, Frame, Hello, MAX_FRAME_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn to_io_err(e: bincode::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

async fn read_length_prefixed<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds MAX_FRAME_LEN",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Reads the mode handshake. EOF before any bytes arrive is reported as an
/// error since the handshake is mandatory.
pub async fn read_hello<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Hello> {
    let payload = read_length_prefixed(r).await?.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before handshake",
        )
    })?;
    decode_hello(&payload).map_err(to_io_err)
}

/// Reads the next frame, or `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Option<Frame>> {
    match read_length_prefixed(r).await? {
        Some(payload) => decode_frame(&payload).map(Some).map_err(to_io_err),
        None => Ok(None),
    }
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let buf = encode_frame(frame).map_err(to_io_err)?;
    w.write_all(&buf).await
}

/// Writes a `Hello` handshake. Used by tests exercising both ends of the
/// framing; the hub itself only ever reads one.
pub async fn write_hello<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    hello: &Hello,
) -> std::io::Result<()> {
    let buf = encode_hello(hello).map_err(to_io_err)?;
    w.write_all(&buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_protocol::Mode;

    #[tokio::test]
    async fn hello_then_frames_round_trip_over_a_duplex_stream() {
        let (mut client, mut hub) = tokio::io::duplex(4096);

        write_hello(
            &mut client,
            &Hello {
                mode: Mode::Agent,
                mid: "host-07".into(),
                cid: String::new(),
            },
        )
        .await
        .unwrap();
        let hello = read_hello(&mut hub).await.unwrap();
        assert_eq!(hello.mid, "host-07");

        write_frame(&mut client, &Frame::Data(vec![1, 2, 3]))
            .await
            .unwrap();
        match read_frame(&mut hub).await.unwrap() {
            Some(Frame::Data(bytes)) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected frame: {other:?}"),
        }

        drop(client);
        assert!(read_frame(&mut hub).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_without_allocating() {
        let (mut client, mut hub) = tokio::io::duplex(16);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut hub).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
