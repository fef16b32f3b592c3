//! Control-frame I/O over async byte streams
//!
//! Frames are read with `read_exact` directly on the connection: the header,
//! then exactly the announced payload. Nothing is buffered ahead, so the raw
//! data plane that follows a `Data` message is left untouched on the stream.

use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use chanfs_core::{decode_frame, decode_frame_len, encode_frame, Message, ProtocolError};
use chanfs_core::FRAME_HEADER_LEN;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Send a message on a stream
pub async fn send_message<W>(stream: &mut W, msg: &Message) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let data = encode_frame(msg)?;

    stream.write_all(&data).await.map_err(ConnectionError::Send)?;
    stream.flush().await.map_err(ConnectionError::Send)?;

    trace!("sent {} ({} bytes)", msg.state(), data.len());
    Ok(())
}

/// Receive exactly one message from a stream
pub async fn recv_message<R>(stream: &mut R) -> Result<Message, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    // Read length prefix
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ConnectionError::Closed
        } else {
            ConnectionError::Receive(e)
        }
    })?;

    let len = decode_frame_len(len_buf)?;

    // Read payload
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(ConnectionError::Receive)?;

    let msg = decode_frame(&payload)?;
    trace!("received {} ({} bytes)", msg.state(), len);
    Ok(msg)
}

/// Run `fut` under an optional deadline
pub async fn with_deadline<F, T>(limit: Option<Duration>, fut: F) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, ConnectionError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ConnectionError::Timeout(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanfs_core::{Action, FileInfo, MAX_CONTROL_FRAME};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_roundtrip() {
        let (mut a, mut b) = duplex(4096);
        let msg = Message::start(Action::Download, FileInfo::new("dir/a.txt", 0));

        send_message(&mut a, &msg).await.unwrap();
        assert_eq!(recv_message(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_decoder_leaves_data_plane_unread() {
        let (mut a, mut b) = duplex(4096);

        // Control frame and raw bytes arrive back to back in one write
        let mut wire = encode_frame(&Message::data(FileInfo::new("a.bin", 7))).unwrap();
        wire.extend_from_slice(b"RAWDATA");
        wire.extend_from_slice(&encode_frame(&Message::Eof).unwrap());
        a.write_all(&wire).await.unwrap();
        drop(a);

        let msg = recv_message(&mut b).await.unwrap();
        let Message::Data(data) = msg else {
            panic!("expected Data");
        };

        let mut raw = vec![0u8; data.file_info.size as usize];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, b"RAWDATA");

        assert_eq!(recv_message(&mut b).await.unwrap(), Message::Eof);
    }

    #[tokio::test]
    async fn test_closed_before_header() {
        let (a, mut b) = duplex(64);
        drop(a);
        assert!(matches!(
            recv_message(&mut b).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(b"{\"st").await.unwrap();
        drop(a);
        assert!(matches!(
            recv_message(&mut b).await,
            Err(ConnectionError::Receive(_))
        ));
    }

    #[tokio::test]
    async fn test_oversize_header_rejected_without_reading_payload() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&((MAX_CONTROL_FRAME as u32) + 1).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            recv_message(&mut b).await,
            Err(ConnectionError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&3u32.to_le_bytes()).await.unwrap();
        a.write_all(b"{x}").await.unwrap();
        assert!(matches!(
            recv_message(&mut b).await,
            Err(ConnectionError::Protocol(ProtocolError::Deserialization(_)))
        ));
    }

    #[tokio::test]
    async fn test_deadline() {
        let (_a, mut b) = duplex(64);
        let result = with_deadline(
            Some(Duration::from_millis(20)),
            recv_message(&mut b),
        )
        .await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    }
}
