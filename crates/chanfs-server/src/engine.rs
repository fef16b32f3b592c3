//! Transfer engine - one state machine per connection
//!
//! ```text
//!  client                         server
//!    │ Start{action, fileInfo} ──▶ │  validate path, channel, policy
//!    │ ◀────────────── Data{info}  │
//!    │ ════ raw bytes (size) ════  │  upload: client→server, download: server→client
//!    │ ◀─────────────────── Eof    │
//!    │ Eof ──────────────────────▶ │  (upload only: client acknowledges)
//!    │ ◀──────────────────── Ok    │
//!
//!  any failure: ◀── Error{code, message}, then close
//! ```
//!
//! The engine never panics the task on a bad request: every failure is turned
//! into an `Error` reply (when the wire is in a state to carry one) and the
//! connection is closed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use chanfs_core::{
    Action, Config, ErrorCode, FileInfo, Message, PathError, ProtocolError, RelPath,
    StartPayload, State, DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL,
};

use crate::net::{recv_message, send_message, with_deadline, ConnectionError};
use crate::storage::{Storage, StorageError};
use crate::stream::ChunkSink;

/// Engine settings, taken from [`Config`] at construction
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_channel: String,
    pub buffer_size: usize,
    pub reject_empty_uploads: bool,
    pub io_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_channel: DEFAULT_CHANNEL.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            reject_empty_uploads: true,
            io_timeout: None,
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            default_channel: config.storage.default_channel.clone(),
            buffer_size: config.storage.buffer_size,
            reject_empty_uploads: config.storage.reject_empty_uploads,
            io_timeout: config.server.io_timeout(),
        }
    }
}

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl TransferError {
    /// Wire classification of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::Validation(_) => ErrorCode::Validation,
            TransferError::Path(e) => e.into(),
            TransferError::Storage(e) => e.code(),
            TransferError::Protocol(e) => e.into(),
            TransferError::Connection(ConnectionError::Protocol(e)) => e.into(),
            TransferError::Connection(_) => ErrorCode::Connection,
        }
    }
}

/// Summary of one connection, returned to the dispatcher
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Terminal state (`Ok` or `Error`)
    pub state: State,
    pub action: Option<Action>,
    pub channel: Option<String>,
    pub rel_path: Option<String>,
    /// Raw data-plane bytes moved
    pub bytes: u64,
    pub error: Option<ErrorCode>,
}

impl TransferOutcome {
    pub fn is_ok(&self) -> bool {
        self.state == State::Ok
    }
}

/// Drives the transfer protocol for individual connections.
///
/// The engine itself is stateless and shared; each [`run`](Self::run) call
/// owns its own session.
pub struct TransferEngine {
    storage: Arc<dyn Storage>,
    config: EngineConfig,
}

impl TransferEngine {
    pub fn new(storage: Arc<dyn Storage>, config: EngineConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one request/response cycle on `stream`, then shut it down.
    pub async fn run<S>(&self, stream: S, peer: &str) -> TransferOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = Session {
            storage: self.storage.as_ref(),
            config: &self.config,
            stream,
            peer,
            state: State::Start,
            outbound_span_open: false,
            outcome: TransferOutcome {
                state: State::Start,
                action: None,
                channel: None,
                rel_path: None,
                bytes: 0,
                error: None,
            },
        };

        match session.drive().await {
            Ok(()) => {
                info!(
                    peer = session.peer,
                    "{} {:?} completed ({} bytes)",
                    session.outcome.action.map(|a| a.to_string()).unwrap_or_default(),
                    session.outcome.rel_path.as_deref().unwrap_or_default(),
                    session.outcome.bytes
                );
            }
            Err(e) => session.fail(e).await,
        }

        let _ = session.stream.shutdown().await;
        session.outcome.state = session.state;
        session.outcome
    }
}

/// Per-connection state
struct Session<'a, S> {
    storage: &'a dyn Storage,
    config: &'a EngineConfig,
    stream: S,
    peer: &'a str,
    state: State,
    /// Raw bytes are flowing to the client; no control frame may be sent
    /// until the announced span is complete
    outbound_span_open: bool,
    outcome: TransferOutcome,
}

impl<'a, S> Session<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn drive(&mut self) -> Result<(), TransferError> {
        let start = match self.recv().await? {
            Message::Start(start) => start,
            other => {
                return Err(ProtocolError::UnexpectedState {
                    expected: State::Start,
                    actual: other.state(),
                }
                .into())
            }
        };

        let StartPayload {
            action,
            file_info,
            channel,
        } = start;
        let channel = channel.unwrap_or_else(|| self.config.default_channel.clone());

        self.outcome.action = Some(action);
        self.outcome.channel = Some(channel.clone());
        self.outcome.rel_path = Some(file_info.rel_path.clone());
        debug!(
            peer = self.peer,
            "start: {} {:?} on channel {:?} (declared {} bytes)",
            action,
            file_info.rel_path,
            channel,
            file_info.size
        );

        let rel_path = RelPath::new(&file_info.rel_path)?;
        if rel_path.is_root() {
            return Err(TransferError::Validation(
                "path names the channel root, not a file".into(),
            ));
        }
        self.storage.channel_root(&channel)?;

        match action {
            Action::Upload => self.upload(&channel, file_info).await,
            Action::Download => self.download(&channel, file_info).await,
            Action::Unknown => Err(TransferError::Validation("unsupported action".into())),
        }
    }

    async fn upload(&mut self, channel: &str, info: FileInfo) -> Result<(), TransferError> {
        if info.size == 0 && self.config.reject_empty_uploads {
            return Err(TransferError::Validation(
                "upload declares an empty file".into(),
            ));
        }

        self.storage.create(channel, &info).await?;

        self.transition(State::Data);
        self.send(&Message::data(info.clone())).await?;

        let mut buf = vec![0u8; self.config.buffer_size.max(1)];
        let mut remaining = info.size;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.read_raw(&mut buf[..want]).await?;
            if n == 0 {
                return Err(ProtocolError::SizeMismatch {
                    declared: info.size,
                    actual: self.outcome.bytes,
                }
                .into());
            }

            self.storage.write_chunk(channel, &info, &buf[..n]).await?;
            remaining -= n as u64;
            self.outcome.bytes += n as u64;
        }

        self.transition(State::Eof);
        self.send(&Message::Eof).await?;

        match self.recv().await? {
            Message::Eof => {}
            other => {
                return Err(ProtocolError::UnexpectedState {
                    expected: State::Eof,
                    actual: other.state(),
                }
                .into())
            }
        }

        self.transition(State::Ok);
        self.send(&Message::Ok).await
    }

    async fn download(&mut self, channel: &str, info: FileInfo) -> Result<(), TransferError> {
        if !self.storage.exists(channel, &info).await? {
            return Err(StorageError::FileNotFound(info.rel_path).into());
        }

        let size = self.storage.size(channel, &info).await?;
        let announced = FileInfo::new(info.rel_path, size);

        self.transition(State::Data);
        self.send(&Message::data(announced.clone())).await?;

        self.outbound_span_open = true;
        let mut sink = SpanSink {
            writer: &mut self.stream,
            remaining: size,
            offered: 0,
            overflowed: false,
            timeout: self.config.io_timeout,
        };
        let result = self
            .storage
            .stream_to(channel, &announced, self.config.buffer_size, &mut sink)
            .await;
        let (remaining, offered, overflowed) = (sink.remaining, sink.offered, sink.overflowed);
        self.outcome.bytes = size - remaining;

        if overflowed {
            // The full announced span went out; the file grew underneath us
            self.outbound_span_open = false;
            return Err(ProtocolError::SizeMismatch {
                declared: size,
                actual: offered,
            }
            .into());
        }
        let stats = result?;
        if remaining != 0 {
            return Err(ProtocolError::SizeMismatch {
                declared: size,
                actual: stats.bytes,
            }
            .into());
        }
        self.outbound_span_open = false;

        self.transition(State::Eof);
        self.send(&Message::Eof).await?;

        self.transition(State::Ok);
        self.send(&Message::Ok).await
    }

    /// Report `error` to the client if the wire allows it
    async fn fail(&mut self, error: TransferError) {
        let code = error.code();
        self.outcome.error = Some(code);

        warn!(
            peer = self.peer,
            "transfer failed in state {} ({}): {}", self.state, code, error
        );

        if self.outbound_span_open {
            debug!(peer = self.peer, "closing mid-span without a terminal frame");
        } else if let Err(e) = self.send(&Message::error(code, error.to_string())).await {
            debug!(peer = self.peer, "could not deliver Error: {}", e);
        }

        self.transition(State::Error);
    }

    fn transition(&mut self, next: State) {
        debug!(peer = self.peer, "{} -> {}", self.state, next);
        self.state = next;
    }

    async fn recv(&mut self) -> Result<Message, ConnectionError> {
        with_deadline(self.config.io_timeout, recv_message(&mut self.stream)).await
    }

    async fn send(&mut self, msg: &Message) -> Result<(), TransferError> {
        with_deadline(self.config.io_timeout, send_message(&mut self.stream, msg)).await?;
        Ok(())
    }

    /// Read raw data-plane bytes. Returns 0 only at end of stream.
    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let stream = &mut self.stream;
        with_deadline(self.config.io_timeout, async move {
            loop {
                match stream.read(buf).await {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ConnectionError::Receive(e)),
                }
            }
        })
        .await
    }
}

/// Writes file chunks onto the connection, never past the announced size
struct SpanSink<'w, W> {
    writer: &'w mut W,
    remaining: u64,
    /// Bytes read from the file so far, including any overflow
    offered: u64,
    overflowed: bool,
    timeout: Option<Duration>,
}

#[async_trait]
impl<'w, W> ChunkSink for SpanSink<'w, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn accept(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.offered += chunk.len() as u64;
        let allowed = self.remaining.min(chunk.len() as u64) as usize;
        let writer = &mut *self.writer;
        let fut = async move {
            writer.write_all(&chunk[..allowed]).await?;
            writer.flush().await
        };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??,
            None => fut.await?,
        }
        self.remaining -= allowed as u64;

        if allowed < chunk.len() {
            self.overflowed = true;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "file grew past its announced size",
            ));
        }
        Ok(())
    }
}
