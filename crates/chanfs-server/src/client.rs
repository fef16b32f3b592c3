//! chanfs client - uploads and downloads single files over one connection each

use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use chanfs_core::{
    Action, ErrorCode, FileInfo, Message, ProtocolError, StartPayload, State, DEFAULT_BUFFER_SIZE,
};

use crate::net::{recv_message, send_message, with_deadline, ConnectionError};
use crate::stream::{stream, ChunkSink, FnSink, StreamError, WriterSink};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server rejected the request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("transfer truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("local I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Error code reported by the server, if the server rejected the request
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// chanfs transfer client
#[derive(Debug, Clone)]
pub struct TransferClient {
    addr: String,
    channel: Option<String>,
    buffer_size: usize,
    io_timeout: Option<Duration>,
}

impl TransferClient {
    /// Client for the server at `addr` (`host:port`)
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            channel: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            io_timeout: None,
        }
    }

    /// Target `channel` instead of the server's default
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Bound every control exchange and data write by `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", self.addr);
        Ok(stream)
    }

    fn start(&self, action: Action, file_info: FileInfo) -> Message {
        Message::Start(StartPayload {
            action,
            file_info,
            channel: self.channel.clone(),
        })
    }

    async fn send(&self, conn: &mut TcpStream, msg: &Message) -> Result<(), ClientError> {
        with_deadline(self.io_timeout, send_message(conn, msg)).await?;
        Ok(())
    }

    /// Receive the next message and require it to be in `expected` state
    async fn expect(&self, conn: &mut TcpStream, expected: State) -> Result<Message, ClientError> {
        let msg = with_deadline(self.io_timeout, recv_message(conn)).await?;
        match msg {
            Message::Error(e) => Err(ClientError::Rejected {
                code: e.code,
                message: e.message,
            }),
            msg if msg.state() == expected => Ok(msg),
            msg => Err(ProtocolError::UnexpectedState {
                expected,
                actual: msg.state(),
            }
            .into()),
        }
    }

    /// Upload `size` bytes from `reader` to `rel_path`
    pub async fn upload<R>(&self, rel_path: &str, size: u64, reader: R) -> Result<u64, ClientError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut conn = self.connect().await?;

        self.send(&mut conn, &self.start(Action::Upload, FileInfo::new(rel_path, size)))
            .await?;
        self.expect(&mut conn, State::Data).await?;

        let stats = {
            let mut sink = WriterSink::new(&mut conn).with_timeout(self.io_timeout);
            stream(reader.take(size), self.buffer_size, &mut sink).await?
        };
        if stats.bytes != size {
            return Err(ClientError::Truncated {
                expected: size,
                actual: stats.bytes,
            });
        }

        self.expect(&mut conn, State::Eof).await?;
        self.send(&mut conn, &Message::Eof).await?;
        self.expect(&mut conn, State::Ok).await?;

        let _ = conn.shutdown().await;
        info!("Uploaded {:?} ({} bytes)", rel_path, size);
        Ok(size)
    }

    pub async fn upload_bytes(&self, rel_path: &str, data: &[u8]) -> Result<u64, ClientError> {
        self.upload(rel_path, data.len() as u64, data).await
    }

    /// Upload a local file to `rel_path`
    pub async fn upload_file(&self, local: &Path, rel_path: &str) -> Result<u64, ClientError> {
        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();
        self.upload(rel_path, size, file).await
    }

    /// Download `rel_path`, handing the raw bytes to `sink` chunk by chunk.
    ///
    /// Returns the file size announced by the server.
    pub async fn download<S>(&self, rel_path: &str, sink: &mut S) -> Result<u64, ClientError>
    where
        S: ChunkSink + ?Sized,
    {
        let mut conn = self.connect().await?;

        self.send(&mut conn, &self.start(Action::Download, FileInfo::new(rel_path, 0)))
            .await?;
        let size = match self.expect(&mut conn, State::Data).await? {
            Message::Data(data) => data.file_info.size,
            other => {
                return Err(ProtocolError::UnexpectedState {
                    expected: State::Data,
                    actual: other.state(),
                }
                .into())
            }
        };

        let stats = stream((&mut conn).take(size), self.buffer_size, sink).await?;
        if stats.bytes != size {
            return Err(ClientError::Truncated {
                expected: size,
                actual: stats.bytes,
            });
        }

        self.expect(&mut conn, State::Eof).await?;
        self.expect(&mut conn, State::Ok).await?;

        info!("Downloaded {:?} ({} bytes)", rel_path, size);
        Ok(size)
    }

    pub async fn download_bytes(&self, rel_path: &str) -> Result<Vec<u8>, ClientError> {
        let mut out = Vec::new();
        self.download(rel_path, &mut FnSink(|chunk: &[u8]| out.extend_from_slice(chunk)))
            .await?;
        Ok(out)
    }

    /// Download `rel_path` into a local file, creating or truncating it
    pub async fn download_file(&self, rel_path: &str, local: &Path) -> Result<u64, ClientError> {
        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = tokio::fs::File::create(local).await?;
        let mut sink = WriterSink::new(file);
        let size = self.download(rel_path, &mut sink).await?;

        let mut file = sink.into_inner();
        file.flush().await?;
        Ok(size)
    }
}
