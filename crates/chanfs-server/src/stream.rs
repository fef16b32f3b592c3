//! Chunked file streaming
//!
//! Reads a file (or any async reader) through a fixed-size buffer and hands
//! each filled slice to a [`ChunkSink`]. Totals are reported on success and,
//! as partial totals, on failure.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes and chunks moved by one streaming run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes: u64,
    pub chunks: u64,
}

/// Consumer of streamed chunks.
///
/// The slice is only valid for the duration of the call; copy it to keep it.
#[async_trait]
pub trait ChunkSink: Send {
    async fn accept(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// Adapts a synchronous closure into a [`ChunkSink`]
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> ChunkSink for FnSink<F>
where
    F: FnMut(&[u8]) + Send,
{
    async fn accept(&mut self, chunk: &[u8]) -> io::Result<()> {
        (self.0)(chunk);
        Ok(())
    }
}

/// Forwards every chunk to an async writer
pub struct WriterSink<W> {
    writer: W,
    timeout: Option<Duration>,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            timeout: None,
        }
    }

    /// Bound every write by `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ChunkSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn accept(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.writer.write_all(chunk))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?,
            None => self.writer.write_all(chunk).await,
        }
    }
}

/// Streaming errors. Every variant raised after the file was opened carries
/// the totals accumulated before the failure.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("buffer size must be greater than zero")]
    InvalidBufferSize,

    #[error("failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read failed after {} bytes: {source}", .stats.bytes)]
    Read {
        stats: StreamStats,
        #[source]
        source: io::Error,
    },

    #[error("chunk consumer failed after {} bytes: {source}", .stats.bytes)]
    Sink {
        stats: StreamStats,
        #[source]
        source: io::Error,
    },
}

impl StreamError {
    /// Totals accumulated before the failure
    pub fn stats(&self) -> StreamStats {
        match self {
            StreamError::InvalidBufferSize | StreamError::Open { .. } => StreamStats::default(),
            StreamError::Read { stats, .. } | StreamError::Sink { stats, .. } => *stats,
        }
    }

    /// True if the file itself does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamError::Open { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Stream the file at `path` into `sink` using a buffer of `buffer_size` bytes.
///
/// The file handle is dropped on every exit path.
pub async fn stream_file<S>(
    path: &Path,
    buffer_size: usize,
    sink: &mut S,
) -> Result<StreamStats, StreamError>
where
    S: ChunkSink + ?Sized,
{
    if buffer_size == 0 {
        return Err(StreamError::InvalidBufferSize);
    }

    let file = File::open(path).await.map_err(|source| StreamError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let result = stream(file, buffer_size, sink).await;

    match &result {
        Ok(stats) => debug!(
            "Streaming completed: file={:?} bytes={} chunks={}",
            path, stats.bytes, stats.chunks
        ),
        Err(e) => {
            let stats = e.stats();
            debug!(
                "Streaming aborted: file={:?} bytes={} chunks={} error={}",
                path, stats.bytes, stats.chunks, e
            );
        }
    }

    result
}

/// Stream any reader into `sink`.
///
/// A read of zero bytes is end-of-stream. Interrupted reads are retried and
/// count as neither progress nor failure; any other error aborts.
pub async fn stream<R, S>(
    mut reader: R,
    buffer_size: usize,
    sink: &mut S,
) -> Result<StreamStats, StreamError>
where
    R: AsyncRead + Unpin,
    S: ChunkSink + ?Sized,
{
    if buffer_size == 0 {
        return Err(StreamError::InvalidBufferSize);
    }

    let mut buf = vec![0u8; buffer_size];
    let mut stats = StreamStats::default();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(StreamError::Read { stats, source }),
        };

        stats.bytes += n as u64;
        stats.chunks += 1;

        if let Err(source) = sink.accept(&buf[..n]).await {
            return Err(StreamError::Sink { stats, source });
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    /// Reader that replays a fixed script of read results
    struct ScriptedReader {
        script: VecDeque<io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(script: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.script.pop_front() {
                Some(Ok(bytes)) => {
                    buf.put_slice(&bytes);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    fn collect_sink(out: &mut Vec<Vec<u8>>) -> FnSink<impl FnMut(&[u8]) + Send + '_> {
        FnSink(move |chunk: &[u8]| out.push(chunk.to_vec()))
    }

    #[tokio::test]
    async fn test_chunk_count_is_ceil_of_size_over_buffer() {
        let temp = TempDir::new().unwrap();

        for (size, buffer) in [(1usize, 1usize), (10, 3), (1024, 1024), (1025, 1024), (5000, 7)] {
            let path = temp.path().join(format!("f-{}-{}", size, buffer));
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            std::fs::write(&path, &data).unwrap();

            let mut chunks = Vec::new();
            let stats = stream_file(&path, buffer, &mut collect_sink(&mut chunks))
                .await
                .unwrap();

            let expected_chunks = (size + buffer - 1) / buffer;
            assert_eq!(stats.chunks, expected_chunks as u64, "size={} buffer={}", size, buffer);
            assert_eq!(stats.bytes, size as u64);
            assert_eq!(chunks.len(), expected_chunks);
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= buffer));
            assert_eq!(chunks.concat(), data);
        }
    }

    #[tokio::test]
    async fn test_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let mut calls = 0;
        let stats = stream_file(&path, 16, &mut FnSink(|_: &[u8]| calls += 1))
            .await
            .unwrap();

        assert_eq!(stats, StreamStats::default());
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_missing_file_returns_error() {
        let temp = TempDir::new().unwrap();
        let err = stream_file(&temp.path().join("nope"), 16, &mut FnSink(|_: &[u8]| {}))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(err.stats(), StreamStats::default());
    }

    #[tokio::test]
    async fn test_zero_buffer_rejected() {
        let err = stream(&b"abc"[..], 0, &mut FnSink(|_: &[u8]| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidBufferSize));
    }

    #[tokio::test]
    async fn test_short_and_interrupted_reads_are_not_eof() {
        let reader = ScriptedReader::new(vec![
            Ok(b"ab".to_vec()),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(b"c".to_vec()),
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Ok(b"defg".to_vec()),
        ]);

        let mut chunks = Vec::new();
        let stats = stream(reader, 8, &mut collect_sink(&mut chunks)).await.unwrap();

        assert_eq!(stats, StreamStats { bytes: 7, chunks: 3 });
        assert_eq!(chunks, vec![b"ab".to_vec(), b"c".to_vec(), b"defg".to_vec()]);
    }

    #[tokio::test]
    async fn test_read_error_reports_partial_totals() {
        let reader = ScriptedReader::new(vec![
            Ok(b"abc".to_vec()),
            Ok(b"de".to_vec()),
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire")),
            Ok(b"never".to_vec()),
        ]);

        let mut chunks = Vec::new();
        let err = stream(reader, 8, &mut collect_sink(&mut chunks))
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Read { .. }));
        assert_eq!(err.stats(), StreamStats { bytes: 5, chunks: 2 });
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_sink_error_aborts() {
        struct FailAfter(usize);

        #[async_trait]
        impl ChunkSink for FailAfter {
            async fn accept(&mut self, _chunk: &[u8]) -> io::Result<()> {
                if self.0 == 0 {
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe));
                }
                self.0 -= 1;
                Ok(())
            }
        }

        let data = vec![7u8; 100];
        let err = stream(&data[..], 10, &mut FailAfter(2)).await.unwrap_err();

        assert!(matches!(err, StreamError::Sink { .. }));
        assert_eq!(err.stats(), StreamStats { bytes: 30, chunks: 3 });
    }

    #[tokio::test]
    async fn test_writer_sink() {
        let data: Vec<u8> = (0..=255).collect();
        let mut sink = WriterSink::new(Vec::new());
        let stats = stream(&data[..], 64, &mut sink).await.unwrap();

        assert_eq!(stats.chunks, 4);
        assert_eq!(sink.into_inner(), data);
    }
}
