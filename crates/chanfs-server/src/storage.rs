//! Storage resolver
//!
//! Maps a `(channel, relative path)` pair to a physical file and performs the
//! handful of operations a transfer needs against it. Nothing is cached: each
//! call re-resolves and re-stats, so concurrent transfers only ever share
//! state through the filesystem.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use chanfs_core::{path::validate_token, ErrorCode, FileInfo, PathError, RelPath, StorageConfig};

use crate::stream::{stream_file, ChunkSink, StreamError, StreamStats};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("unknown channel: {0:?}")]
    ChannelNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Wire classification of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::InvalidPath(_) => ErrorCode::Validation,
            StorageError::ChannelNotFound(_) | StorageError::FileNotFound(_) => {
                ErrorCode::NotFound
            }
            StorageError::NotAFile(_) | StorageError::Io { .. } => ErrorCode::Io,
            StorageError::Stream(e) if e.is_not_found() => ErrorCode::NotFound,
            StorageError::Stream(StreamError::Sink { .. }) => ErrorCode::Connection,
            StorageError::Stream(_) => ErrorCode::Io,
        }
    }
}

/// Operations the transfer engine needs from a storage backend.
///
/// Every file operation takes the channel plus the request's [`FileInfo`];
/// only `rel_path` is consulted, the declared size is never trusted here.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Physical root directory of `channel`
    fn channel_root(&self, channel: &str) -> Result<PathBuf, StorageError>;

    /// Physical location of `rel_path` inside `channel`
    fn resolve_file(&self, channel: &str, rel_path: &str) -> Result<PathBuf, StorageError> {
        let root = self.channel_root(channel)?;
        let rel = RelPath::new(rel_path)?;
        Ok(rel.to_physical(&root))
    }

    /// Size of the file on disk
    async fn size(&self, channel: &str, info: &FileInfo) -> Result<u64, StorageError>;

    /// `false` only when the file is absent; other stat failures are errors
    async fn exists(&self, channel: &str, info: &FileInfo) -> Result<bool, StorageError>;

    /// Create (or truncate to) an empty file
    async fn create(&self, channel: &str, info: &FileInfo) -> Result<(), StorageError>;

    /// Append `chunk` to the file
    async fn write_chunk(
        &self,
        channel: &str,
        info: &FileInfo,
        chunk: &[u8],
    ) -> Result<(), StorageError>;

    /// Stream the file's contents into `sink`
    async fn stream_to(
        &self,
        channel: &str,
        info: &FileInfo,
        buffer_size: usize,
        sink: &mut dyn ChunkSink,
    ) -> Result<StreamStats, StorageError>;
}

/// Filesystem-backed storage: `<root>/<channel>/<rel_path>`
pub struct FsStorage {
    root: PathBuf,
    channels: BTreeSet<String>,
}

impl FsStorage {
    pub fn new<I, S>(root: impl Into<PathBuf>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: root.into(),
            channels: channels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.root.clone(), config.channels.iter().cloned())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the storage root and every channel directory
    pub async fn prepare(&self) -> Result<(), StorageError> {
        for channel in &self.channels {
            let dir = self.channel_root(channel)?;
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StorageError::io(&dir, e))?;
            debug!("Channel {:?} ready at {:?}", channel, dir);
        }
        info!(
            "Storage root {:?} with {} channel(s)",
            self.root,
            self.channels.len()
        );
        Ok(())
    }

    async fn regular_file_len(&self, path: &Path, info: &FileInfo) -> Result<u64, StorageError> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(StorageError::NotAFile(info.rel_path.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::FileNotFound(info.rel_path.clone()))
            }
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

#[async_trait]
impl Storage for FsStorage {
    fn channel_root(&self, channel: &str) -> Result<PathBuf, StorageError> {
        if channel.is_empty() || validate_token(channel).is_err() || !self.channels.contains(channel)
        {
            return Err(StorageError::ChannelNotFound(channel.into()));
        }
        Ok(self.root.join(channel))
    }

    async fn size(&self, channel: &str, info: &FileInfo) -> Result<u64, StorageError> {
        let path = self.resolve_file(channel, &info.rel_path)?;
        self.regular_file_len(&path, info).await
    }

    async fn exists(&self, channel: &str, info: &FileInfo) -> Result<bool, StorageError> {
        let path = self.resolve_file(channel, &info.rel_path)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn create(&self, channel: &str, info: &FileInfo) -> Result<(), StorageError> {
        let path = self.resolve_file(channel, &info.rel_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&path, e))?;
        debug!("Created {:?}", path);
        Ok(())
    }

    async fn write_chunk(
        &self,
        channel: &str,
        info: &FileInfo,
        chunk: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.resolve_file(channel, &info.rel_path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(chunk)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        // tokio completes writes in the background; wait before the handle drops
        file.flush().await.map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }

    async fn stream_to(
        &self,
        channel: &str,
        info: &FileInfo,
        buffer_size: usize,
        sink: &mut dyn ChunkSink,
    ) -> Result<StreamStats, StorageError> {
        let path = self.resolve_file(channel, &info.rel_path)?;
        self.regular_file_len(&path, info).await?;
        Ok(stream_file(&path, buffer_size, sink).await?)
    }
}
