//! chanfs Server - Transfer engine, storage resolver, and TCP server
//!
//! This crate provides:
//! - Chunked file streaming through a bounded buffer
//! - A channel-aware storage resolver over the local filesystem
//! - The per-connection transfer state machine
//! - A TCP dispatcher and a matching client
//!
//! # Architecture
//!
//! Every connection carries exactly one transfer. Control messages are
//! length-prefixed JSON frames; file bytes travel raw between them:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TransferServer (accept loop)                │
//! │  semaphore-bounded, one tokio task per connection           │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ TcpStream
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                TransferEngine (per connection)              │
//! │  Start → Data → raw span → Eof → [client Eof] → Ok | Error  │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ Arc<dyn Storage>
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           FsStorage: <root>/<channel>/<relPath>             │
//! │  size / exists / create / append / stream (ChunkSink)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connections share nothing but the filesystem. Concurrent uploads to the
//! same path are not serialized and may interleave.

pub mod client;
pub mod engine;
pub mod net;
pub mod server;
pub mod storage;
pub mod stream;

pub use client::{ClientError, TransferClient};
pub use engine::{EngineConfig, TransferEngine, TransferError, TransferOutcome};
pub use net::ConnectionError;
pub use server::{ServerError, TransferServer};
pub use storage::{FsStorage, Storage, StorageError};
pub use stream::{stream, stream_file, ChunkSink, FnSink, StreamError, StreamStats, WriterSink};
