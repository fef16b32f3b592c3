//! chanfs Core - Shared types, path model, and wire protocol
//!
//! This crate contains the foundational types used by the transfer engine,
//! the server and the client. It has no dependencies on networking or
//! filesystem code beyond configuration loading.

pub mod config;
pub mod error;
pub mod path;
pub mod protocol;

pub use config::{Config, ServerConfig, StorageConfig};
pub use error::*;
pub use path::RelPath;
pub use protocol::*;

/// Default channel used when a request does not name one
pub const DEFAULT_CHANNEL: &str = "main";

/// Default TCP port for the transfer server
pub const DEFAULT_PORT: u16 = 8080;

/// Default chunk buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Length of the control frame header (u32, little-endian)
pub const FRAME_HEADER_LEN: usize = 4;

/// Maximum control frame size (64 KB)
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// Maximum relative path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum path token length in bytes
pub const MAX_FILENAME_LEN: usize = 255;
