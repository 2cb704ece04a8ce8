//! PeerLink Core - Shared types, direct-channel frames, and identifiers
//!
//! This crate contains the foundational types used by both the relay and the
//! peers. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod ids;
pub mod protocol;
pub mod types;

pub use config::{Config, ConfigError, PeerConfig, RelayConfig, TransferConfig};
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Default chunk size in bytes (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size a peer will accept in a start frame (1 MB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default maximum file size accepted for transfer (100 MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default inactivity window before an in-flight transfer fails
pub const DEFAULT_TRANSFER_IDLE_TIMEOUT_SECS: u64 = 30;

/// Label of the direct-channel data channel carrying transfer frames
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// Public STUN servers used when none are configured
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.stunprotocol.org:3478",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
