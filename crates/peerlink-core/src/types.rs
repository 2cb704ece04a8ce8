//! Shared types for sessions and file transfers

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Which side of a session a participant is on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Created the session and shares its screen and files
    Host,
    /// Joined an existing session
    Viewer,
}

impl Role {
    pub fn from_is_host(is_host: bool) -> Self {
        if is_host {
            Role::Host
        } else {
            Role::Viewer
        }
    }

    pub fn is_host(self) -> bool {
        matches!(self, Role::Host)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// Lifecycle of a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    #[serde(alias = "in_progress")]
    Active,
    Completed,
    Failed,
}

impl TransferStatus {
    /// Completed and failed transfers never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Active => "active",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Whether we are sending or receiving a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

/// A single file moving over the direct channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub filename: String,
    pub total_size: u64,
    pub mime_type: String,
    pub chunk_size: u64,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub direction: TransferDirection,
}

impl Transfer {
    pub fn new(
        id: String,
        filename: String,
        total_size: u64,
        mime_type: String,
        chunk_size: u64,
        direction: TransferDirection,
    ) -> Self {
        Self {
            id,
            filename,
            total_size,
            mime_type,
            chunk_size,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            direction,
        }
    }

    /// Fraction of the file transferred, in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            if self.status == TransferStatus::Completed {
                1.0
            } else {
                0.0
            }
        } else {
            self.bytes_transferred as f64 / self.total_size as f64
        }
    }

    /// Progress as a whole percentage
    pub fn percent(&self) -> u8 {
        (self.progress() * 100.0).round().min(100.0) as u8
    }
}

/// Format a byte count as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Guess a MIME type from a file extension
pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("txt") | Some("log") | Some("md") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}
