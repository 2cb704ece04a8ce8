//! Peer connection abstraction
//!
//! The negotiation engine and the transfer protocol only talk to a
//! [`PeerTransport`]. Backends:
//! - [`MemoryTransport`]: an in-process linked pair, used in tests
//! - `WebRtcTransport` (feature `webrtc`): a real peer connection
//!
//! Asynchronous callbacks (gathered candidates, remote tracks, state
//! changes, data-channel traffic) arrive as [`TransportEvent`]s on the
//! receiver returned alongside the transport.
//!
//! Every backend configures the data channel ordered and reliable; the
//! transfer protocol depends on it.

mod backpressure;
mod memory;
#[cfg(feature = "webrtc")]
mod rtc;

pub use backpressure::{SendWindow, BUFFERED_AMOUNT_HIGH};
pub use memory::MemoryTransport;
#[cfg(feature = "webrtc")]
pub use rtc::WebRtcTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Receiving side of a transport's event stream
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Description could not be created or applied.
    #[error("session description error: {0}")]
    Description(String),

    /// Candidate could not be applied.
    #[error("candidate rejected: {0}")]
    Candidate(String),

    /// Candidate arrived before any remote description.
    #[error("no remote description set")]
    NoRemoteDescription,

    /// Data channel is not open.
    #[error("data channel not open")]
    ChannelNotOpen,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Media track could not be attached or removed.
    #[error("media error: {0}")]
    Media(String),

    /// Transport was closed.
    #[error("transport closed")]
    Closed,

    /// Backend-specific failure.
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Kind of a session description
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged through the relay
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser's JSON shape
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// A media track attached to (or received from) the connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MediaTrack {
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Video,
        }
    }

    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Audio,
        }
    }
}

/// Connection state reported by the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// The connection is gone for good
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

/// Asynchronous notifications from a transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be trickled to the peer
    LocalCandidate(IceCandidate),
    /// The remote peer added a media track
    Track(MediaTrack),
    /// The remote peer removed a media track
    TrackRemoved(String),
    StateChanged(TransportState),
    DataChannelOpen,
    DataChannelClosed,
    /// A text message arrived on the data channel
    Data(String),
}

/// Capability interface over a peer connection library.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer and apply it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote candidate. Fails before a remote description is set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Create the ordered, reliable data channel (offering side only).
    async fn open_data_channel(&self, label: &str) -> Result<(), TransportError>;

    /// Attach local media; takes effect on the next offer.
    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError>;

    /// Detach all local media; takes effect on the next offer.
    async fn remove_tracks(&self) -> Result<(), TransportError>;

    /// Send a text message on the data channel.
    async fn send_data(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_browser_shape() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(serde_json::to_string(&candidate).unwrap(), json);
    }

    #[test]
    fn test_description_shape() {
        let desc = SessionDescription::offer("v=0\r\n");
        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0\r\n");
    }
}
