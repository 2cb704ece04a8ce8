//! PeerLink Peer - negotiation, direct-channel file transfer, and CLI
//!
//! A peer joins a session through the relay, negotiates a direct
//! connection with the other participant, and then moves files over an
//! ordered, reliable data channel. The relay never sees file data.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  signals  ┌────────────────────┐  events  ┌────────────────┐
//! │ Relay socket │ ────────▶ │ Participant actor  │ ◀─────── │ PeerTransport  │
//! │ (signaling)  │ ◀──────── │  NegotiationEngine │ ───────▶ │ memory, webrtc │
//! └──────────────┘           │  TransferReceiver  │  frames  └────────────────┘
//!                            └────────────────────┘
//!                              ▲                 │
//!                      commands│                 ▼ ParticipantEvent broadcast
//! ```
//!
//! Outgoing files are read chunk by chunk in spawned tasks that report back
//! to the actor; incoming files are reassembled in memory and written to
//! the download directory only once complete.

pub mod negotiation;
pub mod participant;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use negotiation::{NegotiationEngine, NegotiationError, NegotiationState};
pub use participant::{ParticipantError, ParticipantEvent, ParticipantHandle, ParticipantOptions};
pub use signaling::{RelayApi, SignalChannel, SignalingClient, SignalingError};
pub use transfer::{
    prepare_outgoing, save_completed, ChunkSender, CompletedFile, ReceiveEvent, TransferReceiver,
    TransferStats, TransferStatsSnapshot,
};
pub use transport::{
    IceCandidate, MediaKind, MediaTrack, MemoryTransport, PeerTransport, SessionDescription,
    TransportError, TransportEvent, TransportState,
};
