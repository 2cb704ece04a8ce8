//! PeerLink Relay
//!
//! Rendezvous point for peers that want to open a direct connection.
//! Clients connect via WebSocket, join a session by its short ID, and the
//! relay forwards negotiation messages between the session's participants.
//!
//! # Protocol
//!
//! 1. Host creates a session over HTTP (`POST /sessions`)
//! 2. Host and viewer send `join-session` with the session ID
//! 3. Relay forwards `offer`, `answer`, and `ice-candidate` verbatim
//! 4. Peers establish a direct connection
//! 5. Once everyone leaves, the session is marked inactive

pub mod messages;
pub mod records;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;

pub use messages::{ErrorCode, SignalKind, SignalMessage};
pub use records::{RecordError, TransferRecord, TransferRecordStore};
pub use registry::{RegistryError, Session, SessionRegistry};
pub use relay::{ConnectionPhase, Disposition, RelayConnection, RelayError, SignalingRelay};
pub use router::{ConnectionHandle, ConnectionId, ConnectionRouter, LeaveOutcome, OutboundFrame};
pub use server::RelayServer;
