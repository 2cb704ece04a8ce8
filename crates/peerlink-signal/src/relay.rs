//! Signaling relay state machine
//!
//! Each relay connection moves `Unjoined -> Joined -> Closed`. Only a
//! successful `join-session` joins; negotiation messages are relayed to the
//! other members of the sender's session and dropped while unjoined.
//! Nothing a client sends can close its connection or stop the relay.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerlink_core::ids::normalize_session_id;
use peerlink_core::Role;

use crate::messages::{ErrorCode, SignalKind, SignalMessage};
use crate::registry::{RegistryError, SessionRegistry};
use crate::router::{ConnectionHandle, ConnectionId, ConnectionRouter, OutboundFrame};

/// Where a relay connection is in its lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Unjoined,
    Joined { session_id: String, role: Role },
    Closed,
}

/// Relay-side state of one participant's connection
pub struct RelayConnection {
    handle: ConnectionHandle,
    phase: ConnectionPhase,
}

impl RelayConnection {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.phase {
            ConnectionPhase::Joined { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    fn reply(&self, msg: &SignalMessage) {
        match msg.to_json() {
            Ok(json) => {
                if !self.handle.try_deliver(&OutboundFrame::from(json)) {
                    debug!("Reply to connection {} dropped (not writable)", self.id());
                }
            }
            Err(e) => warn!("Failed to serialize reply: {}", e),
        }
    }
}

/// What the relay did with an inbound frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Connection joined the session
    Joined { session_id: String },
    /// Frame was queued for this many other members
    Relayed(usize),
    /// Frame was ignored
    Dropped,
    /// Sender got a `session-error`
    Rejected(ErrorCode),
}

/// Reasons a frame is answered with `session-error`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Session ID required")]
    MissingSessionId,

    #[error("Session not found or inactive")]
    SessionNotFound(String),

    #[error("Session not found or inactive")]
    SessionInactive(String),

    #[error("Message is for session {requested}, connection joined {joined}")]
    SessionMismatch { requested: String, joined: String },

    #[error("Clients may not send {0:?} messages")]
    UnexpectedMessage(SignalKind),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::InvalidMessage(_) | RelayError::MissingSessionId => {
                ErrorCode::InvalidMessage
            }
            RelayError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RelayError::SessionInactive(_) => ErrorCode::SessionInactive,
            RelayError::SessionMismatch { .. } => ErrorCode::SessionMismatch,
            RelayError::UnexpectedMessage(_) => ErrorCode::UnexpectedMessage,
        }
    }
}

/// Routes signaling frames between the participants of each session
pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
    router: Arc<ConnectionRouter>,
    next_id: AtomicU64,
    open_connections: AtomicUsize,
}

impl SignalingRelay {
    pub fn new(registry: Arc<SessionRegistry>, router: Arc<ConnectionRouter>) -> Self {
        Self {
            registry,
            router,
            next_id: AtomicU64::new(1),
            open_connections: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    /// Open relay connections, joined or not
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Register a newly accepted connection
    pub fn accept(&self, tx: mpsc::Sender<OutboundFrame>) -> RelayConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        debug!("Accepted relay connection {}", id);

        RelayConnection {
            handle: ConnectionHandle::new(id, tx),
            phase: ConnectionPhase::Unjoined,
        }
    }

    /// Process one inbound text frame
    pub fn handle_text(&self, conn: &mut RelayConnection, text: &str) -> Disposition {
        if conn.phase == ConnectionPhase::Closed {
            return Disposition::Dropped;
        }

        match self.process(conn, text) {
            Ok(disposition) => disposition,
            Err(e) => {
                debug!("Rejecting frame from connection {}: {}", conn.id(), e);
                let session_id = conn.session_id().map(str::to_string);
                conn.reply(&SignalMessage::session_error(session_id, e.code(), e.to_string()));
                Disposition::Rejected(e.code())
            }
        }
    }

    fn process(&self, conn: &mut RelayConnection, text: &str) -> Result<Disposition, RelayError> {
        let msg = SignalMessage::from_json(text)
            .map_err(|e| RelayError::InvalidMessage(e.to_string()))?;

        match msg.kind {
            SignalKind::JoinSession => self.join(conn, &msg),
            kind if kind.is_relayed() => self.relay(conn, &msg, text),
            kind => Err(RelayError::UnexpectedMessage(kind)),
        }
    }

    fn join(
        &self,
        conn: &mut RelayConnection,
        msg: &SignalMessage,
    ) -> Result<Disposition, RelayError> {
        let session_id = msg
            .session_id
            .as_deref()
            .map(normalize_session_id)
            .filter(|s| !s.is_empty())
            .ok_or(RelayError::MissingSessionId)?;

        // Checked under the member-set lock so a racing last leave either
        // sees this member or deactivates before the check
        let registry = &self.registry;
        let admit = || match registry.get(&session_id) {
            Ok(session) if session.active => Ok(()),
            Ok(_) => Err(RelayError::SessionInactive(session_id.clone())),
            Err(RegistryError::NotFound(id)) => Err(RelayError::SessionNotFound(id)),
            Err(other) => Err(RelayError::InvalidMessage(other.to_string())),
        };

        let role = msg.role();
        let previous = self.router.join(
            &session_id,
            conn.handle.clone(),
            role,
            admit,
            |emptied| registry.deactivate(emptied),
        )?;
        if let Some(previous) = previous {
            info!(
                "Connection {} moved from {} to {}",
                conn.id(),
                previous.session_id,
                session_id
            );
        }

        conn.phase = ConnectionPhase::Joined {
            session_id: session_id.clone(),
            role,
        };
        info!("Connection {} joined session {} as {}", conn.id(), session_id, role);

        conn.reply(&SignalMessage::session_joined(session_id.clone(), role));

        match SignalMessage::participant_joined(session_id.clone(), role).to_json() {
            Ok(json) => {
                let notified =
                    self.router
                        .broadcast(&session_id, &OutboundFrame::from(json), Some(conn.id()));
                debug!("Notified {} participants in {}", notified, session_id);
            }
            Err(e) => warn!("Failed to serialize join notification: {}", e),
        }

        Ok(Disposition::Joined { session_id })
    }

    fn relay(
        &self,
        conn: &RelayConnection,
        msg: &SignalMessage,
        raw: &str,
    ) -> Result<Disposition, RelayError> {
        let Some(joined) = conn.session_id() else {
            debug!(
                "Dropping {:?} from unjoined connection {}",
                msg.kind,
                conn.id()
            );
            return Ok(Disposition::Dropped);
        };

        if let Some(requested) = msg.session_id.as_deref() {
            let requested = normalize_session_id(requested);
            if requested != joined {
                return Err(RelayError::SessionMismatch {
                    requested,
                    joined: joined.to_string(),
                });
            }
        }

        // Forward the original frame so the payload reaches peers untouched
        let delivered = self
            .router
            .broadcast(joined, &OutboundFrame::from(raw), Some(conn.id()));
        debug!(
            "Relayed {:?} from connection {} to {} peers in {}",
            msg.kind,
            conn.id(),
            delivered,
            joined
        );
        Ok(Disposition::Relayed(delivered))
    }

    /// Clean up after the transport closed. Safe to call more than once.
    pub fn disconnect(&self, conn: &mut RelayConnection) {
        if conn.phase == ConnectionPhase::Closed {
            return;
        }

        let registry = &self.registry;
        let outcome = self
            .router
            .leave(conn.id(), |emptied| registry.deactivate(emptied));
        if let Some(outcome) = outcome {
            info!(
                "Connection {} left session {} ({} remaining)",
                conn.id(),
                outcome.session_id,
                outcome.remaining
            );
        }

        conn.phase = ConnectionPhase::Closed;
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
        debug!("Relay connection {} closed", conn.id());
    }
}
