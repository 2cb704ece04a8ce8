//! Offer/answer negotiation over the relay
//!
//! The host offers as soon as it learns a viewer joined; the viewer answers.
//! Both sides trickle candidates. Remote candidates that arrive before the
//! remote description are buffered and flushed once it is applied.
//!
//! The engine is driven by its owner: relay messages go to
//! [`NegotiationEngine::handle_signal`], transport callbacks to
//! [`NegotiationEngine::handle_transport_event`].

use std::collections::HashSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerlink_core::{Role, DATA_CHANNEL_LABEL};
use peerlink_signal::{SignalKind, SignalMessage};

use crate::transport::{
    IceCandidate, MediaTrack, PeerTransport, SdpKind, SessionDescription, TransportError,
    TransportEvent, TransportState,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Offer sent, waiting for the answer
    Offering,
    /// Offer received, answer being produced
    Answering,
    /// Descriptions exchanged, connectivity checks running
    Connecting,
    Connected,
    /// Connection never came up
    Failed,
    /// Connection was up and then dropped
    Disconnected,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Disconnected)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid {kind:?} payload: {reason}")]
    InvalidSignal { kind: SignalKind, reason: String },

    #[error("unexpected {kind:?} for {role}")]
    UnexpectedSignal { kind: SignalKind, role: Role },

    #[error("only the host can share media")]
    HostOnly,

    #[error("signaling channel closed")]
    SignalingClosed,

    #[error("negotiation already ended ({0:?})")]
    Terminated(NegotiationState),
}

pub struct NegotiationEngine {
    role: Role,
    session_id: String,
    transport: Arc<dyn PeerTransport>,
    signals: mpsc::Sender<SignalMessage>,
    state: NegotiationState,
    remote_set: bool,
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
    local_tracks: Vec<MediaTrack>,
    peer_present: bool,
    channel_opened: bool,
    ever_connected: bool,
}

impl NegotiationEngine {
    pub fn new(
        role: Role,
        session_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        signals: mpsc::Sender<SignalMessage>,
    ) -> Self {
        Self {
            role,
            session_id: session_id.into(),
            transport,
            signals,
            state: NegotiationState::Idle,
            remote_set: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            local_tracks: Vec::new(),
            peer_present: false,
            channel_opened: false,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote candidates waiting for a remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Process a message received from the relay
    pub async fn handle_signal(&mut self, msg: &SignalMessage) -> Result<(), NegotiationError> {
        match msg.kind {
            SignalKind::SessionJoined if msg.participant_joined_flag() => {
                if self.role.is_host() {
                    info!("Peer joined {}, sending offer", self.session_id);
                    self.peer_present = true;
                    self.start_offer().await
                } else {
                    debug!("Another participant joined {}", self.session_id);
                    Ok(())
                }
            }
            SignalKind::Offer => {
                if self.role.is_host() {
                    return Err(self.unexpected(msg.kind));
                }
                let desc: SessionDescription = payload(msg)?;
                if desc.kind != SdpKind::Offer {
                    return Err(invalid(msg.kind, "description is not an offer"));
                }
                self.accept_offer(desc).await
            }
            SignalKind::Answer => {
                if !self.role.is_host() {
                    return Err(self.unexpected(msg.kind));
                }
                let desc: SessionDescription = payload(msg)?;
                if desc.kind != SdpKind::Answer {
                    return Err(invalid(msg.kind, "description is not an answer"));
                }
                self.accept_answer(desc).await
            }
            SignalKind::IceCandidate => {
                let candidate: IceCandidate = payload(msg)?;
                self.add_remote_candidate(candidate).await
            }
            _ => Ok(()),
        }
    }

    /// Process a notification from the transport
    pub async fn handle_transport_event(&mut self, event: &TransportEvent) -> Result<(), NegotiationError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let data = to_value(SignalKind::IceCandidate, candidate)?;
                self.send(SignalMessage::ice_candidate(&self.session_id, data)).await
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                if !self.state.is_terminal() {
                    self.ever_connected = true;
                    self.set_state(NegotiationState::Connected);
                }
                Ok(())
            }
            TransportEvent::StateChanged(state) if state.is_lost() => {
                if !self.state.is_terminal() {
                    let next = if self.ever_connected {
                        NegotiationState::Disconnected
                    } else {
                        NegotiationState::Failed
                    };
                    self.set_state(next);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Replace the local media tracks (host only).
    ///
    /// Renegotiates when a viewer is present, keeping the data channel and
    /// any running transfers.
    pub async fn set_local_tracks(&mut self, tracks: Vec<MediaTrack>) -> Result<(), NegotiationError> {
        if !self.role.is_host() {
            return Err(NegotiationError::HostOnly);
        }
        self.ensure_live()?;

        self.transport.remove_tracks().await?;
        self.local_tracks = tracks;
        if self.peer_present {
            self.start_offer().await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), NegotiationError> {
        self.transport.close().await?;
        if !self.state.is_terminal() {
            let next = if self.ever_connected {
                NegotiationState::Disconnected
            } else {
                NegotiationState::Failed
            };
            self.set_state(next);
        }
        Ok(())
    }

    async fn start_offer(&mut self) -> Result<(), NegotiationError> {
        self.ensure_live()?;

        let result = async {
            if !self.local_tracks.is_empty() {
                self.transport.add_tracks(&self.local_tracks).await?;
            }
            if !self.channel_opened {
                self.transport.open_data_channel(DATA_CHANNEL_LABEL).await?;
                self.channel_opened = true;
            }
            self.transport.create_offer().await
        }
        .await;

        let offer = self.or_fail(result)?;
        if self.state != NegotiationState::Connected {
            self.set_state(NegotiationState::Offering);
        }
        let data = to_value(SignalKind::Offer, &offer)?;
        self.send(SignalMessage::offer(&self.session_id, data)).await
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        self.ensure_live()?;
        let renegotiating = self.state == NegotiationState::Connected;
        if !renegotiating {
            self.set_state(NegotiationState::Answering);
        }

        let result = self.transport.set_remote_description(offer).await;
        self.or_fail(result)?;
        self.remote_set = true;
        self.flush_candidates().await;

        let result = self.transport.create_answer().await;
        let answer = self.or_fail(result)?;
        if !renegotiating && self.state != NegotiationState::Connected {
            self.set_state(NegotiationState::Connecting);
        }
        let data = to_value(SignalKind::Answer, &answer)?;
        self.send(SignalMessage::answer(&self.session_id, data)).await
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.ensure_live()?;

        let result = self.transport.set_remote_description(answer).await;
        self.or_fail(result)?;
        self.remote_set = true;
        self.flush_candidates().await;

        if self.state == NegotiationState::Offering {
            self.set_state(NegotiationState::Connecting);
        }
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.seen_candidates.insert(candidate.clone()) {
            debug!("Ignoring duplicate candidate");
            return Ok(());
        }
        if !self.remote_set {
            debug!("Buffering candidate until remote description is set");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!("Remote candidate rejected: {}", e);
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!("Applying {} buffered candidates", pending.len());
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Buffered candidate rejected: {}", e);
            }
        }
    }

    async fn send(&self, msg: SignalMessage) -> Result<(), NegotiationError> {
        self.signals
            .send(msg)
            .await
            .map_err(|_| NegotiationError::SignalingClosed)
    }

    fn or_fail<T>(&mut self, result: Result<T, TransportError>) -> Result<T, NegotiationError> {
        result.map_err(|e| {
            warn!("Negotiation failed in {:?}: {}", self.state, e);
            self.set_state(NegotiationState::Failed);
            NegotiationError::from(e)
        })
    }

    fn ensure_live(&self) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            Err(NegotiationError::Terminated(self.state))
        } else {
            Ok(())
        }
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state != next {
            debug!("Negotiation {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn unexpected(&self, kind: SignalKind) -> NegotiationError {
        NegotiationError::UnexpectedSignal {
            kind,
            role: self.role,
        }
    }
}

fn payload<T: DeserializeOwned>(msg: &SignalMessage) -> Result<T, NegotiationError> {
    let data = msg
        .data
        .clone()
        .ok_or_else(|| invalid(msg.kind, "missing data"))?;
    serde_json::from_value(data).map_err(|e| invalid(msg.kind, e))
}

fn to_value<T: Serialize>(kind: SignalKind, value: &T) -> Result<serde_json::Value, NegotiationError> {
    serde_json::to_value(value).map_err(|e| invalid(kind, e))
}

fn invalid(kind: SignalKind, reason: impl ToString) -> NegotiationError {
    NegotiationError::InvalidSignal {
        kind,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::transport::TransportEvents;

    const SESSION: &str = "ABCD1234EFGH";

    struct Harness {
        host: NegotiationEngine,
        viewer: NegotiationEngine,
        host_link: Arc<MemoryTransport>,
        host_signals: mpsc::Receiver<SignalMessage>,
        viewer_signals: mpsc::Receiver<SignalMessage>,
        host_events: TransportEvents,
        viewer_events: TransportEvents,
        viewer_seen: Vec<TransportEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let ((ht, host_events), (vt, viewer_events)) = MemoryTransport::pair();
            let host_link = Arc::new(ht);
            let (host_tx, host_signals) = mpsc::channel(64);
            let (viewer_tx, viewer_signals) = mpsc::channel(64);

            Self {
                host: NegotiationEngine::new(Role::Host, SESSION, host_link.clone(), host_tx),
                viewer: NegotiationEngine::new(Role::Viewer, SESSION, Arc::new(vt), viewer_tx),
                host_link,
                host_signals,
                viewer_signals,
                host_events,
                viewer_events,
                viewer_seen: Vec::new(),
            }
        }

        async fn peer_joined(&mut self) {
            let joined = SignalMessage::participant_joined(SESSION, Role::Viewer);
            self.host.handle_signal(&joined).await.unwrap();
        }

        /// Deliver everything queued in both directions until quiet.
        ///
        /// Signal errors are left to the state assertions.
        async fn pump(&mut self) {
            loop {
                let mut progressed = false;
                while let Ok(msg) = self.host_signals.try_recv() {
                    let _ = self.viewer.handle_signal(&msg).await;
                    progressed = true;
                }
                while let Ok(msg) = self.viewer_signals.try_recv() {
                    let _ = self.host.handle_signal(&msg).await;
                    progressed = true;
                }
                while let Ok(ev) = self.host_events.try_recv() {
                    self.host.handle_transport_event(&ev).await.unwrap();
                    progressed = true;
                }
                while let Ok(ev) = self.viewer_events.try_recv() {
                    self.viewer.handle_transport_event(&ev).await.unwrap();
                    self.viewer_seen.push(ev);
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }

        async fn connect(&mut self) {
            self.peer_joined().await;
            self.pump().await;
            assert_eq!(self.host.state(), NegotiationState::Connected);
            assert_eq!(self.viewer.state(), NegotiationState::Connected);
        }
    }

    #[tokio::test]
    async fn test_host_offers_when_peer_joins() {
        let mut h = Harness::new();
        h.peer_joined().await;
        assert_eq!(h.host.state(), NegotiationState::Offering);

        let offer = h.host_signals.try_recv().unwrap();
        assert_eq!(offer.kind, SignalKind::Offer);
        assert_eq!(offer.session_id.as_deref(), Some(SESSION));
        assert_eq!(offer.data.as_ref().unwrap()["type"], "offer");
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let mut h = Harness::new();
        h.connect().await;
        assert!(h.viewer_seen.contains(&TransportEvent::DataChannelOpen));
    }

    #[tokio::test]
    async fn test_viewer_ignores_participant_joined() {
        let mut h = Harness::new();
        let joined = SignalMessage::participant_joined(SESSION, Role::Host);
        h.viewer.handle_signal(&joined).await.unwrap();
        assert_eq!(h.viewer.state(), NegotiationState::Idle);
        assert!(h.viewer_signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered() {
        let mut h = Harness::new();
        h.peer_joined().await;

        // Host gathered a candidate while offering; deliver it ahead of the offer
        let ev = h.host_events.try_recv().unwrap();
        h.host.handle_transport_event(&ev).await.unwrap();
        let offer = h.host_signals.try_recv().unwrap();
        let candidate = h.host_signals.try_recv().unwrap();
        assert_eq!(candidate.kind, SignalKind::IceCandidate);

        h.viewer.handle_signal(&candidate).await.unwrap();
        h.viewer.handle_signal(&candidate).await.unwrap();
        assert_eq!(h.viewer.pending_candidates(), 1);

        h.viewer.handle_signal(&offer).await.unwrap();
        assert_eq!(h.viewer.pending_candidates(), 0);

        h.pump().await;
        assert_eq!(h.host.state(), NegotiationState::Connected);
        assert_eq!(h.viewer.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_screen_share_renegotiates() {
        let mut h = Harness::new();
        h.connect().await;
        h.viewer_seen.clear();

        h.host
            .set_local_tracks(vec![MediaTrack::video("screen"), MediaTrack::audio("mic")])
            .await
            .unwrap();
        assert_eq!(h.host.state(), NegotiationState::Connected);
        h.pump().await;

        assert_eq!(h.viewer.state(), NegotiationState::Connected);
        assert!(h.viewer_seen.contains(&TransportEvent::Track(MediaTrack::video("screen"))));
        assert!(h.viewer_seen.contains(&TransportEvent::Track(MediaTrack::audio("mic"))));

        h.host.set_local_tracks(Vec::new()).await.unwrap();
        h.pump().await;
        assert!(h.viewer_seen.contains(&TransportEvent::TrackRemoved("screen".into())));
        assert_eq!(h.viewer.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_viewer_cannot_share() {
        let mut h = Harness::new();
        assert!(matches!(
            h.viewer.set_local_tracks(vec![MediaTrack::video("v")]).await,
            Err(NegotiationError::HostOnly)
        ));
    }

    #[tokio::test]
    async fn test_tracks_before_peer_ride_first_offer() {
        let mut h = Harness::new();
        h.host.set_local_tracks(vec![MediaTrack::video("screen")]).await.unwrap();
        assert!(h.host_signals.try_recv().is_err());

        h.connect().await;
        assert!(h.viewer_seen.contains(&TransportEvent::Track(MediaTrack::video("screen"))));
    }

    #[tokio::test]
    async fn test_failure_before_connect() {
        let mut h = Harness::new();
        h.peer_joined().await;
        h.host_link.fail_link();
        h.pump().await;

        assert_eq!(h.host.state(), NegotiationState::Failed);
        assert!(matches!(
            h.host.set_local_tracks(Vec::new()).await,
            Err(NegotiationError::Terminated(NegotiationState::Failed))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_after_connect() {
        let mut h = Harness::new();
        h.connect().await;
        h.host_link.fail_link();
        h.pump().await;

        assert_eq!(h.host.state(), NegotiationState::Disconnected);
        assert_eq!(h.viewer.state(), NegotiationState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejects_wrong_direction_and_bad_payload() {
        let mut h = Harness::new();

        let offer = SignalMessage::offer(SESSION, serde_json::json!({"type": "offer", "sdp": "v=0\r\n"}));
        assert!(matches!(
            h.host.handle_signal(&offer).await,
            Err(NegotiationError::UnexpectedSignal { .. })
        ));

        let garbage = SignalMessage::offer(SESSION, serde_json::json!({"sdp": 5}));
        assert!(matches!(
            h.viewer.handle_signal(&garbage).await,
            Err(NegotiationError::InvalidSignal { .. })
        ));
        assert_eq!(h.viewer.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_bad_sdp_fails_engine() {
        let mut h = Harness::new();
        let offer = SignalMessage::offer(SESSION, serde_json::json!({"type": "offer", "sdp": "garbage"}));
        assert!(matches!(
            h.viewer.handle_signal(&offer).await,
            Err(NegotiationError::Transport(TransportError::Description(_)))
        ));
        assert_eq!(h.viewer.state(), NegotiationState::Failed);
    }
}
