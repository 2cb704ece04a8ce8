//! In-process transport pair
//!
//! Two linked endpoints that walk through the same offer/answer/candidate
//! steps as a real peer connection. The link connects once both sides hold
//! a local and a remote description and have each applied at least one
//! remote candidate. Data sent on one side arrives as
//! [`TransportEvent::Data`] on the other, in order.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    IceCandidate, MediaKind, MediaTrack, PeerTransport, SdpKind, SessionDescription,
    TransportError, TransportEvent, TransportEvents, TransportState,
};

#[derive(Default)]
struct Side {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    local_tracks: Vec<MediaTrack>,
    /// Remote tracks already reported through `Track` events
    remote_tracks: Vec<MediaTrack>,
    gathered: bool,
    version: u32,
}

#[derive(Default)]
struct LinkState {
    sides: [Side; 2],
    channel: Option<String>,
    connected: bool,
    channel_open: bool,
    closed: bool,
}

struct Link {
    state: Mutex<LinkState>,
    events: [mpsc::UnboundedSender<TransportEvent>; 2],
}

impl Link {
    fn emit(&self, side: usize, event: TransportEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.events[side].send(event);
    }

    fn emit_both(&self, event: TransportEvent) {
        self.emit(0, event.clone());
        self.emit(1, event);
    }
}

/// One endpoint of an in-memory link
pub struct MemoryTransport {
    side: usize,
    link: Arc<Link>,
}

impl MemoryTransport {
    /// Create two linked endpoints with their event streams
    pub fn pair() -> ((MemoryTransport, TransportEvents), (MemoryTransport, TransportEvents)) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            state: Mutex::new(LinkState::default()),
            events: [tx_a, tx_b],
        });

        (
            (
                MemoryTransport {
                    side: 0,
                    link: link.clone(),
                },
                rx_a,
            ),
            (MemoryTransport { side: 1, link }, rx_b),
        )
    }

    fn other(&self) -> usize {
        1 - self.side
    }

    /// Whether the link has connected
    pub fn is_connected(&self) -> bool {
        self.link.state.lock().connected
    }

    /// Simulate a network failure on the link.
    ///
    /// Both sides see `Disconnected` if the link had connected, `Failed`
    /// otherwise.
    pub fn fail_link(&self) {
        let mut state = self.link.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        if state.channel_open {
            state.channel_open = false;
            self.link.emit_both(TransportEvent::DataChannelClosed);
        }
        let lost = if state.connected {
            TransportState::Disconnected
        } else {
            TransportState::Failed
        };
        state.connected = false;
        self.link.emit_both(TransportEvent::StateChanged(lost));
    }

    fn describe(&self, state: &mut LinkState, kind: SdpKind) -> SessionDescription {
        let side = &mut state.sides[self.side];
        side.version += 1;

        let mut sdp = format!("v=0\r\no=memory {} {}\r\n", self.side, side.version);
        for track in &side.local_tracks {
            let kind = match track.kind {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            };
            sdp.push_str(&format!("a=track:{}:{}\r\n", kind, track.id));
        }
        if let Some(label) = &state.channel {
            sdp.push_str(&format!("a=datachannel:{}\r\n", label));
        }

        match kind {
            SdpKind::Offer => SessionDescription::offer(sdp),
            SdpKind::Answer => SessionDescription::answer(sdp),
        }
    }

    fn gather(&self, state: &mut LinkState) {
        let side = &mut state.sides[self.side];
        if side.gathered {
            return;
        }
        side.gathered = true;

        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.side + 1,
                9000 + self.side
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        self.link
            .emit(self.side, TransportEvent::LocalCandidate(candidate));
    }

    fn check_connected(&self, state: &mut LinkState) {
        if !state.connected {
            let ready = state.sides.iter().all(|s| {
                s.local.is_some() && s.remote.is_some() && s.remote_candidates > 0
            });
            if !ready {
                return;
            }
            state.connected = true;
            debug!("Memory link connected");
            self.link
                .emit_both(TransportEvent::StateChanged(TransportState::Connected));
        }

        if state.channel.is_some() && !state.channel_open {
            state.channel_open = true;
            self.link.emit_both(TransportEvent::DataChannelOpen);
        }
    }
}

fn parse_tracks(sdp: &str) -> Vec<MediaTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=track:"))
        .filter_map(|rest| rest.split_once(':'))
        .filter_map(|(kind, id)| match kind {
            "audio" => Some(MediaTrack::audio(id)),
            "video" => Some(MediaTrack::video(id)),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }

        let offer = self.describe(&mut state, SdpKind::Offer);
        state.sides[self.side].local = Some(offer.clone());
        self.gather(&mut state);
        self.check_connected(&mut state);
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match &state.sides[self.side].remote {
            Some(remote) if remote.kind == SdpKind::Offer => {}
            _ => return Err(TransportError::Description("no remote offer to answer".into())),
        }

        let answer = self.describe(&mut state, SdpKind::Answer);
        state.sides[self.side].local = Some(answer.clone());
        self.gather(&mut state);
        self.check_connected(&mut state);
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(TransportError::Description("malformed sdp".into()));
        }
        if desc.kind == SdpKind::Answer {
            let has_offer = matches!(
                &state.sides[self.side].local,
                Some(local) if local.kind == SdpKind::Offer
            );
            if !has_offer {
                return Err(TransportError::Description("answer without local offer".into()));
            }
        }

        let tracks = parse_tracks(&desc.sdp);
        let side = &mut state.sides[self.side];
        for track in &tracks {
            if !side.remote_tracks.contains(track) {
                self.link
                    .emit(self.side, TransportEvent::Track(track.clone()));
            }
        }
        for track in &side.remote_tracks {
            if !tracks.contains(track) {
                self.link
                    .emit(self.side, TransportEvent::TrackRemoved(track.id.clone()));
            }
        }
        side.remote_tracks = tracks;
        side.remote = Some(desc);

        self.check_connected(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.sides[self.side].remote.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        if candidate.candidate.is_empty() {
            return Err(TransportError::Candidate("empty candidate".into()));
        }

        state.sides[self.side].remote_candidates += 1;
        self.check_connected(&mut state);
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.channel.is_none() {
            state.channel = Some(label.to_string());
        }
        if state.connected {
            self.check_connected(&mut state);
        }
        Ok(())
    }

    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        let side = &mut state.sides[self.side];
        for track in tracks {
            if !side.local_tracks.contains(track) {
                side.local_tracks.push(track.clone());
            }
        }
        Ok(())
    }

    async fn remove_tracks(&self) -> Result<(), TransportError> {
        self.link.state.lock().sides[self.side].local_tracks.clear();
        Ok(())
    }

    async fn send_data(&self, text: String) -> Result<(), TransportError> {
        let state = self.link.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if !state.channel_open {
            return Err(TransportError::ChannelNotOpen);
        }
        self.link.events[self.other()]
            .send(TransportEvent::Data(text))
            .map_err(|_| TransportError::SendFailed("peer endpoint dropped".into()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        if state.channel_open {
            state.channel_open = false;
            self.link.emit_both(TransportEvent::DataChannelClosed);
        }
        state.connected = false;
        self.link
            .emit(self.side, TransportEvent::StateChanged(TransportState::Closed));
        self.link.emit(
            self.other(),
            TransportEvent::StateChanged(TransportState::Disconnected),
        );
        Ok(())
    }
}
