//! WebRTC backend
//!
//! Wraps a `webrtc` peer connection. Candidates are trickled as they are
//! gathered; the data channel is created ordered with full reliability.
//! Sends wait on the channel's buffered amount through a [`SendWindow`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    IceCandidate, MediaKind, MediaTrack, PeerTransport, SendWindow, SessionDescription,
    TransportError, TransportEvent, TransportEvents, TransportState,
};

/// Media stream id used for every local track
const STREAM_ID: &str = "peerlink";

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn backend(e: webrtc::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

/// Remote tracks reported to the owner; each one is removed at most once
#[derive(Default)]
struct RemoteTracks {
    live: parking_lot::Mutex<HashMap<String, MediaKind>>,
}

impl RemoteTracks {
    fn added(&self, track: MediaTrack) -> Option<TransportEvent> {
        let mut live = self.live.lock();
        if live.contains_key(&track.id) {
            return None;
        }
        live.insert(track.id.clone(), track.kind);
        Some(TransportEvent::Track(track))
    }

    fn ended(&self, id: &str) -> Option<TransportEvent> {
        self.live
            .lock()
            .remove(id)
            .map(|_| TransportEvent::TrackRemoved(id.to_string()))
    }

    /// Drop every live track the remote side no longer sends
    fn retain_sending(&self, sending: &HashSet<String>) -> Vec<TransportEvent> {
        let mut live = self.live.lock();
        let gone: Vec<String> = live
            .keys()
            .filter(|id| !sending.contains(*id))
            .cloned()
            .collect();
        gone.into_iter()
            .map(|id| {
                live.remove(&id);
                TransportEvent::TrackRemoved(id)
            })
            .collect()
    }
}

/// Track ids from `a=msid` lines of media sections the remote side sends on
fn sending_track_ids(sdp: &str) -> HashSet<String> {
    let mut ids = HashSet::new();
    for section in sdp.split("\nm=").skip(1) {
        let mut sending = true;
        let mut tracks = Vec::new();
        for line in section.lines().map(str::trim_end) {
            match line {
                "a=inactive" | "a=recvonly" => sending = false,
                _ => {
                    if let Some((_, track)) =
                        line.strip_prefix("a=msid:").and_then(|m| m.split_once(' '))
                    {
                        tracks.push(track.to_string());
                    }
                }
            }
        }
        if sending {
            ids.extend(tracks);
        }
    }
    ids
}

/// Peer connection backed by the `webrtc` crate
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    remote_tracks: Arc<RemoteTracks>,
    window: SendWindow,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcTransport {
    /// Create a peer connection using the given STUN servers
    pub async fn new(stun_servers: &[String]) -> Result<(Self, TransportEvents), TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(backend)?);

        let (events, rx) = mpsc::unbounded_channel();
        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        let remote_tracks = Arc::new(RemoteTracks::default());

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => TransportState::New,
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                    _ => return,
                };
                info!("Peer connection state: {:?}", mapped);
                let _ = tx.send(TransportEvent::StateChanged(mapped));
            })
        }));

        let tx = events.clone();
        let tracks = remote_tracks.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let tracks = tracks.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let id = track.id();
                if let Some(event) = tracks.added(MediaTrack { id: id.clone(), kind }) {
                    let _ = tx.send(event);
                }

                // Reads end once the remote stops sending or the receiver is torn down
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    debug!("Remote track {} ended", id);
                    if let Some(event) = tracks.ended(&id) {
                        let _ = tx.send(event);
                    }
                });
            })
        }));

        // Answering side receives the channel the offerer created
        let tx = events.clone();
        let slot = channel.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let slot = slot.clone();
            Box::pin(async move {
                debug!("Remote data channel: {}", dc.label());
                attach_channel(dc, slot, tx).await;
            })
        }));

        Ok((
            Self {
                pc,
                channel,
                senders: Mutex::new(Vec::new()),
                remote_tracks,
                window: SendWindow::default(),
                events,
            },
            rx,
        ))
    }
}

async fn attach_channel(
    dc: Arc<RTCDataChannel>,
    slot: ChannelSlot,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let _ = tx.send(TransportEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let _ = tx.send(TransportEvent::DataChannelClosed);
        Box::pin(async {})
    }));

    let tx = events;
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!("Ignoring binary data channel message");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(TransportEvent::Data(text));
                }
                Err(_) => warn!("Data channel message is not UTF-8"),
            }
        })
    }));

    *slot.lock().await = Some(dc);
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let sending = sending_track_ids(&desc.sdp);
        let remote = match desc.kind {
            super::SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            super::SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| TransportError::Description(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;

        for event in self.remote_tracks.retain_sending(&sending) {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn open_data_channel(&self, label: &str) -> Result<(), TransportError> {
        if self.channel.lock().await.is_some() {
            return Ok(());
        }
        // Ordered and fully reliable: no max_retransmits / max_packet_life_time
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(backend)?;

        attach_channel(dc, self.channel.clone(), self.events.clone()).await;
        Ok(())
    }

    async fn add_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError> {
        let mut senders = self.senders.lock().await;
        for track in tracks {
            let mime_type = match track.kind {
                MediaKind::Audio => MIME_TYPE_OPUS,
                MediaKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                STREAM_ID.to_owned(),
            ));
            let sender = self
                .pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| TransportError::Media(e.to_string()))?;
            senders.push(sender);
        }
        Ok(())
    }

    async fn remove_tracks(&self) -> Result<(), TransportError> {
        let mut senders = self.senders.lock().await;
        for sender in senders.drain(..) {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| TransportError::Media(e.to_string()))?;
        }
        Ok(())
    }

    async fn send_data(&self, text: String) -> Result<(), TransportError> {
        let channel = self.channel.lock().await.clone();
        let dc = channel.ok_or(TransportError::ChannelNotOpen)?;

        self.window
            .reserve(text.len(), || {
                let dc = dc.clone();
                async move {
                    if dc.ready_state() == RTCDataChannelState::Open {
                        Some(dc.buffered_amount().await)
                    } else {
                        None
                    }
                }
            })
            .await?;

        dc.send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(backend)
    }
}
