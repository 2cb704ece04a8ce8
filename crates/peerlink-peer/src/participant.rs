//! Session participant
//!
//! One actor task per joined session. It owns the negotiation engine and
//! the transfer receiver, and serializes relay signals, transport events,
//! caller commands, and a periodic idle sweep through a single `select!`
//! loop. Outgoing files are read by spawned tasks that report back to the
//! actor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerlink_core::{Role, Transfer, TransferConfig, TransferError, TransferStatus};
use peerlink_signal::{SignalKind, SignalMessage};

use crate::negotiation::{NegotiationEngine, NegotiationError, NegotiationState};
use crate::signaling::{RelayApi, SignalChannel};
use crate::transfer::{
    prepare_outgoing, save_completed, ChunkSender, ReceiveEvent, TransferReceiver, TransferStats,
    TransferStatsSnapshot,
};
use crate::transport::{MediaTrack, PeerTransport, TransportError, TransportEvent, TransportEvents};

/// Capacity of the participant event broadcast
const EVENT_CAPACITY: usize = 256;

/// Capacity of the caller command queue
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("direct channel is not open")]
    ChannelNotOpen,

    #[error("participant has shut down")]
    Closed,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// What a participant needs to know about its session
#[derive(Clone)]
pub struct ParticipantOptions {
    pub session_id: String,
    pub role: Role,
    pub transfer: TransferConfig,
    /// Where received files are written
    pub download_dir: PathBuf,
    /// Relay API for transfer bookkeeping; skipped when absent
    pub api: Option<RelayApi>,
}

/// Notifications for the participant's owner
#[derive(Clone, Debug, PartialEq)]
pub enum ParticipantEvent {
    /// The relay confirmed our join
    Joined { session_id: String, role: Role },
    /// Another participant joined the session
    PeerJoined { role: Role },
    /// The relay refused a request
    SessionError(String),
    StateChanged(NegotiationState),
    DataChannelOpen,
    DataChannelClosed,
    RemoteTrack(MediaTrack),
    RemoteTrackRemoved(String),
    /// A transfer started, progressed, or finished
    TransferUpdated(Transfer),
    /// An incoming file was written to disk
    FileReceived { transfer: Transfer, path: PathBuf },
    Closed,
}

enum Command {
    SendFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<Transfer, ParticipantError>>,
    },
    SetTracks {
        tracks: Vec<MediaTrack>,
        reply: oneshot::Sender<Result<(), ParticipantError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Progress reports from outgoing send tasks
enum SendReport {
    Progress(Transfer),
    Finished {
        transfer: Transfer,
        error: Option<TransferError>,
    },
}

struct Outgoing {
    transfer: Transfer,
    task: JoinHandle<()>,
}

/// Handle to a running participant
#[derive(Clone)]
pub struct ParticipantHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ParticipantEvent>,
    stats: Arc<TransferStats>,
}

impl ParticipantHandle {
    /// Start a participant and send its join request.
    ///
    /// The returned receiver sees every event from the first one on.
    pub fn spawn(
        options: ParticipantOptions,
        transport: Arc<dyn PeerTransport>,
        transport_events: TransportEvents,
        signals: SignalChannel,
    ) -> (Self, broadcast::Receiver<ParticipantEvent>) {
        let (events, first_rx) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (reports, report_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(TransferStats::default());

        let engine = NegotiationEngine::new(
            options.role,
            options.session_id.clone(),
            transport.clone(),
            signals.outbound.clone(),
        );
        let participant = Participant {
            receiver: TransferReceiver::new(&options.transfer),
            options,
            engine,
            transport,
            signals_out: signals.outbound,
            events: events.clone(),
            stats: stats.clone(),
            reports,
            outgoing: HashMap::new(),
            channel_open: false,
            last_state: NegotiationState::Idle,
        };

        tokio::spawn(participant.run(signals.inbound, transport_events, command_rx, report_rx));

        (
            Self {
                commands,
                events,
                stats,
            },
            first_rx,
        )
    }

    /// Validate a file and start sending it to the peer
    pub async fn send_file(&self, path: impl Into<PathBuf>) -> Result<Transfer, ParticipantError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SendFile {
            path: path.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ParticipantError::Closed)?
    }

    /// Share media tracks with the viewer (host only)
    pub async fn start_share(&self, tracks: Vec<MediaTrack>) -> Result<(), ParticipantError> {
        self.set_tracks(tracks).await
    }

    pub async fn stop_share(&self) -> Result<(), ParticipantError> {
        self.set_tracks(Vec::new()).await
    }

    /// Leave the session; in-flight transfers fail
    pub async fn close(&self) -> Result<(), ParticipantError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply }).await?;
        rx.await.map_err(|_| ParticipantError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParticipantEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.stats.snapshot()
    }

    async fn set_tracks(&self, tracks: Vec<MediaTrack>) -> Result<(), ParticipantError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetTracks { tracks, reply }).await?;
        rx.await.map_err(|_| ParticipantError::Closed)?
    }

    async fn request(&self, command: Command) -> Result<(), ParticipantError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ParticipantError::Closed)
    }
}

struct Participant {
    options: ParticipantOptions,
    engine: NegotiationEngine,
    transport: Arc<dyn PeerTransport>,
    signals_out: mpsc::Sender<SignalMessage>,
    receiver: TransferReceiver,
    events: broadcast::Sender<ParticipantEvent>,
    stats: Arc<TransferStats>,
    reports: mpsc::UnboundedSender<SendReport>,
    outgoing: HashMap<String, Outgoing>,
    channel_open: bool,
    last_state: NegotiationState,
}

impl Participant {
    async fn run(
        mut self,
        mut signals_in: mpsc::Receiver<SignalMessage>,
        mut transport_events: TransportEvents,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::UnboundedReceiver<SendReport>,
    ) {
        let join = SignalMessage::join(self.options.session_id.clone(), self.options.role);
        if self.signals_out.send(join).await.is_err() {
            warn!("Relay connection closed before join");
        }

        let mut sweep = tokio::time::interval(self.options.transfer.sweep_interval());
        let mut relay_open = true;
        let mut transport_open = true;

        loop {
            tokio::select! {
                msg = signals_in.recv(), if relay_open => match msg {
                    Some(msg) => self.on_signal(msg).await,
                    None => {
                        // An established direct channel outlives the relay
                        info!("Relay connection closed");
                        relay_open = false;
                    }
                },
                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => transport_open = false,
                },
                report = reports.recv() => {
                    if let Some(report) = report {
                        self.on_report(report);
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = sweep.tick() => {
                    for event in self.receiver.expire_idle(Instant::now()) {
                        self.on_receive_event(event).await;
                    }
                }
            }
        }
        debug!("Participant for {} stopped", self.options.session_id);
    }

    async fn on_signal(&mut self, msg: SignalMessage) {
        match msg.kind {
            SignalKind::SessionJoined if !msg.participant_joined_flag() => {
                let session_id = msg
                    .session_id
                    .clone()
                    .unwrap_or_else(|| self.options.session_id.clone());
                info!("Joined session {} as {}", session_id, self.options.role);
                self.emit(ParticipantEvent::Joined {
                    session_id,
                    role: self.options.role,
                });
                return;
            }
            SignalKind::SessionJoined => {
                self.emit(ParticipantEvent::PeerJoined { role: msg.role() });
            }
            SignalKind::SessionError => {
                let message = msg.error_message().unwrap_or("unknown error").to_string();
                warn!("Relay error: {}", message);
                self.emit(ParticipantEvent::SessionError(message));
                return;
            }
            _ => {}
        }

        if let Err(e) = self.engine.handle_signal(&msg).await {
            warn!("Failed to handle {:?}: {}", msg.kind, e);
        }
        self.check_state();
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        if let Err(e) = self.engine.handle_transport_event(&event).await {
            warn!("Failed to handle transport event: {}", e);
        }

        match event {
            TransportEvent::DataChannelOpen => {
                if !self.channel_open {
                    info!("Direct channel open");
                    self.channel_open = true;
                    self.emit(ParticipantEvent::DataChannelOpen);
                }
            }
            TransportEvent::DataChannelClosed => {
                if self.channel_open {
                    info!("Direct channel closed");
                    self.channel_open = false;
                    self.fail_transfers(TransferError::ChannelClosed).await;
                    self.emit(ParticipantEvent::DataChannelClosed);
                }
            }
            TransportEvent::Track(track) => self.emit(ParticipantEvent::RemoteTrack(track)),
            TransportEvent::TrackRemoved(id) => self.emit(ParticipantEvent::RemoteTrackRemoved(id)),
            TransportEvent::Data(text) => match self.receiver.handle_text(&text) {
                Ok(Some(event)) => self.on_receive_event(event).await,
                Ok(None) => {}
                Err(e) => warn!("Ignoring malformed transfer frame: {}", e),
            },
            TransportEvent::LocalCandidate(_) | TransportEvent::StateChanged(_) => {}
        }

        self.check_state();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendFile { path, reply } => {
                let _ = reply.send(self.start_send(path).await);
            }
            Command::SetTracks { tracks, reply } => {
                let result: Result<(), ParticipantError> =
                    self.engine.set_local_tracks(tracks).await.map_err(Into::into);
                self.check_state();
                let _ = reply.send(result);
            }
            Command::Close { .. } => {}
        }
    }

    async fn start_send(&mut self, path: PathBuf) -> Result<Transfer, ParticipantError> {
        if !self.channel_open {
            return Err(ParticipantError::ChannelNotOpen);
        }

        let config = &self.options.transfer;
        let prepared = prepare_outgoing(&path, config).await?;
        let sender = ChunkSender::open(&prepared, config.verify_checksum).await?;
        let transfer = sender.transfer().clone();
        info!(
            "Sending {} ({} bytes) as transfer {}",
            transfer.filename, transfer.total_size, transfer.id
        );

        let bookkeeping = self
            .options
            .api
            .clone()
            .map(|api| (api, self.options.session_id.clone()));
        let task = tokio::spawn(run_send(
            sender,
            self.transport.clone(),
            self.reports.clone(),
            bookkeeping,
        ));

        self.outgoing.insert(
            transfer.id.clone(),
            Outgoing {
                transfer: transfer.clone(),
                task,
            },
        );
        self.emit(ParticipantEvent::TransferUpdated(transfer.clone()));
        Ok(transfer)
    }

    fn on_report(&mut self, report: SendReport) {
        match report {
            SendReport::Progress(transfer) => {
                // Reports from aborted tasks may still be queued
                if let Some(outgoing) = self.outgoing.get_mut(&transfer.id) {
                    outgoing.transfer = transfer.clone();
                    self.emit(ParticipantEvent::TransferUpdated(transfer));
                }
            }
            SendReport::Finished { transfer, error } => {
                if self.outgoing.remove(&transfer.id).is_none() {
                    return;
                }
                match error {
                    None => {
                        info!("Sent {} ({} bytes)", transfer.filename, transfer.total_size);
                        self.stats.record_sent(transfer.total_size);
                    }
                    Some(e) => {
                        warn!("Sending {} failed: {}", transfer.filename, e);
                        self.stats.record_failed();
                    }
                }
                self.emit(ParticipantEvent::TransferUpdated(transfer));
            }
        }
    }

    async fn on_receive_event(&mut self, event: ReceiveEvent) {
        match event {
            ReceiveEvent::Started(transfer) | ReceiveEvent::Progress(transfer) => {
                self.emit(ParticipantEvent::TransferUpdated(transfer));
            }
            ReceiveEvent::Completed(file) => {
                match save_completed(&self.options.download_dir, &file).await {
                    Ok(path) => {
                        self.stats.record_received(file.transfer.total_size);
                        self.emit(ParticipantEvent::TransferUpdated(file.transfer.clone()));
                        self.emit(ParticipantEvent::FileReceived {
                            transfer: file.transfer,
                            path,
                        });
                    }
                    Err(e) => {
                        warn!("Could not save {}: {}", file.transfer.filename, e);
                        let mut transfer = file.transfer;
                        transfer.status = TransferStatus::Failed;
                        self.stats.record_failed();
                        self.emit(ParticipantEvent::TransferUpdated(transfer));
                    }
                }
            }
            ReceiveEvent::Failed { transfer, .. } => {
                self.stats.record_failed();
                self.emit(ParticipantEvent::TransferUpdated(transfer));
            }
            ReceiveEvent::Rejected { transfer_id, error } => {
                warn!("Refused frame for transfer {}: {}", transfer_id, error);
            }
        }
    }

    /// Fail every in-flight transfer in both directions
    async fn fail_transfers(&mut self, error: TransferError) {
        for (_, outgoing) in self.outgoing.drain() {
            outgoing.task.abort();
            let mut transfer = outgoing.transfer;
            transfer.status = TransferStatus::Failed;
            self.stats.record_failed();
            let _ = self.events.send(ParticipantEvent::TransferUpdated(transfer));
        }

        for event in self.receiver.fail_all(error) {
            self.on_receive_event(event).await;
        }
    }

    fn check_state(&mut self) {
        let state = self.engine.state();
        if state != self.last_state {
            self.last_state = state;
            self.emit(ParticipantEvent::StateChanged(state));
        }
    }

    async fn shutdown(&mut self) {
        info!("Leaving session {}", self.options.session_id);
        self.fail_transfers(TransferError::Cancelled("session closed".into()))
            .await;
        if let Err(e) = self.engine.close().await {
            warn!("Error closing transport: {}", e);
        }
        self.check_state();
        self.emit(ParticipantEvent::Closed);
    }

    fn emit(&self, event: ParticipantEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Stream one file's frames onto the data channel
async fn run_send(
    mut sender: ChunkSender<tokio::fs::File>,
    transport: Arc<dyn PeerTransport>,
    reports: mpsc::UnboundedSender<SendReport>,
    bookkeeping: Option<(RelayApi, String)>,
) {
    let record_id = match &bookkeeping {
        Some((api, session_id)) => {
            let t = sender.transfer();
            match api.create_transfer_record(session_id, &t.filename, t.total_size).await {
                Ok(record) => Some(record.transfer_id),
                Err(e) => {
                    warn!("Could not create transfer record: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    let result = send_frames(&mut sender, transport.as_ref(), &reports).await;

    let mut transfer = sender.transfer().clone();
    let error = result.err();
    transfer.status = if error.is_some() {
        TransferStatus::Failed
    } else {
        TransferStatus::Completed
    };

    if let (Some((api, _)), Some(record_id)) = (&bookkeeping, record_id) {
        let progress = (error.is_none()).then_some(100);
        if let Err(e) = api
            .update_transfer_record(&record_id, progress, Some(transfer.status))
            .await
        {
            warn!("Could not update transfer record: {}", e);
        }
    }

    let _ = reports.send(SendReport::Finished { transfer, error });
}

async fn send_frames(
    sender: &mut ChunkSender<tokio::fs::File>,
    transport: &dyn PeerTransport,
    reports: &mpsc::UnboundedSender<SendReport>,
) -> Result<(), TransferError> {
    send_frame(transport, sender.start_frame().encode()?).await?;
    while let Some(frame) = sender.next_frame().await? {
        send_frame(transport, frame.encode()?).await?;
        let _ = reports.send(SendReport::Progress(sender.transfer().clone()));
    }
    Ok(())
}

async fn send_frame(transport: &dyn PeerTransport, text: String) -> Result<(), TransferError> {
    transport.send_data(text).await.map_err(|e| match e {
        TransportError::ChannelNotOpen | TransportError::Closed => TransferError::ChannelClosed,
        other => TransferError::Io(other.to_string()),
    })
}
