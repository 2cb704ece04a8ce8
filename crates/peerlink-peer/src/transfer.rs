//! Chunked file transfer over the direct channel
//!
//! Sending side reads the file one chunk at a time and emits
//! `start`, `chunk`..., `complete` frames in order. Receiving side
//! reassembles into a buffer sized from the start frame and only exposes
//! the file once every byte has arrived.
//!
//! Several transfers may be in flight on one channel; frames are keyed by
//! transfer ID and a failure only affects its own transfer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use peerlink_core::ids::generate_transfer_id;
use peerlink_core::protocol::{chunk_count, expected_chunk_len, TransferFrame};
use peerlink_core::{
    guess_mime_type, ProtocolError, Transfer, TransferConfig, TransferDirection, TransferError,
    TransferStatus, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
};

/// Transfer statistics
#[derive(Debug, Default)]
pub struct TransferStats {
    pub files_sent: AtomicU64,
    pub files_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub transfers_failed: AtomicU64,
}

impl TransferStats {
    pub fn record_sent(&self, bytes: u64) {
        self.files_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.files_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot for reporting
    pub fn snapshot(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            files_sent: self.files_sent.load(Ordering::Relaxed),
            files_received: self.files_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of transfer stats
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    pub files_sent: u64,
    pub files_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub transfers_failed: u64,
}

impl TransferStatsSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }

    /// Percentage of finished transfers that succeeded
    pub fn success_rate(&self) -> f64 {
        let done = self.files_sent + self.files_received;
        let total = done + self.transfers_failed;
        if total == 0 {
            100.0
        } else {
            (done as f64 / total as f64) * 100.0
        }
    }
}

/// A validated local file ready to be sent
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub transfer: Transfer,
}

/// Validate a file for sending and assign it a transfer ID
pub async fn prepare_outgoing(path: &Path, config: &TransferConfig) -> Result<OutgoingFile, TransferError> {
    let chunk_size = config.chunk_size;
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::InvalidChunkSize(chunk_size as u64));
    }

    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(TransferError::InvalidFile(format!("{} is not a file", path.display())));
    }
    let size = metadata.len();
    if size > config.max_file_size {
        return Err(TransferError::FileTooLarge {
            size,
            max: config.max_file_size,
        });
    }

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| TransferError::InvalidFile(format!("{} has no usable name", path.display())))?
        .to_string();

    let id = generate_transfer_id().map_err(|e| TransferError::Io(e.to_string()))?;
    let transfer = Transfer::new(
        id,
        filename,
        size,
        guess_mime_type(path).to_string(),
        chunk_size as u64,
        TransferDirection::Outgoing,
    );

    Ok(OutgoingFile {
        path: path.to_path_buf(),
        transfer,
    })
}

/// Produces the frames of one outgoing transfer, in order
pub struct ChunkSender<R> {
    reader: R,
    transfer: Transfer,
    next_index: u64,
    total_chunks: u64,
    hasher: Option<blake3::Hasher>,
    finished: bool,
}

impl ChunkSender<File> {
    /// Open a prepared file for sending
    pub async fn open(outgoing: &OutgoingFile, checksum: bool) -> Result<Self, TransferError> {
        let file = File::open(&outgoing.path).await?;
        Ok(Self::new(file, outgoing.transfer.clone(), checksum))
    }
}

impl<R: AsyncRead + Unpin> ChunkSender<R> {
    pub fn new(reader: R, mut transfer: Transfer, checksum: bool) -> Self {
        let total_chunks = chunk_count(transfer.total_size, transfer.chunk_size);
        transfer.status = TransferStatus::Active;
        Self {
            reader,
            transfer,
            next_index: 0,
            total_chunks,
            hasher: checksum.then(blake3::Hasher::new),
            finished: false,
        }
    }

    /// Frame announcing the transfer
    pub fn start_frame(&self) -> TransferFrame {
        let chunk_size = (self.transfer.chunk_size != DEFAULT_CHUNK_SIZE as u64)
            .then_some(self.transfer.chunk_size);
        TransferFrame::Start {
            transfer_id: self.transfer.id.clone(),
            filename: self.transfer.filename.clone(),
            file_size: self.transfer.total_size,
            file_type: self.transfer.mime_type.clone(),
            chunk_size,
        }
    }

    /// Next chunk frame, then the complete frame, then `None`
    pub async fn next_frame(&mut self) -> Result<Option<TransferFrame>, TransferError> {
        if self.finished {
            return Ok(None);
        }

        if self.next_index < self.total_chunks {
            let index = self.next_index;
            let len = expected_chunk_len(self.transfer.total_size, self.transfer.chunk_size, index);
            let mut chunk = vec![0u8; len];
            self.reader.read_exact(&mut chunk).await?;

            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&chunk);
            }
            self.next_index += 1;
            self.transfer.bytes_transferred += len as u64;

            return Ok(Some(TransferFrame::Chunk {
                transfer_id: self.transfer.id.clone(),
                chunk_index: index,
                chunk,
            }));
        }

        // Final status is decided by the caller once the frame is delivered
        self.finished = true;
        Ok(Some(TransferFrame::Complete {
            transfer_id: self.transfer.id.clone(),
            checksum: self.hasher.take().map(|h| h.finalize().to_hex().to_string()),
        }))
    }

    pub fn bytes_sent(&self) -> u64 {
        self.transfer.bytes_transferred
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }
}

/// A fully received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub transfer: Transfer,
    pub data: Vec<u8>,
}

/// Outcome of feeding one frame to the receiver
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveEvent {
    Started(Transfer),
    Progress(Transfer),
    Completed(CompletedFile),
    /// An accepted transfer failed; its partial data is gone
    Failed { transfer: Transfer, error: TransferError },
    /// A frame was refused without an accepted transfer behind it
    Rejected { transfer_id: String, error: TransferError },
}

struct Incoming {
    transfer: Transfer,
    buffer: Vec<u8>,
    received: Vec<bool>,
    last_activity: Instant,
}

/// Reassembles incoming transfers
pub struct TransferReceiver {
    max_file_size: u64,
    idle_timeout: Duration,
    verify_checksum: bool,
    active: HashMap<String, Incoming>,
    /// Completed, failed, or rejected IDs with when they finished. Late
    /// frames for these are dropped until the entry ages out.
    finished: HashMap<String, Instant>,
}

impl TransferReceiver {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            idle_timeout: config.idle_timeout(),
            verify_checksum: config.verify_checksum,
            active: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    /// Decode and apply a text message from the data channel
    pub fn handle_text(&mut self, text: &str) -> Result<Option<ReceiveEvent>, ProtocolError> {
        let frame = TransferFrame::decode(text)?;
        Ok(self.handle_frame(frame))
    }

    pub fn handle_frame(&mut self, frame: TransferFrame) -> Option<ReceiveEvent> {
        match frame {
            TransferFrame::Start {
                transfer_id,
                filename,
                file_size,
                file_type,
                chunk_size,
            } => Some(self.start(transfer_id, filename, file_size, file_type, chunk_size)),
            TransferFrame::Chunk {
                transfer_id,
                chunk_index,
                chunk,
            } => self.chunk(transfer_id, chunk_index, chunk),
            TransferFrame::Complete {
                transfer_id,
                checksum,
            } => self.complete(transfer_id, checksum),
        }
    }

    fn start(
        &mut self,
        transfer_id: String,
        filename: String,
        file_size: u64,
        file_type: String,
        chunk_size: Option<u64>,
    ) -> ReceiveEvent {
        if self.active.contains_key(&transfer_id) || self.finished.contains_key(&transfer_id) {
            return ReceiveEvent::Rejected {
                error: TransferError::DuplicateTransfer(transfer_id.clone()),
                transfer_id,
            };
        }

        let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE as u64);
        let error = if file_size > self.max_file_size {
            Some(TransferError::FileTooLarge {
                size: file_size,
                max: self.max_file_size,
            })
        } else if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE as u64 {
            Some(TransferError::InvalidChunkSize(chunk_size))
        } else if filename.trim().is_empty() {
            Some(TransferError::InvalidFile("empty filename".into()))
        } else {
            None
        };
        if let Some(error) = error {
            warn!("Rejecting incoming transfer {}: {}", transfer_id, error);
            self.finished.insert(transfer_id.clone(), Instant::now());
            return ReceiveEvent::Rejected { transfer_id, error };
        }

        let mime_type = if file_type.is_empty() {
            guess_mime_type(Path::new(&filename)).to_string()
        } else {
            file_type
        };
        let mut transfer = Transfer::new(
            transfer_id.clone(),
            filename,
            file_size,
            mime_type,
            chunk_size,
            TransferDirection::Incoming,
        );
        transfer.status = TransferStatus::Active;

        info!(
            "Receiving {} ({} bytes) as transfer {}",
            transfer.filename, file_size, transfer_id
        );
        let chunks = chunk_count(file_size, chunk_size) as usize;
        self.active.insert(
            transfer_id,
            Incoming {
                transfer: transfer.clone(),
                buffer: vec![0u8; file_size as usize],
                received: vec![false; chunks],
                last_activity: Instant::now(),
            },
        );
        ReceiveEvent::Started(transfer)
    }

    fn chunk(&mut self, transfer_id: String, index: u64, chunk: Vec<u8>) -> Option<ReceiveEvent> {
        if self.finished.contains_key(&transfer_id) {
            debug!("Dropping chunk for finished transfer {}", transfer_id);
            return None;
        }
        let Some(incoming) = self.active.get_mut(&transfer_id) else {
            return Some(ReceiveEvent::Rejected {
                error: TransferError::UnknownTransfer(transfer_id.clone()),
                transfer_id,
            });
        };
        incoming.last_activity = Instant::now();

        let t = &incoming.transfer;
        let total = incoming.received.len() as u64;
        if index >= total {
            let error = TransferError::ChunkOutOfRange { index, total };
            return Some(self.fail(&transfer_id, error));
        }
        let expected = expected_chunk_len(t.total_size, t.chunk_size, index);
        if chunk.len() != expected {
            let error = TransferError::ChunkSizeMismatch {
                index,
                expected,
                actual: chunk.len(),
            };
            return Some(self.fail(&transfer_id, error));
        }

        if incoming.received[index as usize] {
            debug!("Duplicate chunk {} for {}", index, transfer_id);
            return None;
        }

        let offset = (index * t.chunk_size) as usize;
        incoming.buffer[offset..offset + expected].copy_from_slice(&chunk);
        incoming.received[index as usize] = true;
        incoming.transfer.bytes_transferred += expected as u64;

        Some(ReceiveEvent::Progress(incoming.transfer.clone()))
    }

    fn complete(&mut self, transfer_id: String, checksum: Option<String>) -> Option<ReceiveEvent> {
        if self.finished.contains_key(&transfer_id) {
            return None;
        }
        let Some(incoming) = self.active.get(&transfer_id) else {
            return Some(ReceiveEvent::Rejected {
                error: TransferError::UnknownTransfer(transfer_id.clone()),
                transfer_id,
            });
        };

        let t = &incoming.transfer;
        if t.bytes_transferred != t.total_size {
            let error = TransferError::Incomplete {
                received: t.bytes_transferred,
                total: t.total_size,
            };
            return Some(self.fail(&transfer_id, error));
        }

        if let (true, Some(expected)) = (self.verify_checksum, checksum.as_deref()) {
            let actual = blake3::hash(&incoming.buffer).to_hex();
            if !actual.as_str().eq_ignore_ascii_case(expected) {
                return Some(self.fail(&transfer_id, TransferError::ChecksumMismatch));
            }
        }

        let mut incoming = self.active.remove(&transfer_id)?;
        self.finished.insert(transfer_id, Instant::now());
        incoming.transfer.status = TransferStatus::Completed;
        info!(
            "Transfer {} complete: {}",
            incoming.transfer.id, incoming.transfer.filename
        );

        Some(ReceiveEvent::Completed(CompletedFile {
            transfer: incoming.transfer,
            data: incoming.buffer,
        }))
    }

    /// Fail transfers that have seen no frame within the idle window.
    ///
    /// Finished IDs older than the window are forgotten as well.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<ReceiveEvent> {
        let window = self.idle_timeout;
        self.finished
            .retain(|_, at| now.saturating_duration_since(*at) <= window);

        let idle: Vec<String> = self
            .active
            .iter()
            .filter(|(_, inc)| now.saturating_duration_since(inc.last_activity) > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let secs = self.idle_timeout.as_secs();
        idle.into_iter()
            .map(|id| self.fail(&id, TransferError::IdleTimeout(secs)))
            .collect()
    }

    /// Fail every in-flight transfer, e.g. when the channel closes
    pub fn fail_all(&mut self, error: TransferError) -> Vec<ReceiveEvent> {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        ids.into_iter().map(|id| self.fail(&id, error.clone())).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, transfer_id: &str) -> Option<&Transfer> {
        self.active.get(transfer_id).map(|inc| &inc.transfer)
    }

    fn fail(&mut self, transfer_id: &str, error: TransferError) -> ReceiveEvent {
        self.finished.insert(transfer_id.to_string(), Instant::now());
        match self.active.remove(transfer_id) {
            Some(incoming) => {
                let mut transfer = incoming.transfer;
                transfer.status = TransferStatus::Failed;
                warn!("Transfer {} failed: {}", transfer_id, error);
                ReceiveEvent::Failed { transfer, error }
            }
            None => ReceiveEvent::Rejected {
                transfer_id: transfer_id.to_string(),
                error,
            },
        }
    }
}

/// Write a received file into `dir` without overwriting anything.
///
/// Data goes to a hidden `.part` file first and is renamed into place.
pub async fn save_completed(dir: &Path, file: &CompletedFile) -> Result<PathBuf, TransferError> {
    tokio::fs::create_dir_all(dir).await?;

    let name = sanitize_filename(&file.transfer.filename);
    let target = unique_path(dir, &name).await;
    let partial = dir.join(format!(".{}.{}.part", name, file.transfer.id));

    if let Err(e) = tokio::fs::write(&partial, &file.data).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&partial, &target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }

    info!("Saved {} to {}", file.transfer.filename, target.display());
    Ok(target)
}

/// Strip directories and characters that are unsafe in a file name
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !exists(&candidate).await {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    let mut n = 1;
    loop {
        let numbered = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(numbered);
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const C: u64 = 16;

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: C as usize,
            ..Default::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn outgoing(id: &str, data: &[u8]) -> Transfer {
        Transfer::new(
            id.into(),
            "data.bin".into(),
            data.len() as u64,
            "application/octet-stream".into(),
            C,
            TransferDirection::Outgoing,
        )
    }

    async fn frames_for(id: &str, data: &[u8], checksum: bool) -> Vec<TransferFrame> {
        let mut sender = ChunkSender::new(Cursor::new(data.to_vec()), outgoing(id, data), checksum);
        let mut frames = vec![sender.start_frame()];
        while let Some(frame) = sender.next_frame().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        for n in [0, 1, C - 1, C, C + 1, 10 * C] {
            let data = pattern(n as usize);
            let frames = frames_for("t", &data, true).await;

            let chunks = frames
                .iter()
                .filter(|f| matches!(f, TransferFrame::Chunk { .. }))
                .count() as u64;
            assert_eq!(chunks, n.div_ceil(C), "chunk count for {} bytes", n);

            let mut receiver = TransferReceiver::new(&config());
            let mut last = None;
            for frame in frames {
                // Through the wire format, as the data channel carries it
                let text = frame.encode().unwrap();
                last = receiver.handle_text(&text).unwrap();
            }
            match last {
                Some(ReceiveEvent::Completed(file)) => {
                    assert_eq!(file.data, data, "payload for {} bytes", n);
                    assert_eq!(file.transfer.status, TransferStatus::Completed);
                    assert_eq!(file.transfer.bytes_transferred, n);
                }
                other => panic!("expected completion for {} bytes, got {:?}", n, other),
            }
            assert_eq!(receiver.active_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_sender_progress_and_order() {
        let data = pattern(40);
        let mut sender = ChunkSender::new(Cursor::new(data.clone()), outgoing("t", &data), false);

        let mut indices = Vec::new();
        while let Some(frame) = sender.next_frame().await.unwrap() {
            match frame {
                TransferFrame::Chunk { chunk_index, .. } => indices.push(chunk_index),
                TransferFrame::Complete { checksum, .. } => assert!(checksum.is_none()),
                TransferFrame::Start { .. } => unreachable!(),
            }
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(sender.bytes_sent(), 40);
        assert!((sender.transfer().progress() - 1.0).abs() < f64::EPSILON);
        assert!(sender.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sender_errors_when_file_shrinks() {
        let data = pattern(40);
        let mut sender = ChunkSender::new(Cursor::new(data[..20].to_vec()), outgoing("t", &data), false);
        sender.next_frame().await.unwrap();
        assert!(matches!(sender.next_frame().await, Err(TransferError::Io(_))));
    }

    #[test]
    fn test_start_frame_omits_default_chunk_size() {
        let data = pattern(4);
        let mut transfer = outgoing("t", &data);
        transfer.chunk_size = DEFAULT_CHUNK_SIZE as u64;
        let sender = ChunkSender::new(Cursor::new(data), transfer, false);
        match sender.start_frame() {
            TransferFrame::Start { chunk_size, .. } => assert_eq!(chunk_size, None),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_before_all_bytes_fails() {
        let data = pattern(5 * C as usize);
        let frames = frames_for("t", &data, false).await;
        let mut receiver = TransferReceiver::new(&config());

        receiver.handle_frame(frames[0].clone());
        receiver.handle_frame(frames[1].clone());
        let complete = frames.last().unwrap().clone();

        match receiver.handle_frame(complete) {
            Some(ReceiveEvent::Failed { transfer, error }) => {
                assert_eq!(transfer.status, TransferStatus::Failed);
                assert_eq!(
                    error,
                    TransferError::Incomplete {
                        received: C,
                        total: 5 * C
                    }
                );
            }
            other => panic!("expected failure, got {:?}", other),
        }

        // Stragglers for the failed transfer are dropped silently
        assert!(receiver.handle_frame(frames[2].clone()).is_none());
    }

    #[tokio::test]
    async fn test_channel_loss_fails_partial_transfer() {
        let data = pattern(5 * C as usize);
        let frames = frames_for("t", &data, false).await;
        let mut receiver = TransferReceiver::new(&config());

        for frame in &frames[..3] {
            receiver.handle_frame(frame.clone());
        }
        assert_eq!(receiver.get("t").unwrap().bytes_transferred, 2 * C);

        let events = receiver.fail_all(TransferError::ChannelClosed);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ReceiveEvent::Failed { transfer, error: TransferError::ChannelClosed }
                if transfer.status == TransferStatus::Failed
        ));
        assert_eq!(receiver.active_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_ignored() {
        let data = pattern(2 * C as usize);
        let frames = frames_for("t", &data, false).await;
        let mut receiver = TransferReceiver::new(&config());

        receiver.handle_frame(frames[0].clone());
        assert!(matches!(
            receiver.handle_frame(frames[1].clone()),
            Some(ReceiveEvent::Progress(_))
        ));
        assert!(receiver.handle_frame(frames[1].clone()).is_none());
        assert_eq!(receiver.get("t").unwrap().bytes_transferred, C);

        receiver.handle_frame(frames[2].clone());
        assert!(matches!(
            receiver.handle_frame(frames[3].clone()),
            Some(ReceiveEvent::Completed(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_chunks_fail_transfer() {
        let data = pattern(3 * C as usize);
        let frames = frames_for("t", &data, false).await;

        let mut receiver = TransferReceiver::new(&config());
        receiver.handle_frame(frames[0].clone());
        let out_of_range = TransferFrame::Chunk {
            transfer_id: "t".into(),
            chunk_index: 3,
            chunk: vec![0; C as usize],
        };
        assert!(matches!(
            receiver.handle_frame(out_of_range),
            Some(ReceiveEvent::Failed {
                error: TransferError::ChunkOutOfRange { index: 3, total: 3 },
                ..
            })
        ));

        let mut receiver = TransferReceiver::new(&config());
        receiver.handle_frame(frames[0].clone());
        let short = TransferFrame::Chunk {
            transfer_id: "t".into(),
            chunk_index: 0,
            chunk: vec![0; 3],
        };
        assert!(matches!(
            receiver.handle_frame(short),
            Some(ReceiveEvent::Failed {
                error: TransferError::ChunkSizeMismatch { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let data = pattern(20);
        let mut frames = frames_for("t", &data, true).await;
        if let Some(TransferFrame::Complete { checksum, .. }) = frames.last_mut() {
            *checksum = Some(blake3::hash(b"other").to_hex().to_string());
        }

        let mut receiver = TransferReceiver::new(&config());
        let last = frames.into_iter().map(|f| receiver.handle_frame(f)).last().flatten();
        assert!(matches!(
            last,
            Some(ReceiveEvent::Failed {
                error: TransferError::ChecksumMismatch,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_interleaved_transfers() {
        let a = pattern(3 * C as usize);
        let b: Vec<u8> = pattern(2 * C as usize).into_iter().rev().collect();
        let fa = frames_for("a", &a, false).await;
        let fb = frames_for("b", &b, false).await;

        let mut receiver = TransferReceiver::new(&config());
        let mut completed = Vec::new();
        let longest = fa.len().max(fb.len());
        for i in 0..longest {
            for frames in [&fa, &fb] {
                if let Some(frame) = frames.get(i) {
                    if let Some(ReceiveEvent::Completed(file)) = receiver.handle_frame(frame.clone()) {
                        completed.push(file);
                    }
                }
            }
        }

        assert_eq!(completed.len(), 2);
        let by_id: HashMap<_, _> = completed.into_iter().map(|f| (f.transfer.id.clone(), f.data)).collect();
        assert_eq!(by_id["a"], a);
        assert_eq!(by_id["b"], b);
    }

    #[test]
    fn test_rejects_oversized_and_bad_start() {
        let mut receiver = TransferReceiver::new(&TransferConfig {
            max_file_size: 100,
            ..config()
        });

        let huge = TransferFrame::Start {
            transfer_id: "big".into(),
            filename: "big.iso".into(),
            file_size: 101,
            file_type: String::new(),
            chunk_size: Some(C),
        };
        assert!(matches!(
            receiver.handle_frame(huge),
            Some(ReceiveEvent::Rejected {
                error: TransferError::FileTooLarge { size: 101, max: 100 },
                ..
            })
        ));
        // Chunks for a rejected transfer are dropped, not reported
        let chunk = TransferFrame::Chunk {
            transfer_id: "big".into(),
            chunk_index: 0,
            chunk: vec![1; C as usize],
        };
        assert!(receiver.handle_frame(chunk).is_none());

        let zero_chunk = TransferFrame::Start {
            transfer_id: "z".into(),
            filename: "z".into(),
            file_size: 10,
            file_type: String::new(),
            chunk_size: Some(0),
        };
        assert!(matches!(
            receiver.handle_frame(zero_chunk),
            Some(ReceiveEvent::Rejected {
                error: TransferError::InvalidChunkSize(0),
                ..
            })
        ));
        assert_eq!(receiver.active_count(), 0);
    }

    #[test]
    fn test_unknown_transfer_rejected() {
        let mut receiver = TransferReceiver::new(&config());
        let complete = TransferFrame::Complete {
            transfer_id: "ghost".into(),
            checksum: None,
        };
        assert!(matches!(
            receiver.handle_frame(complete),
            Some(ReceiveEvent::Rejected {
                error: TransferError::UnknownTransfer(_),
                ..
            })
        ));
    }

    #[test]
    fn test_browser_start_frame_defaults() {
        let mut receiver = TransferReceiver::new(&config());
        let text = r#"{"type":"file-transfer-start","transferId":"x","filename":"photo.png","fileSize":10}"#;
        match receiver.handle_text(text).unwrap() {
            Some(ReceiveEvent::Started(transfer)) => {
                assert_eq!(transfer.chunk_size, DEFAULT_CHUNK_SIZE as u64);
                assert_eq!(transfer.mime_type, "image/png");
                assert_eq!(transfer.status, TransferStatus::Active);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(receiver.handle_text("not json").is_err());
    }

    #[test]
    fn test_idle_transfers_expire() {
        let mut receiver = TransferReceiver::new(&config());
        receiver.handle_frame(TransferFrame::Start {
            transfer_id: "slow".into(),
            filename: "slow.bin".into(),
            file_size: 64,
            file_type: String::new(),
            chunk_size: Some(C),
        });

        assert!(receiver.expire_idle(Instant::now()).is_empty());

        let later = Instant::now() + config().idle_timeout() + Duration::from_secs(1);
        let events = receiver.expire_idle(later);
        assert!(matches!(
            &events[..],
            [ReceiveEvent::Failed {
                error: TransferError::IdleTimeout(_),
                ..
            }]
        ));
        assert_eq!(receiver.active_count(), 0);
    }

    #[test]
    fn test_finished_ids_age_out() {
        let mut receiver = TransferReceiver::new(&config());
        receiver.handle_frame(TransferFrame::Start {
            transfer_id: "empty".into(),
            filename: "empty.txt".into(),
            file_size: 0,
            file_type: String::new(),
            chunk_size: Some(C),
        });
        let complete = TransferFrame::Complete {
            transfer_id: "empty".into(),
            checksum: None,
        };
        assert!(matches!(
            receiver.handle_frame(complete.clone()),
            Some(ReceiveEvent::Completed(_))
        ));
        assert!(receiver.handle_frame(complete.clone()).is_none(), "late frame dropped");

        receiver.expire_idle(Instant::now());
        assert!(receiver.handle_frame(complete.clone()).is_none(), "still remembered");

        let later = Instant::now() + config().idle_timeout() + Duration::from_secs(1);
        receiver.expire_idle(later);
        assert!(matches!(
            receiver.handle_frame(complete),
            Some(ReceiveEvent::Rejected {
                error: TransferError::UnknownTransfer(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_prepare_outgoing_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        tokio::fs::write(&path, pattern(300)).await.unwrap();

        let prepared = prepare_outgoing(&path, &config()).await.unwrap();
        assert_eq!(prepared.transfer.filename, "report.pdf");
        assert_eq!(prepared.transfer.mime_type, "application/pdf");
        assert_eq!(prepared.transfer.total_size, 300);
        assert_eq!(prepared.transfer.direction, TransferDirection::Outgoing);

        let small = TransferConfig {
            max_file_size: 299,
            ..config()
        };
        assert!(matches!(
            prepare_outgoing(&path, &small).await,
            Err(TransferError::FileTooLarge { size: 300, max: 299 })
        ));
        assert!(matches!(
            prepare_outgoing(dir.path(), &config()).await,
            Err(TransferError::InvalidFile(_))
        ));
        assert!(matches!(
            prepare_outgoing(&dir.path().join("missing"), &config()).await,
            Err(TransferError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_open_and_send_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let data = pattern(50);
        tokio::fs::write(&path, &data).await.unwrap();

        let prepared = prepare_outgoing(&path, &config()).await.unwrap();
        let mut sender = ChunkSender::open(&prepared, true).await.unwrap();
        let mut receiver = TransferReceiver::new(&config());
        receiver.handle_frame(sender.start_frame());

        let mut last = None;
        while let Some(frame) = sender.next_frame().await.unwrap() {
            last = receiver.handle_frame(frame);
        }
        match last {
            Some(ReceiveEvent::Completed(file)) => assert_eq!(file.data, data),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_completed_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut transfer = outgoing("t1", b"abc");
        transfer.filename = "../../etc/notes.txt".into();
        let file = CompletedFile {
            transfer,
            data: b"abc".to_vec(),
        };

        let first = save_completed(dir.path(), &file).await.unwrap();
        assert_eq!(first, dir.path().join("notes.txt"));
        let second = save_completed(dir.path(), &file).await.unwrap();
        assert_eq!(second, dir.path().join("notes (1).txt"));
        assert_eq!(tokio::fs::read(&second).await.unwrap(), b"abc");

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert!(names.iter().all(|n| !n.ends_with(".part")));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_write_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let file = CompletedFile {
            transfer: outgoing("t1", b"abc"),
            data: b"abc".to_vec(),
        };

        // Writes to /dev/full fail with ENOSPC
        let partial = dir.path().join(".data.bin.t1.part");
        std::os::unix::fs::symlink("/dev/full", &partial).unwrap();

        assert!(matches!(
            save_completed(dir.path(), &file).await,
            Err(TransferError::Io(_))
        ));
        assert!(tokio::fs::symlink_metadata(&partial).await.is_err());
        assert!(!exists(&dir.path().join("data.bin")).await);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c.txt"), "c.txt");
        assert_eq!(sanitize_filename(".."), "download");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("what?.md"), "what_.md");
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = TransferStats::default();
        stats.record_sent(100);
        stats.record_received(50);
        stats.record_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.total_bytes(), 150);
        assert_eq!(snap.files_sent, 1);
        assert!((snap.success_rate() - 200.0 / 3.0).abs() < 1e-9);
    }
}
