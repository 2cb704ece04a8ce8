//! Transfer record store
//!
//! Bookkeeping for file transfers announced by peers over HTTP. The relay
//! never sees file data; these records only track metadata and progress.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use peerlink_core::ids::{generate_transfer_id, normalize_session_id};
use peerlink_core::TransferStatus;

/// Metadata about one file transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub transfer_id: String,
    pub session_id: String,
    pub filename: String,
    pub file_size: u64,
    pub status: TransferStatus,
    /// Percent complete, 0..=100
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /file-transfers`
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransferRecord {
    pub session_id: String,
    pub filename: String,
    pub file_size: u64,
}

/// Body of `PUT /file-transfers/{id}`
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub status: Option<TransferStatus>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("transfer {0} not found")]
    NotFound(String),

    #[error("invalid transfer record: {0}")]
    Invalid(String),

    #[error("random number generator unavailable: {0}")]
    Rng(String),
}

#[derive(Default)]
pub struct TransferRecordStore {
    records: DashMap<String, TransferRecord>,
}

impl TransferRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending transfer
    pub fn create(&self, new: NewTransferRecord) -> Result<TransferRecord, RecordError> {
        let filename = new.filename.trim();
        if filename.is_empty() {
            return Err(RecordError::Invalid("filename is empty".into()));
        }
        let session_id = normalize_session_id(&new.session_id);
        if session_id.is_empty() {
            return Err(RecordError::Invalid("sessionId is empty".into()));
        }

        let transfer_id = generate_transfer_id().map_err(|e| RecordError::Rng(e.to_string()))?;
        let record = TransferRecord {
            transfer_id: transfer_id.clone(),
            session_id,
            filename: filename.to_string(),
            file_size: new.file_size,
            status: TransferStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
        };

        self.records.insert(transfer_id, record.clone());
        info!(
            "Transfer record {} created for {} ({} bytes)",
            record.transfer_id, record.filename, record.file_size
        );
        Ok(record)
    }

    /// Apply a progress/status update.
    ///
    /// Terminal records keep their status; progress is clamped to 100.
    pub fn update(&self, transfer_id: &str, update: RecordUpdate) -> Result<TransferRecord, RecordError> {
        let mut record = self
            .records
            .get_mut(transfer_id)
            .ok_or_else(|| RecordError::NotFound(transfer_id.to_string()))?;

        if record.status.is_terminal() {
            debug!("Ignoring update to finished transfer {}", transfer_id);
            return Ok(record.clone());
        }

        if let Some(progress) = update.progress {
            record.progress = progress.min(100);
        }
        if let Some(status) = update.status {
            record.status = status;
            if status == TransferStatus::Completed {
                record.progress = 100;
            }
        }

        Ok(record.clone())
    }

    pub fn get(&self, transfer_id: &str) -> Result<TransferRecord, RecordError> {
        self.records
            .get(transfer_id)
            .map(|r| r.clone())
            .ok_or_else(|| RecordError::NotFound(transfer_id.to_string()))
    }

    /// Records for a session, oldest first
    pub fn list_for_session(&self, session_id: &str) -> Vec<TransferRecord> {
        let session_id = normalize_session_id(session_id);
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
