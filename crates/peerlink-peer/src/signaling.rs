//! Relay client
//!
//! Two halves:
//! - [`SignalingClient`]: the WebSocket used to exchange negotiation
//!   messages with the other participant
//! - [`RelayApi`]: the HTTP API for session lookup and transfer records

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use peerlink_core::TransferStatus;
use peerlink_signal::{Session, SignalMessage, TransferRecord};

/// Queue depth between the socket tasks and their callers
const SIGNAL_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to connect to relay: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("relay connection closed")]
    Closed,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("relay API returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Both directions of an open relay connection.
///
/// Dropping `outbound` closes the socket.
pub struct SignalChannel {
    pub outbound: mpsc::Sender<SignalMessage>,
    pub inbound: mpsc::Receiver<SignalMessage>,
}

pub struct SignalingClient;

impl SignalingClient {
    /// Open a WebSocket to the relay
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<SignalChannel, SignalingError> {
        let url = parse_ws_url(url)?;
        debug!("Connecting to relay: {}", url);

        let ws = match timeout(connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(SignalingError::Connect(e.to_string())),
            Err(_) => return Err(SignalingError::Timeout(connect_timeout)),
        };
        info!("Connected to relay {}", url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<SignalMessage>(SIGNAL_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<SignalMessage>(SIGNAL_QUEUE);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Dropping unserializable signal: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    debug!("Relay write failed: {}", e);
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Relay read failed: {}", e);
                        break;
                    }
                };
                match SignalMessage::from_json(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed relay frame: {}", e),
                }
            }
            debug!("Relay connection closed");
        });

        Ok(SignalChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn parse_ws_url(url: &str) -> Result<Url, SignalingError> {
    let parsed = Url::parse(url).map_err(|e| SignalingError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(SignalingError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewRecordBody<'a> {
    session_id: &'a str,
    filename: &'a str,
    file_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordUpdateBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<TransferStatus>,
}

/// HTTP client for the relay's session and transfer-record API
#[derive(Clone)]
pub struct RelayApi {
    base: String,
    http: reqwest::Client,
}

impl RelayApi {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Create a new session
    pub async fn create_session(&self) -> Result<Session, SignalingError> {
        let response = self.http.post(self.url("sessions")).send().await?;
        decode(response).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, SignalingError> {
        let response = self
            .http
            .get(self.url(&format!("sessions/{}", session_id)))
            .send()
            .await?;
        decode(response).await
    }

    /// Announce a transfer for bookkeeping
    pub async fn create_transfer_record(
        &self,
        session_id: &str,
        filename: &str,
        file_size: u64,
    ) -> Result<TransferRecord, SignalingError> {
        let body = NewRecordBody {
            session_id,
            filename,
            file_size,
        };
        let response = self
            .http
            .post(self.url("file-transfers"))
            .json(&body)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn update_transfer_record(
        &self,
        transfer_id: &str,
        progress: Option<u8>,
        status: Option<TransferStatus>,
    ) -> Result<TransferRecord, SignalingError> {
        let body = RecordUpdateBody { progress, status };
        let response = self
            .http
            .put(self.url(&format!("file-transfers/{}", transfer_id)))
            .json(&body)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn list_transfer_records(&self, session_id: &str) -> Result<Vec<TransferRecord>, SignalingError> {
        let response = self
            .http
            .get(self.url(&format!("sessions/{}/file-transfers", session_id)))
            .send()
            .await?;
        decode(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, SignalingError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    Err(SignalingError::Api {
        status: status.as_u16(),
        message,
    })
}
