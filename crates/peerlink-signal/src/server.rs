//! Relay server: WebSocket signaling plus the small HTTP API
//!
//! Both share one TCP port. The request head is peeked before anything is
//! consumed; WebSocket upgrades are handed to tungstenite untouched and
//! everything else is answered as plain HTTP/1.1 with `Connection: close`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use peerlink_core::RelayConfig;

use crate::records::{NewTransferRecord, RecordError, RecordUpdate, TransferRecordStore};
use crate::registry::{RegistryError, SessionRegistry};
use crate::relay::SignalingRelay;
use crate::router::{ConnectionRouter, OutboundFrame};

/// Largest request head we wait for before giving up
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Largest HTTP body accepted by the API
const MAX_BODY_SIZE: usize = 64 * 1024;

/// How long a client has to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a closing connection's writer may keep flushing
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct ServerState {
    relay: SignalingRelay,
    records: TransferRecordStore,
    outbound_queue: usize,
}

/// Relay server state
pub struct RelayServer {
    config: RelayConfig,
    state: Arc<ServerState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let relay = SignalingRelay::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(ConnectionRouter::new()),
        );
        let outbound_queue = config.outbound_queue.max(1);

        Self {
            config,
            state: Arc::new(ServerState {
                relay,
                records: TransferRecordStore::new(),
                outbound_queue,
            }),
        }
    }

    pub fn relay(&self) -> &SignalingRelay {
        &self.state.relay
    }

    pub fn records(&self) -> &TransferRecordStore {
        &self.state.records
    }

    /// Bind and run the relay until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Run the relay on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        if let Some(max_age) = self.config.session_max_age_secs {
            let state = self.state.clone();
            let max_age = Duration::from_secs(max_age);
            let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    state.relay.registry().sweep_older_than(max_age);
                }
            });
        }

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let state = self.state.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, state).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), BoxError> {
    let head = tokio::time::timeout(HEAD_TIMEOUT, peek_head(&stream)).await??;
    let head = RequestHead::parse(&head).ok_or("malformed request head")?;

    if head.is_websocket_upgrade() {
        if !matches!(head.path(), "/" | "/ws") {
            let response = HttpResponse::error(404, "not found");
            stream.write_all(&response.to_bytes()).await?;
            return Ok(());
        }
        return handle_websocket(stream, peer_addr, state).await;
    }

    handle_http_request(&mut stream, &head, &state).await
}

/// Peek until the end of the request head without consuming it
async fn peek_head(stream: &TcpStream) -> Result<String, std::io::Error> {
    let mut buf = vec![0u8; MAX_HEAD_SIZE];
    let mut seen = 0;

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }

        if let Some(end) = find_head_end(&buf[..n]) {
            return Ok(String::from_utf8_lossy(&buf[..end]).into_owned());
        }
        if n == buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        if n == seen {
            // Nothing new arrived yet
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen = n;
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parsed request line and headers
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    len: usize,
}

impl RequestHead {
    fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.split("\r\n");
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Some(Self {
            method,
            target,
            headers,
            len: raw.len(),
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.to_ascii_lowercase().contains("websocket"))
            .unwrap_or(false)
    }

    /// Path without query string
    fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }

    fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

async fn handle_websocket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), BoxError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(state.outbound_queue);
    let mut conn = state.relay.accept(tx);
    debug!("New relay connection from {} as {}", peer_addr, conn.id());

    // Single writer per socket; everything else only enqueues
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.relay.handle_text(&mut conn, &text);
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    state.relay.handle_text(&mut conn, &text);
                }
                Err(_) => debug!("Ignoring non-UTF-8 frame from {}", conn.id()),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        }
    }

    let id = conn.id();
    state.relay.disconnect(&mut conn);
    // Dropping the last sender lets the writer drain and exit
    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    debug!("Connection closed: {}", id);
    Ok(())
}

/// A response for the HTTP API
#[derive(Debug, Clone, PartialEq)]
struct HttpResponse {
    status: u16,
    body: Option<String>,
}

impl HttpResponse {
    fn json(status: u16, body: &impl Serialize) -> Self {
        match serde_json::to_string(body) {
            Ok(body) => Self {
                status,
                body: Some(body),
            },
            Err(e) => {
                warn!("Failed to serialize response: {}", e);
                Self::error(500, "internal error")
            }
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: Some(json!({ "error": message }).to_string()),
        }
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.as_deref().unwrap_or("");
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, PUT, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n\
             Connection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            body.len(),
            body
        )
        .into_bytes()
    }
}

/// Read the full request (head plus body) and answer it
async fn handle_http_request(
    stream: &mut TcpStream,
    head: &RequestHead,
    state: &ServerState,
) -> Result<(), BoxError> {
    let body_len = head.content_length();
    if body_len > MAX_BODY_SIZE {
        let response = HttpResponse::error(413, "request body too large");
        stream.write_all(&response.to_bytes()).await?;
        return Ok(());
    }

    let mut raw = vec![0u8; head.len + body_len];
    stream.read_exact(&mut raw).await?;
    let body = &raw[head.len..];

    let response = route(state, &head.method, head.path(), body);
    debug!("{} {} -> {}", head.method, head.path(), response.status);

    stream.write_all(&response.to_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn route(state: &ServerState, method: &str, path: &str, body: &[u8]) -> HttpResponse {
    let path = path.strip_prefix("/api").unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let registry = state.relay.registry();

    match (method, segments.as_slice()) {
        ("OPTIONS", _) => HttpResponse::no_content(),

        ("GET", ["health"]) => HttpResponse::json(
            200,
            &json!({
                "status": "healthy",
                "sessions": registry.len(),
                "activeSessions": registry.active_count(),
                "connections": state.relay.open_connections(),
            }),
        ),

        ("GET", ["stats"]) => HttpResponse::json(
            200,
            &json!({
                "sessions": registry.len(),
                "activeSessions": registry.active_count(),
                "connections": state.relay.open_connections(),
                "routedSessions": state.relay.router().session_count(),
                "joinedConnections": state.relay.router().connection_count(),
                "transfers": state.records.len(),
            }),
        ),

        ("POST", ["sessions"]) => match registry.create() {
            Ok(session) => HttpResponse::json(200, &session),
            Err(e) => {
                warn!("Failed to create session: {}", e);
                HttpResponse::error(500, "Failed to create session")
            }
        },

        ("GET", ["sessions", id]) => {
            match registry.get(&peerlink_core::ids::normalize_session_id(id)) {
                Ok(session) => HttpResponse::json(200, &session),
                Err(RegistryError::NotFound(_)) => HttpResponse::error(404, "Session not found"),
                Err(e) => HttpResponse::error(500, &e.to_string()),
            }
        }

        ("GET", ["sessions", id, "file-transfers"]) => {
            HttpResponse::json(200, &state.records.list_for_session(id))
        }

        ("POST", ["file-transfers"]) => match parse_body::<NewTransferRecord>(body) {
            Ok(new) => record_response(state.records.create(new)),
            Err(response) => response,
        },

        ("PUT", ["file-transfers", id]) => match parse_body::<RecordUpdate>(body) {
            Ok(update) => record_response(state.records.update(id, update)),
            Err(response) => response,
        },

        ("GET", ["file-transfers", id]) => record_response(state.records.get(id)),

        (_, ["sessions", ..]) | (_, ["file-transfers", ..]) | (_, ["health"]) | (_, ["stats"]) => {
            HttpResponse::error(405, "method not allowed")
        }

        _ => HttpResponse::error(404, "not found"),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, HttpResponse> {
    serde_json::from_slice(body).map_err(|e| HttpResponse::error(400, &format!("invalid body: {}", e)))
}

fn record_response<T: Serialize>(result: Result<T, RecordError>) -> HttpResponse {
    match result {
        Ok(record) => HttpResponse::json(200, &record),
        Err(RecordError::NotFound(_)) => HttpResponse::error(404, "Transfer not found"),
        Err(RecordError::Invalid(msg)) => HttpResponse::error(400, &msg),
        Err(RecordError::Rng(msg)) => HttpResponse::error(500, &msg),
    }
}
