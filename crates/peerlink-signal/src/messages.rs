//! Signal protocol messages
//!
//! Every frame on the relay WebSocket is a JSON object of the form
//! `{"type": ..., "sessionId": ..., "data": ...}`. The relay only looks at
//! `type` and `sessionId`; `data` is opaque for relayed messages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use peerlink_core::Role;

/// Message types carried over the relay connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Client asks to join a session
    JoinSession,
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// Trickled connectivity candidate
    IceCandidate,
    /// Join confirmation, or notification that another participant joined
    SessionJoined,
    /// Request could not be served
    SessionError,
}

impl SignalKind {
    /// Negotiation messages forwarded verbatim to the other participants
    pub fn is_relayed(self) -> bool {
        matches!(
            self,
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate
        )
    }

    /// Types only the relay may send
    pub fn is_server_only(self) -> bool {
        matches!(self, SignalKind::SessionJoined | SignalKind::SessionError)
    }
}

/// A frame sent over the signaling WebSocket
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Machine-readable reason attached to `session-error` frames
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame failed schema validation
    InvalidMessage,
    /// Join named a session that was never created
    SessionNotFound,
    /// Join named a session whose participants all left
    SessionInactive,
    /// Relayed message named a different session than the one joined
    SessionMismatch,
    /// Client sent a type only the relay may send
    UnexpectedMessage,
}

impl SignalMessage {
    fn new(kind: SignalKind, session_id: Option<String>, data: Option<Value>) -> Self {
        Self {
            kind,
            session_id,
            data,
        }
    }

    /// Join a session in the given role
    pub fn join(session_id: impl Into<String>, role: Role) -> Self {
        Self::new(
            SignalKind::JoinSession,
            Some(session_id.into()),
            Some(json!({ "isHost": role.is_host() })),
        )
    }

    /// Session description offer with an opaque payload
    pub fn offer(session_id: impl Into<String>, data: Value) -> Self {
        Self::new(SignalKind::Offer, Some(session_id.into()), Some(data))
    }

    /// Session description answer with an opaque payload
    pub fn answer(session_id: impl Into<String>, data: Value) -> Self {
        Self::new(SignalKind::Answer, Some(session_id.into()), Some(data))
    }

    /// Connectivity candidate with an opaque payload
    pub fn ice_candidate(session_id: impl Into<String>, data: Value) -> Self {
        Self::new(SignalKind::IceCandidate, Some(session_id.into()), Some(data))
    }

    /// Confirmation sent to the participant that just joined
    pub fn session_joined(session_id: impl Into<String>, role: Role) -> Self {
        Self::new(
            SignalKind::SessionJoined,
            Some(session_id.into()),
            Some(json!({ "isHost": role.is_host() })),
        )
    }

    /// Notification sent to everyone else when a participant joins
    pub fn participant_joined(session_id: impl Into<String>, role: Role) -> Self {
        Self::new(
            SignalKind::SessionJoined,
            Some(session_id.into()),
            Some(json!({ "participantJoined": true, "isHost": role.is_host() })),
        )
    }

    /// Error response for the sender only
    pub fn session_error(
        session_id: Option<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            SignalKind::SessionError,
            session_id,
            Some(json!({ "error": message.into(), "code": code })),
        )
    }

    /// `data.isHost`, defaulting to false
    pub fn is_host(&self) -> bool {
        self.data_field("isHost")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Role requested by a join (or reported by a join notification)
    pub fn role(&self) -> Role {
        Role::from_is_host(self.is_host())
    }

    /// `data.participantJoined`, defaulting to false
    pub fn participant_joined_flag(&self) -> bool {
        self.data_field("participantJoined")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `data.error` of a session-error frame
    pub fn error_message(&self) -> Option<&str> {
        self.data_field("error").and_then(Value::as_str)
    }

    /// `data.code` of a session-error frame
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.data_field("code")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_wire_format() {
        let msg = SignalMessage::join("ABCD1234EFGH", Role::Host);
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"join-session""#));
        assert!(json.contains(r#""sessionId":"ABCD1234EFGH""#));
        assert!(json.contains(r#""isHost":true"#));

        let parsed = SignalMessage::from_json(&json).unwrap();
        assert_eq!(parsed.kind, SignalKind::JoinSession);
        assert_eq!(parsed.role(), Role::Host);
    }

    #[test]
    fn test_parse_browser_frames() {
        let offer = r#"{"type":"offer","sessionId":"S","data":{"type":"offer","sdp":"v=0"}}"#;
        let msg = SignalMessage::from_json(offer).unwrap();
        assert_eq!(msg.kind, SignalKind::Offer);
        assert!(msg.kind.is_relayed());
        assert_eq!(msg.data.unwrap()["sdp"], "v=0");

        let ice = r#"{"type":"ice-candidate","sessionId":"S","data":{"candidate":"c"}}"#;
        assert_eq!(
            SignalMessage::from_json(ice).unwrap().kind,
            SignalKind::IceCandidate
        );
    }

    #[test]
    fn test_reject_unknown_type() {
        assert!(SignalMessage::from_json(r#"{"type":"explode","sessionId":"S"}"#).is_err());
        assert!(SignalMessage::from_json(r#"{"sessionId":"S"}"#).is_err());
        assert!(SignalMessage::from_json(r#"{"type":"offer","sessionId":42}"#).is_err());
    }

    #[test]
    fn test_participant_joined_flags() {
        let own = SignalMessage::session_joined("S", Role::Viewer);
        assert!(!own.participant_joined_flag());
        assert!(!own.is_host());

        let other = SignalMessage::participant_joined("S", Role::Viewer);
        assert!(other.participant_joined_flag());
        assert_eq!(other.kind, SignalKind::SessionJoined);
    }

    #[test]
    fn test_error_message() {
        let msg = SignalMessage::session_error(
            Some("S".into()),
            ErrorCode::SessionNotFound,
            "Session not found or inactive",
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains("session-error"));
        assert!(json.contains("session_not_found"));

        let parsed = SignalMessage::from_json(&json).unwrap();
        assert_eq!(parsed.error_message(), Some("Session not found or inactive"));
        assert_eq!(parsed.error_code(), Some(ErrorCode::SessionNotFound));
        assert!(parsed.kind.is_server_only());
    }
}
