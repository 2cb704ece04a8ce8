//! Session registry
//!
//! Sessions are keyed by their short ID. Records are never removed by the
//! relay itself; `active` flips to false when the last participant leaves.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use peerlink_core::ids::{generate_host_token, generate_session_id};

/// Attempts before giving up on finding an unused session ID
const MAX_ID_ATTEMPTS: usize = 8;

/// A session record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Short shareable ID
    #[serde(rename = "sessionId")]
    pub id: String,
    /// Opaque token identifying the creating party
    #[serde(rename = "hostId")]
    pub host_token: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("random number generator unavailable: {0}")]
    Rng(String),

    #[error("could not allocate a unique session id")]
    IdExhausted,
}

/// In-memory store of sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new active session with a fresh ID
    pub fn create(&self) -> Result<Session, RegistryError> {
        let host_token = generate_host_token().map_err(|e| RegistryError::Rng(e.to_string()))?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_session_id().map_err(|e| RegistryError::Rng(e.to_string()))?;

            // The entry API keeps check-and-insert atomic for this key
            match self.sessions.entry(id.clone()) {
                Entry::Occupied(_) => {
                    debug!("Session id collision on {}, retrying", id);
                    continue;
                }
                Entry::Vacant(slot) => {
                    let session = Session {
                        id,
                        host_token,
                        active: true,
                        created_at: Utc::now(),
                    };
                    slot.insert(session.clone());
                    info!("Session created: {}", session.id);
                    return Ok(session);
                }
            }
        }

        Err(RegistryError::IdExhausted)
    }

    /// Look up a session by ID
    pub fn get(&self, id: &str) -> Result<Session, RegistryError> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Mark a session inactive. No-op for unknown or already inactive IDs.
    pub fn deactivate(&self, id: &str) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            if session.active {
                session.active = false;
                info!("Session {} deactivated", id);
            }
        }
    }

    /// Drop records older than `max_age`, returning how many were removed
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;

        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.created_at > cutoff);
        let removed = before.saturating_sub(self.sessions.len());

        if removed > 0 {
            info!("Swept {} session records older than {}s", removed, max_age.num_seconds());
        }
        removed
    }

    /// Number of session records
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions still accepting joins
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.active).count()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::ids::validate_session_id;

    #[test]
    fn test_create_and_get() {
        let registry = SessionRegistry::new();
        let session = registry.create().unwrap();

        assert!(session.active);
        assert!(validate_session_id(&session.id));
        assert_eq!(registry.get(&session.id).unwrap(), session);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_get_unknown() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.get("NOPE"),
            Err(RegistryError::NotFound("NOPE".into()))
        );
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.create().unwrap();

        registry.deactivate(&session.id);
        registry.deactivate(&session.id);
        registry.deactivate("UNKNOWN");

        let record = registry.get(&session.id).unwrap();
        assert!(!record.active);
        assert_eq!(registry.len(), 1, "record is kept after deactivation");
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SessionRegistry::new();
        for _ in 0..500 {
            registry.create().unwrap();
        }
        assert_eq!(registry.len(), 500);
    }

    #[test]
    fn test_sweep_older_than() {
        let registry = SessionRegistry::new();
        let fresh = registry.create().unwrap();
        registry.insert_for_test(Session {
            id: "OLD000000000".into(),
            host_token: "t".into(),
            active: false,
            created_at: Utc::now() - chrono::Duration::hours(2),
        });

        assert_eq!(registry.sweep_older_than(Duration::from_secs(3600)), 1);
        assert!(registry.get("OLD000000000").is_err());
        assert!(registry.get(&fresh.id).is_ok());
    }

    #[test]
    fn test_session_json_shape() {
        let registry = SessionRegistry::new();
        let session = registry.create().unwrap();
        let value = serde_json::to_value(&session).unwrap();

        assert_eq!(value["sessionId"], session.id.as_str());
        assert!(value["hostId"].is_string());
        assert_eq!(value["active"], true);
        assert!(value["createdAt"].is_string());
    }
}
