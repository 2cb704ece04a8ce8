//! Connection routing for the relay
//!
//! Maps each session ID to the live connections joined to it. Every member
//! set has its own lock, so joins, leaves, and broadcasts on one session are
//! serialized while unrelated sessions never contend.
//!
//! Delivery never waits on a socket: each connection owns a bounded queue
//! drained by its writer task, and a broadcast only enqueues.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use peerlink_core::Role;

/// Relay-assigned connection identifier
pub type ConnectionId = u64;

/// Serialized frame queued for a connection
pub type OutboundFrame = Arc<str>;

/// Sending half of a connection's outbound queue
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a frame without waiting.
    ///
    /// Returns false when the writer is gone or the queue is full.
    pub fn try_deliver(&self, frame: &OutboundFrame) -> bool {
        self.tx.try_send(frame.clone()).is_ok()
    }

    /// Whether the writer side is still alive
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A connection joined to a session
struct Member {
    handle: ConnectionHandle,
    role: Role,
}

#[derive(Default)]
struct MemberSet {
    members: HashMap<ConnectionId, Member>,
    /// Set once the last member leaves; a closed set is never reused
    closed: bool,
}

/// Result of removing a connection from its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Session the connection was in
    pub session_id: String,
    /// Members left behind
    pub remaining: usize,
}

impl LeaveOutcome {
    /// The departing connection was the last member
    pub fn emptied(&self) -> bool {
        self.remaining == 0
    }
}

/// Session to member-set routing table
#[derive(Default)]
pub struct ConnectionRouter {
    sessions: DashMap<String, Arc<Mutex<MemberSet>>>,
    memberships: DashMap<ConnectionId, String>,
}

impl ConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a session once `admit` accepts it.
    ///
    /// `admit` runs under the session's member lock, so it never interleaves
    /// with the last member leaving. A connection belongs to at most one
    /// session; if it was a member of a different session it leaves that one
    /// afterwards and the outcome is returned. `on_emptied` runs under the
    /// previous session's lock when that leave emptied it.
    pub fn join<E>(
        &self,
        session_id: &str,
        handle: ConnectionHandle,
        role: Role,
        admit: impl FnOnce() -> Result<(), E>,
        on_emptied: impl FnOnce(&str),
    ) -> Result<Option<LeaveOutcome>, E> {
        let id = handle.id();
        let previous = self.session_of(id).filter(|prev| prev != session_id);

        loop {
            let set = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(MemberSet::default())))
                .clone();

            let mut guard = set.lock();
            if guard.closed {
                // Emptied concurrently; evict the stale set and retry
                drop(guard);
                self.sessions
                    .remove_if(session_id, |_, v| Arc::ptr_eq(v, &set));
                continue;
            }

            if let Err(e) = admit() {
                if guard.members.is_empty() {
                    guard.closed = true;
                    self.sessions
                        .remove_if(session_id, |_, v| Arc::ptr_eq(v, &set));
                }
                return Err(e);
            }

            guard.members.insert(id, Member { handle, role });
            self.memberships.insert(id, session_id.to_string());
            debug!(
                "Connection {} joined {} as {} ({} members)",
                id,
                session_id,
                role,
                guard.members.len()
            );
            break;
        }

        Ok(previous.map(|prev| self.remove_from(&prev, id, on_emptied)))
    }

    /// Remove a connection from whichever session holds it.
    ///
    /// `on_emptied` runs under the session's member lock when the connection
    /// was the last member.
    pub fn leave(&self, id: ConnectionId, on_emptied: impl FnOnce(&str)) -> Option<LeaveOutcome> {
        let session_id = self.session_of(id)?;
        Some(self.remove_from(&session_id, id, on_emptied))
    }

    fn remove_from(
        &self,
        session_id: &str,
        id: ConnectionId,
        on_emptied: impl FnOnce(&str),
    ) -> LeaveOutcome {
        let set = self.sessions.get(session_id).map(|s| s.clone());

        let remaining = match set {
            Some(set) => {
                let mut guard = set.lock();
                guard.members.remove(&id);
                let remaining = guard.members.len();
                if remaining == 0 {
                    guard.closed = true;
                    self.sessions
                        .remove_if(session_id, |_, v| Arc::ptr_eq(v, &set));
                    on_emptied(session_id);
                    debug!("Session {} has no connections left", session_id);
                }
                remaining
            }
            None => 0,
        };
        self.memberships.remove_if(&id, |_, s| s == session_id);

        LeaveOutcome {
            session_id: session_id.to_string(),
            remaining,
        }
    }

    /// Send a frame to every member of a session except `excluding`.
    ///
    /// Members whose queue is closed or full are skipped. Returns the number
    /// of members the frame was queued for.
    pub fn broadcast(
        &self,
        session_id: &str,
        frame: &OutboundFrame,
        excluding: Option<ConnectionId>,
    ) -> usize {
        let Some(set) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return 0;
        };

        let guard = set.lock();
        let mut delivered = 0;
        for (id, member) in guard.members.iter() {
            if Some(*id) == excluding {
                continue;
            }
            if member.handle.try_deliver(frame) {
                delivered += 1;
            } else {
                debug!("Skipping unwritable connection {} in {}", id, session_id);
            }
        }
        delivered
    }

    /// Session the connection is joined to
    pub fn session_of(&self, id: ConnectionId) -> Option<String> {
        self.memberships.get(&id).map(|s| s.clone())
    }

    /// Members of a session with their roles
    pub fn members(&self, session_id: &str) -> Vec<(ConnectionId, Role)> {
        let Some(set) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return Vec::new();
        };
        let guard = set.lock();
        let mut members: Vec<_> = guard
            .members
            .iter()
            .map(|(id, m)| (*id, m.role))
            .collect();
        members.sort_by_key(|(id, _)| *id);
        members
    }

    /// Number of members in a session
    pub fn member_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .map(|set| set.lock().members.len())
            .unwrap_or(0)
    }

    /// Sessions with at least one member
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connections joined to any session
    pub fn connection_count(&self) -> usize {
        self.memberships.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: ConnectionId) -> (ConnectionHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(id, tx), rx)
    }

    fn frame(s: &str) -> OutboundFrame {
        Arc::from(s)
    }

    fn join(
        router: &ConnectionRouter,
        session_id: &str,
        h: ConnectionHandle,
        role: Role,
    ) -> Option<LeaveOutcome> {
        router
            .join(session_id, h, role, || Ok::<(), ()>(()), |_| {})
            .unwrap()
    }

    fn leave(router: &ConnectionRouter, id: ConnectionId) -> Option<LeaveOutcome> {
        router.leave(id, |_| {})
    }

    #[test]
    fn test_join_creates_session() {
        let router = ConnectionRouter::new();
        let (h, _rx) = handle(1);

        assert!(join(&router, "S1", h, Role::Host).is_none());
        assert_eq!(router.session_count(), 1);
        assert_eq!(router.member_count("S1"), 1);
        assert_eq!(router.session_of(1).as_deref(), Some("S1"));
        assert_eq!(router.members("S1"), vec![(1, Role::Host)]);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let router = ConnectionRouter::new();
        let (h1, mut rx1) = handle(1);
        let (h2, mut rx2) = handle(2);
        let (h3, mut rx3) = handle(3);
        join(&router, "S1", h1, Role::Host);
        join(&router, "S1", h2, Role::Viewer);
        join(&router, "OTHER", h3, Role::Host);

        let delivered = router.broadcast("S1", &frame("hello"), Some(1));
        assert_eq!(delivered, 1);
        assert_eq!(&*rx2.try_recv().unwrap(), "hello");
        assert!(rx1.try_recv().is_err());
        assert!(rx3.try_recv().is_err(), "other sessions never see the frame");
    }

    #[test]
    fn test_left_connection_gets_no_broadcast() {
        let router = ConnectionRouter::new();
        let (h1, _rx1) = handle(1);
        let (h2, mut rx2) = handle(2);
        join(&router, "S1", h1, Role::Host);
        join(&router, "S1", h2, Role::Viewer);

        let outcome = leave(&router, 2).unwrap();
        assert_eq!(outcome.session_id, "S1");
        assert_eq!(outcome.remaining, 1);
        assert!(!outcome.emptied());

        assert_eq!(router.broadcast("S1", &frame("x"), None), 1);
        assert!(rx2.try_recv().is_err());
        assert!(router.session_of(2).is_none());
    }

    #[test]
    fn test_last_leave_removes_session() {
        let router = ConnectionRouter::new();
        let (h1, _rx1) = handle(1);
        join(&router, "S1", h1, Role::Host);

        let outcome = leave(&router, 1).unwrap();
        assert!(outcome.emptied());
        assert_eq!(router.session_count(), 0);
        assert_eq!(router.connection_count(), 0);
        assert!(leave(&router, 1).is_none(), "second leave is a no-op");
    }

    #[test]
    fn test_join_moves_between_sessions() {
        let router = ConnectionRouter::new();
        let (h1, _rx1) = handle(1);
        join(&router, "A", h1.clone(), Role::Host);

        let previous = join(&router, "B", h1, Role::Host).unwrap();
        assert_eq!(previous.session_id, "A");
        assert!(previous.emptied());
        assert_eq!(router.member_count("A"), 0);
        assert_eq!(router.member_count("B"), 1);
        assert_eq!(router.session_of(1).as_deref(), Some("B"));
    }

    #[test]
    fn test_rejoin_same_session_is_not_a_move() {
        let router = ConnectionRouter::new();
        let (h1, _rx1) = handle(1);
        join(&router, "A", h1.clone(), Role::Viewer);
        assert!(join(&router, "A", h1, Role::Viewer).is_none());
        assert_eq!(router.member_count("A"), 1);
    }

    #[test]
    fn test_broadcast_skips_closed_and_full() {
        let router = ConnectionRouter::new();
        let (h1, rx1) = handle(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        let h2 = ConnectionHandle::new(2, tx2);
        let (h3, mut rx3) = handle(3);
        join(&router, "S", h1.clone(), Role::Host);
        join(&router, "S", h2, Role::Viewer);
        join(&router, "S", h3, Role::Viewer);

        drop(rx1);
        assert!(!h1.is_open());

        // Fill connection 2's single slot
        assert_eq!(router.broadcast("S", &frame("first"), None), 2);
        assert_eq!(router.broadcast("S", &frame("second"), None), 1);

        assert_eq!(&*rx2.try_recv().unwrap(), "first");
        assert!(rx2.try_recv().is_err());
        assert_eq!(&*rx3.try_recv().unwrap(), "first");
        assert_eq!(&*rx3.try_recv().unwrap(), "second");
    }

    #[test]
    fn test_broadcast_unknown_session() {
        let router = ConnectionRouter::new();
        assert_eq!(router.broadcast("NOPE", &frame("x"), None), 0);
    }

    #[test]
    fn test_concurrent_join_leave() {
        let router = Arc::new(ConnectionRouter::new());
        let mut threads = Vec::new();

        for t in 0..8u64 {
            let router = router.clone();
            threads.push(std::thread::spawn(move || {
                let mut receivers = Vec::new();
                for i in 0..200u64 {
                    let id = t * 1000 + i;
                    let (h, rx) = handle(id);
                    receivers.push(rx);
                    join(&router, "HOT", h, Role::Viewer);
                    router.broadcast("HOT", &frame("ping"), Some(id));
                    leave(&router, id);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(router.member_count("HOT"), 0);
        assert_eq!(router.connection_count(), 0);
        assert_eq!(router.session_count(), 0);
    }

    #[test]
    fn test_refused_join_leaves_no_session() {
        let router = ConnectionRouter::new();
        let (h1, _rx1) = handle(1);

        let result = router.join("S1", h1, Role::Viewer, || Err("inactive"), |_| {});
        assert_eq!(result, Err("inactive"));
        assert_eq!(router.session_count(), 0);
        assert!(router.session_of(1).is_none());
    }

    #[test]
    fn test_on_emptied_runs_for_last_member_only() {
        let router = ConnectionRouter::new();
        let (h1, _rx1) = handle(1);
        let (h2, _rx2) = handle(2);
        join(&router, "S1", h1, Role::Host);
        join(&router, "S1", h2, Role::Viewer);

        let mut emptied = Vec::new();
        router.leave(2, |s| emptied.push(s.to_string()));
        assert!(emptied.is_empty());
        router.leave(1, |s| emptied.push(s.to_string()));
        assert_eq!(emptied, vec!["S1".to_string()]);
    }

    #[test]
    fn test_move_reports_emptied_previous_session() {
        let router = ConnectionRouter::new();
        let (h1, _rx1) = handle(1);
        join(&router, "A", h1.clone(), Role::Host);

        let mut emptied = None;
        let previous = router
            .join("B", h1, Role::Host, || Ok::<(), ()>(()), |s| emptied = Some(s.to_string()))
            .unwrap();
        assert_eq!(previous.map(|p| p.session_id), Some("A".to_string()));
        assert_eq!(emptied.as_deref(), Some("A"));
        assert_eq!(router.connection_count(), 1);
    }
}
