//! Connection registry
//!
//! The single source of truth for live connections. Maintains a thread-safe
//! mapping from connection id to connection state and provides the snapshot
//! and roster views used by the broadcaster and heartbeat monitor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::server::{ServerEvent, UserInfo};

/// Name and room announced via a valid JOIN; set exactly once, together
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub room: String,
}

/// Outcome of a JOIN attempt against the registry
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// First valid JOIN; name and room were set atomically
    Joined(UserInfo),
    /// The connection already joined; the frame is ignored
    AlreadyJoined,
    /// The connection is no longer registered
    NotFound,
}

/// Result of one heartbeat sweep over the registry
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Connections that had a PING queued this sweep
    pub pinged: usize,
    /// Connections past the pong deadline, to be force-closed by the caller
    pub reaped: Vec<Uuid>,
}

/// Server-side state for one live client transport
///
/// The WebSocket sink itself is owned exclusively by the connection's writer
/// task; everything here communicates with it through the outbound queue.
pub struct ConnectionHandle {
    id: Uuid,
    profile: Option<Profile>,
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: broadcast::Sender<()>,
    awaiting_pong: bool,
    last_ping_sent_at: Instant,
}

impl ConnectionHandle {
    fn new(
        id: Uuid,
        outbound: mpsc::UnboundedSender<Message>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            id,
            profile: None,
            outbound,
            shutdown,
            awaiting_pong: false,
            last_ping_sent_at: Instant::now(),
        }
    }

    /// Get the connection id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the profile, if the connection has joined
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Queue an event on the connection's outbound channel
    ///
    /// Returns false if the writer task is gone; the caller logs and moves on.
    fn send_event(&self, event: &ServerEvent) -> bool {
        match event.to_json() {
            Ok(json) => self.outbound.send(Message::Text(json)).is_ok(),
            Err(e) => {
                warn!("Failed to encode event for {}: {}", self.id, e);
                false
            }
        }
    }

    /// Queue a Close frame and signal the reader loop to exit
    fn force_close(&self, frame: Option<CloseFrame<'static>>) {
        let _ = self.outbound.send(Message::Close(frame));
        let _ = self.shutdown.send(());
    }
}

/// A point-in-time view of one connection, cloned out of the registry for
/// fan-out. A send to a since-removed entry fails harmlessly.
#[derive(Clone)]
pub struct Recipient {
    pub id: Uuid,
    pub room: Option<String>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Recipient {
    /// Queue pre-serialized text on the recipient's outbound channel
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.send(Message::Text(text)).is_ok()
    }
}

/// Registry of live connections
///
/// All mutation goes through the write lock; the heartbeat sweep and
/// broadcaster snapshots therefore never observe a half-updated entry.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<Uuid, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new connection with a fresh unique id and return the id
    pub async fn register(
        &self,
        outbound: mpsc::UnboundedSender<Message>,
        shutdown: broadcast::Sender<()>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let mut conns = self.conns.write().await;
        conns.insert(id, ConnectionHandle::new(id, outbound, shutdown));
        id
    }

    /// Atomically set name and room on the first valid JOIN
    pub async fn join(&self, id: Uuid, name: &str, room: &str) -> JoinOutcome {
        let mut conns = self.conns.write().await;
        match conns.get_mut(&id) {
            None => JoinOutcome::NotFound,
            Some(handle) if handle.profile.is_some() => JoinOutcome::AlreadyJoined,
            Some(handle) => {
                handle.profile = Some(Profile {
                    name: name.to_string(),
                    room: room.to_string(),
                });
                JoinOutcome::Joined(UserInfo {
                    id,
                    name: name.to_string(),
                    room: room.to_string(),
                })
            }
        }
    }

    /// Remove a connection; removal is final, repeat removal returns None
    pub async fn remove(&self, id: Uuid) -> Option<ConnectionHandle> {
        self.conns.write().await.remove(&id)
    }

    /// Check whether a connection is still registered
    pub async fn contains(&self, id: Uuid) -> bool {
        self.conns.read().await.contains_key(&id)
    }

    /// Whether the connection has joined; None if not registered
    pub async fn is_joined(&self, id: Uuid) -> Option<bool> {
        let conns = self.conns.read().await;
        conns.get(&id).map(|h| h.profile.is_some())
    }

    /// Get the number of live connections
    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Clone a point-in-time view of every open connection for fan-out
    pub async fn snapshot(&self) -> Vec<Recipient> {
        let conns = self.conns.read().await;
        let mut recipients = Vec::with_capacity(conns.len());
        for handle in conns.values() {
            recipients.push(Recipient {
                id: handle.id,
                room: handle.profile.as_ref().map(|p| p.room.clone()),
                outbound: handle.outbound.clone(),
            });
        }
        recipients
    }

    /// Build the roster of joined connections, fresh from the map
    pub async fn roster(&self) -> Vec<UserInfo> {
        let conns = self.conns.read().await;
        let mut users = Vec::new();
        for handle in conns.values() {
            if let Some(profile) = &handle.profile {
                users.push(UserInfo {
                    id: handle.id,
                    name: profile.name.clone(),
                    room: profile.room.clone(),
                });
            }
        }
        users
    }

    /// Clear the outstanding-PING flag for a connection
    ///
    /// Returns false if the connection is not registered.
    pub async fn pong_received(&self, id: Uuid) -> bool {
        let mut conns = self.conns.write().await;
        match conns.get_mut(&id) {
            Some(handle) => {
                handle.awaiting_pong = false;
                true
            }
            None => false,
        }
    }

    /// Whether a connection has an unanswered PING; None if not registered
    pub(crate) async fn is_awaiting_pong(&self, id: Uuid) -> Option<bool> {
        let conns = self.conns.read().await;
        conns.get(&id).map(|h| h.awaiting_pong)
    }

    /// One heartbeat pass over every open connection
    ///
    /// Connections past `timeout` since their unanswered PING are collected
    /// for reaping and get no further ping this sweep. Everyone else gets a
    /// PING queued and their outstanding flag set. A queue failure is logged
    /// only; the timeout check reaps the connection on a later sweep.
    pub(crate) async fn liveness_sweep(&self, now: Instant, timeout: Duration) -> SweepReport {
        let mut conns = self.conns.write().await;
        let mut report = SweepReport::default();
        for (id, handle) in conns.iter_mut() {
            if handle.awaiting_pong && now.duration_since(handle.last_ping_sent_at) > timeout {
                report.reaped.push(*id);
                continue;
            }
            handle.awaiting_pong = true;
            handle.last_ping_sent_at = now;
            if handle.send_event(&ServerEvent::Ping) {
                report.pinged += 1;
            } else {
                debug!("Failed to queue PING for {}", id);
            }
        }
        report
    }

    /// Force-close a connection's transport
    ///
    /// Queues the given Close frame and signals the reader loop; the normal
    /// close path then performs deregistration and any leave broadcast.
    pub async fn force_close(&self, id: Uuid, frame: Option<CloseFrame<'static>>) -> bool {
        let conns = self.conns.read().await;
        match conns.get(&id) {
            Some(handle) => {
                handle.force_close(frame);
                true
            }
            None => false,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
        broadcast::Sender<()>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        (tx, rx, shutdown_tx)
    }

    #[tokio::test]
    async fn test_register_assigns_unique_ids() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a, sd_a) = test_conn();
        let (tx_b, _rx_b, sd_b) = test_conn();

        let a = registry.register(tx_a, sd_a).await;
        let b = registry.register(tx_b, sd_b).await;

        assert_ne!(a, b);
        assert_eq!(registry.connection_count().await, 2);
        assert!(registry.contains(a).await);
        assert!(registry.contains(b).await);
    }

    #[tokio::test]
    async fn test_remove_is_final() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx, sd) = test_conn();
        let id = registry.register(tx, sd).await;

        let removed = registry.remove(id).await;
        assert!(removed.is_some());
        assert!(!registry.contains(id).await);

        // Repeat removal is a no-op
        assert!(registry.remove(id).await.is_none());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_sets_profile_once() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx, sd) = test_conn();
        let id = registry.register(tx, sd).await;

        assert_eq!(registry.is_joined(id).await, Some(false));

        match registry.join(id, "Alice", "lobby").await {
            JoinOutcome::Joined(user) => {
                assert_eq!(user.id, id);
                assert_eq!(user.name, "Alice");
                assert_eq!(user.room, "lobby");
            }
            other => panic!("Expected Joined, got {:?}", other),
        }
        assert_eq!(registry.is_joined(id).await, Some(true));

        // Second JOIN leaves name and room untouched
        assert_eq!(
            registry.join(id, "Mallory", "den").await,
            JoinOutcome::AlreadyJoined
        );
        let removed = registry.remove(id).await.unwrap();
        let profile = removed.profile().unwrap();
        assert_eq!(profile.name, "Alice");
        assert_eq!(profile.room, "lobby");
    }

    #[tokio::test]
    async fn test_join_unknown_connection() {
        let registry = ConnectionRegistry::new();
        let outcome = registry.join(Uuid::new_v4(), "Alice", "lobby").await;
        assert_eq!(outcome, JoinOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_roster_excludes_unjoined() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a, sd_a) = test_conn();
        let (tx_b, _rx_b, sd_b) = test_conn();
        let (tx_c, _rx_c, sd_c) = test_conn();

        let a = registry.register(tx_a, sd_a).await;
        let b = registry.register(tx_b, sd_b).await;
        let _c = registry.register(tx_c, sd_c).await;

        registry.join(a, "Alice", "lobby").await;
        registry.join(b, "Bob", "lobby").await;

        let roster = registry.roster().await;
        assert_eq!(roster.len(), 2);
        let alice = roster.iter().find(|u| u.id == a).unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.room, "lobby");
        let bob = roster.iter().find(|u| u.id == b).unwrap();
        assert_eq!(bob.name, "Bob");
    }

    #[tokio::test]
    async fn test_roster_never_lists_removed() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx, sd) = test_conn();
        let id = registry.register(tx, sd).await;
        registry.join(id, "Alice", "lobby").await;
        registry.remove(id).await;

        assert!(registry.roster().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_carries_room() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx, sd) = test_conn();
        let id = registry.register(tx, sd).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert!(snapshot[0].room.is_none());

        registry.join(id, "Alice", "lobby").await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].room.as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn test_pong_clears_awaiting_flag() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx, sd) = test_conn();
        let id = registry.register(tx, sd).await;

        let now = Instant::now();
        let report = registry.liveness_sweep(now, Duration::from_secs(10)).await;
        assert_eq!(report.pinged, 1);
        assert!(report.reaped.is_empty());
        assert_eq!(registry.is_awaiting_pong(id).await, Some(true));

        // The sweep queued exactly one PING
        match rx.try_recv().unwrap() {
            Message::Text(json) => assert_eq!(json, r#"{"type":"PING"}"#),
            other => panic!("Expected text PING, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        assert!(registry.pong_received(id).await);
        assert_eq!(registry.is_awaiting_pong(id).await, Some(false));
    }

    #[tokio::test]
    async fn test_pong_for_removed_connection() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.pong_received(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_sweep_reaps_after_timeout() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx, sd) = test_conn();
        let id = registry.register(tx, sd).await;

        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        registry.liveness_sweep(t0, timeout).await;

        // No pong arrives; next sweep past the deadline reaps, no second ping
        let report = registry
            .liveness_sweep(t0 + Duration::from_secs(11), timeout)
            .await;
        assert_eq!(report.reaped, vec![id]);
        assert_eq!(report.pinged, 0);

        // Only the first sweep's PING is on the queue
        assert!(matches!(rx.try_recv().unwrap(), Message::Text(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_pings_again_after_pong() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx, sd) = test_conn();
        let id = registry.register(tx, sd).await;

        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        registry.liveness_sweep(t0, timeout).await;
        registry.pong_received(id).await;

        let report = registry
            .liveness_sweep(t0 + Duration::from_secs(45), timeout)
            .await;
        assert_eq!(report.pinged, 1);
        assert!(report.reaped.is_empty());

        assert!(matches!(rx.try_recv().unwrap(), Message::Text(_)));
        assert!(matches!(rx.try_recv().unwrap(), Message::Text(_)));
    }

    #[tokio::test]
    async fn test_force_close_queues_close_and_signals() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx, sd) = test_conn();
        let mut shutdown_rx = sd.subscribe();
        let id = registry.register(tx, sd).await;

        assert!(registry.force_close(id, None).await);
        assert!(matches!(rx.try_recv().unwrap(), Message::Close(None)));
        assert!(shutdown_rx.try_recv().is_ok());

        assert!(!registry.force_close(Uuid::new_v4(), None).await);
    }
}
