//! Per-connection session handler
//!
//! Drives the unjoined -> joined state machine for one connection. Inbound
//! frames pass the rate limiter first, then are parsed and dispatched;
//! malformed frames are dropped without a client-visible error.

use std::sync::Arc;
use std::time::Instant;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{validate_join, ClientFrame, RATE_LIMIT_CLOSE_REASON};
use crate::presence::{ConnectionRegistry, JoinOutcome, PresenceBroadcaster, RateWindow};

/// What the connection loop should do after one inbound frame
#[derive(Debug)]
pub enum FrameOutcome {
    /// Keep reading frames
    Continue,
    /// Send the given Close frame and stop processing this connection
    Close(Option<CloseFrame<'static>>),
}

/// Protocol state for one connection
pub struct Session {
    id: Uuid,
    registry: Arc<ConnectionRegistry>,
    broadcaster: PresenceBroadcaster,
    rate: RateWindow,
}

impl Session {
    /// Create a session for a freshly registered connection
    pub fn new(
        id: Uuid,
        registry: Arc<ConnectionRegistry>,
        broadcaster: PresenceBroadcaster,
        now: Instant,
    ) -> Self {
        Self {
            id,
            registry,
            broadcaster,
            rate: RateWindow::new(now),
        }
    }

    /// Get the connection id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Process one inbound text frame
    pub async fn handle_text(&mut self, text: &str, now: Instant) -> FrameOutcome {
        if self.rate.admit(now).is_rejected() {
            warn!("Connection {} exceeded the message rate, closing", self.id);
            return FrameOutcome::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: RATE_LIMIT_CLOSE_REASON.into(),
            }));
        }

        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Connection {}: dropping unparseable frame: {}", self.id, e);
                return FrameOutcome::Continue;
            }
        };

        match frame {
            ClientFrame::Join { name, room } => self.handle_join(&name, &room).await,
            ClientFrame::Pong => {
                if !self.registry.pong_received(self.id).await {
                    debug!("Connection {}: PONG after removal", self.id);
                }
            }
            ClientFrame::Unknown => {
                // Unknown message types are silently dropped
            }
        }
        FrameOutcome::Continue
    }

    async fn handle_join(&self, name: &str, room: &str) {
        if let Err(e) = validate_join(name, room) {
            warn!("Connection {}: invalid JOIN dropped: {}", self.id, e);
            return;
        }

        match self.registry.join(self.id, name, room).await {
            JoinOutcome::Joined(user) => {
                info!(
                    "Connection {} joined room \"{}\" as \"{}\"",
                    self.id, user.room, user.name
                );
                self.broadcaster.announce_join(&user).await;
            }
            JoinOutcome::AlreadyJoined => {
                debug!("Connection {}: repeat JOIN ignored", self.id);
            }
            JoinOutcome::NotFound => {
                debug!("Connection {}: JOIN after removal ignored", self.id);
            }
        }
    }

    /// Deregister and, if the connection had joined, announce the departure
    ///
    /// Safe to call more than once; only the call that actually removes the
    /// entry emits a leave broadcast.
    pub async fn close(&self) {
        let Some(handle) = self.registry.remove(self.id).await else {
            return;
        };
        if let Some(profile) = handle.profile() {
            info!(
                "Connection {} left room \"{}\"",
                self.id, profile.room
            );
            self.broadcaster.announce_leave(&profile.room, self.id).await;
        } else {
            debug!("Connection {} closed before joining", self.id);
        }
    }
}
