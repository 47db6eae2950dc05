//! Presence broadcaster
//!
//! Room-scoped join/leave notifications plus a global roster push on every
//! membership change. Every fan-out is best-effort: a failed send to one
//! recipient is logged and never aborts delivery to the rest.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::{ConnectionRegistry, Recipient};
use crate::server::{ServerEvent, UserInfo};

/// Computes and delivers presence notifications to the registry's members
#[derive(Clone)]
pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl PresenceBroadcaster {
    /// Create a broadcaster over the given registry
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Notify the joining connection's room, excluding the joiner itself,
    /// then push the updated roster to everyone
    pub async fn announce_join(&self, user: &UserInfo) {
        let event = ServerEvent::user_joined(user.clone());
        self.fan_out(&event, |r| {
            r.id != user.id && r.room.as_deref() == Some(user.room.as_str())
        })
        .await;
        self.broadcast_roster().await;
    }

    /// Notify the departed connection's room, after registry removal,
    /// then push the updated roster to everyone
    pub async fn announce_leave(&self, room: &str, id: Uuid) {
        let event = ServerEvent::user_left(id);
        self.fan_out(&event, |r| r.room.as_deref() == Some(room)).await;
        self.broadcast_roster().await;
    }

    /// Send the current roster to every open connection
    ///
    /// The list is recomputed fresh from the registry on each call and
    /// contains joined connections only.
    pub async fn broadcast_roster(&self) {
        let users = self.registry.roster().await;
        let event = ServerEvent::user_list(users);
        self.fan_out(&event, |_| true).await;
    }

    async fn fan_out<F>(&self, event: &ServerEvent, include: F)
    where
        F: Fn(&Recipient) -> bool,
    {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode presence event: {}", e);
                return;
            }
        };

        let mut delivered = 0usize;
        for recipient in self.registry.snapshot().await {
            if !include(&recipient) {
                continue;
            }
            if recipient.send_text(json.clone()) {
                delivered += 1;
            } else {
                // Writer task gone; the heartbeat will reap the entry
                warn!("Send to {} failed, skipping recipient", recipient.id);
            }
        }
        debug!("Delivered presence event to {} connections", delivered);
    }
}
