//! Heartbeat monitor
//!
//! The only mechanism that detects half-open or silently-dead transports.
//! One process-wide task pings every open connection on a fixed period and
//! force-closes connections whose PONG never arrives; the regular close path
//! then handles deregistration and the leave broadcast.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::registry::ConnectionRegistry;

/// Period between heartbeat sweeps
pub const PING_INTERVAL: Duration = Duration::from_millis(45_000);

/// How long an unanswered PING may stand before the connection is reaped
pub const PONG_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Process-wide liveness prober, started exactly once
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor over the given registry
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            interval: PING_INTERVAL,
            timeout: PONG_TIMEOUT,
        }
    }

    /// Start the periodic sweep task
    ///
    /// Runs until the server's shutdown channel fires.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick(Instant::now()).await;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Heartbeat monitor stopping");
                        break;
                    }
                }
            }
        })
    }

    /// One sweep: ping the live, reap the dead. Returns the reap count.
    pub async fn tick(&self, now: Instant) -> usize {
        let report = self.registry.liveness_sweep(now, self.timeout).await;
        if report.pinged > 0 {
            debug!("Sent PING to {} connections", report.pinged);
        }
        for id in &report.reaped {
            info!("Connection {} missed the pong deadline, closing", id);
            self.registry.force_close(*id, None).await;
        }
        report.reaped.len()
    }
}
