//! Presence engine
//!
//! The connection registry, rate limiter, heartbeat monitor, and presence
//! broadcaster that make up the relay's in-memory state.

mod broadcast;
mod heartbeat;
mod limiter;
mod registry;

pub use broadcast::*;
pub use heartbeat::*;
pub use limiter::*;
pub use registry::*;
