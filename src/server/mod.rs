//! WebSocket server module
//!
//! Handles the transport boundary: upgrades, the per-connection reader loop,
//! and the wire protocol.

mod protocol;
mod session;
mod websocket;

pub use protocol::*;
pub use session::*;
pub use websocket::*;
