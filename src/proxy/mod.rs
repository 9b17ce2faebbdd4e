//! WebSocket proxy core
//!
//! Sits between external dashboard clients and the gateway daemon's own
//! WebSocket server: authenticates downstream clients, multiplexes their
//! sessions over a single resilient upstream link, and correlates
//! request/response traffic by message id.

pub mod auth;
pub mod backoff;
pub mod messages;
pub mod router;
pub mod server;
pub mod session;
pub mod upstream;

/// Maximum number of frames to buffer per client session
pub const WS_BUFFER_SIZE: usize = 256;
