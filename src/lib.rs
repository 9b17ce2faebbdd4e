//! Gwproxy - WebSocket proxy/gateway
//!
//! A WebSocket proxy between external dashboard clients and the gateway
//! control daemon.
//!
//! ## Features
//!
//! - Bearer-style token authentication of downstream clients
//! - A single resilient upstream connection shared by all sessions
//! - Request/response correlation by message id
//! - Randomized, capped exponential backoff for upstream reconnects
//! - Fully non-blocking I/O; reconnect delays are timers, not sleeps

pub mod config;
pub mod error;
pub mod proxy;

pub use config::{ProxyConfig, ProxyConfigManager};
pub use error::{GwProxyError, Result};
