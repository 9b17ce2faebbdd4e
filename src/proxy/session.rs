//! Client session model and relay loops
//!
//! A session exists only for an authenticated downstream connection. It is
//! created on accept, owned by the server side, and destroyed on close;
//! nothing about it is ever serialized or shared across restarts.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::proxy::messages::ProxyMessage;
use crate::proxy::router::MessageRouter;
use crate::proxy::upstream::{UpstreamSink, UpstreamState};

/// An authenticated downstream client session
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Opaque session identifier
    pub id: Uuid,
    /// Remote address of the client
    pub remote_addr: SocketAddr,
    /// Whether the session passed token authentication
    pub authenticated: bool,
    /// Time the connection was accepted
    pub connected_at: DateTime<Utc>,
}

impl ClientSession {
    /// Create a session for a client that passed authentication
    pub fn authenticated(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            authenticated: true,
            connected_at: Utc::now(),
        }
    }
}

/// Relay traffic between an authenticated client socket and the upstream
/// link until either side closes.
///
/// Registers the session with the router, then runs a send task (router →
/// client) and a receive loop (client → router) side by side. Deregisters
/// the session and discards its pending requests on exit.
pub(crate) async fn relay_session(
    socket: WebSocket,
    session: ClientSession,
    router: Arc<MessageRouter>,
    upstream: Arc<dyn UpstreamSink>,
) {
    let session_id = session.id;
    let remote_addr = session.remote_addr;

    let mut outbound_rx = router.register(session);

    info!(session = %session_id, addr = %remote_addr, "Client session registered");

    router.send_to(session_id, &ProxyMessage::auth_success(session_id));

    // Tell the new session about the current upstream state so it does not
    // have to wait for the next state change broadcast.
    if upstream.state() == UpstreamState::Connected {
        router.send_to(session_id, &ProxyMessage::upstream_ready());
    }

    let (mut sender, mut receiver) = socket.split();

    // Router → client: frames are already serialized, in delivery order
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Client → upstream
    let router_rx = router.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    debug!(session = %session_id, "Incoming message from client: {}", text);
                    router_rx.forward_downstream(session_id, &text, upstream.as_ref());
                }
                Ok(Message::Close(_)) => {
                    debug!(session = %session_id, "Client closed connection");
                    break;
                }
                Ok(Message::Ping(_)) => {
                    // Pong is handled automatically by axum
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(session = %session_id, "Client connection error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut receive_task => {}
    }

    send_task.abort();
    receive_task.abort();
    let _ = tokio::join!(send_task, receive_task);

    router.deregister(session_id);
    info!(session = %session_id, addr = %remote_addr, "Client session closed");
}
