//! Downstream WebSocket server
//!
//! Accepts dashboard client connections, runs the per-connection
//! authentication state machine, and hands authenticated sockets to the
//! relay. Rejected connections get a control message and are closed with
//! WebSocket code 1008 (Policy Violation); there is no retry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::{GwProxyError, Result};
use crate::proxy::auth::{AuthResult, ConnectionAuthenticator};
use crate::proxy::messages::ProxyMessage;
use crate::proxy::router::MessageRouter;
use crate::proxy::session::{relay_session, ClientSession};
use crate::proxy::upstream::UpstreamLink;

/// Shared state for connection handlers
#[derive(Clone)]
pub struct AppState {
    pub authenticator: ConnectionAuthenticator,
    pub router: Arc<MessageRouter>,
    pub upstream: Arc<UpstreamLink>,
}

/// Downstream proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    state: AppState,
}

impl ProxyServer {
    /// Create a new proxy server.
    ///
    /// The authenticator, router, and upstream link are injected so they can
    /// be shared with the upstream task and swapped out in tests.
    pub fn new(
        config: ProxyConfig,
        authenticator: ConnectionAuthenticator,
        router: Arc<MessageRouter>,
        upstream: Arc<UpstreamLink>,
    ) -> Self {
        let state = AppState {
            authenticator,
            router,
            upstream,
        };

        Self { config, state }
    }

    /// Build the router
    fn build_router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind to the configured address and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let router = self.build_router();

        info!(
            "Proxy server listening on {} (advertised host: {})",
            listener.local_addr()?,
            self.config.host
        );

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| GwProxyError::Internal(e.to_string()))?;

        info!("Proxy server shut down");
        Ok(())
    }
}

/// WebSocket upgrade handler; the access token rides in the query string
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_connection(socket, token, addr, state))
}

/// Run the per-connection state machine: authenticate, then relay
async fn handle_connection(
    mut socket: WebSocket,
    token: Option<String>,
    addr: SocketAddr,
    state: AppState,
) {
    info!(addr = %addr, "Client connected to proxy server");

    match state.authenticator.authenticate(token.as_deref()) {
        AuthResult::Authenticated => {}
        AuthResult::Rejected(reason) => {
            warn!(addr = %addr, "Rejecting client: {:?}", reason);

            let notice = ProxyMessage::auth_failed(reason.wire_code());
            let _ = socket.send(Message::Text(notice.to_json())).await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        }
    }

    let session = ClientSession::authenticated(addr);
    relay_session(
        socket,
        session,
        state.router.clone(),
        state.upstream.clone(),
    )
    .await;
}
