//! Upstream daemon link
//!
//! Owns the single WebSocket connection to the gateway daemon, independent
//! of how many client sessions exist. Reconnects with randomized exponential
//! backoff; the delay is a timer, never a blocking sleep, so the rest of the
//! proxy keeps serving while the link is down.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};
use url::Url;

use crate::error::{GwProxyError, Result};
use crate::proxy::backoff::BackoffScheduler;
use crate::proxy::messages::ProxyMessage;
use crate::proxy::router::MessageRouter;

/// Outbound frames queued while a send is in flight
pub const UPSTREAM_BUFFER_SIZE: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// The outbound side of the upstream link as seen by the router
pub trait UpstreamSink: Send + Sync {
    /// Current connection state
    fn state(&self) -> UpstreamState;

    /// Queue a frame for the daemon.
    ///
    /// Fails fast when the link is not connected; requests are never
    /// buffered across an outage.
    fn send(&self, frame: String) -> Result<()>;
}

/// The single resilient connection to the gateway daemon
pub struct UpstreamLink {
    url: Url,
    state: RwLock<UpstreamState>,
    outbound_tx: mpsc::Sender<String>,
    // taken once by run()
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl UpstreamLink {
    /// Create a link for the given upstream URL
    pub fn new(url: Url) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(UPSTREAM_BUFFER_SIZE);
        Arc::new(Self {
            url,
            state: RwLock::new(UpstreamState::Disconnected),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        })
    }

    fn set_state(&self, state: UpstreamState) {
        *self.state.write() = state;
    }

    /// Drive the connect/relay/reconnect loop until shutdown.
    ///
    /// Inbound upstream frames are handed to the router; upstream state
    /// changes are broadcast to all sessions as control messages.
    pub async fn run(
        self: Arc<Self>,
        router: Arc<MessageRouter>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut outbound_rx = match self.outbound_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("Upstream link is already running");
                return;
            }
        };
        let mut backoff = BackoffScheduler::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(UpstreamState::Connecting);
            info!("Connecting to upstream {}", self.url);

            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!("Upstream connection established");
                    self.set_state(UpstreamState::Connected);
                    backoff.reset();
                    router.broadcast(&ProxyMessage::upstream_ready());

                    self.relay(stream, &mut outbound_rx, &router, &mut shutdown)
                        .await;

                    if *shutdown.borrow() {
                        break;
                    }
                    self.set_state(UpstreamState::Reconnecting);
                    router.broadcast(&ProxyMessage::upstream_disconnected());
                }
                Err(e) => {
                    error!("Failed to establish upstream connection: {}", e);
                    self.set_state(UpstreamState::Reconnecting);
                }
            }

            let delay = backoff.get_next();
            debug!(
                "Reconnect to upstream scheduled in {:.1} seconds (attempt {})",
                delay,
                backoff.counter()
            );
            router.broadcast(&ProxyMessage::upstream_reconnecting(
                backoff.counter(),
                delay,
            ));

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_state(UpstreamState::Disconnected);
        info!("Upstream link stopped");
    }

    /// Relay frames over an established connection until it fails or the
    /// proxy shuts down
    async fn relay(
        &self,
        stream: WsStream,
        outbound_rx: &mut mpsc::Receiver<String>,
        router: &Arc<MessageRouter>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(Message::Text(frame)).await {
                                error!("Failed to send frame upstream: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Incoming message from upstream: {}", text);
                            router.route_upstream(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Upstream closed connection: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Upstream connection error: {}", e);
                            break;
                        }
                        None => {
                            info!("Upstream connection closed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}

impl UpstreamSink for UpstreamLink {
    fn state(&self) -> UpstreamState {
        *self.state.read()
    }

    fn send(&self, frame: String) -> Result<()> {
        if self.state() != UpstreamState::Connected {
            return Err(GwProxyError::UpstreamUnavailable);
        }

        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(GwProxyError::UpstreamBusy),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GwProxyError::UpstreamUnavailable),
        }
    }
}
