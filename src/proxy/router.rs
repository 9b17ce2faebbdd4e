//! Message routing and request/response correlation
//!
//! Outbound client frames are validated and tagged with a pending request
//! entry before being forwarded to the upstream link. Inbound upstream
//! frames are routed back to the session that originated the matching
//! request; they are never broadcast.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GwProxyError, Result};
use crate::proxy::messages::ProxyMessage;
use crate::proxy::session::ClientSession;
use crate::proxy::upstream::UpstreamSink;
use crate::proxy::WS_BUFFER_SIZE;

/// How long a forwarded request may wait for its response
pub const PENDING_REQUEST_TTL: Duration = Duration::from_secs(60);

/// How often expired pending requests are swept
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Correlates a forwarded request with the session awaiting its response
#[derive(Debug)]
pub struct PendingRequest {
    pub origin_session_id: Uuid,
    pub created_at: Instant,
}

/// A registered session's outbound queue and metadata
struct SessionHandle {
    session: ClientSession,
    tx: mpsc::Sender<String>,
}

/// Routes frames between client sessions and the single upstream link
pub struct MessageRouter {
    sessions: DashMap<Uuid, SessionHandle>,
    pending: DashMap<String, PendingRequest>,
}

impl MessageRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Register a session and return the receiving end of its outbound queue.
    ///
    /// Frames pushed to the queue are already serialized; the queue preserves
    /// delivery order for the session.
    pub fn register(&self, session: ClientSession) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(WS_BUFFER_SIZE);
        self.sessions.insert(session.id, SessionHandle { session, tx });
        rx
    }

    /// Deregister a session and discard its pending requests.
    ///
    /// A late upstream response for the session is dropped from then on.
    pub fn deregister(&self, session_id: Uuid) {
        if let Some((_, handle)) = self.sessions.remove(&session_id) {
            debug!(
                session = %session_id,
                addr = %handle.session.remote_addr,
                connected_at = %handle.session.connected_at,
                "Session deregistered"
            );
        }
        self.pending
            .retain(|_, pending| pending.origin_session_id != session_id);
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a control message to a single session
    pub fn send_to(&self, session_id: Uuid, message: &ProxyMessage) {
        self.deliver_raw(session_id, message.to_json());
    }

    /// Send a control message to every registered session
    pub fn broadcast(&self, message: &ProxyMessage) {
        let frame = message.to_json();
        for entry in self.sessions.iter() {
            self.try_push(entry.key(), &entry.tx, frame.clone());
        }
    }

    /// Validate and forward a client frame to the upstream link.
    ///
    /// A frame that is not JSON gets a `PROXY_MESSAGE_INVALID` reply; JSON
    /// without the daemon API shape gets `REQUEST_INVALID`. Valid requests
    /// are recorded in the pending table and forwarded verbatim. A
    /// correlation id another session already has in flight is rejected with
    /// `UPSTREAM_REQUEST_FAILED`; the existing claim is left untouched. If
    /// the upstream is not connected the request fails fast with
    /// `UPSTREAM_REQUEST_FAILED` and nothing is recorded.
    pub fn forward_downstream(&self, session_id: Uuid, raw: &str, upstream: &dyn UpstreamSink) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(session = %session_id, "Discarding non-JSON client frame: {}", e);
                self.send_to(session_id, &ProxyMessage::message_invalid(raw, &e.to_string()));
                return;
            }
        };

        let msg_id = match correlation_id(&value) {
            Some(msg_id) => msg_id.to_string(),
            None => {
                warn!(session = %session_id, "Discarding frame without daemon API shape: {}", raw);
                self.send_to(session_id, &ProxyMessage::request_invalid(raw));
                return;
            }
        };

        match self.pending.entry(msg_id.clone()) {
            // a session may reissue its own id; it never takes over another
            // session's pending response
            Entry::Occupied(existing) if existing.get().origin_session_id != session_id => {
                warn!(
                    session = %session_id,
                    msg_id = %msg_id,
                    "Correlation id already in flight for another session"
                );
                drop(existing);
                self.send_to(session_id, &ProxyMessage::request_failed(&msg_id));
                return;
            }
            entry => {
                entry.insert(PendingRequest {
                    origin_session_id: session_id,
                    created_at: Instant::now(),
                });
            }
        }

        if let Err(e) = upstream.send(raw.to_string()) {
            // fail fast while the link is down instead of buffering
            warn!(session = %session_id, msg_id = %msg_id, "Cannot relay request: {}", e);
            self.pending.remove(&msg_id);
            self.send_to(session_id, &ProxyMessage::request_failed(&msg_id));
        }
    }

    /// Route an upstream frame to the session that originated the matching
    /// request.
    ///
    /// Frames without a matching pending request are logged and dropped;
    /// they are never broadcast to other sessions.
    pub fn route_upstream(&self, raw: &str) {
        if let Err(e) = self.try_route_upstream(raw) {
            warn!("Dropping upstream frame: {}", e);
        }
    }

    fn try_route_upstream(&self, raw: &str) -> Result<()> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| GwProxyError::MalformedMessage(e.to_string()))?;

        let msg_id = correlation_id(&value)
            .ok_or_else(|| GwProxyError::MalformedMessage(raw.to_string()))?
            .to_string();

        let (_, pending) = self
            .pending
            .remove(&msg_id)
            .ok_or(GwProxyError::UnknownCorrelationId(msg_id.clone()))?;

        debug!(msg_id = %msg_id, session = %pending.origin_session_id, "Routing upstream response");
        self.deliver_raw(pending.origin_session_id, raw.to_string());
        Ok(())
    }

    /// Drop pending requests older than `ttl`, notifying their origins
    pub fn sweep_expired(&self, ttl: Duration) {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.pending.retain(|msg_id, pending| {
            if now.duration_since(pending.created_at) >= ttl {
                expired.push((msg_id.clone(), pending.origin_session_id));
                false
            } else {
                true
            }
        });

        for (msg_id, origin) in expired {
            info!(msg_id = %msg_id, session = %origin, "Pending request timed out");
            self.send_to(origin, &ProxyMessage::request_failed(&msg_id));
        }
    }

    /// Periodically sweep expired pending requests until shutdown
    pub async fn run_sweeper(self: Arc<Self>, ttl: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_expired(ttl);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Deliver an already serialized frame to a session
    fn deliver_raw(&self, session_id: Uuid, frame: String) {
        match self.sessions.get(&session_id) {
            Some(handle) => self.try_push(&session_id, &handle.tx, frame),
            None => {
                debug!(session = %session_id, "Dropping frame for closed session");
            }
        }
    }

    /// Push without blocking; a slow client loses frames rather than
    /// stalling the router.
    fn try_push(&self, session_id: &Uuid, tx: &mpsc::Sender<String>, frame: String) {
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %session_id, "Session buffer full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %session_id, "Session channel closed");
            }
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the daemon API correlation id (`data.msgId`) from a frame.
///
/// A valid daemon API message carries a string `mType` and a string
/// `data.msgId`; the latter correlates requests with responses.
fn correlation_id(value: &Value) -> Option<&str> {
    value.get("mType")?.as_str()?;
    value.get("data")?.get("msgId")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GwProxyError, Result};
    use crate::proxy::upstream::UpstreamState;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::net::SocketAddr;

    /// Upstream double that records sent frames
    struct FakeUpstream {
        state: UpstreamState,
        sent: Mutex<Vec<String>>,
    }

    impl FakeUpstream {
        fn connected() -> Self {
            Self {
                state: UpstreamState::Connected,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn reconnecting() -> Self {
            Self {
                state: UpstreamState::Reconnecting,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl UpstreamSink for FakeUpstream {
        fn state(&self) -> UpstreamState {
            self.state
        }

        fn send(&self, frame: String) -> Result<()> {
            if self.state != UpstreamState::Connected {
                return Err(GwProxyError::UpstreamUnavailable);
            }
            self.sent.lock().push(frame);
            Ok(())
        }
    }

    fn test_session() -> ClientSession {
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        ClientSession::authenticated(addr)
    }

    fn request(msg_id: &str) -> String {
        json!({ "mType": "iqrfEmbedLedr_Set", "data": { "msgId": msg_id } }).to_string()
    }

    #[tokio::test]
    async fn test_forward_records_pending_and_sends() {
        let router = MessageRouter::new();
        let session = test_session();
        let id = session.id;
        let _rx = router.register(session);
        let upstream = FakeUpstream::connected();

        router.forward_downstream(id, &request("42"), &upstream);

        assert_eq!(router.pending_count(), 1);
        assert_eq!(upstream.sent.lock().as_slice(), &[request("42")]);
    }

    #[tokio::test]
    async fn test_non_json_frame_gets_message_invalid() {
        let router = MessageRouter::new();
        let session = test_session();
        let id = session.id;
        let mut rx = router.register(session);
        let upstream = FakeUpstream::connected();

        router.forward_downstream(id, "{\"type}", &upstream);

        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "PROXY_MESSAGE_INVALID");
        assert_eq!(reply["data"]["message"], "{\"type}");
        assert!(reply["data"]["error"].is_string());
        assert_eq!(router.pending_count(), 0);
        assert!(upstream.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_json_without_correlation_gets_request_invalid() {
        let router = MessageRouter::new();
        let session = test_session();
        let id = session.id;
        let mut rx = router.register(session);
        let upstream = FakeUpstream::connected();

        let raw = json!({ "foo": 1 }).to_string();
        router.forward_downstream(id, &raw, &upstream);

        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "REQUEST_INVALID");
        assert_eq!(reply["data"], raw.as_str());
        assert!(upstream.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_when_upstream_down() {
        let router = MessageRouter::new();
        let session = test_session();
        let id = session.id;
        let mut rx = router.register(session);
        let upstream = FakeUpstream::reconnecting();

        router.forward_downstream(id, &request("42"), &upstream);

        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "UPSTREAM_REQUEST_FAILED");
        assert_eq!(reply["data"]["msgId"], "42");
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_routed_only_to_originator() {
        let router = MessageRouter::new();
        let session_a = test_session();
        let session_b = test_session();
        let id_a = session_a.id;
        let mut rx_a = router.register(session_a);
        let mut rx_b = router.register(session_b);
        let upstream = FakeUpstream::connected();

        router.forward_downstream(id_a, &request("42"), &upstream);

        let response = json!({
            "mType": "iqrfEmbedLedr_Set",
            "data": { "msgId": "42", "rsp": {}, "status": 0 }
        })
        .to_string();
        router.route_upstream(&response);

        assert_eq!(rx_a.recv().await.unwrap(), response);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_msgid_from_other_session_rejected() {
        let router = MessageRouter::new();
        let session_a = test_session();
        let session_b = test_session();
        let id_a = session_a.id;
        let id_b = session_b.id;
        let mut rx_a = router.register(session_a);
        let mut rx_b = router.register(session_b);
        let upstream = FakeUpstream::connected();

        router.forward_downstream(id_a, &request("42"), &upstream);
        router.forward_downstream(id_b, &request("42"), &upstream);

        // the duplicate is rejected and never forwarded
        let reply: Value = serde_json::from_str(&rx_b.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "UPSTREAM_REQUEST_FAILED");
        assert_eq!(reply["data"]["msgId"], "42");
        assert_eq!(upstream.sent.lock().len(), 1);
        assert_eq!(router.pending_count(), 1);

        // the response still reaches the first claimant only
        let response = json!({
            "mType": "iqrfEmbedLedr_Set",
            "data": { "msgId": "42", "rsp": {}, "status": 0 }
        })
        .to_string();
        router.route_upstream(&response);

        assert_eq!(rx_a.recv().await.unwrap(), response);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_session_may_reissue_msgid() {
        let router = MessageRouter::new();
        let session = test_session();
        let id = session.id;
        let mut rx = router.register(session);
        let upstream = FakeUpstream::connected();

        router.forward_downstream(id, &request("42"), &upstream);
        router.forward_downstream(id, &request("42"), &upstream);

        assert_eq!(upstream.sent.lock().len(), 2);
        assert_eq!(router.pending_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsolicited_response_dropped() {
        let router = MessageRouter::new();
        let session = test_session();
        let mut rx = router.register(session);

        router.route_upstream(&request("unknown"));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deregister_discards_pending() {
        let router = MessageRouter::new();
        let session = test_session();
        let id = session.id;
        let _rx = router.register(session);
        let upstream = FakeUpstream::connected();

        router.forward_downstream(id, &request("42"), &upstream);
        assert_eq!(router.pending_count(), 1);

        router.deregister(id);
        assert_eq!(router.session_count(), 0);
        assert_eq!(router.pending_count(), 0);

        // a late response for the closed session is dropped
        router.route_upstream(&request("42"));
    }

    #[tokio::test]
    async fn test_sweep_notifies_origin() {
        let router = MessageRouter::new();
        let session = test_session();
        let id = session.id;
        let mut rx = router.register(session);
        let upstream = FakeUpstream::connected();

        router.forward_downstream(id, &request("42"), &upstream);
        // consume nothing yet; expire immediately
        router.sweep_expired(Duration::from_secs(0));

        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "UPSTREAM_REQUEST_FAILED");
        assert_eq!(reply["data"]["msgId"], "42");
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_sessions() {
        let router = MessageRouter::new();
        let mut rx_a = router.register(test_session());
        let mut rx_b = router.register(test_session());

        router.broadcast(&ProxyMessage::upstream_disconnected());

        for rx in [&mut rx_a, &mut rx_b] {
            let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(msg["type"], "UPSTREAM_DISCONNECTED");
        }
    }
}
