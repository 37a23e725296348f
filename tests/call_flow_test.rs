//! End-to-end call flow tests: two endpoints (caller and agent) wired
//! through an in-memory signaling relay and a scripted backend, with
//! fake peer connections recording every operation in order.
//!
//! The relay reproduces the production routing rules: `offer` goes to
//! the caller in the target session, `answer` to the agent, candidates
//! to everyone else in the session, and routing context is stripped
//! before delivery.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use callpoint::calls::{
    CallError, CallManager, CallState, MediaPeer, MediaPeerFactory, PeerEvent, SdpKind,
};
use callpoint::config::EndpointConfig;
use callpoint::media::{LocalTrack, MediaSource, TrackKind};
use callpoint::net::{HttpClient, HttpRequest, HttpResponse};
use callpoint::signaling::IceCandidate;
use callpoint::transport::{SignalingTransport, SignalingTransportFactory, TransportEvent};
use callpoint::types::call::{CallRole, EndCallReason, SessionId};

// ---------------------------------------------------------------------
// In-memory signaling relay
// ---------------------------------------------------------------------

#[derive(Default)]
struct RelayInner {
    clients: HashMap<String, mpsc::Sender<TransportEvent>>,
    sessions: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct TestRelay {
    inner: Mutex<RelayInner>,
    drop_answers: AtomicBool,
}

impl TestRelay {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn register(&self, client_id: &str, sender: mpsc::Sender<TransportEvent>) {
        self.inner
            .lock()
            .await
            .clients
            .insert(client_id.to_string(), sender);
    }

    async fn unregister(&self, client_id: &str) {
        self.inner.lock().await.clients.remove(client_id);
    }

    async fn add_to_session(&self, session_id: &str, client_id: &str) {
        let mut inner = self.inner.lock().await;
        let members = inner.sessions.entry(session_id.to_string()).or_default();
        if !members.iter().any(|m| m == client_id) {
            members.push(client_id.to_string());
        }
    }

    async fn deliver_raw(&self, client_id: &str, text: &str) {
        let sender = self.inner.lock().await.clients.get(client_id).cloned();
        if let Some(sender) = sender {
            let _ = sender
                .send(TransportEvent::MessageReceived(text.to_string()))
                .await;
        }
    }

    async fn broadcast_pending_update(&self) {
        let senders: Vec<_> = {
            let inner = self.inner.lock().await;
            inner
                .clients
                .iter()
                .filter(|(id, _)| id.starts_with("agent_"))
                .map(|(_, s)| s.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender
                .send(TransportEvent::MessageReceived(
                    json!({"type": "pending_update"}).to_string(),
                ))
                .await;
        }
    }

    async fn broadcast_call_ended(&self, session_id: &str) {
        let senders: Vec<_> = {
            let inner = self.inner.lock().await;
            let Some(members) = inner.sessions.get(session_id) else {
                return;
            };
            members
                .iter()
                .filter_map(|m| inner.clients.get(m).cloned())
                .collect()
        };
        for sender in senders {
            let _ = sender
                .send(TransportEvent::MessageReceived(
                    json!({"type": "call_ended"}).to_string(),
                ))
                .await;
        }
    }

    async fn disconnect_client(&self, client_id: &str) {
        // Dropping the sender ends the client's event stream.
        self.unregister(client_id).await;
    }

    /// The production routing rules, target stripped before delivery.
    async fn route(&self, from: &str, text: &str) {
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let msg_type = message["type"].as_str().unwrap_or_default().to_string();
        let target = message["target"].as_str().unwrap_or_default().to_string();

        match msg_type.as_str() {
            "join_session" => {
                if let Some(session_id) = message["session_id"].as_str() {
                    self.add_to_session(session_id, from).await;
                }
            }
            "agent_ready" => {}
            "offer" => {
                self.forward_to_role(&target, "caller_", json!({"type": "offer", "sdp": message["sdp"]}))
                    .await;
            }
            "answer" => {
                if self.drop_answers.load(Ordering::SeqCst) {
                    return;
                }
                self.forward_to_role(&target, "agent_", json!({"type": "answer", "sdp": message["sdp"]}))
                    .await;
            }
            "ice_candidate" => {
                let senders: Vec<_> = {
                    let inner = self.inner.lock().await;
                    let Some(members) = inner.sessions.get(&target) else {
                        return;
                    };
                    members
                        .iter()
                        .filter(|m| m.as_str() != from)
                        .filter_map(|m| inner.clients.get(m).cloned())
                        .collect()
                };
                let payload =
                    json!({"type": "ice_candidate", "candidate": message["candidate"]}).to_string();
                for sender in senders {
                    let _ = sender
                        .send(TransportEvent::MessageReceived(payload.clone()))
                        .await;
                }
            }
            _ => {}
        }
    }

    async fn forward_to_role(&self, session_id: &str, prefix: &str, payload: Value) {
        let sender = {
            let inner = self.inner.lock().await;
            let Some(members) = inner.sessions.get(session_id) else {
                return;
            };
            members
                .iter()
                .find(|m| m.starts_with(prefix))
                .and_then(|m| inner.clients.get(m).cloned())
        };
        if let Some(sender) = sender {
            let _ = sender
                .send(TransportEvent::MessageReceived(payload.to_string()))
                .await;
        }
    }
}

struct RelayTransport {
    relay: Arc<TestRelay>,
    client_id: String,
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
        self.relay.route(&self.client_id, text).await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.relay.unregister(&self.client_id).await;
    }
}

struct RelayTransportFactory {
    relay: Arc<TestRelay>,
}

#[async_trait]
impl SignalingTransportFactory for RelayTransportFactory {
    async fn create_transport(
        &self,
        endpoint_id: &str,
    ) -> Result<(Arc<dyn SignalingTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (tx, rx) = mpsc::channel(256);
        self.relay.register(endpoint_id, tx.clone()).await;
        let _ = tx.send(TransportEvent::Connected).await;
        Ok((
            Arc::new(RelayTransport {
                relay: self.relay.clone(),
                client_id: endpoint_id.to_string(),
            }),
            rx,
        ))
    }
}

// ---------------------------------------------------------------------
// Fake peer connections
// ---------------------------------------------------------------------

struct FakePeer {
    ops: Mutex<Vec<String>>,
    close_count: Mutex<usize>,
    event_tx: mpsc::Sender<PeerEvent>,
}

impl FakePeer {
    async fn record(&self, op: impl Into<String>) {
        self.ops.lock().await.push(op.into());
    }

    async fn ops(&self) -> Vec<String> {
        self.ops.lock().await.clone()
    }

    async fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self
            .event_tx
            .send(PeerEvent::CandidateGenerated(candidate))
            .await;
    }
}

#[async_trait]
impl MediaPeer for FakePeer {
    async fn create_offer(&self) -> Result<String, anyhow::Error> {
        self.record("create_offer").await;
        Ok("v=0 fake-offer".to_string())
    }

    async fn create_answer(&self) -> Result<String, anyhow::Error> {
        self.record("create_answer").await;
        Ok("v=0 fake-answer".to_string())
    }

    async fn set_local_description(&self, kind: SdpKind, _sdp: &str) -> Result<(), anyhow::Error> {
        self.record(format!("set_local:{}", kind.as_str())).await;
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: &str) -> Result<(), anyhow::Error> {
        self.record(format!("set_remote:{}", kind.as_str())).await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        self.record(format!("add_candidate:{}", candidate.candidate))
            .await;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), anyhow::Error> {
        self.record(format!("add_track:{}", track.kind)).await;
        Ok(())
    }

    async fn close(&self) {
        *self.close_count.lock().await += 1;
    }
}

/// Creation order is deterministic per endpoint: the primary connection
/// is created inline before any recording task can run, so `created[0]`
/// is always the primary leg.
#[derive(Default)]
struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().await.clone()
    }

    async fn primary(&self) -> Arc<FakePeer> {
        self.created.lock().await.first().cloned().expect("no peer created")
    }
}

#[async_trait]
impl MediaPeerFactory for FakePeerFactory {
    async fn create_peer(
        &self,
    ) -> Result<(Arc<dyn MediaPeer>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let peer = Arc::new(FakePeer {
            ops: Mutex::new(Vec::new()),
            close_count: Mutex::new(0),
            event_tx,
        });
        self.created.lock().await.push(peer.clone());
        Ok((peer, event_rx))
    }
}

// ---------------------------------------------------------------------
// Local media
// ---------------------------------------------------------------------

#[derive(Default)]
struct TestMediaSource {
    fail_audio: AtomicBool,
    fail_video: AtomicBool,
}

impl TestMediaSource {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MediaSource for TestMediaSource {
    async fn acquire_audio(&self) -> Result<LocalTrack, anyhow::Error> {
        if self.fail_audio.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("microphone access denied"));
        }
        Ok(LocalTrack::new("audio", TrackKind::Audio, None))
    }

    async fn acquire_video(&self) -> Result<LocalTrack, anyhow::Error> {
        if self.fail_video.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("camera access denied"));
        }
        Ok(LocalTrack::new("video", TrackKind::Video, None))
    }
}

// ---------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------

struct TestBackend {
    relay: Arc<TestRelay>,
    record_offer_ok: AtomicBool,
    notifies: Mutex<Vec<(String, String, String)>>, // (session, caller_name, caller_id)
    responds: Mutex<Vec<(String, String)>>,         // (session, action)
    ends: Mutex<Vec<String>>,
    record_offers: Mutex<Vec<(String, String)>>, // (session, role)
    record_stops: Mutex<Vec<(String, String)>>,
    last_authorization: Mutex<Option<String>>,
}

impl TestBackend {
    fn new(relay: Arc<TestRelay>) -> Arc<Self> {
        Arc::new(Self {
            relay,
            record_offer_ok: AtomicBool::new(true),
            notifies: Mutex::new(Vec::new()),
            responds: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
            record_offers: Mutex::new(Vec::new()),
            record_stops: Mutex::new(Vec::new()),
            last_authorization: Mutex::new(None),
        })
    }

    fn ok(body: Value) -> HttpResponse {
        HttpResponse {
            status_code: 200,
            body: body.to_string().into_bytes(),
        }
    }

    fn status(code: u16) -> HttpResponse {
        HttpResponse {
            status_code: code,
            body: Vec::new(),
        }
    }
}

#[async_trait]
impl HttpClient for TestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        *self.last_authorization.lock().await =
            request.headers.get("Authorization").cloned();

        let path = request
            .url
            .strip_prefix("http://backend.test")
            .unwrap_or(&request.url)
            .to_string();
        let body: Value = request
            .body
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(Value::Null);

        let response = match path.as_str() {
            "/api/call/notify" => {
                let session = body["session_id"].as_str().unwrap_or_default().to_string();
                let caller_id = body["caller_id"].as_str().unwrap_or_default().to_string();
                self.relay.add_to_session(&session, &caller_id).await;
                self.notifies.lock().await.push((
                    session,
                    body["caller_name"].as_str().unwrap_or_default().to_string(),
                    caller_id,
                ));
                self.relay.broadcast_pending_update().await;
                Self::ok(json!({"ok": true}))
            }
            "/api/call/respond" => {
                let session = body["session_id"].as_str().unwrap_or_default().to_string();
                let action = body["action"].as_str().unwrap_or_default().to_string();
                if action == "accept"
                    && let Some(agent_id) = body["agent_id"].as_str()
                {
                    self.relay.add_to_session(&session, agent_id).await;
                }
                self.responds.lock().await.push((session, action.clone()));
                Self::ok(json!({"ok": true, "action": action}))
            }
            "/api/call/end" => {
                let session = body["session_id"].as_str().unwrap_or_default().to_string();
                self.ends.lock().await.push(session.clone());
                self.relay.broadcast_call_ended(&session).await;
                Self::ok(json!({"ok": true}))
            }
            "/api/record/offer" => {
                let session = body["session_id"].as_str().unwrap_or_default().to_string();
                let role = body["role"].as_str().unwrap_or_default().to_string();
                self.record_offers.lock().await.push((session, role));
                if self.record_offer_ok.load(Ordering::SeqCst) {
                    Self::ok(json!({"sdp": "v=0 recorder-answer", "type": "answer"}))
                } else {
                    Self::status(500)
                }
            }
            "/api/record/stop" => {
                let session = body["session_id"].as_str().unwrap_or_default().to_string();
                let role = body["role"].as_str().unwrap_or_default().to_string();
                self.record_stops.lock().await.push((session, role));
                Self::ok(json!({"ok": true}))
            }
            "/api/calls/pending" => {
                let notifies = self.notifies.lock().await;
                let calls: Vec<Value> = notifies
                    .iter()
                    .enumerate()
                    .map(|(i, (session, name, caller_id))| {
                        json!({
                            "id": i as i64 + 1,
                            "session_id": session,
                            "caller_name": name,
                            "caller_id": caller_id,
                            "start_time": "2026-08-06T10:00:00",
                        })
                    })
                    .collect();
                Self::ok(Value::Array(calls))
            }
            "/api/auth/request-otp" => Self::ok(json!({"ok": true})),
            "/api/auth/verify-otp" => {
                Self::ok(json!({"access_token": "token-abc", "token_type": "bearer"}))
            }
            _ => Self::status(404),
        };
        Ok(response)
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Endpoint {
    manager: Arc<CallManager>,
    peers: Arc<FakePeerFactory>,
    media: Arc<TestMediaSource>,
}

fn build_endpoint(role: CallRole, relay: &Arc<TestRelay>, backend: &Arc<TestBackend>) -> Endpoint {
    let peers = FakePeerFactory::new();
    let media = TestMediaSource::new();
    let config = EndpointConfig {
        backend_base_url: "http://backend.test".to_string(),
        relay_ws_url: "ws://backend.test/ws".to_string(),
        stun_servers: vec![],
        recording_enabled: true,
    };
    let manager = CallManager::new(
        role,
        config,
        Arc::new(RelayTransportFactory {
            relay: relay.clone(),
        }),
        peers.clone(),
        media.clone(),
        backend.clone(),
    );
    Endpoint {
        manager,
        peers,
        media,
    }
}

struct Fixture {
    relay: Arc<TestRelay>,
    backend: Arc<TestBackend>,
    caller: Endpoint,
    agent: Endpoint,
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let relay = TestRelay::new();
    let backend = TestBackend::new(relay.clone());
    let caller = build_endpoint(CallRole::Caller, &relay, &backend);
    let agent = build_endpoint(CallRole::Agent, &relay, &backend);
    Fixture {
        relay,
        backend,
        caller,
        agent,
    }
}

async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn is_active(manager: &Arc<CallManager>) -> bool {
    manager
        .session()
        .await
        .is_some_and(|s| s.state.is_active())
}

/// Drive a call to Active on both sides and return its session id.
async fn establish_call(fx: &Fixture) -> SessionId {
    fx.agent.manager.connect().await.unwrap();
    let session_id = fx.caller.manager.start_call("Ada").await.unwrap();
    fx.agent
        .manager
        .accept_call(session_id.clone(), "Ada", None)
        .await
        .unwrap();

    let caller = fx.caller.manager.clone();
    let agent = fx.agent.manager.clone();
    wait_until("both sides active", || {
        let caller = caller.clone();
        let agent = agent.clone();
        async move { is_active(&caller).await && is_active(&agent).await }
    })
    .await;
    session_id
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

/// Agent accepts a pending call, sends the offer, the caller answers:
/// both sides reach Active, and the agent's recording relay was started
/// with role `agent` on entering Negotiating.
#[tokio::test]
async fn test_full_negotiation_reaches_active_on_both_sides() {
    let fx = fixture();
    let mut pending = fx.agent.manager.event_bus().pending_update.subscribe();

    let session_id = establish_call(&fx).await;

    // The caller's announcement produced a pending-set notice.
    tokio::time::timeout(Duration::from_secs(1), pending.recv())
        .await
        .expect("no pending_update notice")
        .unwrap();

    // Description exchange ran with the fixed polarity.
    let agent_ops = fx.agent.peers.primary().await.ops().await;
    assert!(agent_ops.contains(&"create_offer".to_string()));
    assert!(agent_ops.contains(&"set_local:offer".to_string()));
    assert!(agent_ops.contains(&"set_remote:answer".to_string()));

    let caller_ops = fx.caller.peers.primary().await.ops().await;
    assert!(caller_ops.contains(&"set_remote:offer".to_string()));
    assert!(caller_ops.contains(&"create_answer".to_string()));

    // Recording was negotiated for both roles against the same session.
    let backend = fx.backend.clone();
    wait_until("recording negotiated for both roles", || {
        let backend = backend.clone();
        let session = session_id.to_string();
        async move {
            let offers = backend.record_offers.lock().await;
            offers.iter().any(|(s, r)| *s == session && r == "agent")
                && offers.iter().any(|(s, r)| *s == session && r == "caller")
        }
    })
    .await;

    // A locally gathered candidate is wrapped with the session context
    // and relayed to the counterpart.
    let agent_primary = fx.agent.peers.primary().await;
    agent_primary
        .emit_candidate(IceCandidate::new("agent-host-1"))
        .await;

    let caller_primary = fx.caller.peers.primary().await;
    wait_until("candidate relayed to caller", || {
        let peer = caller_primary.clone();
        async move {
            peer.ops()
                .await
                .contains(&"add_candidate:agent-host-1".to_string())
        }
    })
    .await;
}

/// Role polarity invariant: only the agent ever creates offers on the
/// primary connection, only the caller creates answers.
#[tokio::test]
async fn test_role_polarity_on_primary_connection() {
    let fx = fixture();
    establish_call(&fx).await;

    let agent_ops = fx.agent.peers.primary().await.ops().await;
    assert!(!agent_ops.contains(&"create_answer".to_string()));

    let caller_ops = fx.caller.peers.primary().await.ops().await;
    assert!(!caller_ops.contains(&"create_offer".to_string()));
}

/// Candidates that outrun the offer are queued and applied, in arrival
/// order, only after the remote description is installed.
#[tokio::test]
async fn test_candidate_race_at_call_start() {
    let fx = fixture();
    fx.agent.manager.connect().await.unwrap();
    let session_id = fx.caller.manager.start_call("Ada").await.unwrap();

    // Race: candidates reach the caller before any offer exists.
    let caller_id = fx.caller.manager.endpoint_id().as_str().to_string();
    for n in 1..=2 {
        fx.relay
            .deliver_raw(
                &caller_id,
                &json!({
                    "type": "ice_candidate",
                    "candidate": {"candidate": format!("early-{n}")},
                })
                .to_string(),
            )
            .await;
    }
    // Give the dispatch loop time to buffer them.
    tokio::time::sleep(Duration::from_millis(50)).await;

    fx.agent
        .manager
        .accept_call(session_id, "Ada", None)
        .await
        .unwrap();

    let caller = fx.caller.manager.clone();
    wait_until("caller active", || {
        let caller = caller.clone();
        async move { is_active(&caller).await }
    })
    .await;

    let ops = fx.caller.peers.primary().await.ops().await;
    let remote_at = ops
        .iter()
        .position(|op| op == "set_remote:offer")
        .expect("remote offer applied");
    let first = ops
        .iter()
        .position(|op| op == "add_candidate:early-1")
        .expect("first candidate applied");
    let second = ops
        .iter()
        .position(|op| op == "add_candidate:early-2")
        .expect("second candidate applied");
    assert!(remote_at < first, "candidate applied before description: {ops:?}");
    assert!(first < second, "candidates reordered: {ops:?}");
}

/// A failing recording negotiation is non-fatal and never retried: the
/// call still reaches Active.
#[tokio::test]
async fn test_recording_failure_is_nonfatal() {
    let fx = fixture();
    fx.backend.record_offer_ok.store(false, Ordering::SeqCst);
    let mut failed = fx.agent.manager.event_bus().recording_failed.subscribe();

    let session_id = establish_call(&fx).await;

    let notice = tokio::time::timeout(Duration::from_secs(1), failed.recv())
        .await
        .expect("no recording-failed notice")
        .unwrap();
    assert_eq!(notice.session_id, session_id);
    assert_eq!(notice.role, CallRole::Agent);

    // Exactly one attempt per role, no retry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let offers = fx.backend.record_offers.lock().await;
    let agent_attempts = offers.iter().filter(|(_, r)| r == "agent").count();
    assert_eq!(agent_attempts, 1);
}

/// Hangup tears down exactly once even when it races the remote
/// `call_ended` broadcast, and the remote side ends too.
#[tokio::test]
async fn test_teardown_is_idempotent_under_hangup_race() {
    let fx = fixture();
    let session_id = establish_call(&fx).await;

    let mut agent_ended = fx.agent.manager.event_bus().call_ended.subscribe();

    fx.caller.manager.hangup().await.unwrap();
    // The backend broadcast call_ended into the session; the caller's own
    // copy races its local teardown.
    fx.caller.manager.hangup().await.unwrap(); // second local attempt is a no-op

    let ended = tokio::time::timeout(Duration::from_secs(1), agent_ended.recv())
        .await
        .expect("agent never saw the end")
        .unwrap();
    assert_eq!(ended.session_id, session_id);
    assert_eq!(ended.reason, EndCallReason::RemoteEnded);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Exactly one close of the caller's primary connection.
    let closes = *fx.caller.peers.primary().await.close_count.lock().await;
    assert_eq!(closes, 1);

    let state = fx.caller.manager.session().await.unwrap().state;
    assert!(state.is_ended());
    if let CallState::Ended { duration_secs, .. } = state {
        assert!(duration_secs.is_some());
    }

    // Recording stop went out for the caller role.
    let stops = fx.backend.record_stops.lock().await;
    assert!(stops
        .iter()
        .any(|(s, r)| *s == session_id.to_string() && r == "caller"));
}

/// A session stuck in Negotiating (answer never delivered) still hangs
/// up cleanly: straight to Ended, local media released.
#[tokio::test]
async fn test_hangup_while_negotiating() {
    let fx = fixture();
    fx.relay.drop_answers.store(true, Ordering::SeqCst);

    fx.agent.manager.connect().await.unwrap();
    let session_id = fx.caller.manager.start_call("Ada").await.unwrap();
    fx.agent
        .manager
        .accept_call(session_id, "Ada", None)
        .await
        .unwrap();

    let agent_session = fx.agent.manager.session().await.unwrap();
    assert!(agent_session.state.is_negotiating());

    fx.agent.manager.hangup().await.unwrap();

    let session = fx.agent.manager.session().await.unwrap();
    let CallState::Ended {
        reason,
        duration_secs,
        ..
    } = session.state
    else {
        panic!("expected Ended, got {:?}", session.state);
    };
    assert_eq!(reason, EndCallReason::Hangup);
    assert_eq!(duration_secs, None);

    // Local media was released with the session.
    assert!(matches!(
        fx.agent.manager.set_audio_enabled(false).await,
        Err(CallError::NoActiveCall)
    ));
}

/// A second call attempt while one is live is rejected locally, with no
/// message sent.
#[tokio::test]
async fn test_double_call_attempt_rejected() {
    let fx = fixture();
    establish_call(&fx).await;

    let notifies_before = fx.backend.notifies.lock().await.len();
    let result = fx.caller.manager.start_call("Eve").await;
    assert!(matches!(result, Err(CallError::CallInProgress(_))));
    assert_eq!(fx.backend.notifies.lock().await.len(), notifies_before);
}

/// Media acquisition failure aborts the caller before any signaling.
#[tokio::test]
async fn test_media_failure_aborts_before_signaling() {
    let fx = fixture();
    fx.caller.media.fail_audio.store(true, Ordering::SeqCst);
    let mut failures = fx.caller.manager.event_bus().media_failure.subscribe();

    let result = fx.caller.manager.start_call("Ada").await;
    assert!(matches!(result, Err(CallError::MediaAcquisition(_))));

    tokio::time::timeout(Duration::from_secs(1), failures.recv())
        .await
        .expect("no media-failure notice")
        .unwrap();

    assert!(fx.caller.manager.session().await.is_none());
    assert!(fx.backend.notifies.lock().await.is_empty());
    assert!(fx.relay.inner.lock().await.clients.is_empty());
}

/// On the agent, a media failure after accepting ends the session before
/// it ever reaches Negotiating.
#[tokio::test]
async fn test_agent_media_failure_ends_accepted_call() {
    let fx = fixture();
    fx.agent.manager.connect().await.unwrap();
    let session_id = fx.caller.manager.start_call("Ada").await.unwrap();

    fx.agent.media.fail_audio.store(true, Ordering::SeqCst);
    let result = fx
        .agent
        .manager
        .accept_call(session_id, "Ada", None)
        .await;
    assert!(matches!(result, Err(CallError::MediaAcquisition(_))));

    let session = fx.agent.manager.session().await.unwrap();
    let CallState::Ended { reason, .. } = session.state else {
        panic!("expected Ended, got {:?}", session.state);
    };
    assert_eq!(reason, EndCallReason::MediaFailure);
}

/// Rejecting a pending call confirms with the backend and creates no
/// local session.
#[tokio::test]
async fn test_reject_call() {
    let fx = fixture();
    fx.agent.manager.connect().await.unwrap();
    let session_id = fx.caller.manager.start_call("Ada").await.unwrap();

    fx.agent.manager.reject_call(&session_id).await.unwrap();

    let responds = fx.backend.responds.lock().await;
    assert_eq!(
        responds.as_slice(),
        &[(session_id.to_string(), "reject".to_string())]
    );
    assert!(fx.agent.manager.session().await.is_none());
}

/// Losing the signaling transport mid-call is equivalent to a remote
/// call end.
#[tokio::test]
async fn test_transport_loss_ends_call() {
    let fx = fixture();
    let mut ended = fx.caller.manager.event_bus().call_ended.subscribe();
    let session_id = establish_call(&fx).await;

    let caller_id = fx.caller.manager.endpoint_id().as_str().to_string();
    fx.relay.disconnect_client(&caller_id).await;

    let event = tokio::time::timeout(Duration::from_secs(1), ended.recv())
        .await
        .expect("no call-ended event")
        .unwrap();
    assert_eq!(event.session_id, session_id);
    assert_eq!(event.reason, EndCallReason::TransportLost);
}

/// Mid-call video: the new track lands on both the primary and the
/// recording connection, and the agent re-runs the offer/answer cycle.
#[tokio::test]
async fn test_midcall_video_goes_to_both_connections() {
    let fx = fixture();
    let session_id = establish_call(&fx).await;

    // Wait for the initial recording legs to settle so created[1] is the
    // agent's first recording peer.
    let backend = fx.backend.clone();
    wait_until("initial recording", || {
        let backend = backend.clone();
        async move { backend.record_offers.lock().await.len() >= 2 }
    })
    .await;

    fx.agent.manager.enable_video().await.unwrap();

    // Primary connection got the track and a renegotiation offer.
    let agent = fx.agent.manager.clone();
    let agent_primary = fx.agent.peers.primary().await;
    wait_until("renegotiation answer applied", || {
        let peer = agent_primary.clone();
        async move {
            let ops = peer.ops().await;
            ops.iter().filter(|op| *op == "set_remote:answer").count() == 2
        }
    })
    .await;
    assert!(is_active(&agent).await);

    let ops = agent_primary.ops().await;
    assert!(ops.contains(&"add_track:video".to_string()));
    assert_eq!(ops.iter().filter(|op| *op == "create_offer").count(), 2);

    // The caller answered the re-offer without ever creating one.
    let caller_ops = fx.caller.peers.primary().await.ops().await;
    assert_eq!(
        caller_ops
            .iter()
            .filter(|op| *op == "set_remote:offer")
            .count(),
        2
    );
    assert!(!caller_ops.contains(&"create_offer".to_string()));

    // The recording leg re-ran its exchange with the grown track set.
    let backend = fx.backend.clone();
    let session = session_id.to_string();
    wait_until("recording renegotiated", || {
        let backend = backend.clone();
        let session = session.clone();
        async move {
            backend
                .record_offers
                .lock()
                .await
                .iter()
                .filter(|(s, r)| *s == session && r == "agent")
                .count()
                == 2
        }
    })
    .await;

    let recording_peers = fx.agent.peers.created().await;
    let restarted = recording_peers.last().unwrap();
    let rec_ops = restarted.ops().await;
    assert!(rec_ops.contains(&"add_track:audio".to_string()));
    assert!(rec_ops.contains(&"add_track:video".to_string()));
}

/// The pending listing and one-time-code login are plain
/// request/response operations; the issued bearer credential rides along
/// on later requests.
#[tokio::test]
async fn test_pending_listing_and_otp_login() {
    let fx = fixture();
    fx.agent.manager.connect().await.unwrap();
    fx.caller.manager.start_call("Ada").await.unwrap();

    let backend = fx.agent.manager.backend();

    backend.request_otp("operator").await.unwrap();
    let token = backend.verify_otp("operator", "123456").await.unwrap();
    assert_eq!(token.access_token, "token-abc");

    let pending = backend.pending_calls().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].caller_name, "Ada");
    let caller_id = pending[0].caller_id.as_ref().expect("caller endpoint id");
    assert!(caller_id.as_str().starts_with("caller_"));

    let auth = fx.backend.last_authorization.lock().await.clone();
    assert_eq!(auth.as_deref(), Some("Bearer token-abc"));
}
