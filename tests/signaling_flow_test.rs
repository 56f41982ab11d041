use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use revoice_rust::api::RevoltApi;
use revoice_rust::config::RevoiceConfig;
use revoice_rust::signaling::protocol::{DtlsParameters, ProduceKind};
use revoice_rust::signaling::{SignalingChannel, SignalingError};
use revoice_rust::types::events::SignalingEvent;

mod test_utils {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use revoice_rust::api::{HttpClient, HttpRequest, HttpResponse};

    /// Serves canned JSON bodies keyed by method and URL suffix.
    pub struct MockHttpClient {
        routes: Mutex<HashMap<(String, String), (u16, String)>>,
        delays: Mutex<Vec<(String, Duration)>>,
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self {
                routes: Mutex::new(HashMap::new()),
                delays: Mutex::new(Vec::new()),
            }
        }

        pub fn route(&self, method: &str, path: &str, status: u16, body: serde_json::Value) {
            self.routes.lock().unwrap().insert(
                (method.to_string(), path.to_string()),
                (status, body.to_string()),
            );
        }

        /// Holds back any request whose URL ends with `path`, for racing
        /// a slow fetch against other traffic.
        pub fn delay(&self, path: &str, delay: Duration) {
            self.delays.lock().unwrap().push((path.to_string(), delay));
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let delay = self
                .delays
                .lock()
                .unwrap()
                .iter()
                .find(|(path, _)| request.url.ends_with(path.as_str()))
                .map(|(_, delay)| *delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let routes = self.routes.lock().unwrap();
            for ((method, path), (status, body)) in routes.iter() {
                if *method == request.method && request.url.ends_with(path.as_str()) {
                    return Ok(HttpResponse {
                        status_code: *status,
                        body: body.clone().into_bytes(),
                    });
                }
            }
            Ok(HttpResponse {
                status_code: 404,
                body: b"{}".to_vec(),
            })
        }
    }
}

const BOT_ID: &str = "bot-user";
const ROOM_ID: &str = "room-1";
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

enum ServerCommand {
    Inject(Value),
    Drop,
}

struct VortexState {
    roster: Mutex<Value>,
    muted: Mutex<HashSet<String>>,
    received: Mutex<Vec<Value>>,
    sessions: AtomicUsize,
    closes: AtomicUsize,
}

/// In-process stand-in for the voice signaling server. Answers every
/// correlated request by echoing its id and type; tests can mutate the
/// roster, mute reply types, inject frames and drop the connection.
struct MockVortex {
    addr: SocketAddr,
    control: mpsc::UnboundedSender<ServerCommand>,
    state: Arc<VortexState>,
}

async fn start_vortex(roster: Value) -> MockVortex {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let control_rx = Arc::new(tokio::sync::Mutex::new(control_rx));
    let state = Arc::new(VortexState {
        roster: Mutex::new(roster),
        muted: Mutex::new(HashSet::new()),
        received: Mutex::new(Vec::new()),
        sessions: AtomicUsize::new(0),
        closes: AtomicUsize::new(0),
    });

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            accept_state.sessions.fetch_add(1, Ordering::SeqCst);
            run_session(ws, accept_state.clone(), control_rx.clone()).await;
        }
    });

    MockVortex {
        addr,
        control: control_tx,
        state,
    }
}

async fn run_session(
    ws: WebSocketStream<TcpStream>,
    state: Arc<VortexState>,
    control: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerCommand>>>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut control = control.lock().await;
    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let envelope: Value = serde_json::from_str(text.as_str()).unwrap();
                        state.received.lock().unwrap().push(envelope.clone());
                        if let Some(reply) = auto_reply(&envelope, &state) {
                            sink.send(Message::Text(reply.to_string().into())).await.unwrap();
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        state.closes.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
            command = control.recv() => {
                match command {
                    Some(ServerCommand::Inject(frame)) => {
                        sink.send(Message::Text(frame.to_string().into())).await.unwrap();
                    }
                    Some(ServerCommand::Drop) | None => return,
                }
            }
        }
    }
}

fn auto_reply(envelope: &Value, state: &VortexState) -> Option<Value> {
    let msg_type = envelope["type"].as_str()?;
    if state.muted.lock().unwrap().contains(msg_type) {
        return None;
    }
    let data = match msg_type {
        "Authenticate" => json!({"rtpCapabilities": {"codecs": ["opus"]}}),
        "InitializeTransports" => json!({"sendTransport": {"id": "transport-1"}}),
        "ConnectTransport" => json!({}),
        "RoomInfo" => json!({"users": state.roster.lock().unwrap().clone()}),
        "StartProduce" => json!({"producerId": "producer-1"}),
        "StopProduce" => json!({}),
        _ => return None,
    };
    Some(json!({"id": envelope["id"], "type": msg_type, "data": data}))
}

fn user_profile(id: &str, username: &str) -> Value {
    json!({"_id": id, "username": username, "badges": 0, "online": true})
}

fn standard_http() -> Arc<test_utils::MockHttpClient> {
    let http = test_utils::MockHttpClient::new();
    http.route(
        "POST",
        &format!("/channels/{ROOM_ID}/join_call"),
        200,
        json!({"token": "vortex-token"}),
    );
    http.route(
        "GET",
        &format!("/users/{BOT_ID}"),
        200,
        user_profile(BOT_ID, "jukebox"),
    );
    Arc::new(http)
}

fn test_config(vortex: &MockVortex) -> RevoiceConfig {
    RevoiceConfig {
        vortex_url: format!("ws://{}", vortex.addr),
        reconnect_delay: Duration::from_millis(100),
        request_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    }
}

async fn connect_channel(
    http: Arc<test_utils::MockHttpClient>,
    config: RevoiceConfig,
) -> (Arc<SignalingChannel>, broadcast::Receiver<SignalingEvent>) {
    let api = RevoltApi::new("http://revolt.test", "bot-token", http);
    let channel = SignalingChannel::new(ROOM_ID, api, config);
    let events = channel.subscribe();
    channel.connect().await.unwrap();
    (channel, events)
}

async fn next_event(events: &mut broadcast::Receiver<SignalingEvent>) -> SignalingEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a signaling event")
        .unwrap()
}

/// Consumes Capabilities, TransportsReady and RoomFetched.
async fn drain_handshake(events: &mut broadcast::Receiver<SignalingEvent>) {
    for _ in 0..3 {
        next_event(events).await;
    }
}

#[tokio::test]
async fn handshake_emits_capabilities_transports_and_roster() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let (channel, mut events) = connect_channel(standard_http(), test_config(&vortex)).await;

    let first = next_event(&mut events).await;
    assert!(
        matches!(first, SignalingEvent::Capabilities(_)),
        "expected Capabilities first, got {first:?}"
    );
    let second = next_event(&mut events).await;
    let SignalingEvent::TransportsReady(descriptor) = second else {
        panic!("expected TransportsReady, got {second:?}");
    };
    assert_eq!(descriptor.0["id"], "transport-1");
    let third = next_event(&mut events).await;
    assert!(
        matches!(third, SignalingEvent::RoomFetched),
        "expected RoomFetched, got {third:?}"
    );

    let users = channel.users().await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, BOT_ID);
    assert_eq!(users[0].username, "jukebox");
    assert!(users[0].connected);
    assert_eq!(users[0].connected_to.as_deref(), Some(ROOM_ID));
    assert!(channel.room_empty());
    assert!(channel.is_connected().await);

    // The authenticate frame carried the call token and the room id.
    let received = vortex.state.received.lock().unwrap().clone();
    assert_eq!(received[0]["type"], "Authenticate");
    assert_eq!(received[0]["data"]["token"], "vortex-token");
    assert_eq!(received[0]["data"]["roomId"], ROOM_ID);
}

#[tokio::test]
async fn replies_require_matching_id_and_type() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let (channel, mut events) = connect_channel(standard_http(), test_config(&vortex)).await;
    drain_handshake(&mut events).await;

    // The handshake consumed ids 0 through 2, so the next request gets 3.
    vortex
        .state
        .muted
        .lock()
        .unwrap()
        .insert("ConnectTransport".to_string());

    let requester = channel.clone();
    let op = tokio::spawn(async move {
        requester
            .connect_transport(
                "transport-1".to_string(),
                DtlsParameters(json!({"role": "client"})),
            )
            .await
    });
    sleep(Duration::from_millis(100)).await;

    // Right type under the wrong id, then the right id under the wrong
    // type. Neither may resolve the waiter.
    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"id": 999, "type": "ConnectTransport", "data": {}}),
        ))
        .unwrap();
    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"id": 3, "type": "StartProduce", "data": {}}),
        ))
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(!op.is_finished(), "request resolved from a mismatched reply");

    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"id": 3, "type": "ConnectTransport", "data": {}}),
        ))
        .unwrap();
    timeout(EVENT_TIMEOUT, op).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn reconnects_quietly_and_refetches_the_roster() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let http = standard_http();
    http.route(
        "GET",
        "/users/visitor",
        200,
        user_profile("visitor", "friendly-visitor"),
    );
    let (channel, mut events) = connect_channel(http, test_config(&vortex)).await;
    drain_handshake(&mut events).await;
    assert!(channel.room_empty());

    // The roster grows while we are away.
    *vortex.state.roster.lock().unwrap() = json!({
        BOT_ID: {"audio": true},
        "visitor": {"audio": false},
    });
    vortex.control.send(ServerCommand::Drop).unwrap();

    // Only the roster refetch is re-emitted after the reconnect.
    let event = next_event(&mut events).await;
    assert!(
        matches!(event, SignalingEvent::RoomFetched),
        "expected a quiet reconnect, got {event:?}"
    );

    assert_eq!(vortex.state.sessions.load(Ordering::SeqCst), 2);
    let users = channel.users().await;
    assert_eq!(users.len(), 2);
    let visitor = users.iter().find(|user| user.id == "visitor").unwrap();
    assert_eq!(visitor.username, "friendly-visitor");
    assert!(visitor.muted);
    assert!(!channel.room_empty());
}

#[tokio::test]
async fn tracks_unsolicited_user_joins_and_leaves() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let http = standard_http();
    http.route(
        "GET",
        "/users/visitor",
        200,
        user_profile("visitor", "friendly-visitor"),
    );
    let (channel, mut events) = connect_channel(http, test_config(&vortex)).await;
    drain_handshake(&mut events).await;

    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"type": "UserJoined", "data": {"id": "visitor"}}),
        ))
        .unwrap();

    let event = next_event(&mut events).await;
    let SignalingEvent::UserJoined(user) = event else {
        panic!("expected UserJoined, got {event:?}");
    };
    assert_eq!(user.id, "visitor");
    assert_eq!(user.username, "friendly-visitor");
    assert!(user.connected);
    assert_eq!(user.connected_to.as_deref(), Some(ROOM_ID));
    assert!(!channel.room_empty());
    assert_eq!(channel.users().await.len(), 2);

    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"type": "UserLeft", "data": {"id": "visitor"}}),
        ))
        .unwrap();

    let event = next_event(&mut events).await;
    let SignalingEvent::UserLeft(user) = event else {
        panic!("expected UserLeft, got {event:?}");
    };
    assert_eq!(user.id, "visitor");
    assert!(!user.connected);
    assert!(user.connected_to.is_none());
    assert!(channel.room_empty());
    assert_eq!(channel.users().await.len(), 1);
}

#[tokio::test]
async fn a_leave_during_join_hydration_leaves_no_ghost() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let http = standard_http();
    http.route(
        "GET",
        "/users/visitor",
        200,
        user_profile("visitor", "friendly-visitor"),
    );
    http.delay("/users/visitor", Duration::from_millis(200));
    let (channel, mut events) = connect_channel(http, test_config(&vortex)).await;
    drain_handshake(&mut events).await;

    // The visitor leaves again while their profile fetch is still
    // running; the late insert must not land.
    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"type": "UserJoined", "data": {"id": "visitor"}}),
        ))
        .unwrap();
    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"type": "UserLeft", "data": {"id": "visitor"}}),
        ))
        .unwrap();

    sleep(Duration::from_millis(500)).await;
    assert_eq!(channel.users().await.len(), 1);
    assert!(channel.room_empty());
    let leftover = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(
        leftover.is_err(),
        "expected no membership events, got {leftover:?}"
    );
}

#[tokio::test]
async fn forwards_unsolicited_produce_notices() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let (_channel, mut events) = connect_channel(standard_http(), test_config(&vortex)).await;
    drain_handshake(&mut events).await;

    // No id on either frame: these are notices about another member,
    // not replies to our own requests.
    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"type": "StartProduce", "data": {"id": "visitor", "type": "audio"}}),
        ))
        .unwrap();
    vortex
        .control
        .send(ServerCommand::Inject(
            json!({"type": "StopProduce", "data": {"id": "visitor", "type": "audio"}}),
        ))
        .unwrap();

    let event = next_event(&mut events).await;
    let SignalingEvent::ProduceStarted(data) = event else {
        panic!("expected ProduceStarted, got {event:?}");
    };
    assert_eq!(data["id"], "visitor");

    let event = next_event(&mut events).await;
    let SignalingEvent::ProduceStopped(data) = event else {
        panic!("expected ProduceStopped, got {event:?}");
    };
    assert_eq!(data["id"], "visitor");
}

#[tokio::test]
async fn connect_tears_down_the_previous_session() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let config = RevoiceConfig {
        request_timeout: Some(Duration::from_secs(5)),
        ..test_config(&vortex)
    };
    let (channel, mut events) = connect_channel(standard_http(), config).await;
    drain_handshake(&mut events).await;

    // Park a request that never gets its reply on this session.
    vortex
        .state
        .muted
        .lock()
        .unwrap()
        .insert("ConnectTransport".to_string());
    let requester = channel.clone();
    let op = tokio::spawn(async move {
        requester
            .connect_transport(
                "transport-1".to_string(),
                DtlsParameters(json!({"role": "client"})),
            )
            .await
    });
    sleep(Duration::from_millis(100)).await;

    channel.connect().await.unwrap();

    // The stale waiter fails right away instead of running out its
    // timeout, and the old session saw a proper close.
    let result = timeout(Duration::from_millis(500), op)
        .await
        .expect("stale request survived the reconnect")
        .unwrap();
    assert!(matches!(result, Err(SignalingError::ChannelClosed)));
    assert_eq!(vortex.state.sessions.load(Ordering::SeqCst), 2);
    assert_eq!(vortex.state.closes.load(Ordering::SeqCst), 1);

    drain_handshake(&mut events).await;
    assert!(channel.is_connected().await);
}

#[tokio::test]
async fn close_does_not_reconnect() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let (channel, mut events) = connect_channel(standard_http(), test_config(&vortex)).await;
    drain_handshake(&mut events).await;

    channel.close().await;
    assert!(!channel.is_connected().await);

    // Several reconnect delays worth of quiet.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(vortex.state.sessions.load(Ordering::SeqCst), 1);

    let result = channel.stop_produce(ProduceKind::Audio).await;
    assert!(matches!(result, Err(SignalingError::NotConnected)));
}

#[tokio::test]
async fn requests_time_out_without_a_reply() {
    let vortex = start_vortex(json!({BOT_ID: {"audio": true}})).await;
    let config = RevoiceConfig {
        request_timeout: Some(Duration::from_millis(300)),
        ..test_config(&vortex)
    };
    let (channel, mut events) = connect_channel(standard_http(), config).await;
    drain_handshake(&mut events).await;

    vortex
        .state
        .muted
        .lock()
        .unwrap()
        .insert("StopProduce".to_string());
    let result = channel.stop_produce(ProduceKind::Audio).await;
    assert!(matches!(result, Err(SignalingError::Timeout)));
}
