pub mod protocol;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::join_all;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::api::{ApiError, RevoltApi};
use crate::config::RevoiceConfig;
use crate::signaling::protocol::{
    AuthenticateReply, AuthenticateRequest, ConnectTransportRequest, DtlsParameters, Envelope,
    InitializeTransportsReply, InitializeTransportsRequest, MessageType, ProduceKind,
    RoomInfoReply, RtpParameters, StartProduceRequest, StartProduceReply, StopProduceRequest,
    TRANSPORT_MODE, UserEventData,
};
use crate::types::events::{CHANNEL_CAPACITY, SignalingEvent};
use crate::types::user::RoomUser;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("not connected to the signaling server")]
    NotConnected,
    #[error("connection attempt already in progress")]
    AlreadyConnecting,
    #[error("timed out waiting for server reply")]
    Timeout,
    #[error("response channel closed before a reply arrived")]
    ChannelClosed,
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

struct PendingRequest {
    kind: MessageType,
    tx: oneshot::Sender<Value>,
}

/// JSON signaling channel to the voice server for one room.
///
/// Owns the WebSocket, the request/reply correlation table and the room
/// roster. Reconnects on its own after unexpected closes; handshake
/// events already seen by subscribers are suppressed on reconnect, the
/// roster refetch is not.
pub struct SignalingChannel {
    room_id: String,
    api: RevoltApi,
    config: RevoiceConfig,
    sink: Mutex<Option<WsSink>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    users: Mutex<HashMap<String, RoomUser>>,
    // Tickets for joins whose profile fetch is still running. A leave
    // that overtakes the fetch revokes the ticket, so the late insert
    // is skipped. Lock order: this before `users`.
    joins_in_flight: Mutex<HashMap<String, u64>>,
    join_seq: AtomicU64,
    room_empty: AtomicBool,
    reconnecting: AtomicBool,
    intentional_close: AtomicBool,
    is_connecting: AtomicBool,
    events_tx: broadcast::Sender<SignalingEvent>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    pub fn new(room_id: impl Into<String>, api: RevoltApi, config: RevoiceConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            room_id: room_id.into(),
            api,
            config,
            sink: Mutex::new(None),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            joins_in_flight: Mutex::new(HashMap::new()),
            join_seq: AtomicU64::new(0),
            room_empty: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            intentional_close: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            events_tx,
            read_task: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events_tx.subscribe()
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// `true` when the bot is the only user left in the room.
    pub fn room_empty(&self) -> bool {
        self.room_empty.load(Ordering::Relaxed)
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Snapshot of the current roster.
    pub async fn users(&self) -> Vec<RoomUser> {
        self.users.lock().await.values().cloned().collect()
    }

    /// Opens the WebSocket and kicks off the authentication handshake.
    ///
    /// Resolves once the socket is up and the `Authenticate` request has
    /// been sent. The rest of the handshake is driven in the background
    /// and reported through [`SignalingEvent`]s.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SignalingError> {
        self.intentional_close.store(false, Ordering::Relaxed);
        // A manual connect is a fresh session, not a resumed one.
        self.reconnecting.store(false, Ordering::Relaxed);
        self.connect_inner().await
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<(), SignalingError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::AlreadyConnecting);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        // A previous session goes away before the new one is dialed; its
        // waiters fail fast instead of lingering until their timeout.
        self.teardown_socket().await;

        let token = self.api.join_call(&self.room_id).await?;

        let (ws, _) = connect_async(self.config.vortex_url.as_str()).await?;
        let (sink, stream) = ws.split();

        *self.sink.lock().await = Some(sink);
        self.next_id.store(0, Ordering::Relaxed);

        let channel = self.clone();
        let handle = tokio::spawn(async move { channel.read_loop(stream).await });
        *self.read_task.lock().await = Some(handle);

        let auth_id = self.next_request_id();
        let rx = self.register_waiter(auth_id, MessageType::Authenticate).await;
        let data = serde_json::to_value(AuthenticateRequest {
            token,
            room_id: self.room_id.clone(),
        })?;
        let envelope = Envelope::request(auth_id, MessageType::Authenticate, Some(data));
        if let Err(e) = self.send_frame(&envelope).await {
            self.pending.lock().await.remove(&auth_id);
            return Err(e);
        }

        let channel = self.clone();
        tokio::spawn(async move { channel.drive_handshake(auth_id, rx).await });

        Ok(())
    }

    /// Runs the post-authentication handshake. Failures are logged rather
    /// than returned; the caller has already moved on.
    async fn drive_handshake(self: Arc<Self>, auth_id: u64, rx: oneshot::Receiver<Value>) {
        let reconnecting = self.reconnecting.load(Ordering::Relaxed);

        let data = match self.await_reply(auth_id, rx).await {
            Ok(data) => data,
            Err(e) => {
                warn!(target: "Signaling", "Authenticate failed for room {}: {e}", self.room_id);
                return;
            }
        };
        let auth: AuthenticateReply = match serde_json::from_value(data) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(target: "Signaling", "Malformed Authenticate reply: {e}");
                return;
            }
        };

        if !reconnecting {
            let _ = self
                .events_tx
                .send(SignalingEvent::Capabilities(auth.rtp_capabilities.clone()));
        }

        let init = match serde_json::to_value(InitializeTransportsRequest {
            mode: TRANSPORT_MODE,
            rtp_capabilities: auth.rtp_capabilities,
        }) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "Signaling", "Failed to encode InitializeTransports: {e}");
                return;
            }
        };
        let reply = match self
            .send_request(MessageType::InitializeTransports, Some(init))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(target: "Signaling", "InitializeTransports failed for room {}: {e}", self.room_id);
                return;
            }
        };
        let transports: InitializeTransportsReply = match serde_json::from_value(reply) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(target: "Signaling", "Malformed InitializeTransports reply: {e}");
                return;
            }
        };

        if !reconnecting {
            let _ = self
                .events_tx
                .send(SignalingEvent::TransportsReady(transports.send_transport));
        }

        // The roster is refetched on every session, reconnects included.
        if let Err(e) = self.fetch_room_info().await {
            warn!(target: "Signaling", "Failed to fetch room info for {}: {e}", self.room_id);
        }
    }

    /// Fetches the roster, hydrates every profile over REST and replaces
    /// the previous roster wholesale.
    async fn fetch_room_info(&self) -> Result<(), SignalingError> {
        let reply = self.send_request(MessageType::RoomInfo, None).await?;
        let info: RoomInfoReply = serde_json::from_value(reply)?;

        let tasks = info.users.iter().map(|(id, state)| {
            let api = self.api.clone();
            let id = id.clone();
            let room_id = self.room_id.clone();
            let muted = !state.audio;
            async move {
                let mut user = RoomUser::new(id.clone());
                user.connected = true;
                user.connected_to = Some(room_id);
                user.muted = muted;
                match api.fetch_user(&id).await {
                    Ok(profile) => user.apply_profile(&profile),
                    Err(e) => {
                        warn!(target: "Signaling", "Failed to hydrate user {id}: {e}")
                    }
                }
                user
            }
        });
        let hydrated = join_all(tasks).await;

        // The fetched roster is authoritative; joins still hydrating are
        // superseded by it.
        let mut in_flight = self.joins_in_flight.lock().await;
        in_flight.clear();
        let mut users = self.users.lock().await;
        users.clear();
        for user in hydrated {
            users.insert(user.id.clone(), user);
        }
        self.room_empty.store(users.len() == 1, Ordering::Relaxed);
        drop(users);
        drop(in_flight);

        let _ = self.events_tx.send(SignalingEvent::RoomFetched);
        Ok(())
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register_waiter(&self, id: u64, kind: MessageType) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, PendingRequest { kind, tx });
        rx
    }

    /// Sends a correlated request and waits for the matching reply.
    async fn send_request(
        &self,
        kind: MessageType,
        data: Option<Value>,
    ) -> Result<Value, SignalingError> {
        let id = self.next_request_id();
        let rx = self.register_waiter(id, kind).await;
        if let Err(e) = self.send_frame(&Envelope::request(id, kind, data)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        self.await_reply(id, rx).await
    }

    async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<Value>,
    ) -> Result<Value, SignalingError> {
        match self.config.request_timeout {
            Some(limit) => match timeout(limit, rx).await {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(_)) => Err(SignalingError::ChannelClosed),
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    Err(SignalingError::Timeout)
                }
            },
            None => rx.await.map_err(|_| SignalingError::ChannelClosed),
        }
    }

    async fn send_frame(&self, envelope: &Envelope) -> Result<(), SignalingError> {
        let text = serde_json::to_string(envelope)?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SignalingError::NotConnected)?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut stream: WsStream) {
        let mut close_frame: Option<CloseFrame> = None;
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatch_frame(text.as_str()).await,
                Ok(Message::Close(frame)) => {
                    close_frame = frame;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "Signaling", "WebSocket read error: {e}");
                    break;
                }
            }
        }
        self.handle_close(close_frame).await;
    }

    async fn dispatch_frame(self: &Arc<Self>, raw: &str) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Signaling", "Discarding malformed frame: {e}");
                return;
            }
        };

        match envelope.msg_type {
            MessageType::UserJoined => self.handle_user_joined(envelope.data).await,
            MessageType::UserLeft => self.handle_user_left(envelope.data).await,
            MessageType::StartProduce | MessageType::StopProduce if envelope.id.is_none() => {
                self.handle_produce_notice(envelope);
            }
            _ => self.resolve_reply(envelope).await,
        }
    }

    /// Produce frames without an id are server notices about other
    /// members, not replies. The payload is forwarded as received.
    fn handle_produce_notice(&self, envelope: Envelope) {
        let data = envelope.data.unwrap_or(Value::Null);
        let event = match envelope.msg_type {
            MessageType::StartProduce => SignalingEvent::ProduceStarted(data),
            _ => SignalingEvent::ProduceStopped(data),
        };
        let _ = self.events_tx.send(event);
    }

    /// Hydrates the joining user in the background so the read loop never
    /// stalls on REST calls. The insert only lands if the join's ticket is
    /// still valid once the profile fetch returns.
    async fn handle_user_joined(self: &Arc<Self>, data: Option<Value>) {
        let Some(value) = data else {
            debug!(target: "Signaling", "UserJoined event without data");
            return;
        };
        let event: UserEventData = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                warn!(target: "Signaling", "Malformed UserJoined event: {e}");
                return;
            }
        };

        let ticket = self.join_seq.fetch_add(1, Ordering::Relaxed);
        self.joins_in_flight
            .lock()
            .await
            .insert(event.id.clone(), ticket);

        let channel = self.clone();
        tokio::spawn(async move {
            let mut user = RoomUser::new(event.id.clone());
            user.connected = true;
            user.connected_to = Some(channel.room_id.clone());
            match channel.api.fetch_user(&event.id).await {
                Ok(profile) => user.apply_profile(&profile),
                Err(e) => {
                    warn!(target: "Signaling", "Failed to hydrate user {}: {e}", event.id)
                }
            }

            let mut in_flight = channel.joins_in_flight.lock().await;
            if in_flight.get(&event.id) != Some(&ticket) {
                // The user left again while the fetch was running.
                debug!(target: "Signaling", "Discarding superseded join for user {}", event.id);
                return;
            }
            in_flight.remove(&event.id);

            let mut users = channel.users.lock().await;
            users.insert(user.id.clone(), user.clone());
            channel.room_empty.store(users.len() == 1, Ordering::Relaxed);
            drop(users);
            drop(in_flight);

            let _ = channel.events_tx.send(SignalingEvent::UserJoined(user));
        });
    }

    async fn handle_user_left(&self, data: Option<Value>) {
        let Some(value) = data else {
            debug!(target: "Signaling", "UserLeft event without data");
            return;
        };
        let event: UserEventData = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                warn!(target: "Signaling", "Malformed UserLeft event: {e}");
                return;
            }
        };

        // A join still hydrating never made it into the roster; revoking
        // its ticket is the whole removal.
        let mut in_flight = self.joins_in_flight.lock().await;
        if in_flight.remove(&event.id).is_some() {
            drop(in_flight);
            debug!(target: "Signaling", "User {} left before their join was hydrated", event.id);
            return;
        }
        drop(in_flight);

        let mut users = self.users.lock().await;
        let Some(mut user) = users.remove(&event.id) else {
            drop(users);
            debug!(target: "Signaling", "UserLeft for unknown user {}", event.id);
            return;
        };
        self.room_empty.store(users.len() == 1, Ordering::Relaxed);
        drop(users);

        user.connected = false;
        user.connected_to = None;
        let _ = self.events_tx.send(SignalingEvent::UserLeft(user));
    }

    /// Delivers a reply to its waiter. The entry is resolved only when
    /// both the id and the message type match; a type mismatch leaves the
    /// waiter in place.
    async fn resolve_reply(&self, envelope: Envelope) {
        let Some(id) = envelope.id else {
            debug!(target: "Signaling", "Ignoring {:?} frame without id", envelope.msg_type);
            return;
        };

        let mut pending = self.pending.lock().await;
        let expected = pending.get(&id).map(|request| request.kind);
        match expected {
            Some(kind) if kind == envelope.msg_type => {
                if let Some(request) = pending.remove(&id) {
                    drop(pending);
                    if request.tx.send(envelope.data.unwrap_or(Value::Null)).is_err() {
                        warn!(target: "Signaling", "Reply waiter for id {id} was dropped before delivery");
                    }
                }
            }
            Some(kind) => {
                drop(pending);
                debug!(
                    target: "Signaling",
                    "Reply type {:?} does not match waiter for id {id} (expected {kind:?})",
                    envelope.msg_type
                );
            }
            None => {
                drop(pending);
                debug!(target: "Signaling", "No waiter for {:?} reply with id {id}", envelope.msg_type);
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, close_frame: Option<CloseFrame>) {
        *self.sink.lock().await = None;
        self.pending.lock().await.clear();

        let normal = matches!(&close_frame, Some(frame) if frame.code == CloseCode::Normal);
        if normal || self.intentional_close.load(Ordering::Relaxed) {
            debug!(target: "Signaling", "WebSocket for room {} closed cleanly", self.room_id);
            return;
        }

        warn!(
            target: "Signaling",
            "WebSocket for room {} closed unexpectedly ({close_frame:?}), scheduling reconnect",
            self.room_id
        );
        self.reconnecting.store(true, Ordering::Relaxed);

        tokio::spawn(self.clone().reconnect_loop());
    }

    /// Retries the connect sequence until it succeeds or the channel is
    /// closed for good. Boxed: the connect path spawns the read loop,
    /// which schedules this loop again on the next unexpected close, so
    /// the future type is recursive.
    fn reconnect_loop(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                tokio::time::sleep(self.config.reconnect_delay).await;
                if self.intentional_close.load(Ordering::Relaxed) {
                    return;
                }
                match self.connect_inner().await {
                    Ok(()) => {
                        info!(target: "Signaling", "Reconnected to room {}", self.room_id);
                        return;
                    }
                    Err(e) => {
                        warn!(target: "Signaling", "Reconnect attempt for room {} failed: {e}", self.room_id);
                    }
                }
            }
        })
    }

    /// Announces our DTLS parameters for the server-offered transport.
    pub async fn connect_transport(
        &self,
        id: String,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalingError> {
        let data = serde_json::to_value(ConnectTransportRequest {
            id,
            dtls_parameters,
        })?;
        self.send_request(MessageType::ConnectTransport, Some(data))
            .await?;
        Ok(())
    }

    /// Registers an audio producer and returns its server-side id.
    pub async fn start_produce(
        &self,
        kind: ProduceKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, SignalingError> {
        let data = serde_json::to_value(StartProduceRequest {
            kind,
            rtp_parameters,
        })?;
        let reply = self
            .send_request(MessageType::StartProduce, Some(data))
            .await?;
        let reply: StartProduceReply = serde_json::from_value(reply)?;
        Ok(reply.producer_id)
    }

    pub async fn stop_produce(&self, kind: ProduceKind) -> Result<(), SignalingError> {
        let data = serde_json::to_value(StopProduceRequest { kind })?;
        self.send_request(MessageType::StopProduce, Some(data))
            .await?;
        Ok(())
    }

    /// Closes the socket for good. No reconnect will follow.
    pub async fn close(&self) {
        debug!(target: "Signaling", "Closing signaling channel for room {}", self.room_id);
        self.intentional_close.store(true, Ordering::Relaxed);
        self.teardown_socket().await;
    }

    async fn teardown_socket(&self) {
        if let Some(handle) = self.read_task.lock().await.take() {
            handle.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
        }
        self.pending.lock().await.clear();
    }
}
