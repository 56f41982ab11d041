use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::device::{DeviceError, MediaDevice, SendTransport};
use crate::media::MediaSource;
use crate::signaling::protocol::ProduceKind;
use crate::signaling::{SignalingChannel, SignalingError};
use crate::track::Producer;
use crate::types::events::{CHANNEL_CAPACITY, PlayerEvent, SignalingEvent, VoiceEvent};
use crate::types::user::RoomUser;

/// Lifecycle of one voice room membership.
///
/// `Buffering`, `Playing` and `Paused` only apply while a
/// playback-capable source is attached; a raw source parks the
/// connection at `Unknown` until it is swapped out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Offline,
    Joining,
    Idle,
    Buffering,
    Playing,
    Paused,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("not joined to a voice room")]
    NotJoined,
    #[error("the source's track is already being consumed")]
    TrackBusy,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// An active membership in one voice room. Owns the signaling channel
/// and the send transport, and bridges media sources onto the room.
pub struct VoiceConnection {
    room_id: String,
    signaling: Arc<SignalingChannel>,
    device: Arc<dyn MediaDevice>,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn SendTransport>>>,
    transport_connected: AtomicBool,
    producer: Mutex<Option<Producer>>,
    media: Mutex<Option<Arc<dyn MediaSource>>>,
    idle_leave: Option<Duration>,
    leave_timer: Mutex<Option<JoinHandle<()>>>,
    events_tx: broadcast::Sender<VoiceEvent>,
    registry_users: Arc<DashMap<String, RoomUser>>,
    signaling_pump: Mutex<Option<JoinHandle<()>>>,
    player_pump: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceConnection {
    pub(crate) fn new(
        room_id: impl Into<String>,
        signaling: Arc<SignalingChannel>,
        device: Arc<dyn MediaDevice>,
        idle_leave: Option<Duration>,
        registry_users: Arc<DashMap<String, RoomUser>>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            room_id: room_id.into(),
            signaling,
            device,
            state: Mutex::new(ConnectionState::Joining),
            transport: Mutex::new(None),
            transport_connected: AtomicBool::new(false),
            producer: Mutex::new(None),
            media: Mutex::new(None),
            idle_leave,
            leave_timer: Mutex::new(None),
            events_tx,
            registry_users,
            signaling_pump: Mutex::new(None),
            player_pump: Mutex::new(None),
        })
    }

    /// Subscribes to signaling and opens the channel. Event handling is
    /// wired up before the connect so no handshake event is missed.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), SignalingError> {
        let mut events = self.signaling.subscribe();
        let conn = self.clone();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => conn.handle_signaling_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "Voice", "Signaling pump for room {} lagged by {n} events", conn.room_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        *self.signaling_pump.lock().await = Some(pump);
        self.signaling.connect().await
    }

    async fn handle_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Capabilities(capabilities) => {
                if let Err(e) = self.device.load(capabilities).await {
                    warn!(target: "Voice", "Failed to load device for room {}: {e}", self.room_id);
                }
            }
            SignalingEvent::TransportsReady(descriptor) => {
                match self.device.create_send_transport(descriptor).await {
                    Ok(transport) => {
                        *self.transport.lock().await = Some(transport);
                        self.set_state(ConnectionState::Idle).await;
                    }
                    Err(e) => {
                        warn!(target: "Voice", "Failed to create send transport for room {}: {e}", self.room_id);
                    }
                }
            }
            SignalingEvent::RoomFetched => {
                for user in self.signaling.users().await {
                    self.registry_users.insert(user.id.clone(), user);
                }
                self.evaluate_idle_leave().await;
            }
            SignalingEvent::UserJoined(user) => {
                self.registry_users.insert(user.id.clone(), user.clone());
                self.evaluate_idle_leave().await;
                let _ = self.events_tx.send(VoiceEvent::UserJoined(user));
            }
            SignalingEvent::UserLeft(user) => {
                // Kept in the registry as a stale entry so lookups still
                // resolve the profile after the user is gone.
                self.registry_users.insert(user.id.clone(), user.clone());
                self.evaluate_idle_leave().await;
                let _ = self.events_tx.send(VoiceEvent::UserLeft(user));
            }
            // Produce notices carry no connection state.
            SignalingEvent::ProduceStarted(_) | SignalingEvent::ProduceStopped(_) => {}
        }
    }

    /// Re-arms or cancels the idle-leave timer from the current roster.
    async fn evaluate_idle_leave(self: &Arc<Self>) {
        self.cancel_leave_timer().await;
        let Some(delay) = self.idle_leave else {
            return;
        };
        if !self.signaling.room_empty() {
            return;
        }
        let conn = self.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            conn.leave_timer.lock().await.take();
            info!(target: "Voice", "Room {} stayed empty, leaving", conn.room_id);
            conn.leave().await;
            conn.destroy().await;
            let _ = conn.events_tx.send(VoiceEvent::Autoleave);
        });
        *self.leave_timer.lock().await = Some(timer);
    }

    async fn cancel_leave_timer(&self) {
        if let Some(timer) = self.leave_timer.lock().await.take() {
            timer.abort();
        }
    }

    /// Attaches a media source to the room and starts producing from
    /// it. Each call consumes the source's current track; a second call
    /// for the same track yields [`VoiceError::TrackBusy`] until the
    /// source provides a fresh one.
    pub async fn play(
        self: &Arc<Self>,
        source: Arc<dyn MediaSource>,
    ) -> Result<Producer, VoiceError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(VoiceError::NotJoined)?;

        let previous = *self.state.lock().await;
        if source.is_player() {
            self.set_state(ConnectionState::Buffering).await;
        } else {
            self.set_state(ConnectionState::Unknown).await;
        }

        match self.start_producing(transport, &source).await {
            Ok(producer) => Ok(producer),
            Err(e) => {
                // Nothing is playing after a failure; put the state back.
                self.set_state(previous).await;
                Err(e)
            }
        }
    }

    async fn start_producing(
        self: &Arc<Self>,
        transport: Arc<dyn SendTransport>,
        source: &Arc<dyn MediaSource>,
    ) -> Result<Producer, VoiceError> {
        let stream = source.take_stream().await.ok_or(VoiceError::TrackBusy)?;

        if !self.transport_connected.swap(true, Ordering::SeqCst) {
            let result = self
                .signaling
                .connect_transport(transport.id(), transport.dtls_parameters())
                .await;
            if let Err(e) = result {
                self.transport_connected.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        let rtp_parameters = transport.attach(stream).await?;
        let producer_id = self
            .signaling
            .start_produce(ProduceKind::Audio, rtp_parameters)
            .await?;
        let producer = Producer { id: producer_id };

        *self.producer.lock().await = Some(producer.clone());
        *self.media.lock().await = Some(source.clone());

        if source.is_player() {
            self.replace_player_pump(source).await;
        }

        Ok(producer)
    }

    /// Mirrors player events onto the connection state. Replaced on
    /// every play so stale pumps never double-report.
    async fn replace_player_pump(self: &Arc<Self>, source: &Arc<dyn MediaSource>) {
        let mut events = source.subscribe_events();
        let conn = self.clone();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PlayerEvent::Buffering) => {
                        conn.set_state(ConnectionState::Buffering).await;
                    }
                    Ok(PlayerEvent::Started) => {
                        conn.set_state(ConnectionState::Playing).await;
                    }
                    Ok(PlayerEvent::Paused) => {
                        conn.set_state(ConnectionState::Paused).await;
                    }
                    Ok(PlayerEvent::Finished) => {
                        let producer = conn.producer.lock().await.take();
                        if producer.is_some() {
                            if let Err(e) = conn.signaling.stop_produce(ProduceKind::Audio).await {
                                warn!(target: "Voice", "Failed to stop producing in room {}: {e}", conn.room_id);
                            }
                        }
                        conn.set_state(ConnectionState::Idle).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        if let Some(old) = self.player_pump.lock().await.replace(pump) {
            old.abort();
        }
    }

    async fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock().await;
            if *state == next {
                debug!(target: "Voice", "Room {} already in state {next:?}", self.room_id);
                return;
            }
            *state = next;
        }
        let _ = self.events_tx.send(VoiceEvent::StateChanged(next));
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Current roster of the room, including this client.
    pub async fn users(&self) -> Vec<RoomUser> {
        self.signaling.users().await
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.signaling
            .users()
            .await
            .iter()
            .any(|user| user.id == user_id)
    }

    pub async fn producer(&self) -> Option<Producer> {
        self.producer.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events_tx.subscribe()
    }

    /// Leaves the room: closes the transport and the signaling channel
    /// and detaches the media source. The source itself stays usable.
    pub async fn leave(&self) {
        self.cancel_leave_timer().await;
        self.set_state(ConnectionState::Offline).await;

        if let Some(transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
        self.transport_connected.store(false, Ordering::SeqCst);
        self.producer.lock().await.take();
        self.signaling.close().await;

        if let Some(media) = self.media.lock().await.take() {
            media.detach().await;
        }
    }

    /// Leaves and tears down the event pumps. The connection is dead
    /// afterwards.
    pub async fn destroy(&self) {
        self.leave().await;
        if let Some(pump) = self.signaling_pump.lock().await.take() {
            pump.abort();
        }
        if let Some(pump) = self.player_pump.lock().await.take() {
            pump.abort();
        }
    }
}
