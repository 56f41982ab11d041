use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use tokio::sync::{Mutex, broadcast};

use crate::api::{ApiError, HttpClient, RevoltApi, UreqHttpClient};
use crate::config::RevoiceConfig;
use crate::connection::{ConnectionState, VoiceConnection};
use crate::device::{DeviceFactory, NullDeviceFactory};
use crate::signaling::{SignalingChannel, SignalingError};
use crate::types::events::VoiceEvent;
use crate::types::user::RoomUser;

const VOICE_CHANNEL_TYPE: &str = "VoiceChannel";

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("the channel is not a voice channel")]
    NotAVoiceRoom,
    #[error("already connected to this room")]
    AlreadyConnected,
    #[error("failed to look up the room")]
    RoomLookup(#[from] ApiError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Entry point of the crate: tracks every joined room and every user
/// seen across them.
///
/// Rooms are joined through [`Revoice::join`]; the registry evicts a
/// connection once it reports itself offline, so a later join for the
/// same room starts fresh.
pub struct Revoice {
    api: RevoltApi,
    config: RevoiceConfig,
    device_factory: Arc<dyn DeviceFactory>,
    connections: Mutex<HashMap<String, Arc<VoiceConnection>>>,
    users: Arc<DashMap<String, RoomUser>>,
}

impl Revoice {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Self::builder(token).build()
    }

    pub fn builder(token: impl Into<String>) -> RevoiceBuilder {
        RevoiceBuilder {
            token: token.into(),
            config: None,
            http: None,
            device_factory: None,
        }
    }

    /// Joins a voice room and returns its connection once the signaling
    /// socket is open. With `idle_leave` set, the connection leaves on
    /// its own after the room has been empty for that long.
    pub async fn join(
        self: &Arc<Self>,
        room_id: &str,
        idle_leave: Option<Duration>,
    ) -> Result<Arc<VoiceConnection>, JoinError> {
        // Held across the whole join so concurrent joins for one room
        // cannot race past the duplicate check.
        let mut connections = self.connections.lock().await;
        if connections.contains_key(room_id) {
            return Err(JoinError::AlreadyConnected);
        }

        let channel = self.api.fetch_channel(room_id).await?;
        if channel.channel_type != VOICE_CHANNEL_TYPE {
            return Err(JoinError::NotAVoiceRoom);
        }

        let signaling = SignalingChannel::new(room_id, self.api.clone(), self.config.clone());
        let device = self.device_factory.create_device();
        let connection = VoiceConnection::new(
            room_id,
            signaling,
            device,
            idle_leave,
            self.users.clone(),
        );

        let events = connection.subscribe();
        connection.start().await?;
        connections.insert(room_id.to_string(), connection.clone());
        drop(connections);

        self.watch_connection(room_id, events);
        Ok(connection)
    }

    /// Evicts the room's entry once its connection goes offline, from
    /// a manual leave or the idle-leave timer alike.
    fn watch_connection(self: &Arc<Self>, room_id: &str, mut events: broadcast::Receiver<VoiceEvent>) {
        let registry = self.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(VoiceEvent::Autoleave)
                    | Ok(VoiceEvent::StateChanged(ConnectionState::Offline)) => {
                        registry.connections.lock().await.remove(&room_id);
                        debug!(target: "Voice", "Dropped registry entry for room {room_id}");
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Leaves the given room. Returns whether a connection existed.
    pub async fn leave(&self, room_id: &str) -> bool {
        let connection = self.connections.lock().await.remove(room_id);
        match connection {
            Some(connection) => {
                connection.destroy().await;
                true
            }
            None => false,
        }
    }

    pub async fn get_connection(&self, room_id: &str) -> Option<Arc<VoiceConnection>> {
        self.connections.lock().await.get(room_id).cloned()
    }

    /// Looks up a user seen in any joined room, along with the
    /// connection they are currently in, if any.
    pub async fn get_user(
        &self,
        user_id: &str,
    ) -> Option<(RoomUser, Option<Arc<VoiceConnection>>)> {
        let user = self.users.get(user_id).map(|entry| entry.value().clone())?;
        let connection = match user.connected_to.as_deref() {
            Some(room_id) if user.connected => {
                self.connections.lock().await.get(room_id).cloned()
            }
            _ => None,
        };
        Some((user, connection))
    }

    /// Whether the user has been seen in any joined room. Entries
    /// outlive the user's presence, so this can be stale.
    pub fn knows_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn users(&self) -> Vec<RoomUser> {
        self.users
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

pub struct RevoiceBuilder {
    token: String,
    config: Option<RevoiceConfig>,
    http: Option<Arc<dyn HttpClient>>,
    device_factory: Option<Arc<dyn DeviceFactory>>,
}

impl RevoiceBuilder {
    pub fn with_config(mut self, config: RevoiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_device_factory(mut self, device_factory: Arc<dyn DeviceFactory>) -> Self {
        self.device_factory = Some(device_factory);
        self
    }

    pub fn build(self) -> Arc<Revoice> {
        let config = self.config.unwrap_or_default();
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(UreqHttpClient::new()));
        let device_factory = self
            .device_factory
            .unwrap_or_else(|| Arc::new(NullDeviceFactory));
        let api = RevoltApi::new(config.api_url.clone(), self.token, http);
        Arc::new(Revoice {
            api,
            config,
            device_factory,
            connections: Mutex::new(HashMap::new()),
            users: Arc::new(DashMap::new()),
        })
    }
}
