use serde_json::Value;

use crate::connection::ConnectionState;
use crate::signaling::protocol::{RtpCapabilities, TransportDescriptor};
use crate::types::user::RoomUser;

// The size of the broadcast channel buffer.
pub(crate) const CHANNEL_CAPACITY: usize = 64;

/// Events emitted by a [`SignalingChannel`](crate::signaling::SignalingChannel).
///
/// `Capabilities` and `TransportsReady` fire once per session and are
/// suppressed on reconnects. `RoomFetched` fires after every roster
/// refetch, including reconnects.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Capabilities(RtpCapabilities),
    TransportsReady(TransportDescriptor),
    RoomFetched,
    UserJoined(RoomUser),
    UserLeft(RoomUser),
    /// Server notice that a member started producing; carries the raw
    /// payload of the frame.
    ProduceStarted(Value),
    /// Server notice that a member's producer went away.
    ProduceStopped(Value),
}

/// Events emitted by a [`VoiceConnection`](crate::connection::VoiceConnection).
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    StateChanged(ConnectionState),
    UserJoined(RoomUser),
    UserLeft(RoomUser),
    /// The connection left on its own because the room stayed empty.
    Autoleave,
}

/// Playback lifecycle events emitted by a [`MediaPlayer`](crate::media::MediaPlayer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    /// A track was queued and the transcoder is working on it.
    Buffering,
    /// The first packet of a track arrived, or playback resumed.
    Started,
    Paused,
    Finished,
}
