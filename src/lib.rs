pub mod api;
pub mod config;
pub mod connection;
pub mod device;
pub mod media;
pub mod registry;
pub mod signaling;
pub mod track;
pub mod types;

pub use api::{HttpClient, RevoltApi};
pub use config::{MediaOptions, RevoiceConfig};
pub use connection::{ConnectionState, VoiceConnection, VoiceError};
pub use media::{Media, MediaError, MediaPlayer, MediaSource};
pub use registry::{JoinError, Revoice, RevoiceBuilder};
pub use track::Producer;
pub use types::events::{PlayerEvent, SignalingEvent, VoiceEvent};
pub use types::user::RoomUser;
