use crate::api::ApiUser;

/// A user as seen from inside a voice room.
///
/// Profile fields come from the REST API, presence fields from the
/// signaling server. A user whose profile fetch failed still appears in
/// the roster with an empty profile.
#[derive(Debug, Clone, Default)]
pub struct RoomUser {
    pub id: String,
    pub username: String,
    pub badges: u32,
    pub relationship: Option<String>,
    pub online: bool,
    /// Whether the user is currently in the room.
    pub connected: bool,
    /// Room the user is connected to, if any.
    pub connected_to: Option<String>,
    pub muted: bool,
}

impl RoomUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn apply_profile(&mut self, profile: &ApiUser) {
        self.username = profile.username.clone();
        self.badges = profile.badges;
        self.relationship = profile.relationship.clone();
        self.online = profile.online;
    }
}
