use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport negotiation mode requested from the signaling server.
pub const TRANSPORT_MODE: &str = "SplitWebRTC";

/// Wire tag of a signaling message. Serializes as the bare variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Authenticate,
    InitializeTransports,
    ConnectTransport,
    RoomInfo,
    StartProduce,
    StopProduce,
    UserJoined,
    UserLeft,
}

/// Envelope shared by every signaling frame.
///
/// Requests carry an `id`; the server echoes the same `id` and `type` in
/// its reply. Unsolicited events carry no `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn request(id: u64, msg_type: MessageType, data: Option<Value>) -> Self {
        Self {
            id: Some(id),
            msg_type,
            data,
        }
    }
}

/// Opaque RTP capability blob negotiated with the server. Passed through
/// to the media device untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

/// Opaque description of the send transport offered by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportDescriptor(pub Value);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProduceKind {
    Audio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub token: String,
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateReply {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeTransportsRequest {
    pub mode: &'static str,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeTransportsReply {
    pub send_transport: TransportDescriptor,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProduceRequest {
    #[serde(rename = "type")]
    pub kind: ProduceKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProduceReply {
    pub producer_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopProduceRequest {
    #[serde(rename = "type")]
    pub kind: ProduceKind,
}

/// Per-user presence flags in a `RoomInfo` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomUserState {
    #[serde(default)]
    pub audio: bool,
}

#[derive(Debug, Deserialize)]
pub struct RoomInfoReply {
    #[serde(default)]
    pub users: HashMap<String, RoomUserState>,
}

/// Payload of unsolicited `UserJoined` / `UserLeft` events.
#[derive(Debug, Deserialize)]
pub struct UserEventData {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_request_serializes_with_wire_names() {
        let data = serde_json::to_value(AuthenticateRequest {
            token: "tok".to_string(),
            room_id: "01ROOM".to_string(),
        })
        .unwrap();
        let envelope = Envelope::request(0, MessageType::Authenticate, Some(data));
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "id": 0,
                "type": "Authenticate",
                "data": { "token": "tok", "roomId": "01ROOM" },
            })
        );
    }

    #[test]
    fn room_info_request_omits_data_field() {
        let envelope = Envelope::request(3, MessageType::RoomInfo, None);
        let text = serde_json::to_string(&envelope).unwrap();
        assert_eq!(text, r#"{"id":3,"type":"RoomInfo"}"#);
    }

    #[test]
    fn unsolicited_user_joined_parses_without_id() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type":"UserJoined","data":{"id":"01USER"}}"#).unwrap();
        assert_eq!(envelope.id, None);
        assert_eq!(envelope.msg_type, MessageType::UserJoined);

        let data: UserEventData = serde_json::from_value(envelope.data.unwrap()).unwrap();
        assert_eq!(data.id, "01USER");
    }

    #[test]
    fn initialize_transports_reply_keeps_descriptor_opaque() {
        let reply: InitializeTransportsReply = serde_json::from_str(
            r#"{"sendTransport":{"id":"st-1","iceParameters":{"usernameFragment":"u"}}}"#,
        )
        .unwrap();
        assert_eq!(reply.send_transport.0["id"], "st-1");
    }

    #[test]
    fn start_produce_request_uses_type_key() {
        let json = serde_json::to_value(StartProduceRequest {
            kind: ProduceKind::Audio,
            rtp_parameters: RtpParameters(serde_json::json!({"codecs": []})),
        })
        .unwrap();
        assert_eq!(json["type"], "audio");
        assert!(json["rtpParameters"]["codecs"].is_array());
    }
}
