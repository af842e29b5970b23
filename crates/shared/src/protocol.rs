use serde::{Deserialize, Serialize};

use crate::{
    domain::{encode_body, ChatMessage, MessageBody, MessageKind, Room, RoomId, UserId},
    error::FrameError,
};

/// Frames the client writes to the bidirectional channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Message(OutboundMessage),
    JoinRoom { room_id: RoomId },
    LeaveRoom { room_id: RoomId },
    Typing { room_id: RoomId, is_typing: bool },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Message(message) => &message.room_id,
            Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id }
            | Self::Typing { room_id, .. } => room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub room_id: RoomId,
    pub content: String,
    pub sender_name: String,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

impl OutboundMessage {
    pub fn new(
        room_id: RoomId,
        content: impl Into<String>,
        sender_name: impl Into<String>,
        body: &MessageBody,
    ) -> Self {
        let (file_url, file_name, file_type, duration) = encode_body(body);
        Self {
            room_id,
            content: content.into(),
            sender_name: sender_name.into(),
            message_type: body.kind(),
            file_url,
            file_name,
            file_type,
            duration,
        }
    }
}

/// Frames the server pushes to a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Message(ChatMessage),
    RecentMessages {
        room_id: RoomId,
        messages: Vec<ChatMessage>,
    },
    Error {
        message: String,
    },
    Pong,
    /// A well-formed frame of a type this client does not consume.
    Other {
        kind: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RecentMessagesData {
    room_id: RoomId,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(default)]
    message: String,
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let kind = raw.kind.ok_or(FrameError::MissingType)?;
        let frame = match kind.as_str() {
            "message" => Self::Message(serde_json::from_value(raw.data)?),
            "recent_messages" => {
                let data: RecentMessagesData = serde_json::from_value(raw.data)?;
                Self::RecentMessages {
                    room_id: data.room_id,
                    messages: data.messages,
                }
            }
            "error" => {
                let data: ErrorData = serde_json::from_value(raw.data)?;
                Self::Error {
                    message: data.message,
                }
            }
            "pong" => Self::Pong,
            _ => Self::Other { kind },
        };
        Ok(frame)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub description: String,
    pub room_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedRoom {
    pub room: Room,
}

/// Envelope used by mutating REST endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    #[serde(default)]
    pub online_users: Vec<UserId>,
    #[serde(default)]
    pub total_count: usize,
}
