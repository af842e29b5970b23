use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(MessageId);
id_newtype!(NotificationId);
id_newtype!(UploadId);

impl NotificationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl UploadId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_room_type")]
    pub room_type: String,
    /// Ordered, duplicate-free member ids as stored by the backend.
    #[serde(
        default,
        rename = "members",
        deserialize_with = "deserialize_unique_members"
    )]
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub member_count: u32,
}

impl Room {
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.name.to_lowercase().contains(&query)
            || self.description.to_lowercase().contains(&query)
    }
}

fn default_room_type() -> String {
    "general".to_string()
}

fn deserialize_unique_members<'de, D>(deserializer: D) -> Result<Vec<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<UserId>>::deserialize(deserializer)?.unwrap_or_default();
    let mut unique = Vec::with_capacity(raw.len());
    for id in raw {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    Ok(unique)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    Audio,
}

impl MessageKind {
    fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" => Self::File,
            "audio" => Self::Audio,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub file_url: String,
    pub file_name: String,
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAttachment {
    pub file_url: String,
    pub file_type: Option<String>,
    pub duration_secs: Option<u32>,
}

/// Per-variant payload of a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text,
    File(FileAttachment),
    Audio(AudioAttachment),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text => MessageKind::Text,
            Self::File(_) => MessageKind::File,
            Self::Audio(_) => MessageKind::Audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    pub is_edited: bool,
    pub is_deleted: bool,
}

impl ChatMessage {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Flat shape of a message as the backend serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    #[serde(default)]
    message_id: MessageId,
    room_id: RoomId,
    sender_id: UserId,
    #[serde(default)]
    sender_name: String,
    #[serde(default)]
    content: String,
    #[serde(default = "default_message_type")]
    message_type: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    is_edited: bool,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<u32>,
}

impl Default for MessageId {
    fn default() -> Self {
        Self(String::new())
    }
}

fn default_message_type() -> String {
    "text".to_string()
}

impl From<WireMessage> for ChatMessage {
    fn from(wire: WireMessage) -> Self {
        let body = decode_body(
            MessageKind::parse_lenient(&wire.message_type),
            wire.file_url,
            wire.file_name,
            wire.file_type,
            wire.duration,
        );
        Self {
            message_id: wire.message_id,
            room_id: wire.room_id,
            sender_id: wire.sender_id,
            sender_name: wire.sender_name,
            content: wire.content,
            body,
            timestamp: wire.timestamp,
            is_edited: wire.is_edited,
            is_deleted: wire.is_deleted,
        }
    }
}

impl From<ChatMessage> for WireMessage {
    fn from(message: ChatMessage) -> Self {
        let (file_url, file_name, file_type, duration) = encode_body(&message.body);
        Self {
            message_id: message.message_id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            content: message.content,
            message_type: kind_tag(message.body.kind()).to_string(),
            timestamp: message.timestamp,
            is_edited: message.is_edited,
            is_deleted: message.is_deleted,
            file_url,
            file_name,
            file_type,
            duration,
        }
    }
}

pub(crate) fn kind_tag(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::File => "file",
        MessageKind::Audio => "audio",
    }
}

/// Attachment variants without a locator degrade to plain text.
pub(crate) fn decode_body(
    kind: MessageKind,
    file_url: Option<String>,
    file_name: Option<String>,
    file_type: Option<String>,
    duration: Option<u32>,
) -> MessageBody {
    match (kind, file_url) {
        (MessageKind::File, Some(file_url)) => MessageBody::File(FileAttachment {
            file_name: file_name.unwrap_or_else(|| file_url.clone()),
            file_url,
            file_type,
        }),
        (MessageKind::Audio, Some(file_url)) => MessageBody::Audio(AudioAttachment {
            file_url,
            file_type,
            duration_secs: duration,
        }),
        _ => MessageBody::Text,
    }
}

pub(crate) fn encode_body(
    body: &MessageBody,
) -> (Option<String>, Option<String>, Option<String>, Option<u32>) {
    match body {
        MessageBody::Text => (None, None, None, None),
        MessageBody::File(file) => (
            Some(file.file_url.clone()),
            Some(file.file_name.clone()),
            file.file_type.clone(),
            None,
        ),
        MessageBody::Audio(audio) => (
            Some(audio.file_url.clone()),
            None,
            audio.file_type.clone(),
            audio.duration_secs,
        ),
    }
}

/// Accepts RFC 3339 as well as the zone-less ISO form the backend emits,
/// which is UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| format!("invalid timestamp '{raw}': {err}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Mention,
    RoomInvite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub is_online: bool,
}
