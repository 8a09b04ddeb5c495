use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Ping,
    Pong,
    FriendMessage,
    GroupMessage,
    FileMessage,
    ImageMessage,
}

/// A frame read off the socket. Unknown `type` values fail to decode and get dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub to_user_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

impl IncomingFrame {
    pub fn to_user(&self) -> Option<&str> {
        non_empty(&self.to_user_id)
    }

    pub fn room(&self) -> Option<&str> {
        non_empty(&self.room_id)
    }

    pub fn content(&self) -> Option<&str> {
        non_empty(&self.content)
    }

    pub fn attachment(&self) -> Option<&str> {
        non_empty(&self.attachment_id)
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub from_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    pub timestamp: i64,
    pub sequence_id: i64,
}

/// Attachment metadata as produced by the upload service, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub attachment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb_attachment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb_width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb_height: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
pub struct PongFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub ts: i64,
}

impl PongFrame {
    pub fn now() -> Self {
        Self {
            kind: FrameKind::Pong,
            ts: crate::db::ms_to_secs(crate::db::now_ms()),
        }
    }
}
