use sqlx::SqlitePool;

use crate::db::{self, ContentType};

use super::frame::{AttachmentPayload, FrameKind};

#[derive(Debug, Clone, sqlx::FromRow)]
struct AttachmentRow {
    id: String,
    uploader_user_id: Option<String>,
    file_name: Option<String>,
    mime_type: Option<String>,
    size_bytes: Option<i64>,
    hash: Option<String>,
    storage_provider: Option<String>,
    image_width: Option<i64>,
    image_height: Option<i64>,
    thumb_attachment_id: Option<String>,
    thumb_width: Option<i64>,
    thumb_height: Option<i64>,
    created_at: i64,
}

/// An uploaded object the sender is allowed to reference in a message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub payload: AttachmentPayload,
    /// `payload` serialized, stored alongside the message.
    pub payload_json: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.payload
            .mime_type
            .as_deref()
            .is_some_and(|mime| mime.trim().to_ascii_lowercase().starts_with("image/"))
    }

    pub fn content_type(&self) -> ContentType {
        if self.is_image() { ContentType::Image } else { ContentType::File }
    }

    pub fn frame_kind(&self) -> FrameKind {
        if self.is_image() { FrameKind::ImageMessage } else { FrameKind::FileMessage }
    }
}

/// `None` when the attachment does not exist or belongs to someone else.
pub(crate) async fn load_for_sender(db_pool: &SqlitePool, sender_id: &str, attachment_id: &str) -> anyhow::Result<Option<Attachment>> {
    let row: Option<AttachmentRow> = sqlx::query_as(
        "SELECT id,uploader_user_id,file_name,mime_type,size_bytes,hash,storage_provider,image_width,image_height,\
         thumb_attachment_id,thumb_width,thumb_height,created_at FROM attachments WHERE id=?",
    )
    .bind(attachment_id)
    .fetch_optional(db_pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    if row.uploader_user_id.as_deref().is_some_and(|uploader| uploader != sender_id) {
        return Ok(None);
    }

    let payload = AttachmentPayload {
        attachment_id: row.id,
        file_name: row.file_name,
        mime_type: row.mime_type,
        size_bytes: row.size_bytes,
        hash: row.hash,
        storage_provider: row.storage_provider,
        image_width: row.image_width,
        image_height: row.image_height,
        thumb_attachment_id: row.thumb_attachment_id,
        thumb_width: row.thumb_width,
        thumb_height: row.thumb_height,
        created_at: db::ms_to_secs(row.created_at),
    };
    let payload_json = serde_json::to_string(&payload)?;

    Ok(Some(Attachment { payload, payload_json }))
}
