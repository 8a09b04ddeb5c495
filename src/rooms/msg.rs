use axum::extract::ws::Utf8Bytes;
use thiserror::Error;

use crate::{db, AppState};

use super::{
    attachment::{self, Attachment},
    frame::{FrameKind, IncomingFrame, OutgoingFrame, PongFrame},
    gate::{self, Denied},
    new,
    sequencer::MessageDraft,
};

/// What became of one inbound frame.
#[derive(Debug)]
pub enum Outcome {
    /// Goes back to this connection only.
    Reply(Utf8Bytes),
    Delivered { room_id: String, sequence_id: i64 },
    Ignored,
    Rejected(Rejection),
}

/// Reasons a frame is dropped without reaching the sequencer. The sender is not told.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error(transparent)]
    Denied(#[from] Denied),
    #[error("attachment missing or not owned by sender")]
    AttachmentUnavailable,
}

#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Friend(&'a str),
    Group(&'a str),
}

struct Body {
    kind: FrameKind,
    content: Option<String>,
    attachment: Option<Attachment>,
}

pub async fn handle_frame(state: &AppState, user_id: &str, frame: &IncomingFrame) -> anyhow::Result<Outcome> {
    match frame.kind {
        FrameKind::Ping => Ok(Outcome::Reply(serde_json::to_string(&PongFrame::now())?.into())),
        FrameKind::Pong => Ok(Outcome::Ignored),
        FrameKind::FriendMessage => {
            let (Some(to_user), Some(content)) = (frame.to_user(), frame.content()) else {
                return Ok(Outcome::Rejected(Rejection::Missing("to_user_id or content")));
            };
            let body = Body {
                kind: FrameKind::FriendMessage,
                content: Some(content.to_owned()),
                attachment: None,
            };
            post(state, user_id, Target::Friend(to_user), body).await
        }
        FrameKind::GroupMessage => {
            let (Some(room_id), Some(content)) = (frame.room(), frame.content()) else {
                return Ok(Outcome::Rejected(Rejection::Missing("room_id or content")));
            };
            let body = Body {
                kind: FrameKind::GroupMessage,
                content: Some(content.to_owned()),
                attachment: None,
            };
            post(state, user_id, Target::Group(room_id), body).await
        }
        FrameKind::FileMessage | FrameKind::ImageMessage => {
            let Some(attachment_id) = frame.attachment() else {
                return Ok(Outcome::Rejected(Rejection::Missing("attachment_id")));
            };
            let target = match (frame.to_user(), frame.room()) {
                (Some(to_user), _) => Target::Friend(to_user),
                (None, Some(room_id)) => Target::Group(room_id),
                (None, None) => return Ok(Outcome::Rejected(Rejection::Missing("to_user_id or room_id"))),
            };
            let Some(attachment) = attachment::load_for_sender(&state.db_pool, user_id, attachment_id).await? else {
                return Ok(Outcome::Rejected(Rejection::AttachmentUnavailable));
            };
            let body = Body {
                kind: attachment.frame_kind(),
                content: None,
                attachment: Some(attachment),
            };
            post(state, user_id, target, body).await
        }
    }
}

/// Authorize, sequence, then fan out. Nothing is delivered unless the message was stored.
async fn post(state: &AppState, sender: &str, target: Target<'_>, body: Body) -> anyhow::Result<Outcome> {
    let verdict = match target {
        Target::Friend(to_user) => gate::check_direct(&state.db_pool, sender, to_user).await?,
        Target::Group(room_id) => gate::check_group(&state.db_pool, room_id, sender, db::now_ms()).await?,
    };
    if let Err(denied) = verdict {
        return Ok(Outcome::Rejected(denied.into()));
    }

    let room_id = match target {
        Target::Friend(to_user) => new::ensure_direct_room(&state.db_pool, sender, to_user).await?,
        Target::Group(room_id) => room_id.to_owned(),
    };

    let draft = match &body.attachment {
        Some(attachment) => MessageDraft::attachment(
            &room_id,
            sender,
            attachment.content_type(),
            &attachment.payload.attachment_id,
            attachment.payload_json.clone(),
        ),
        None => MessageDraft::text(&room_id, sender, body.content.as_deref().unwrap_or_default()),
    };

    let stored = state.sequencer.persist(&draft).await?;

    let out = OutgoingFrame {
        id: stored.id,
        kind: body.kind,
        from_user_id: sender.to_owned(),
        to_user_id: match target {
            Target::Friend(to_user) => Some(to_user.to_owned()),
            Target::Group(_) => None,
        },
        room_id: Some(room_id.clone()),
        content: body.content,
        attachment_id: body.attachment.as_ref().map(|a| a.payload.attachment_id.clone()),
        attachment: body.attachment.map(|a| a.payload),
        timestamp: db::ms_to_secs(stored.created_at),
        sequence_id: stored.sequence_id,
    };
    let payload: Utf8Bytes = serde_json::to_string(&out)?.into();

    match target {
        Target::Friend(to_user) => state.hub.deliver_direct(sender, to_user, payload).await,
        Target::Group(_) => {
            let members = new::active_member_ids(&state.db_pool, &room_id).await?;
            state.hub.deliver_to_set(members, payload).await;
        }
    }

    Ok(Outcome::Delivered {
        room_id,
        sequence_id: stored.sequence_id,
    })
}
