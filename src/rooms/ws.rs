use std::fmt::Display;

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval_at, timeout, Instant},
};
use tower_sessions::Session;
use tracing::{debug, info, trace, warn};

use crate::{config::SocketConfig, session::current_user, AppResult, AppState};

use super::{
    frame::IncomingFrame,
    hub::{ConnId, ConnectionHandle},
    msg::{self, Outcome},
};

/// Replies owed to this connection alone (pongs). Overflow is dropped.
const CONTROL_LANE_CAPACITY: usize = 16;

#[debug_handler(state = crate::AppState)]
pub(crate) async fn connect(
    State(state): State<AppState>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = current_user(&session).await?;
    let max_bytes = state.config.socket.max_frame_bytes;

    Ok(ws
        .max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| run(state, user_id, socket))
        .into_response())
}

/// Why the inbound pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    PeerClosed,
    ReadFailed,
    LivenessExpired,
    WriterStopped,
}

async fn run(state: AppState, user_id: String, socket: WebSocket) {
    let cfg = state.config.socket.clone();
    let id = ConnId::new();
    let (queue, queue_rx) = mpsc::channel(cfg.send_queue);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_LANE_CAPACITY);
    let (closed_tx, closed_rx) = oneshot::channel();

    state
        .hub
        .register(ConnectionHandle {
            id,
            user_id: user_id.clone(),
            queue,
        })
        .await;
    info!(%user_id, conn = %id, "connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, queue_rx, control_rx, closed_tx, cfg.clone()));

    let exit = read_pump(&state, &user_id, stream, control_tx, closed_rx, &cfg).await;

    // closing the queue is what stops the writer
    state.hub.unregister(&user_id, id).await;
    if let Err(err) = writer.await {
        warn!(%user_id, conn = %id, error = %err, "write pump panicked");
    }
    info!(%user_id, conn = %id, ?exit, "disconnected");
}

/// Decodes frames one at a time until the peer goes away, stops answering, or the writer gives up.
pub(crate) async fn read_pump<S, E>(
    state: &AppState,
    user_id: &str,
    mut stream: S,
    control: mpsc::Sender<Utf8Bytes>,
    mut closed: oneshot::Receiver<()>,
    cfg: &SocketConfig,
) -> Exit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = &mut closed => return Exit::WriterStopped,
            next = timeout(cfg.pong_wait, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                info!(user_id, "no frame within liveness window");
                return Exit::LivenessExpired;
            }
            Ok(None) => return Exit::PeerClosed,
            Ok(Some(Err(err))) => {
                debug!(user_id, error = %err, "read failed");
                return Exit::ReadFailed;
            }
            Ok(Some(Ok(message))) => message,
        };

        let decoded = match &message {
            Message::Text(text) => serde_json::from_str::<IncomingFrame>(text.as_str()),
            Message::Binary(data) => serde_json::from_slice::<IncomingFrame>(data),
            Message::Close(_) => return Exit::PeerClosed,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(err) => {
                trace!(user_id, error = %err, "undecodable frame dropped");
                continue;
            }
        };

        match msg::handle_frame(state, user_id, &frame).await {
            Ok(Outcome::Reply(reply)) => {
                if control.try_send(reply).is_err() {
                    debug!(user_id, "control lane full, reply dropped");
                }
            }
            Ok(Outcome::Delivered { room_id, sequence_id }) => {
                trace!(user_id, %room_id, sequence_id, "message delivered");
            }
            Ok(Outcome::Rejected(reason)) => {
                debug!(user_id, kind = ?frame.kind, %reason, "frame rejected");
            }
            Ok(Outcome::Ignored) => {}
            Err(err) => {
                warn!(user_id, kind = ?frame.kind, error = ?err, "message not saved");
            }
        }
    }
}

/// Drains the outbound queue onto the socket and sends heartbeats. Stops when the hub closes the
/// queue (after a close frame) or when a write fails; either way `closed` fires.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Utf8Bytes>,
    mut control: mpsc::Receiver<Utf8Bytes>,
    closed: oneshot::Sender<()>,
    cfg: SocketConfig,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + cfg.ping_period, cfg.ping_period);

    loop {
        let message = tokio::select! {
            item = queue.recv() => match item {
                Some(payload) => Message::Text(payload),
                None => {
                    if let Ok(Err(err)) = timeout(cfg.write_wait, sink.send(Message::Close(None))).await {
                        trace!(error = %err, "close frame not sent");
                    }
                    break;
                }
            },
            Some(reply) = control.recv() => Message::Text(reply),
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(cfg.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "write failed");
                break;
            }
            Err(_) => {
                debug!("write deadline passed");
                break;
            }
        }
    }

    let _ = closed.send(());
}
