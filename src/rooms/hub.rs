use std::collections::{HashMap, HashSet};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

const CONTROL_CHANNEL_CAPACITY: usize = 1024;

/// Identifies one live socket. A user may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What the hub keeps for a connection: a lookup key and the sending half of its queue.
///
/// The hub holds the only sender, so dropping it is how the queue gets closed.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnId,
    pub user_id: String,
    pub queue: mpsc::Sender<Utf8Bytes>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Connections disconnected because their queue was full or already closed.
    pub dropped: usize,
}

impl Delivery {
    fn merge(&mut self, other: Delivery) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

/// user -> live connections. Only ever touched from the hub's control loop.
#[derive(Debug, Default)]
pub struct Registry {
    by_user: HashMap<String, HashMap<ConnId, mpsc::Sender<Utf8Bytes>>>,
}

impl Registry {
    pub fn register(&mut self, conn: ConnectionHandle) {
        self.by_user
            .entry(conn.user_id)
            .or_default()
            .insert(conn.id, conn.queue);
    }

    /// Returns false if the connection was already gone.
    pub fn unregister(&mut self, user_id: &str, id: ConnId) -> bool {
        let Some(conns) = self.by_user.get_mut(user_id) else {
            return false;
        };

        let removed = conns.remove(&id).is_some();
        if conns.is_empty() {
            self.by_user.remove(user_id);
        }
        removed
    }

    /// Pushes onto every connection of `user_id` without waiting. A connection that cannot
    /// take the payload right now is disconnected.
    pub fn deliver(&mut self, user_id: &str, payload: &Utf8Bytes) -> Delivery {
        let mut result = Delivery::default();
        let Some(conns) = self.by_user.get_mut(user_id) else {
            return result;
        };

        let mut dead = Vec::new();
        for (id, queue) in conns.iter() {
            match queue.try_send(payload.clone()) {
                Ok(()) => result.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user_id, conn = %id, "send queue full, disconnecting");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(user_id, conn = %id, "send queue already closed");
                    dead.push(*id);
                }
            }
        }

        result.dropped = dead.len();
        for id in dead {
            conns.remove(&id);
        }
        if conns.is_empty() {
            self.by_user.remove(user_id);
        }

        result
    }

    pub fn deliver_direct(&mut self, from_user: &str, to_user: &str, payload: &Utf8Bytes) -> Delivery {
        let mut result = self.deliver(to_user, payload);
        // echo to the sender's other devices
        if from_user != to_user {
            result.merge(self.deliver(from_user, payload));
        }
        result
    }

    pub fn deliver_to_set(&mut self, user_ids: &[String], payload: &Utf8Bytes) -> Delivery {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let mut result = Delivery::default();
        for user_id in user_ids {
            if seen.insert(user_id.as_str()) {
                result.merge(self.deliver(user_id, payload));
            }
        }
        result
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, HashMap::len)
    }

    pub fn online_users(&self) -> usize {
        self.by_user.len()
    }
}

#[derive(Debug)]
enum Outbound {
    Direct {
        from_user: String,
        to_user: String,
        payload: Utf8Bytes,
    },
    Set {
        user_ids: Vec<String>,
        payload: Utf8Bytes,
    },
}

#[derive(Debug)]
enum Probe {
    ConnectionCount {
        user_id: String,
        reply: oneshot::Sender<usize>,
    },
    OnlineUsers {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the connection registry. All mutation and fan-out happens on one task, fed by
/// these channels; the handle is cheap to clone.
#[derive(Debug, Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<ConnectionHandle>,
    unregister_tx: mpsc::Sender<(String, ConnId)>,
    outbound_tx: mpsc::Sender<Outbound>,
    probe_tx: mpsc::Sender<Probe>,
}

impl Hub {
    /// Starts the control loop. It runs until every `Hub` handle has been dropped.
    pub fn spawn() -> Self {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (probe_tx, probe_rx) = mpsc::channel(16);

        tokio::spawn(run(register_rx, unregister_rx, outbound_rx, probe_rx));

        Self {
            register_tx,
            unregister_tx,
            outbound_tx,
            probe_tx,
        }
    }

    pub async fn register(&self, conn: ConnectionHandle) {
        if self.register_tx.send(conn).await.is_err() {
            warn!("hub stopped, connection not registered");
        }
    }

    /// Drops the connection and closes its outbound queue. Safe to call more than once.
    pub async fn unregister(&self, user_id: &str, id: ConnId) {
        if self.unregister_tx.send((user_id.to_owned(), id)).await.is_err() {
            warn!("hub stopped, connection not unregistered");
        }
    }

    pub async fn deliver_direct(&self, from_user: &str, to_user: &str, payload: Utf8Bytes) {
        let event = Outbound::Direct {
            from_user: from_user.to_owned(),
            to_user: to_user.to_owned(),
            payload,
        };
        if self.outbound_tx.send(event).await.is_err() {
            warn!("hub stopped, direct message not delivered");
        }
    }

    pub async fn deliver_to_set(&self, user_ids: Vec<String>, payload: Utf8Bytes) {
        if self.outbound_tx.send(Outbound::Set { user_ids, payload }).await.is_err() {
            warn!("hub stopped, group message not delivered");
        }
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        let probe = Probe::ConnectionCount {
            user_id: user_id.to_owned(),
            reply,
        };
        if self.probe_tx.send(probe).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn online_users(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.probe_tx.send(Probe::OnlineUsers { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run(
    mut register_rx: mpsc::Receiver<ConnectionHandle>,
    mut unregister_rx: mpsc::Receiver<(String, ConnId)>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut probe_rx: mpsc::Receiver<Probe>,
) {
    let mut registry = Registry::default();

    loop {
        tokio::select! {
            biased;

            Some(conn) = register_rx.recv() => {
                debug!(user_id = %conn.user_id, conn = %conn.id, "hub: registered");
                registry.register(conn);
            }
            Some((user_id, id)) = unregister_rx.recv() => {
                if registry.unregister(&user_id, id) {
                    debug!(%user_id, conn = %id, "hub: unregistered");
                }
            }
            Some(event) = outbound_rx.recv() => {
                let delivery = match event {
                    Outbound::Direct { from_user, to_user, payload } => {
                        registry.deliver_direct(&from_user, &to_user, &payload)
                    }
                    Outbound::Set { user_ids, payload } => registry.deliver_to_set(&user_ids, &payload),
                };
                trace!(delivered = delivery.delivered, dropped = delivery.dropped, "hub: fan-out");
            }
            Some(probe) = probe_rx.recv() => match probe {
                Probe::ConnectionCount { user_id, reply } => {
                    let _ = reply.send(registry.connection_count(&user_id));
                }
                Probe::OnlineUsers { reply } => {
                    let _ = reply.send(registry.online_users());
                }
            },
            else => break,
        }
    }

    debug!("hub: all handles dropped, stopping");
}
