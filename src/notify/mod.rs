//! Client notification fan-out.
//!
//! `Notifier` is what the engine talks to. `ConnectionHub` is the
//! production implementation: a registry of connection id to a bounded
//! delivery queue. Delivery never waits. A connection whose queue is full
//! or whose receiver is gone is dropped from the registry and logged.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{ServerMessage, UserId};

/// Delivers typed messages to connected clients. Implementations must not
/// block: callers include the clock driver.
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    /// Deliver to every connection identified as `user_id`.
    fn notify_user(&self, user_id: UserId, message: ServerMessage);

    /// Deliver to every connection.
    fn broadcast_all(&self, message: ServerMessage);
}

struct Subscriber {
    user_id: Option<UserId>,
    tx: mpsc::Sender<ServerMessage>,
}

pub struct ConnectionHub {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    buffer: usize,
}

impl ConnectionHub {
    /// `buffer` is the per-connection queue depth.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and return the receiving end of its queue.
    /// Re-subscribing an id replaces the old queue.
    pub fn subscribe(&self, conn_id: Uuid, user_id: Option<UserId>) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().insert(conn_id, Subscriber { user_id, tx });
        debug!(%conn_id, ?user_id, "Connection subscribed");
        rx
    }

    /// Attach a user id to an existing connection. Returns false if the
    /// connection is not registered.
    pub fn identify(&self, conn_id: Uuid, user_id: UserId) -> bool {
        match self.lock().get_mut(&conn_id) {
            Some(sub) => {
                sub.user_id = Some(user_id);
                debug!(%conn_id, user_id, "Connection identified");
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, conn_id: Uuid) -> bool {
        let removed = self.lock().remove(&conn_id).is_some();
        if removed {
            debug!(%conn_id, "Connection unsubscribed");
        }
        removed
    }

    /// Deliver to a single connection.
    pub fn send_to(&self, conn_id: Uuid, message: ServerMessage) -> bool {
        self.deliver(|id, _| *id == conn_id, message) > 0
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }


    /// Push `message` to every matching subscriber, pruning dead ones.
    /// Returns the number of successful deliveries.
    fn deliver<F>(&self, matches: F, message: ServerMessage) -> usize
    where
        F: Fn(&Uuid, &Subscriber) -> bool,
    {
        let mut subscribers = self.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, sub) in subscribers.iter() {
            if !matches(id, sub) {
                continue;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id = %id, "Subscriber queue full, dropping connection");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(conn_id = %id, "Subscriber gone, dropping connection");
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            subscribers.remove(&id);
        }
        delivered
    }
}

impl Notifier for ConnectionHub {
    fn notify_user(&self, user_id: UserId, message: ServerMessage) {
        self.deliver(|_, sub| sub.user_id == Some(user_id), message);
    }

    fn broadcast_all(&self, message: ServerMessage) {
        self.deliver(|_, _| true, message);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
