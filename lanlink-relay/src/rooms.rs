//! Room registry for the signaling relay.
//!
//! Maps caller-supplied room identifiers to the set of connected clients.
//! A room exists only while it has members: it is created by the first join
//! and removed by the leave that empties it. Entries are in-memory only.
//!
//! Each room carries its own membership lock, so joins, leaves and
//! broadcasts in one room never wait on another room. The registry-wide
//! lock is held only long enough to look up, insert or remove a room.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};

use crate::relay::RelayError;

/// Queue feeding one client's WebSocket writer.
pub type ClientSender = mpsc::Sender<String>;

/// Relay-assigned identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Wraps a raw id. Normally ids come from [`ClientIdAllocator`].
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Hands out process-unique client ids.
#[derive(Debug, Default)]
pub struct ClientIdAllocator {
    next: AtomicU64,
}

impl ClientIdAllocator {
    /// Returns the next unused id.
    pub fn allocate(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Members whose queue accepted the frame.
    pub delivered: usize,
    /// Members whose frame was dropped (timeout or closed queue).
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct Members {
    clients: HashMap<ClientId, ClientSender>,
    /// Set once the room emptied; a retired room accepts no new members and
    /// is about to leave the registry.
    retired: bool,
}

#[derive(Debug, Default)]
struct Room {
    members: Mutex<Members>,
}

/// In-memory directory of live rooms.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client` to `room_id`, creating the room if absent.
    ///
    /// Joining a room whose last member is concurrently leaving waits for
    /// that room to be removed and then creates a fresh one.
    pub async fn join(&self, room_id: &str, client: ClientId, sender: ClientSender) {
        loop {
            let room = self.get_or_create(room_id).await;
            let mut members = room.members.lock().await;
            if members.retired {
                drop(members);
                tokio::task::yield_now().await;
                continue;
            }
            members.clients.insert(client, sender);
            tracing::debug!(room = %room_id, client = %client, members = members.clients.len(), "joined room");
            return;
        }
    }

    /// Removes `client` from `room_id`; deletes the room when it empties.
    ///
    /// Returns `true` if the client was a member. Safe to call for rooms or
    /// clients that do not exist.
    pub async fn leave(&self, room_id: &str, client: ClientId) -> bool {
        let Some(room) = self.get(room_id).await else {
            return false;
        };

        let mut members = room.members.lock().await;
        let removed = members.clients.remove(&client).is_some();
        if !members.clients.is_empty() || members.retired {
            return removed;
        }
        members.retired = true;
        drop(members);

        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|r| Arc::ptr_eq(r, &room)) {
            rooms.remove(room_id);
            tracing::debug!(room = %room_id, "room emptied and removed");
        }
        removed
    }

    /// Sends `frame` to every member of `room_id` except `from`.
    ///
    /// The membership lock is held for the whole fan-out, so the recipient
    /// set cannot change mid-broadcast. Each member gets at most
    /// `send_timeout` to accept the frame; a slow or closed member is
    /// skipped and the rest still receive it.
    pub async fn broadcast(
        &self,
        room_id: &str,
        from: ClientId,
        frame: &str,
        send_timeout: Duration,
    ) -> Delivery {
        let Some(room) = self.get(room_id).await else {
            return Delivery::default();
        };
        let members = room.members.lock().await;

        let sends = members
            .clients
            .iter()
            .filter(|(id, _)| **id != from)
            .map(|(id, tx)| async move {
                let result = match tokio::time::timeout(send_timeout, tx.send(frame.to_owned())).await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(RelayError::QueueClosed { client: *id }),
                    Err(_) => Err(RelayError::QueueTimeout { client: *id }),
                };
                if let Err(e) = &result {
                    tracing::warn!(room = %room_id, client = %id, error = %e, "dropping frame for member");
                }
                result
            });
        let results = futures_util::future::join_all(sends).await;
        drop(members);

        let delivered = results.iter().filter(|r| r.is_ok()).count();
        Delivery {
            delivered,
            dropped: results.len() - delivered,
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of the current members of `room_id` (empty if the room is absent).
    pub async fn members(&self, room_id: &str) -> Vec<ClientId> {
        let Some(room) = self.get(room_id).await else {
            return Vec::new();
        };
        let mut ids: Vec<ClientId> = room.members.lock().await.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns `true` if `room_id` is currently live.
    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    /// Identifiers of all live rooms, sorted.
    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        if let Some(room) = self.get(room_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.to_string()).or_insert_with(|| {
            tracing::debug!(room = %room_id, "room created");
            Arc::default()
        }))
    }
}
