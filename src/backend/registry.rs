//! Connection Registry
//!
//! In-memory map of live socket connections, the rooms they joined and the
//! identities behind them. Every targeted emit and room broadcast funnels
//! through here; the registry is the authority on who is online, ahead of
//! any presence flag in the database.
//!
//! One identity may hold several concurrent connections (multiple tabs or
//! devices). Presence only collapses when the last connection goes away.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::shared::ServerEvent;

/// Opaque handle for one live socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Outcome of removing a connection from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected {
    pub user_id: i64,
    /// True when no other connection remains for this identity.
    pub last_for_user: bool,
}

struct Connection {
    user_id: i64,
    sender: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<i64>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    /// chat_id -> connections currently joined to the room.
    rooms: HashMap<i64, HashSet<ConnectionId>>,
    /// user_id -> that identity's live connections.
    by_user: HashMap<i64, HashSet<ConnectionId>>,
}

/// Shared registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user_id`, returning its handle and whether the
    /// identity was already online through another connection.
    pub fn register(
        &self,
        user_id: i64,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> (ConnectionId, bool) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.lock();
        let already_online = inner.by_user.get(&user_id).is_some_and(|c| !c.is_empty());
        inner
            .connections
            .insert(id, Connection { user_id, sender, rooms: HashSet::new() });
        inner.by_user.entry(user_id).or_default().insert(id);
        debug!("[Registry] Connection {:?} registered for user {}", id, user_id);
        (id, already_online)
    }

    /// Remove a connection and clean up its room memberships.
    pub fn unregister(&self, id: ConnectionId) -> Option<Disconnected> {
        let mut inner = self.lock();
        let conn = inner.connections.remove(&id)?;
        for chat_id in &conn.rooms {
            let emptied = match inner.rooms.get_mut(chat_id) {
                Some(members) => {
                    members.remove(&id);
                    members.is_empty()
                }
                None => false,
            };
            if emptied {
                inner.rooms.remove(chat_id);
            }
        }
        let last_for_user = match inner.by_user.get_mut(&conn.user_id) {
            Some(conns) => {
                conns.remove(&id);
                conns.is_empty()
            }
            None => true,
        };
        if last_for_user {
            inner.by_user.remove(&conn.user_id);
        }
        debug!(
            "[Registry] Connection {:?} unregistered for user {} (last: {})",
            id, conn.user_id, last_for_user
        );
        Some(Disconnected { user_id: conn.user_id, last_for_user })
    }

    /// Identity behind a connection, if it is still registered.
    pub fn user_of(&self, id: ConnectionId) -> Option<i64> {
        self.lock().connections.get(&id).map(|c| c.user_id)
    }

    pub fn join_room(&self, id: ConnectionId, chat_id: i64) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.rooms.insert(chat_id);
            inner.rooms.entry(chat_id).or_default().insert(id);
        }
    }

    pub fn leave_room(&self, id: ConnectionId, chat_id: i64) {
        let mut inner = self.lock();
        if let Some(conn) = inner.connections.get_mut(&id) {
            conn.rooms.remove(&chat_id);
        }
        let emptied = match inner.rooms.get_mut(&chat_id) {
            Some(members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.rooms.remove(&chat_id);
        }
    }

    /// Whether the connection currently sits in the chat's room.
    pub fn in_room(&self, id: ConnectionId, chat_id: i64) -> bool {
        self.lock().rooms.get(&chat_id).is_some_and(|m| m.contains(&id))
    }

    /// Emit to a single connection. Returns false when the connection is
    /// gone or its channel closed.
    pub fn send_to_connection(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let inner = self.lock();
        match inner.connections.get(&id) {
            Some(conn) => conn.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Emit to every live connection of an identity.
    pub fn send_to_user(&self, user_id: i64, event: &ServerEvent) -> usize {
        let inner = self.lock();
        let Some(conns) = inner.by_user.get(&user_id) else {
            return 0;
        };
        let mut delivered = 0;
        for id in conns {
            if let Some(conn) = inner.connections.get(id) {
                if conn.sender.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Emit to every connection joined to a chat room, optionally skipping
    /// one connection (typically the initiator).
    pub fn broadcast_to_chat(
        &self,
        chat_id: i64,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let inner = self.lock();
        let Some(members) = inner.rooms.get(&chat_id) else {
            return 0;
        };
        let mut delivered = 0;
        for id in members {
            if Some(*id) == exclude {
                continue;
            }
            if let Some(conn) = inner.connections.get(id) {
                if conn.sender.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!("[Registry] Broadcast to chat {} reached {} connections", chat_id, delivered);
        delivered
    }

    /// Emit to every registered connection except (optionally) one.
    pub fn broadcast_all(&self, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let inner = self.lock();
        let mut delivered = 0;
        for (id, conn) in &inner.connections {
            if Some(*id) == exclude {
                continue;
            }
            if conn.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Identities with at least one live connection, sorted for stable output.
    pub fn online_user_ids(&self) -> Vec<i64> {
        let inner = self.lock();
        let mut ids: Vec<i64> = inner.by_user.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.lock().by_user.get(&user_id).is_some_and(|c| !c.is_empty())
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("[Registry] Lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::event::PresencePayload;

    fn ping(user_id: i64) -> ServerEvent {
        ServerEvent::UserOnline(PresencePayload {
            user_id,
            username: format!("user{user_id}"),
            full_name: None,
            status: "online".into(),
            last_seen: None,
        })
    }

    fn connect(reg: &ConnectionRegistry, user_id: i64) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, _) = reg.register(user_id, tx);
        (id, rx)
    }

    #[test]
    fn test_room_broadcast_skips_excluded() {
        let reg = ConnectionRegistry::new();
        let (a, mut rx_a) = connect(&reg, 1);
        let (b, mut rx_b) = connect(&reg, 2);
        reg.join_room(a, 7);
        reg.join_room(b, 7);

        let reached = reg.broadcast_to_chat(7, &ping(1), Some(a));
        assert_eq!(reached, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_presence_collapses_on_last_connection() {
        let reg = ConnectionRegistry::new();
        let (first, _rx1) = connect(&reg, 5);
        let (second, _rx2) = connect(&reg, 5);
        assert!(reg.is_online(5));

        let gone = reg.unregister(first).unwrap();
        assert!(!gone.last_for_user);
        assert!(reg.is_online(5));

        let gone = reg.unregister(second).unwrap();
        assert!(gone.last_for_user);
        assert!(!reg.is_online(5));
    }

    #[test]
    fn test_register_reports_existing_presence() {
        let reg = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_, already) = reg.register(9, tx);
        assert!(!already);
        let (tx, _rx2) = mpsc::unbounded_channel();
        let (_, already) = reg.register(9, tx);
        assert!(already);
    }

    #[test]
    fn test_unregister_cleans_rooms() {
        let reg = ConnectionRegistry::new();
        let (a, _rx) = connect(&reg, 1);
        reg.join_room(a, 3);
        assert!(reg.in_room(a, 3));
        reg.unregister(a);
        assert_eq!(reg.broadcast_to_chat(3, &ping(1), None), 0);
    }

    #[test]
    fn test_send_to_user_hits_every_connection() {
        let reg = ConnectionRegistry::new();
        let (_a, mut rx_a) = connect(&reg, 4);
        let (_b, mut rx_b) = connect(&reg, 4);
        assert_eq!(reg.send_to_user(4, &ping(4)), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_online_user_ids_sorted_unique() {
        let reg = ConnectionRegistry::new();
        let (_a, _r1) = connect(&reg, 10);
        let (_b, _r2) = connect(&reg, 2);
        let (_c, _r3) = connect(&reg, 10);
        assert_eq!(reg.online_user_ids(), vec![2, 10]);
    }
}
