use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one live gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    /// Every connection of one user.
    User(i64),
    /// Connections that joined one chat thread.
    Thread(i64),
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::User(id) => write!(f, "user:{id}"),
            RoomId::Thread(id) => write!(f, "thread:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub event_type: &'static str,
    pub payload: serde_json::Value,
}

impl ServerEvent {
    pub fn new(event_type: &'static str, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// Room membership and fan-out over per-connection mailboxes.
///
/// Delivery never blocks the publisher: a connection whose mailbox is full
/// misses the event.
pub trait RoomHub: Send + Sync {
    fn attach(&self, conn: ConnectionId, mailbox: mpsc::Sender<ServerEvent>);
    /// Remove the connection and its memberships. Returns the rooms it was in.
    fn detach(&self, conn: ConnectionId) -> Vec<RoomId>;
    fn join(&self, conn: ConnectionId, room: RoomId) -> bool;
    fn leave(&self, conn: ConnectionId, room: RoomId) -> bool;
    /// Deliver to every member of `room` except `except`. Returns the number
    /// of mailboxes that accepted the event.
    fn publish(&self, room: RoomId, event: &ServerEvent, except: Option<ConnectionId>) -> usize;
    /// Deliver to every attached connection except `except`.
    fn broadcast(&self, event: &ServerEvent, except: Option<ConnectionId>) -> usize;
    fn send_to(&self, conn: ConnectionId, event: &ServerEvent) -> bool;
}

struct Member {
    mailbox: mpsc::Sender<ServerEvent>,
    rooms: HashSet<RoomId>,
}

#[derive(Default)]
pub struct LocalRoomHub {
    connections: DashMap<ConnectionId, Member>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
}

impl LocalRoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, conn: ConnectionId, event: &ServerEvent) -> bool {
        let Some(member) = self.connections.get(&conn) else {
            return false;
        };
        match member.mailbox.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %conn,
                    event = event.event_type,
                    "rooms: outbound buffer full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl RoomHub for LocalRoomHub {
    fn attach(&self, conn: ConnectionId, mailbox: mpsc::Sender<ServerEvent>) {
        self.connections.insert(
            conn,
            Member {
                mailbox,
                rooms: HashSet::new(),
            },
        );
    }

    fn detach(&self, conn: ConnectionId) -> Vec<RoomId> {
        let Some((_, member)) = self.connections.remove(&conn) else {
            return Vec::new();
        };
        let rooms: Vec<RoomId> = member.rooms.into_iter().collect();
        for room in &rooms {
            self.rooms.remove_if_mut(room, |_, members| {
                members.remove(&conn);
                members.is_empty()
            });
        }
        rooms
    }

    fn join(&self, conn: ConnectionId, room: RoomId) -> bool {
        {
            let Some(mut member) = self.connections.get_mut(&conn) else {
                return false;
            };
            if !member.rooms.insert(room) {
                return true;
            }
        }
        self.rooms.entry(room).or_default().insert(conn);
        true
    }

    fn leave(&self, conn: ConnectionId, room: RoomId) -> bool {
        let was_member = self
            .connections
            .get_mut(&conn)
            .map(|mut member| member.rooms.remove(&room))
            .unwrap_or(false);
        if was_member {
            self.rooms.remove_if_mut(&room, |_, members| {
                members.remove(&conn);
                members.is_empty()
            });
        }
        was_member
    }

    fn publish(&self, room: RoomId, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let targets: Vec<ConnectionId> = match self.rooms.get(&room) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|c| Some(*c) != except)
                .collect(),
            None => return 0,
        };
        targets
            .into_iter()
            .filter(|conn| self.deliver(*conn, event))
            .count()
    }

    fn broadcast(&self, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .filter(|c| Some(*c) != except)
            .collect();
        targets
            .into_iter()
            .filter(|conn| self.deliver(*conn, event))
            .count()
    }

    fn send_to(&self, conn: ConnectionId, event: &ServerEvent) -> bool {
        self.deliver(conn, event)
    }
}
