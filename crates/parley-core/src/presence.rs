use crate::auth::Identity;
use crate::rooms::ConnectionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_models::presence::Presence;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// First handle for the user.
    BecameOnline,
    AlreadyOnline,
    /// The user already holds the maximum number of handles.
    LimitReached,
}

/// Backing store for presence. Every mutation is atomic for one user.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn add_handle(
        &self,
        identity: &Identity,
        handle: ConnectionId,
        max_handles: usize,
        now: DateTime<Utc>,
    ) -> ConnectOutcome;

    /// Returns the new `lastSeen` when the last handle was removed.
    async fn remove_handle(
        &self,
        user_id: i64,
        handle: ConnectionId,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;

    async fn get(&self, user_id: i64) -> Option<Presence>;

    async fn online(&self) -> Vec<Presence>;
}

struct Entry {
    username: String,
    handles: HashSet<ConnectionId>,
    last_seen: DateTime<Utc>,
}

impl Entry {
    fn view(&self, user_id: i64) -> Presence {
        Presence {
            user_id,
            username: self.username.clone(),
            is_online: !self.handles.is_empty(),
            last_seen: self.last_seen,
        }
    }
}

/// Process-local presence. Entries of users who went offline are kept so
/// their `lastSeen` stays answerable until restart.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    users: DashMap<i64, Entry>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn add_handle(
        &self,
        identity: &Identity,
        handle: ConnectionId,
        max_handles: usize,
        now: DateTime<Utc>,
    ) -> ConnectOutcome {
        let mut entry = self.users.entry(identity.user_id).or_insert_with(|| Entry {
            username: identity.username.clone(),
            handles: HashSet::new(),
            last_seen: now,
        });
        if entry.handles.len() >= max_handles && !entry.handles.contains(&handle) {
            return ConnectOutcome::LimitReached;
        }
        entry.username.clone_from(&identity.username);
        let was_offline = entry.handles.is_empty();
        entry.handles.insert(handle);
        if was_offline {
            entry.last_seen = now;
            ConnectOutcome::BecameOnline
        } else {
            ConnectOutcome::AlreadyOnline
        }
    }

    async fn remove_handle(
        &self,
        user_id: i64,
        handle: ConnectionId,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut entry = self.users.get_mut(&user_id)?;
        if !entry.handles.remove(&handle) || !entry.handles.is_empty() {
            return None;
        }
        entry.last_seen = now;
        Some(now)
    }

    async fn get(&self, user_id: i64) -> Option<Presence> {
        self.users.get(&user_id).map(|entry| entry.view(user_id))
    }

    async fn online(&self) -> Vec<Presence> {
        self.users
            .iter()
            .filter(|entry| !entry.handles.is_empty())
            .map(|entry| entry.view(*entry.key()))
            .collect()
    }
}

/// What a new connection needs after its presence transition.
#[derive(Debug)]
pub struct Arrival {
    pub outcome: ConnectOutcome,
    /// Users online once the transition was published, the caller included.
    pub online: Vec<Presence>,
}

/// Who is connected right now.
///
/// Transitions and whatever the caller publishes for them run under one
/// registry-wide lock, so every observer sees them in the order they
/// happened.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    max_handles_per_user: usize,
    transitions: Arc<Mutex<()>>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, max_handles_per_user: usize) -> Self {
        Self {
            store,
            max_handles_per_user: max_handles_per_user.max(1),
            transitions: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory(max_handles_per_user: usize) -> Self {
        Self::new(Arc::new(InMemoryPresenceStore::new()), max_handles_per_user)
    }

    /// Register `handle` and run `publish` with the outcome before any other
    /// transition can happen. `publish` is skipped when the limit is reached,
    /// and the online snapshot is then empty.
    pub async fn connect_with<F>(
        &self,
        identity: &Identity,
        handle: ConnectionId,
        publish: F,
    ) -> Arrival
    where
        F: FnOnce(ConnectOutcome),
    {
        let _guard = self.transitions.lock().await;
        let outcome = self
            .store
            .add_handle(identity, handle, self.max_handles_per_user, Utc::now())
            .await;
        if outcome == ConnectOutcome::LimitReached {
            return Arrival {
                outcome,
                online: Vec::new(),
            };
        }
        publish(outcome);
        Arrival {
            outcome,
            online: self.online_users().await,
        }
    }

    /// Drop `handle`. When it was the user's last one, `publish` runs with the
    /// new `lastSeen` before any other transition can happen.
    pub async fn disconnect_with<F>(
        &self,
        user_id: i64,
        handle: ConnectionId,
        publish: F,
    ) -> Option<DateTime<Utc>>
    where
        F: FnOnce(DateTime<Utc>),
    {
        let _guard = self.transitions.lock().await;
        let last_seen = self.store.remove_handle(user_id, handle, Utc::now()).await?;
        publish(last_seen);
        Some(last_seen)
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.store
            .get(user_id)
            .await
            .map(|p| p.is_online)
            .unwrap_or(false)
    }

    pub async fn last_seen(&self, user_id: i64) -> Option<DateTime<Utc>> {
        self.store.get(user_id).await.map(|p| p.last_seen)
    }

    pub async fn presence(&self, user_id: i64) -> Option<Presence> {
        self.store.get(user_id).await
    }

    pub async fn online_users(&self) -> Vec<Presence> {
        self.store.online().await
    }
}
