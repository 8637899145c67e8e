use parley_core::auth::Identity;
use parley_core::rooms::ConnectionId;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticated,
    /// Authenticated and inside at least one thread room.
    Joined,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is already authenticated")]
    AlreadyAuthenticated,
    #[error("session is not authenticated")]
    NotAuthenticated,
    #[error("session is closed")]
    Closed,
}

/// Per-connection state of one gateway client.
pub struct Session {
    connection_id: ConnectionId,
    identity: Option<Identity>,
    threads: HashSet<i64>,
    closed: bool,
}

impl Session {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            identity: None,
            threads: HashSet::new(),
            closed: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn phase(&self) -> SessionPhase {
        match (&self.identity, self.closed) {
            (_, true) => SessionPhase::Closed,
            (None, false) => SessionPhase::Connecting,
            (Some(_), false) if self.threads.is_empty() => SessionPhase::Authenticated,
            (Some(_), false) => SessionPhase::Joined,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn authenticate(&mut self, identity: Identity) -> Result<(), SessionError> {
        match self.phase() {
            SessionPhase::Connecting => {
                self.identity = Some(identity);
                Ok(())
            }
            SessionPhase::Closed => Err(SessionError::Closed),
            _ => Err(SessionError::AlreadyAuthenticated),
        }
    }

    /// Record a joined thread room. Returns false if it was already joined.
    pub fn join_thread(&mut self, thread_id: i64) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(self.threads.insert(thread_id))
    }

    pub fn leave_thread(&mut self, thread_id: i64) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(self.threads.remove(&thread_id))
    }

    pub fn has_joined(&self, thread_id: i64) -> bool {
        !self.closed && self.threads.contains(&thread_id)
    }

    /// Move to `Closed`, returning the thread rooms that were joined.
    pub fn close(&mut self) -> Vec<i64> {
        self.closed = true;
        self.threads.drain().collect()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match self.phase() {
            SessionPhase::Connecting => Err(SessionError::NotAuthenticated),
            SessionPhase::Closed => Err(SessionError::Closed),
            _ => Ok(()),
        }
    }
}
