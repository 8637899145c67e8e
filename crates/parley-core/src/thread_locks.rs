use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per thread id, created on first use.
#[derive(Default)]
pub struct ThreadLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

/// Exclusive hold on one thread's log.
pub struct ThreadGuard {
    thread_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl ThreadGuard {
    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, thread_id: i64) -> ThreadGuard {
        let lock = self.locks.entry(thread_id).or_default().clone();
        ThreadGuard {
            thread_id,
            _guard: lock.lock_owned().await,
        }
    }

    /// Drop mutexes nobody holds or waits on. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
