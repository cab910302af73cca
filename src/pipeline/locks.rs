use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{ Mutex, OwnedMutexGuard };

/// One async mutex per key, created on demand and dropped once unused.
#[derive(Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

pub struct KeyedGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waiters are served in FIFO order.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}
