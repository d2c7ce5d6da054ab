//! Per-(entity, window) run locks.
//!
//! Two runs for the same pair never overlap; different pairs proceed freely.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::models::Window;

type LockKey = (String, Window);

#[derive(Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, entity_id: &str, window: Window) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry((entity_id.to_string(), window))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_pair_serialises() {
        let locks = Arc::new(RunLocks::new());
        let guard = locks.acquire("fx-1", Window::T90m).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("fx-1", Window::T90m).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // A different window is independent.
        let _other = locks.acquire("fx-1", Window::T3h).await;

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_releases_idle_entries() {
        let locks = RunLocks::new();
        {
            let _g = locks.acquire("fx-1", Window::T90m).await;
            locks.prune();
            assert_eq!(locks.len(), 1);
        }
        locks.prune();
        assert!(locks.is_empty());
    }
}
