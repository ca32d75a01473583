//! Per-conversation serialization.
//!
//! One async mutex per key; holding the guard keeps at most one job per
//! conversation in flight within this process. Across processes the CAS on
//! job status enforces the same property.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct ConversationSerializer {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ConversationSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a key, creating it on first use. Unused locks
    /// are swept on each acquire.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let serializer = ConversationSerializer::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let serializer = serializer.clone();
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = serializer.acquire("c1").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let serializer = ConversationSerializer::new();
        let a = serializer.acquire("a").await;
        // A second key must not block behind the first.
        let b = tokio::time::timeout(Duration::from_millis(100), serializer.acquire("b"))
            .await
            .expect("second key should not block");
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn released_locks_are_swept() {
        let serializer = ConversationSerializer::new();
        for i in 0..16 {
            let guard = serializer.acquire(&format!("c{i}")).await;
            drop(guard);
        }
        // The next acquire sweeps everything unused.
        let _guard = serializer.acquire("fresh").await;
        assert_eq!(serializer.len(), 1);
    }
}
