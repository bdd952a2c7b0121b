//! Named mutual-exclusion scopes.
//!
//! A `NamedLocks` hands out one async mutex per key, so callers can
//! serialize a critical section such as `"mgmt-nw-id"` or
//! `"agent-selection:<device>"` without a process-wide lock. Entries are
//! created on first use and dropped again once no guard or waiter holds
//! them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

#[derive(Clone, Default)]
pub struct NamedLocks {
    scopes: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Guard for a named scope. The scope is released when this is dropped.
pub struct ScopeGuard {
    name: String,
    scopes: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the scope `name`, waiting for any current holder to leave.
    pub async fn lock(&self, name: &str) -> ScopeGuard {
        let mutex = {
            let mut scopes = self.scopes.lock().unwrap_or_else(|p| p.into_inner());
            scopes
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        trace!(scope = %name, "entered lock scope");
        ScopeGuard {
            name: name.to_string(),
            scopes: self.scopes.clone(),
            guard: Some(guard),
        }
    }

    /// Number of scopes currently tracked (held or awaited).
    pub fn active_scopes(&self) -> usize {
        self.scopes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut scopes = self.scopes.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map itself still references the mutex: nobody waits on it.
        if let Some(mutex) = scopes.get(&self.name) {
            if Arc::strong_count(mutex) == 1 {
                scopes.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_scope_is_exclusive() {
        let locks = NamedLocks::new();
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("mgmt-nw-id").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_scopes_do_not_block_each_other() {
        let locks = NamedLocks::new();
        let _a = locks.lock("agent-selection:hd-1").await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock("agent-selection:hd-2"),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_scopes_are_forgotten() {
        let locks = NamedLocks::new();
        {
            let _guard = locks.lock("l3-tenant-id").await;
            assert_eq!(locks.active_scopes(), 1);
        }
        assert_eq!(locks.active_scopes(), 0);
    }
}
