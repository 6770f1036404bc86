use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use runwarden_core::domain::run::RunId;

/// Per-run async mutexes. Entries are held weakly so a run's lock disappears
/// once nobody is waiting on it.
#[derive(Clone, Default)]
pub struct RunLocks {
    inner: Arc<Mutex<HashMap<RunId, Weak<AsyncMutex<()>>>>>,
}

pub type RunGuard = OwnedMutexGuard<()>;

impl RunLocks {
    pub async fn acquire(&self, run_id: &RunId) -> RunGuard {
        self.lock_for(run_id).lock_owned().await
    }

    /// Number of runs with a live lock.
    pub fn tracked(&self) -> usize {
        let map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.values().filter(|lock| lock.strong_count() > 0).count()
    }

    fn lock_for(&self, run_id: &RunId) -> Arc<AsyncMutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = map.get(run_id).and_then(Weak::upgrade) {
            return existing;
        }
        map.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        map.insert(run_id.clone(), Arc::downgrade(&lock));
        lock
    }
}
