use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async lock per tournament. Report and sync chains hold it from the
/// first read until the last local write.
#[derive(Default)]
pub struct TournamentLocks {
    inner: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl TournamentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, tournament_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(tournament_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry of a deleted tournament.
    pub fn forget(&self, tournament_id: Uuid) {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(&tournament_id);
    }
}
