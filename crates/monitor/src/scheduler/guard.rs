use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

use super::Job;

type Key = (Uuid, Job);

/// Keys of entity checks currently running. At most one check per
/// (entity, job) runs at a time; a second caller is turned away.
#[derive(Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<Key>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when a check for the same key is already running.
    pub fn try_acquire(&self, entity: Uuid, job: Job) -> Option<InFlightGuard> {
        let key = (entity, job);
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        if !keys.insert(key) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key,
        })
    }
}

/// Releases its key on drop, including when the check future is cancelled.
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<Key>>>,
    key: Key,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}
