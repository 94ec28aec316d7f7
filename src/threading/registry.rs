use crate::{
    sync::{Arc, AtomicU64, Mutex, Ordering},
    threading::{ThreadKey, ThreadState, ThreadStateCell},
};
use std::{collections::HashMap, thread::ThreadId};

/// Global counter for allocating thread keys across all coordinators.
/// Keeps keys unique when parallel tests each build their own coordinator.
static NEXT_GLOBAL_THREAD_ID: AtomicU64 = AtomicU64::new(1); // 0 is reserved

/// Map from thread key to cell for every registered thread.
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry {
    threads: Mutex<HashMap<ThreadKey, Arc<ThreadStateCell>>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_key() -> ThreadKey {
        ThreadKey::new(NEXT_GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, cell: Arc<ThreadStateCell>) {
        self.threads.lock().insert(cell.key(), cell);
    }

    pub(crate) fn remove(&self, key: ThreadKey) -> Option<Arc<ThreadStateCell>> {
        self.threads.lock().remove(&key)
    }

    pub(crate) fn find_by_native(&self, native_id: ThreadId) -> Option<Arc<ThreadStateCell>> {
        self.threads
            .lock()
            .values()
            .find(|c| c.owner() == native_id)
            .cloned()
    }

    pub(crate) fn cells(&self) -> Vec<Arc<ThreadStateCell>> {
        self.threads.lock().values().cloned().collect()
    }

    pub(crate) fn states(&self) -> Vec<(ThreadKey, ThreadState)> {
        let mut states: Vec<_> = self
            .threads
            .lock()
            .values()
            .map(|c| (c.key(), c.current_state()))
            .collect();
        states.sort_by_key(|(key, _)| *key);
        states
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.lock().len()
    }
}
