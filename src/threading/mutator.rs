use crate::{
    error::Result,
    gc::CollectorCoordinator,
    sync::Arc,
    threading::{StateWord, ThreadKey, ThreadState, ThreadStateCell},
};
use std::{cell::Cell, marker::PhantomData};
use tracing::{debug, trace};

/// Registration record of one managed thread.
///
/// Returned by [`CollectorCoordinator::register_thread`]. Dropping the handle
/// deregisters the thread. The handle cannot leave the thread that created
/// it, and every guard borrows it, so a thread can never be deregistered
/// while a transition is in flight.
pub struct Mutator {
    cell: Arc<ThreadStateCell>,
    coordinator: Arc<CollectorCoordinator>,
    /// Bytes allocated since the last pressure report
    allocated: Cell<usize>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn new(cell: Arc<ThreadStateCell>, coordinator: Arc<CollectorCoordinator>) -> Self {
        Self {
            cell,
            coordinator,
            allocated: Cell::new(0),
            _not_send: PhantomData,
        }
    }

    pub fn key(&self) -> ThreadKey {
        self.cell.key()
    }

    pub fn cell(&self) -> &Arc<ThreadStateCell> {
        &self.cell
    }

    pub fn coordinator(&self) -> &Arc<CollectorCoordinator> {
        &self.coordinator
    }

    pub fn current_state(&self) -> ThreadState {
        self.cell.current_state()
    }

    /// Switch this thread between `Managed` and `Native`.
    ///
    /// Entering `Native` while a collection is pending wakes the coordinator,
    /// since this thread just became safe. Entering `Managed` while a
    /// collection is pending parks the thread at a safepoint until the
    /// coordinator releases it.
    pub fn transition_to(&self, to: ThreadState) -> Result<StateWord> {
        let word = self.cell.transition_to(to)?;
        self.coordinator.metrics().record_transition(to);
        trace!(thread = %self.key(), ?to, pending = word.safepoint_requested(), "thread state transition");

        if word.safepoint_requested() {
            match to {
                ThreadState::Native => self.coordinator.notify_progress(),
                ThreadState::Managed => {
                    self.coordinator.park_at_safepoint(&self.cell);
                }
                ThreadState::SafepointRequested => {}
            }
        }
        Ok(word)
    }

    /// Report managed allocation. Crossing the configured threshold flags the
    /// coordinator; the collection itself starts at the next safepoint poll.
    pub fn record_allocation(&self, bytes: usize) {
        let total = self.allocated.get().saturating_add(bytes);
        if total >= self.coordinator.config().allocation_threshold {
            debug!(thread = %self.key(), bytes = total, "allocation threshold crossed");
            self.coordinator.request_on_pressure();
            self.allocated.set(0);
        } else {
            self.allocated.set(total);
        }
    }

    pub fn deregister(self) {
        drop(self);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.coordinator.deregister(self.cell.key());
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("key", &self.key())
            .field("state", &self.current_state())
            .finish()
    }
}
