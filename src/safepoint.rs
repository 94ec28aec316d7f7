//! Cooperative suspension for threads running managed code.
use crate::threading::{Mutator, ThreadState};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafepointOutcome {
    /// Nothing pending, or the thread is native and never yields
    Clear,
    /// The thread acknowledged `epoch` and was parked until the request ended
    Yielded { epoch: u64, parked: Duration },
    /// The overlay belonged to a request that already ended
    Stale,
    /// This thread ran a collection itself: on allocation pressure, or as
    /// the last thread to park on a stalled request
    Collected { epoch: u64 },
}

impl SafepointOutcome {
    pub fn yielded(&self) -> bool {
        matches!(self, Self::Yielded { .. })
    }
}

impl Mutator {
    /// Check for a pending collection request.
    ///
    /// The fast path is a single atomic load of the state word. When a
    /// request is pending the thread acknowledges it and parks until the
    /// coordinator lets it go. Otherwise, if this or another thread reported
    /// allocation pressure and nothing is in flight, the collection is run
    /// from here.
    #[inline]
    pub fn poll_safepoint(&self) -> SafepointOutcome {
        let word = self.cell().load();
        if word.execution() == ThreadState::Native {
            return SafepointOutcome::Clear;
        }
        if word.safepoint_requested() {
            return self.coordinator().park_at_safepoint(self.cell());
        }
        if self.coordinator().should_collect() {
            return self.collect_on_pressure();
        }
        SafepointOutcome::Clear
    }

    #[cold]
    fn collect_on_pressure(&self) -> SafepointOutcome {
        match self.coordinator().collect_on_pressure() {
            Some(Ok(snapshot)) => SafepointOutcome::Collected {
                epoch: snapshot.epoch,
            },
            Some(Err(err)) => {
                warn!(thread = %self.key(), %err, "allocation-triggered collection failed");
                SafepointOutcome::Clear
            }
            None => SafepointOutcome::Clear,
        }
    }
}
