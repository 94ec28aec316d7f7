use crate::{
    error::{BridgeError, Result, TransitionFault},
    sync::{AtomicU64, AtomicU8, Ordering},
    threading::{ThreadKey, ThreadState},
};
use std::thread::{self, ThreadId};

const NATIVE: u8 = 0b01;
const SAFEPOINT_REQUESTED: u8 = 0b10;

/// Decoded view of a cell's state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateWord(u8);

impl StateWord {
    #[inline]
    pub fn execution(self) -> ThreadState {
        if self.0 & NATIVE != 0 {
            ThreadState::Native
        } else {
            ThreadState::Managed
        }
    }

    #[inline]
    pub fn safepoint_requested(self) -> bool {
        self.0 & SAFEPOINT_REQUESTED != 0
    }

    /// The state as reported to observers: the overlay wins over the axis.
    #[inline]
    pub fn state(self) -> ThreadState {
        if self.safepoint_requested() {
            ThreadState::SafepointRequested
        } else {
            self.execution()
        }
    }
}

/// Atomic Managed/Native state of one registered thread.
#[derive(Debug)]
pub struct ThreadStateCell {
    key: ThreadKey,
    owner: ThreadId,
    word: AtomicU8,
    /// Last completed collection this thread was released from
    epoch: AtomicU64,
    /// Epoch stamped by the most recent request, valid while the overlay is set
    requested_epoch: AtomicU64,
    acknowledged_epoch: AtomicU64,
}

impl ThreadStateCell {
    pub(crate) fn new(key: ThreadKey, owner: ThreadId, epoch: u64) -> Self {
        Self {
            key,
            owner,
            word: AtomicU8::new(0),
            epoch: AtomicU64::new(epoch),
            requested_epoch: AtomicU64::new(0),
            acknowledged_epoch: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> ThreadKey {
        self.key
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    #[inline]
    pub fn load(&self) -> StateWord {
        StateWord(self.word.load(Ordering::Acquire))
    }

    #[inline]
    pub fn current_state(&self) -> ThreadState {
        self.load().state()
    }

    #[inline]
    pub fn execution_state(&self) -> ThreadState {
        self.load().execution()
    }

    #[inline]
    pub fn is_safepoint_requested(&self) -> bool {
        self.load().safepoint_requested()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn requested_epoch(&self) -> u64 {
        self.requested_epoch.load(Ordering::Acquire)
    }

    pub fn acknowledged_epoch(&self) -> u64 {
        self.acknowledged_epoch.load(Ordering::Acquire)
    }

    /// Move the execution axis. Only `Managed -> Native` and `Native -> Managed`
    /// are legal, and only on the owning thread. The overlay bit is carried
    /// over unchanged; the returned word tells the caller whether a request
    /// was pending at the instant of the switch.
    pub fn transition_to(&self, to: ThreadState) -> Result<StateWord> {
        let mut current = self.word.load(Ordering::Acquire);
        let from = StateWord(current).execution();

        if !self.is_owned_by_current_thread() {
            return Err(self.illegal(from, to, TransitionFault::NotOwner));
        }

        let target_bit = match to {
            ThreadState::Native => NATIVE,
            ThreadState::Managed => 0,
            ThreadState::SafepointRequested => {
                return Err(self.illegal(from, to, TransitionFault::InvalidDirection));
            }
        };

        loop {
            let from = StateWord(current).execution();
            if from == to {
                return Err(self.illegal(from, to, TransitionFault::InvalidDirection));
            }

            let next = (current & !NATIVE) | target_bit;
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(StateWord(next)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the overlay for collection `epoch`. Callable from any thread.
    pub fn mark_safepoint_requested(&self, epoch: u64) {
        // The epoch must be visible before the bit that advertises it.
        self.requested_epoch.store(epoch, Ordering::Release);
        self.word.fetch_or(SAFEPOINT_REQUESTED, Ordering::AcqRel);
    }

    pub(crate) fn clear_safepoint_request(&self, completed_epoch: Option<u64>) {
        if let Some(epoch) = completed_epoch {
            self.epoch.store(epoch, Ordering::Release);
        }
        self.word.fetch_and(!SAFEPOINT_REQUESTED, Ordering::AcqRel);
    }

    pub(crate) fn record_acknowledgement(&self, epoch: u64) {
        self.acknowledged_epoch.store(epoch, Ordering::Release);
    }

    fn illegal(&self, from: ThreadState, to: ThreadState, reason: TransitionFault) -> BridgeError {
        BridgeError::IllegalTransition {
            thread: self.key,
            from,
            to,
            reason,
        }
    }
}
