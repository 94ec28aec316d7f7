//! Per-thread execution state for the managed/native boundary.
//!
//! Every thread that touches the managed heap registers with a
//! [`CollectorCoordinator`](crate::gc::CollectorCoordinator) and receives a
//! [`Mutator`] handle. The handle owns a [`ThreadStateCell`], the single atomic
//! word the coordinator reads to decide whether the thread is safe to ignore
//! during a collection.
//!
//! # Thread States
//!
//! A cell is always on one side of the execution axis:
//! - `Managed`: the thread may hold heap references and must reach a safepoint
//!   before a collection can start.
//! - `Native`: the thread runs foreign code and has promised not to touch the
//!   managed heap until it transitions back.
//!
//! On top of that axis the coordinator sets a `SafepointRequested` overlay
//! whenever a collection is pending. The overlay never changes the axis; it
//! only tells the owner to yield at its next poll or re-entry.
//!
//! # Ownership
//!
//! Only the thread that registered a cell may move it between `Managed` and
//! `Native`. Any thread may set the overlay. [`Mutator`] is `!Send`, so the
//! type system keeps ordinary use on the owning thread; the raw cell still
//! checks ownership at runtime because it is shared with the coordinator.
use serde::Serialize;
use std::fmt;

mod cell;
mod mutator;
mod registry;

pub use cell::*;
pub use mutator::*;
pub(crate) use registry::ThreadRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ThreadState {
    /// Executing managed code; roots are only stable at safepoints
    Managed,
    /// Executing foreign code; holds no managed references
    Native,
    /// A collection is pending and the thread has not yet yielded
    SafepointRequested,
}

/// Stable identifier of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadKey(u64);

impl ThreadKey {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}
