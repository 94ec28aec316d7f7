//! Synchronization primitives shared by the bridge.
//!
//! Everything that blocks goes through `parking_lot`; the state words
//! themselves are plain std atomics.
pub use parking_lot::{Condvar, Mutex, MutexGuard};
pub use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
pub use std::sync::Arc;
