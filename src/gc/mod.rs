//! Collection requests and the hooks into the managed runtime's collector.
//!
//! The bridge does not collect anything itself. It decides *when* a
//! collection may run: a [`CollectorCoordinator`] stops the world using the
//! per-thread cells, then hands control to a [`Collector`] supplied by the
//! runtime, then releases every parked thread.
use crate::threading::{StateWord, ThreadKey};
use serde::Serialize;
use std::{collections::HashSet, time::Instant};

pub mod coordinator;

pub use coordinator::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionPhase {
    Idle,
    /// Overlay set on every cell, waiting for threads to become safe
    Requesting,
    /// Every thread is native or parked; the collector is running
    Collecting,
}

/// How a thread looked at the moment its collection was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadObservation {
    pub key: ThreadKey,
    pub word: StateWord,
    pub acknowledged: bool,
    /// The thread that drove the request to admission
    pub initiator: bool,
}

/// An in-flight collection request.
#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub(crate) epoch: u64,
    pub(crate) acknowledged: HashSet<ThreadKey>,
    pub(crate) requested_at: Instant,
    pub(crate) observations: Vec<ThreadObservation>,
    /// Whether some caller is currently waiting for this request to be admitted
    pub(crate) driven: bool,
}

impl CollectionRequest {
    pub(crate) fn new(epoch: u64) -> Self {
        Self {
            epoch,
            acknowledged: HashSet::new(),
            requested_at: Instant::now(),
            observations: Vec::new(),
            driven: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn acknowledged(&self) -> &HashSet<ThreadKey> {
        &self.acknowledged
    }

    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    /// Thread states captured when the request moved to `Collecting`. Empty
    /// until then.
    pub fn observations(&self) -> &[ThreadObservation] {
        &self.observations
    }
}

/// Heap occupancy reported back by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapUsage {
    pub bytes_allocated: usize,
}

/// The managed runtime's side of a collection.
///
/// `scan_roots` is invoked once every registered thread is either native or
/// parked at a safepoint for `request`'s epoch. It runs without any bridge
/// lock held.
pub trait Collector: Send + Sync {
    fn scan_roots(&self, request: &CollectionRequest) -> HeapUsage;
}

impl<F> Collector for F
where
    F: Fn(&CollectionRequest) -> HeapUsage + Send + Sync,
{
    fn scan_roots(&self, request: &CollectionRequest) -> HeapUsage {
        self(request)
    }
}

/// Collector that scans nothing and reports an empty heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCollector;

impl Collector for NullCollector {
    fn scan_roots(&self, _request: &CollectionRequest) -> HeapUsage {
        HeapUsage::default()
    }
}
