use crate::{sync::{AtomicU64, Ordering}, threading::ThreadState};
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Heap occupancy and timing of one completed collection. Never mutated
/// after publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub epoch: u64,
    pub bytes_allocated: usize,
    /// Time spent inside the collector callback
    pub collection_duration: Duration,
    /// From request to release: how long mutators were held up
    pub pause_duration: Duration,
    pub registered_threads: usize,
    /// Threads that were in native code when the collection was admitted
    pub native_threads: usize,
}

/// Latest-snapshot slot: one writer (the coordinator), any number of
/// lock-free readers.
#[derive(Debug, Default)]
pub struct Telemetry {
    latest: ArcSwapOption<MemorySnapshot>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, snapshot: MemorySnapshot) {
        self.latest.store(Some(Arc::new(snapshot)));
    }

    /// `None` until the first collection completes.
    pub fn last_snapshot(&self) -> Option<MemorySnapshot> {
        self.latest.load().as_deref().copied()
    }
}

/// Metrics counters.
///
/// All counters use `Ordering::Relaxed` because they are independent and do not
/// synchronize memory between threads.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Total time spent in stop-the-world pauses (in microseconds)
    pub gc_pause_total_us: AtomicU64,
    /// Number of completed collections
    pub gc_pause_count: AtomicU64,
    pub native_transitions: AtomicU64,
    pub managed_transitions: AtomicU64,
    /// Number of times a thread parked at a safepoint
    pub safepoint_parks: AtomicU64,
    /// Total time threads spent parked (in microseconds)
    pub safepoint_park_total_us: AtomicU64,
    pub checkpoints_taken: AtomicU64,
    pub checkpoints_skipped: AtomicU64,
    pub stalls: AtomicU64,
    pub stale_acknowledgements: AtomicU64,
    pub abandoned_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub gc_pause_total_us: u64,
    pub gc_pause_count: u64,
    pub native_transitions: u64,
    pub managed_transitions: u64,
    pub safepoint_parks: u64,
    pub safepoint_park_total_us: u64,
    pub checkpoints_taken: u64,
    pub checkpoints_skipped: u64,
    pub stalls: u64,
    pub stale_acknowledgements: u64,
    pub abandoned_requests: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gc_pause(&self, duration: Duration) {
        self.gc_pause_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.gc_pause_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self, to: ThreadState) {
        match to {
            ThreadState::Native => self.native_transitions.fetch_add(1, Ordering::Relaxed),
            _ => self.managed_transitions.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_safepoint_park(&self, duration: Duration) {
        self.safepoint_parks.fetch_add(1, Ordering::Relaxed);
        self.safepoint_park_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_checkpoint(&self, taken: bool) {
        if taken {
            self.checkpoints_taken.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkpoints_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_acknowledgement(&self) {
        self.stale_acknowledgements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned_request(&self) {
        self.abandoned_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSummary {
            gc_pause_total_us: load(&self.gc_pause_total_us),
            gc_pause_count: load(&self.gc_pause_count),
            native_transitions: load(&self.native_transitions),
            managed_transitions: load(&self.managed_transitions),
            safepoint_parks: load(&self.safepoint_parks),
            safepoint_park_total_us: load(&self.safepoint_park_total_us),
            checkpoints_taken: load(&self.checkpoints_taken),
            checkpoints_skipped: load(&self.checkpoints_skipped),
            stalls: load(&self.stalls),
            stale_acknowledgements: load(&self.stale_acknowledgements),
            abandoned_requests: load(&self.abandoned_requests),
        }
    }
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Bridge Metrics:")?;
        writeln!(
            f,
            "  Collections:            {:>8} ({} us paused)",
            self.gc_pause_count, self.gc_pause_total_us
        )?;
        writeln!(
            f,
            "  Transitions:            {:>8} native, {} managed",
            self.native_transitions, self.managed_transitions
        )?;
        writeln!(
            f,
            "  Safepoint parks:        {:>8} ({} us parked)",
            self.safepoint_parks, self.safepoint_park_total_us
        )?;
        writeln!(
            f,
            "  Checkpoints:            {:>8} taken, {} skipped",
            self.checkpoints_taken, self.checkpoints_skipped
        )?;
        writeln!(
            f,
            "  Stalls:                 {:>8} ({} abandoned, {} stale acks)",
            self.stalls, self.abandoned_requests, self.stale_acknowledgements
        )
    }
}
