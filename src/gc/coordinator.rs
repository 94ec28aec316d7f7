use crate::{
    config::BridgeConfig,
    error::{BridgeError, Result},
    gc::{CollectionPhase, CollectionRequest, Collector, ThreadObservation},
    metrics::{MemorySnapshot, RuntimeMetrics, Telemetry},
    safepoint::SafepointOutcome,
    sync::{Arc, AtomicBool, Condvar, Mutex, MutexGuard, Ordering},
    threading::{Mutator, ThreadKey, ThreadRegistry, ThreadState, ThreadStateCell},
};
use std::{
    panic::{self, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// How often threads parked on a stalled request look for a way to finish it
const STALLED_RECHECK: Duration = Duration::from_millis(10);

struct CoordinatorState {
    phase: CollectionPhase,
    /// Number of completed collections
    epoch: u64,
    request: Option<CollectionRequest>,
    /// Requests ended so far, completed or abandoned. Abandoned requests do
    /// not advance the epoch, so waiters watch this instead.
    generation: u64,
}

/// Process-wide owner of the stop-the-world protocol.
///
/// A collection moves through `Idle -> Requesting -> Collecting -> Idle`:
///
/// 1. **Requesting**: the overlay is set on every registered cell and the
///    caller waits until each thread is either `Native` or has acknowledged
///    the request at a safepoint. Native threads are never asked to
///    acknowledge; their state word is trusted as-is.
/// 2. **Collecting**: the [`Collector`] runs with the bookkeeping lock
///    released. Parked threads stay parked, native threads that try to
///    re-enter managed code park on the way in.
/// 3. **Idle**: the epoch advances, overlays clear, parked threads are
///    released and a [`MemorySnapshot`] is published.
///
/// If some thread never becomes safe (typically a foreign call made without a
/// guard) the request outlives the watchdog and the caller gets
/// [`BridgeError::UnboundedStall`]. The request is left in `Requesting` until
/// the late thread turns safe: the last thread to park then completes it. A
/// later [`trigger_collection`](Self::trigger_collection) picks it up as well,
/// and [`abandon_request`](Self::abandon_request) withdraws it.
pub struct CollectorCoordinator {
    config: BridgeConfig,
    collector: Box<dyn Collector>,
    threads: ThreadRegistry,
    state: Mutex<CoordinatorState>,
    /// Signalled when a thread becomes safe or leaves
    progress: Condvar,
    /// Signalled when a request ends, completed or abandoned
    released: Condvar,
    /// Set by allocation pressure, cleared by every completed collection
    needs_collection: AtomicBool,
    telemetry: Telemetry,
    metrics: RuntimeMetrics,
}

impl CollectorCoordinator {
    pub fn new(config: BridgeConfig, collector: impl Collector + 'static) -> Arc<Self> {
        Arc::new(Self {
            config,
            collector: Box::new(collector),
            threads: ThreadRegistry::new(),
            state: Mutex::new(CoordinatorState {
                phase: CollectionPhase::Idle,
                epoch: 0,
                request: None,
                generation: 0,
            }),
            progress: Condvar::new(),
            released: Condvar::new(),
            needs_collection: AtomicBool::new(false),
            telemetry: Telemetry::new(),
            metrics: RuntimeMetrics::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn last_snapshot(&self) -> Option<MemorySnapshot> {
        self.telemetry.last_snapshot()
    }

    pub fn phase(&self) -> CollectionPhase {
        self.state.lock().phase
    }

    /// Number of completed collections.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_states(&self) -> Vec<(ThreadKey, ThreadState)> {
        self.threads.states()
    }

    pub fn thread_state(&self, key: ThreadKey) -> Result<ThreadState> {
        self.threads
            .states()
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, state)| state)
            .ok_or(BridgeError::NotRegistered(key))
    }

    pub fn should_collect(&self) -> bool {
        self.needs_collection.load(Ordering::Acquire)
    }

    /// Register the calling thread. It starts out `Managed`; if a request is
    /// already pending the new cell carries the overlay, so the thread yields
    /// at its first poll.
    pub fn register_thread(self: &Arc<Self>) -> Result<Mutator> {
        let native_id = thread::current().id();
        if let Some(existing) = self.threads.find_by_native(native_id) {
            return Err(BridgeError::AlreadyRegistered(existing.key()));
        }

        let key = ThreadRegistry::allocate_key();
        let state = self.state.lock();
        let cell = Arc::new(ThreadStateCell::new(key, native_id, state.epoch));
        if let Some(request) = &state.request {
            cell.mark_safepoint_requested(request.epoch);
        }
        self.threads.insert(cell.clone());
        drop(state);

        debug!(thread = %key, native = ?native_id, "thread registered");
        Ok(Mutator::new(cell, self.clone()))
    }

    pub(crate) fn deregister(&self, key: ThreadKey) {
        let mut state = self.state.lock();
        self.threads.remove(key);
        if let Some(request) = state.request.as_mut() {
            request.acknowledged.remove(&key);
        }
        self.wake_if_stalled(&state);
        drop(state);

        // Always wake the requester: the set of threads it waits for shrank.
        self.progress.notify_all();
        debug!(thread = %key, "thread deregistered");
    }

    /// Wake a requester after a thread became safe without acknowledging.
    pub(crate) fn notify_progress(&self) {
        // Taking the lock orders this wakeup after the requester's check.
        let state = self.state.lock();
        self.progress.notify_all();
        self.wake_if_stalled(&state);
    }

    fn is_stalled(state: &CoordinatorState) -> bool {
        state.request.as_ref().is_some_and(|r| !r.driven)
    }

    /// Parked threads finish a stalled request themselves; let them recheck.
    fn wake_if_stalled(&self, state: &CoordinatorState) {
        if Self::is_stalled(state) {
            self.released.notify_all();
        }
    }

    pub(crate) fn request_on_pressure(&self) {
        self.needs_collection.store(true, Ordering::Release);
    }

    /// Record that `cell`'s thread yielded for collection `epoch`.
    ///
    /// Fails with [`BridgeError::StaleAcknowledgement`] when `epoch` is not
    /// the request currently in flight. Callers treat that as benign: a later
    /// poll sees the fresh request.
    pub fn acknowledge(&self, cell: &ThreadStateCell, epoch: u64) -> Result<()> {
        let mut state = self.state.lock();
        Self::acknowledge_locked(&mut state, cell, epoch)?;
        self.wake_if_stalled(&state);
        drop(state);
        self.progress.notify_all();
        Ok(())
    }

    fn acknowledge_locked(
        state: &mut CoordinatorState,
        cell: &ThreadStateCell,
        epoch: u64,
    ) -> Result<()> {
        match state.request.as_mut() {
            Some(request) if request.epoch == epoch => {
                request.acknowledged.insert(cell.key());
                cell.record_acknowledgement(epoch);
                Ok(())
            }
            other => Err(BridgeError::StaleAcknowledgement {
                thread: cell.key(),
                acknowledged: epoch,
                current: other.map(|r| r.epoch),
            }),
        }
    }

    /// Acknowledge the pending request on behalf of `cell`'s owner and park
    /// until the request ends.
    pub(crate) fn park_at_safepoint(&self, cell: &ThreadStateCell) -> SafepointOutcome {
        let mut seen = cell.requested_epoch();
        let mut state = self.state.lock();

        let epoch = loop {
            match Self::acknowledge_locked(&mut state, cell, seen) {
                Ok(()) => break seen,
                Err(err) => {
                    self.metrics.record_stale_acknowledgement();
                    debug!(%err, "ignoring stale safepoint acknowledgement");

                    if state.request.is_none() {
                        cell.clear_safepoint_request(None);
                        return SafepointOutcome::Stale;
                    }
                    let fresh = cell.requested_epoch();
                    if fresh == seen || !cell.is_safepoint_requested() {
                        return SafepointOutcome::Stale;
                    }
                    seen = fresh;
                }
            }
        };
        self.progress.notify_all();

        let parked_at = Instant::now();
        let generation = state.generation;
        while state.generation == generation {
            if !Self::is_stalled(&state) {
                self.released.wait(&mut state);
                continue;
            }
            // Nobody drives a stalled request. Once every thread is safe the
            // last one to park finishes it.
            if Self::pending(&self.observe(&state, None)).is_empty() {
                self.metrics.record_safepoint_park(parked_at.elapsed());
                debug!(thread = %cell.key(), epoch, "completing stalled collection request");
                return match self.drive(state, Some(cell)) {
                    Ok(snapshot) => SafepointOutcome::Collected {
                        epoch: snapshot.epoch,
                    },
                    Err(err) => {
                        warn!(thread = %cell.key(), %err, "stalled collection request still blocked");
                        SafepointOutcome::Stale
                    }
                };
            }
            self.released.wait_for(&mut state, STALLED_RECHECK);
        }
        drop(state);

        let parked = parked_at.elapsed();
        self.metrics.record_safepoint_park(parked);
        debug!(thread = %cell.key(), epoch, parked_us = parked.as_micros() as u64, "released from safepoint");
        SafepointOutcome::Yielded { epoch, parked }
    }

    /// Stop the world, run the collector, release the world.
    ///
    /// When another caller is already driving a request, a registered caller
    /// yields at a safepoint and an unregistered caller waits; both return
    /// the snapshot of that collection. A request left behind by an earlier
    /// stall is resumed rather than replaced.
    pub fn trigger_collection(&self) -> Result<MemorySnapshot> {
        let caller = self.threads.find_by_native(thread::current().id());
        let mut state = self.state.lock();

        loop {
            match state.request.as_ref().map(|r| (r.epoch, r.driven)) {
                None => {
                    let epoch = state.epoch + 1;
                    state.request = Some(CollectionRequest::new(epoch));
                    state.phase = CollectionPhase::Requesting;
                    for cell in self.threads.cells() {
                        cell.mark_safepoint_requested(epoch);
                    }
                    debug!(epoch, threads = self.threads.len(), "collection requested");
                    return self.drive(state, caller.as_deref());
                }
                Some((epoch, false)) => {
                    debug!(epoch, "resuming stalled collection request");
                    return self.drive(state, caller.as_deref());
                }
                Some((epoch, true)) => {
                    match &caller {
                        Some(cell) if cell.execution_state() == ThreadState::Managed => {
                            drop(state);
                            self.park_at_safepoint(cell);
                            state = self.state.lock();
                        }
                        _ => state = self.wait_for_release(state, epoch)?,
                    }

                    if state.epoch >= epoch {
                        if let Some(snapshot) = self.telemetry.last_snapshot() {
                            return Ok(snapshot);
                        }
                    }
                    // Abandoned underneath us: start over with a fresh request.
                }
            }
        }
    }

    /// Withdraw a request nobody is driving. Overlays clear, parked threads
    /// resume, the epoch does not advance and no snapshot is published.
    pub fn abandon_request(&self) -> bool {
        let mut state = self.state.lock();
        let epoch = match &state.request {
            Some(request) if !request.driven && state.phase == CollectionPhase::Requesting => {
                request.epoch
            }
            _ => return false,
        };

        state.request = None;
        state.phase = CollectionPhase::Idle;
        state.generation += 1;
        for cell in self.threads.cells() {
            cell.clear_safepoint_request(None);
        }
        drop(state);

        self.metrics.record_abandoned_request();
        self.released.notify_all();
        warn!(epoch, "collection request abandoned");
        true
    }

    /// Allocation-pressure path taken from a safepoint poll. A stalled request
    /// started here is withdrawn, since no operator is around to resume it.
    pub(crate) fn collect_on_pressure(&self) -> Option<Result<MemorySnapshot>> {
        if !self.needs_collection.swap(false, Ordering::AcqRel) {
            return None;
        }

        match self.trigger_collection() {
            Err(err) if err.is_stall() => {
                self.abandon_request();
                Some(Err(err))
            }
            result => Some(result),
        }
    }

    /// One pass over every cell, sorted by key. A thread that turns managed
    /// after this pass still has the overlay set and parks before it can
    /// touch the heap.
    fn observe(&self, state: &CoordinatorState, initiator: Option<ThreadKey>) -> Vec<ThreadObservation> {
        let Some(request) = &state.request else {
            return Vec::new();
        };

        let mut observations: Vec<_> = self
            .threads
            .cells()
            .iter()
            .map(|cell| ThreadObservation {
                key: cell.key(),
                word: cell.load(),
                acknowledged: request.acknowledged.contains(&cell.key()),
                initiator: Some(cell.key()) == initiator,
            })
            .collect();
        observations.sort_by_key(|o| o.key);
        observations
    }

    fn pending(observations: &[ThreadObservation]) -> Vec<ThreadKey> {
        observations
            .iter()
            .filter(|o| {
                o.word.execution() == ThreadState::Managed && !o.acknowledged && !o.initiator
            })
            .map(|o| o.key)
            .collect()
    }

    fn drive<'a>(
        &'a self,
        mut state: MutexGuard<'a, CoordinatorState>,
        caller: Option<&ThreadStateCell>,
    ) -> Result<MemorySnapshot> {
        let initiator = caller.map(|c| c.key());
        let epoch = match state.request.as_mut() {
            Some(request) => {
                request.driven = true;
                request.epoch
            }
            None => unreachable!("drive called without a pending request"),
        };

        let start_time = Instant::now();
        let mut warned = false;

        let observations = loop {
            let observations = self.observe(&state, initiator);
            let pending = Self::pending(&observations);
            if pending.is_empty() {
                break observations;
            }

            let waited = start_time.elapsed();
            if let Some(limit) = self.config.watchdog_timeout {
                if waited >= limit {
                    if let Some(request) = state.request.as_mut() {
                        request.driven = false;
                    }
                    self.wake_if_stalled(&state);
                    drop(state);

                    self.metrics.record_stall();
                    warn!(
                        epoch,
                        waited_ms = waited.as_millis() as u64,
                        ?pending,
                        "collection request stalled; threads never reached a safe state"
                    );
                    return Err(BridgeError::UnboundedStall {
                        epoch,
                        waited,
                        pending,
                    });
                }
            }

            if !warned && waited >= self.config.warn_after {
                self.warn_slow_stop(&pending, waited);
                warned = true;
            }

            match self.next_wakeup(waited, warned) {
                Some(timeout) => {
                    self.progress.wait_for(&mut state, timeout);
                }
                None => self.progress.wait(&mut state),
            }
        };

        if warned {
            warn!(
                "[GC] Stop-the-world completed after {} ms",
                start_time.elapsed().as_millis()
            );
        }

        let request = Self::admit(&mut state, observations);
        drop(state);

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.collector.scan_roots(&request)));
        let collection_duration = started.elapsed();

        let usage = match outcome {
            Ok(usage) => usage,
            Err(payload) => {
                self.release(None);
                panic::resume_unwind(payload);
            }
        };

        let snapshot = MemorySnapshot {
            epoch,
            bytes_allocated: usage.bytes_allocated,
            collection_duration,
            pause_duration: request.requested_at.elapsed(),
            registered_threads: request.observations.len(),
            native_threads: request
                .observations
                .iter()
                .filter(|o| o.word.execution() == ThreadState::Native)
                .count(),
        };
        self.release(Some(snapshot));

        debug!(
            epoch,
            bytes = snapshot.bytes_allocated,
            pause_us = snapshot.pause_duration.as_micros() as u64,
            "collection complete"
        );
        Ok(snapshot)
    }

    /// `Requesting -> Collecting`, recording who was safe and how.
    fn admit(state: &mut CoordinatorState, observations: Vec<ThreadObservation>) -> CollectionRequest {
        state.phase = CollectionPhase::Collecting;
        let Some(request) = state.request.as_mut() else {
            unreachable!("admitting a collection without a pending request")
        };
        request.observations = observations;
        request.clone()
    }

    /// `Collecting -> Idle`. Without a snapshot the collection failed and the
    /// epoch stays where it was.
    fn release(&self, snapshot: Option<MemorySnapshot>) {
        let mut state = self.state.lock();
        let completed = snapshot.map(|s| s.epoch);
        if let Some(epoch) = completed {
            state.epoch = epoch;
        }
        state.request = None;
        state.phase = CollectionPhase::Idle;
        state.generation += 1;
        for cell in self.threads.cells() {
            cell.clear_safepoint_request(completed);
        }

        if let Some(snapshot) = snapshot {
            self.needs_collection.store(false, Ordering::Release);
            self.telemetry.publish(snapshot);
            self.metrics.record_gc_pause(snapshot.pause_duration);
        }
        drop(state);

        self.released.notify_all();
    }

    fn wait_for_release<'a>(
        &'a self,
        mut state: MutexGuard<'a, CoordinatorState>,
        epoch: u64,
    ) -> Result<MutexGuard<'a, CoordinatorState>> {
        let start_time = Instant::now();
        let generation = state.generation;
        while state.generation == generation {
            match self.config.watchdog_timeout {
                Some(limit) => {
                    let waited = start_time.elapsed();
                    if waited >= limit {
                        let pending = Self::pending(&self.observe(&state, None));
                        self.metrics.record_stall();
                        return Err(BridgeError::UnboundedStall {
                            epoch,
                            waited,
                            pending,
                        });
                    }
                    self.released.wait_for(&mut state, limit - waited);
                }
                None => self.released.wait(&mut state),
            }
        }
        Ok(state)
    }

    fn next_wakeup(&self, waited: Duration, warned: bool) -> Option<Duration> {
        let watchdog = self.config.watchdog_timeout.map(|l| l.saturating_sub(waited));
        let warn = (!warned).then(|| self.config.warn_after.saturating_sub(waited));
        match (watchdog, warn) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn warn_slow_stop(&self, pending: &[ThreadKey], waited: Duration) {
        warn!("[GC WARNING] Stop-the-world pause taking longer than expected:");
        warn!("  Waited: {} ms", waited.as_millis());
        warn!("  Total threads: {}", self.threads.len());
        warn!("  Threads not at safe point:");
        for cell in self.threads.cells() {
            if pending.contains(&cell.key()) {
                warn!(
                    "    - Thread {}: {:?} (native: {:?})",
                    cell.key(),
                    cell.current_state(),
                    cell.owner()
                );
            }
        }
    }
}

impl std::fmt::Debug for CollectorCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CollectorCoordinator")
            .field("phase", &state.phase)
            .field("epoch", &state.epoch)
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{HeapUsage, NullCollector};
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> Arc<CollectorCoordinator> {
        CollectorCoordinator::new(
            BridgeConfig::default().with_watchdog(Duration::from_secs(5)),
            NullCollector,
        )
    }

    #[test]
    fn registration() {
        let coordinator = coordinator();
        let mutator = coordinator.register_thread().unwrap();
        assert_eq!(coordinator.thread_count(), 1);
        assert_eq!(
            coordinator.thread_states(),
            vec![(mutator.key(), ThreadState::Managed)]
        );

        let err = coordinator.register_thread().unwrap_err();
        assert_eq!(err, BridgeError::AlreadyRegistered(mutator.key()));

        let key = mutator.key();
        assert_eq!(coordinator.thread_state(key), Ok(ThreadState::Managed));
        mutator.deregister();
        assert_eq!(coordinator.thread_count(), 0);
        assert_eq!(coordinator.thread_state(key), Err(BridgeError::NotRegistered(key)));
    }

    #[test]
    fn collection_without_threads() {
        let coordinator = coordinator();
        assert_eq!(coordinator.last_snapshot(), None);

        let snapshot = coordinator.trigger_collection().unwrap();
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.registered_threads, 0);
        assert_eq!(coordinator.epoch(), 1);
        assert_eq!(coordinator.phase(), CollectionPhase::Idle);
        assert_eq!(coordinator.last_snapshot(), Some(snapshot));
    }

    #[test]
    fn initiator_does_not_wait_for_itself() {
        let coordinator = coordinator();
        let mutator = coordinator.register_thread().unwrap();

        let snapshot = coordinator.trigger_collection().unwrap();
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.registered_threads, 1);
        assert_eq!(mutator.current_state(), ThreadState::Managed);
        assert_eq!(mutator.cell().epoch(), 1);
    }

    #[test]
    fn collector_sees_parked_thread() {
        let scans = Arc::new(AtomicUsize::new(0));
        let scans_seen = scans.clone();
        let coordinator = CollectorCoordinator::new(
            BridgeConfig::default().with_watchdog(Duration::from_secs(5)),
            move |request: &CollectionRequest| {
                scans_seen.fetch_add(1, Ordering::SeqCst);
                for observation in request.observations() {
                    assert!(observation.acknowledged || observation.initiator);
                }
                HeapUsage { bytes_allocated: 512 }
            },
        );

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let coordinator = coordinator.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mutator = coordinator.register_thread().unwrap();
                while !stop.load(Ordering::Acquire) {
                    mutator.poll_safepoint();
                    thread::yield_now();
                }
            })
        };

        while coordinator.thread_count() == 0 {
            thread::yield_now();
        }
        let snapshot = coordinator.trigger_collection().unwrap();
        stop.store(true, Ordering::Release);
        worker.join().unwrap();

        assert_eq!(scans.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.bytes_allocated, 512);
        assert_eq!(coordinator.metrics().summary().safepoint_parks, 1);
    }

    #[test]
    fn acknowledging_without_request_is_stale() {
        let coordinator = coordinator();
        let mutator = coordinator.register_thread().unwrap();

        let err = coordinator.acknowledge(mutator.cell(), 7).unwrap_err();
        assert_eq!(
            err,
            BridgeError::StaleAcknowledgement {
                thread: mutator.key(),
                acknowledged: 7,
                current: None,
            }
        );
    }

    #[test]
    fn abandon_only_undriven_requests() {
        let coordinator = coordinator();
        assert!(!coordinator.abandon_request());
    }
}
