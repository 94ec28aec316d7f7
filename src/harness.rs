//! Workload scenarios for exercising the bridge end to end.
//!
//! A [`Harness`] owns one coordinator backed by a [`SimulatedHeap`] and runs
//! every scenario against it, so memory readings carry over from one scenario
//! to the next. During a scenario a background thread requests collections
//! the way a runtime's collector thread would. Managed work allocates chunks into a
//! bounded window and polls; native work is plain CPU-bound vector summing.
use crate::{
    checkpoint::CheckpointPolicy,
    config::BridgeConfig,
    error::Result,
    gc::{CollectionRequest, CollectorCoordinator, HeapUsage},
    guard::NativeStateGuard,
    sync::{Arc, AtomicBool, AtomicU64, AtomicUsize, Ordering},
    threading::Mutator,
};
use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt, hint,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Size of one managed allocation
const CHUNK: usize = 64 * 1024;
/// Chunks kept alive by a pressure loop
const LIVE_WINDOW: usize = 50;
/// Every n-th allocation forces a collection
const FORCE_EVERY: usize = 10;
const BACKGROUND_INTERVAL: Duration = Duration::from_millis(20);
const WORKER_THREADS: usize = 4;
/// Native buffer size in the memory stress loop
const STRESS_BUFFER: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Scenario {
    /// Managed allocation only, as a baseline
    ManagedOnly,
    /// Foreign work with no state transition
    Unguarded,
    /// Foreign work inside a native guard
    Guarded,
    /// Foreign work in batches with checkpoints between them
    SafepointChecks,
    /// Several registered threads mixing both kinds of work
    Multithreaded,
    /// Short native sleeps alternating with short managed sleeps
    StateSwitching,
    /// Foreign loop calling back into managed code
    Callbacks,
    /// Managed and guarded foreign work interleaved over several rounds
    Mixed,
    /// A long-running native thread next to a managed one
    Concurrent,
    /// Time-boxed foreign loop checking for collections every 100 rounds
    LongRunning,
    /// Large native buffers, checking for collections every 10 rounds
    MemoryStress,
}

impl Scenario {
    pub const ALL: [Scenario; 11] = [
        Scenario::ManagedOnly,
        Scenario::Unguarded,
        Scenario::Guarded,
        Scenario::SafepointChecks,
        Scenario::Multithreaded,
        Scenario::StateSwitching,
        Scenario::Callbacks,
        Scenario::Mixed,
        Scenario::Concurrent,
        Scenario::LongRunning,
        Scenario::MemoryStress,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Scenario::ManagedOnly => "Managed Only Workload",
            Scenario::Unguarded => "Foreign Call Without Guard",
            Scenario::Guarded => "Foreign Call With Guard",
            Scenario::SafepointChecks => "Foreign Call With Safepoint Checks",
            Scenario::Multithreaded => "Multi-threaded",
            Scenario::StateSwitching => "State Switching",
            Scenario::Callbacks => "Foreign Call With Managed Callbacks",
            Scenario::Mixed => "Mixed Managed/Foreign Workload",
            Scenario::Concurrent => "Concurrent Managed and Foreign Work",
            Scenario::LongRunning => "Long-running Foreign Call",
            Scenario::MemoryStress => "Foreign Memory Stress",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Managed heap stand-in. Tracks live bytes; a "collection" just reports them.
#[derive(Debug, Default)]
pub struct SimulatedHeap {
    live: AtomicUsize,
    total_allocated: AtomicUsize,
    scans: AtomicU64,
}

impl SimulatedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, mutator: &Mutator, bytes: usize) -> Vec<u8> {
        self.live.fetch_add(bytes, Ordering::Relaxed);
        self.total_allocated.fetch_add(bytes, Ordering::Relaxed);
        mutator.record_allocation(bytes);
        vec![0xA5; bytes]
    }

    pub fn release(&self, chunk: Vec<u8>) {
        self.live.fetch_sub(chunk.len(), Ordering::Relaxed);
    }

    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn total_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }

    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    fn scan(&self, _request: &CollectionRequest) -> HeapUsage {
        self.scans.fetch_add(1, Ordering::Relaxed);
        HeapUsage {
            bytes_allocated: self.live_bytes(),
        }
    }
}

/// Scales every scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    /// Managed allocation rounds per pressure phase
    pub pressure: usize,
    /// Native work rounds per foreign call
    pub native: usize,
    /// Wall-clock length of the long-running foreign loop
    pub long_run: Duration,
}

impl Workload {
    pub fn from_iterations(iterations: usize) -> Self {
        Self {
            pressure: iterations,
            native: iterations.saturating_mul(10),
            long_run: Duration::from_millis(iterations as u64 * 4),
        }
    }
}

impl Default for Workload {
    fn default() -> Self {
        Self::from_iterations(50)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub duration_ms: u64,
    pub memory_before: usize,
    pub memory_after: usize,
    pub memory_delta: i64,
    pub collections: u64,
    pub stalls: u64,
    pub last_gc_us: Option<u64>,
    pub last_pause_us: Option<u64>,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MB: f64 = 1024.0 * 1024.0;
        writeln!(f, "\n=== {} ===", self.name)?;
        writeln!(f, "Duration: {} ms", self.duration_ms)?;
        writeln!(f, "Memory before: {:.2} MB", self.memory_before as f64 / MB)?;
        writeln!(f, "Memory after: {:.2} MB", self.memory_after as f64 / MB)?;
        writeln!(f, "Memory delta: {:.2} MB", self.memory_delta as f64 / MB)?;
        writeln!(f, "Collections: {} ({} stalled requests)", self.collections, self.stalls)?;
        if let Some(us) = self.last_gc_us {
            writeln!(f, "Last GC duration: {:.3} ms", us as f64 / 1000.0)?;
        }
        if let Some(us) = self.last_pause_us {
            writeln!(f, "Last GC pause time: {:.3} ms", us as f64 / 1000.0)?;
        }
        Ok(())
    }
}

/// Requests a collection every `interval` from an unregistered thread.
/// Stalled requests are left for the next round to resume.
struct BackgroundCollector {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundCollector {
    fn start(coordinator: Arc<CollectorCoordinator>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    if let Err(err) = coordinator.trigger_collection() {
                        debug!(%err, "background collection did not complete");
                    }
                }
            })
        };
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("background collector panicked");
            }
        }
    }
}

pub struct Harness {
    workload: Workload,
    heap: Arc<SimulatedHeap>,
    coordinator: Arc<CollectorCoordinator>,
}

impl Harness {
    pub fn new(config: BridgeConfig, workload: Workload) -> Self {
        let heap = Arc::new(SimulatedHeap::new());
        let coordinator = CollectorCoordinator::new(config, {
            let heap = heap.clone();
            move |request: &CollectionRequest| heap.scan(request)
        });
        Self {
            workload,
            heap,
            coordinator,
        }
    }

    pub fn heap(&self) -> &SimulatedHeap {
        &self.heap
    }

    pub fn coordinator(&self) -> &Arc<CollectorCoordinator> {
        &self.coordinator
    }

    /// Run one scenario on the calling thread. Memory is read from the last
    /// collection before and after; counters cover this scenario only.
    pub fn run(&self, scenario: Scenario) -> Result<ScenarioReport> {
        let coordinator = &self.coordinator;
        let mutator = coordinator.register_thread()?;
        let counters_before = coordinator.metrics().summary();
        let background = BackgroundCollector::start(coordinator.clone(), BACKGROUND_INTERVAL);

        let start_time = Instant::now();
        let memory_before = coordinator.last_snapshot().map_or(0, |s| s.bytes_allocated);
        force_collection(&mutator);

        let body = self.run_body(scenario, &self.heap, &mutator);

        // Safe while waiting, so a collection in flight can finish.
        mutator.with_native_guard(|| background.stop())?;
        force_collection(&mutator);
        body?;

        let duration = start_time.elapsed();
        let last = coordinator.last_snapshot();
        let memory_after = last.map_or(0, |s| s.bytes_allocated);
        let counters = coordinator.metrics().summary();

        Ok(ScenarioReport {
            name: scenario.title().to_string(),
            duration_ms: duration.as_millis() as u64,
            memory_before,
            memory_after,
            memory_delta: memory_after as i64 - memory_before as i64,
            collections: counters.gc_pause_count.saturating_sub(counters_before.gc_pause_count),
            stalls: counters.stalls.saturating_sub(counters_before.stalls),
            last_gc_us: last.map(|s| s.collection_duration.as_micros() as u64),
            last_pause_us: last.map(|s| s.pause_duration.as_micros() as u64),
        })
    }

    fn run_body(&self, scenario: Scenario, heap: &SimulatedHeap, mutator: &Mutator) -> Result<()> {
        let Workload {
            pressure,
            native,
            long_run,
        } = self.workload;
        match scenario {
            Scenario::ManagedOnly => create_pressure(heap, mutator, pressure * 2),
            Scenario::Unguarded => {
                create_pressure(heap, mutator, pressure);
                mutator.call_unguarded(|| do_native_work(native));
                create_pressure(heap, mutator, pressure);
            }
            Scenario::Guarded => {
                create_pressure(heap, mutator, pressure);
                mutator.with_native_guard(|| do_native_work(native))?;
                create_pressure(heap, mutator, pressure);
            }
            Scenario::SafepointChecks => {
                create_pressure(heap, mutator, pressure);
                mutator.with_safepoint_aware_loop(|checkpoint| {
                    for _ in 0..5 {
                        do_native_work(native / 5);
                        checkpoint.checkpoint();
                    }
                })?;
                create_pressure(heap, mutator, pressure);
            }
            Scenario::Multithreaded => {
                let coordinator = mutator.coordinator();
                let results = mutator.with_native_guard(|| {
                    thread::scope(|s| {
                        let mut workers = Vec::with_capacity(WORKER_THREADS);
                        for _ in 0..WORKER_THREADS {
                            workers.push(s.spawn(move || -> Result<()> {
                                let worker = coordinator.register_thread()?;
                                create_pressure(heap, &worker, pressure / 2);
                                worker.with_native_guard(|| do_native_work(native / 2))?;
                                create_pressure(heap, &worker, pressure / 2);
                                Ok(())
                            }));
                        }
                        workers
                            .into_iter()
                            .map(|w| w.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
                            .collect::<Vec<_>>()
                    })
                })?;
                results.into_iter().collect::<Result<()>>()?;
            }
            Scenario::StateSwitching => {
                for _ in 0..5 {
                    {
                        let _guard = NativeStateGuard::enter(mutator)?;
                        thread::sleep(Duration::from_millis(10));
                    }
                    mutator.poll_safepoint();
                    thread::sleep(Duration::from_millis(10));
                }
            }
            Scenario::Callbacks => {
                let guard = NativeStateGuard::enter(mutator)?;
                for _ in 0..5 {
                    do_native_work(native / 10);
                    guard.reenter_managed(|m| create_pressure(heap, m, pressure / 5))?;
                }
            }
            Scenario::Mixed => {
                for round in 0..5 {
                    debug!(round = round + 1, "mixed workload round");
                    create_pressure(heap, mutator, pressure / 2);
                    mutator.with_native_guard(|| do_native_work(native))?;
                    create_pressure(heap, mutator, pressure / 2);
                }
            }
            Scenario::Concurrent => {
                let coordinator = mutator.coordinator();
                let stop = AtomicBool::new(false);
                thread::scope(|s| -> Result<()> {
                    let native_worker = s.spawn(|| -> Result<u64> {
                        let worker = coordinator.register_thread()?;
                        worker.with_safepoint_aware_loop(|checkpoint| {
                            let mut rounds = 0;
                            while !stop.load(Ordering::Acquire) {
                                do_native_work(10);
                                checkpoint.checkpoint();
                                rounds += 1;
                            }
                            rounds
                        })
                    });

                    create_pressure(heap, mutator, pressure * 2);
                    stop.store(true, Ordering::Release);

                    let rounds = mutator
                        .with_native_guard(|| native_worker.join())?
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))?;
                    debug!(rounds, "native worker finished");
                    Ok(())
                })?;
            }
            Scenario::LongRunning => {
                let rounds = mutator.with_checkpoint_policy(CheckpointPolicy::EveryN(100), |checkpoint| {
                    let deadline = Instant::now() + long_run;
                    let mut rounds = 0u64;
                    while Instant::now() < deadline {
                        do_native_work(10);
                        checkpoint.checkpoint();
                        rounds += 1;
                    }
                    rounds
                })?;
                debug!(rounds, "long-running foreign call finished");
            }
            Scenario::MemoryStress => {
                mutator.with_checkpoint_policy(CheckpointPolicy::EveryN(10), |checkpoint| {
                    for round in 0..pressure {
                        touch_native_buffer(round);
                        checkpoint.checkpoint();
                    }
                })?;
            }
        }
        Ok(())
    }
}

fn force_collection(mutator: &Mutator) {
    if let Err(err) = mutator.coordinator().trigger_collection() {
        warn!(thread = %mutator.key(), %err, "forced collection did not complete");
    }
}

/// Allocate `iterations` chunks, keeping a bounded window alive, forcing a
/// collection now and then, polling after every allocation.
pub fn create_pressure(heap: &SimulatedHeap, mutator: &Mutator, iterations: usize) {
    let mut data = VecDeque::with_capacity(LIVE_WINDOW + 1);
    for i in 0..iterations {
        data.push_back(heap.allocate(mutator, CHUNK));

        if i % FORCE_EVERY == 0 {
            force_collection(mutator);
        }

        if data.len() > LIVE_WINDOW {
            if let Some(chunk) = data.pop_front() {
                heap.release(chunk);
            }
        }
        mutator.poll_safepoint();
    }

    for chunk in data {
        heap.release(chunk);
    }
}

/// CPU-bound work that touches no managed state.
pub fn do_native_work(iterations: usize) -> i64 {
    let mut data: Vec<Vec<i32>> = Vec::new();
    let mut sum = 0i64;

    for i in 0..iterations {
        data.push(vec![i as i32; 1000]);

        sum = data.iter().flatten().map(|&v| i64::from(v)).sum();

        if data.len() > 100 {
            data.drain(..50);
        }
    }

    hint::black_box(sum)
}

/// Fill a fresh native buffer, one byte per KiB. Never seen by the managed
/// heap.
fn touch_native_buffer(round: usize) -> u8 {
    let mut buffer = vec![0u8; STRESS_BUFFER];
    for byte in buffer.iter_mut().step_by(1024) {
        *byte = (round % 256) as u8;
    }
    hint::black_box(&buffer);
    buffer[buffer.len() - 1024]
}
