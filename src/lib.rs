//! # gc-bridge
//!
//! Thread-state coordination between a garbage-collected runtime and foreign
//! code.
//!
//! Every thread that may hold managed references registers with a
//! [`CollectorCoordinator`] and gets a [`Mutator`]. Foreign calls run inside
//! [`Mutator::with_native_guard`] (or a safepoint-aware loop for long work),
//! which flips the thread to `Native` so a collection can proceed without
//! waiting for it. Threads in managed code poll with
//! [`Mutator::poll_safepoint`] and park while a collection runs.
//!
//! ## Environment
//!
//! [`BridgeConfig::from_env`] reads `GC_BRIDGE_WATCHDOG_MS`,
//! `GC_BRIDGE_WARN_MS`, `GC_BRIDGE_CHECKPOINT_MS` and
//! `GC_BRIDGE_ALLOC_THRESHOLD`.
use clap::Parser;
use std::process::ExitCode;

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gc;
pub mod guard;
pub mod harness;
pub mod metrics;
pub mod pinvoke;
pub mod safepoint;
pub mod sync;
pub mod threading;

pub use checkpoint::{Checkpoint, CheckpointPolicy};
pub use config::BridgeConfig;
pub use error::{BridgeError, NativeLibraryError, Result, TransitionFault};
pub use gc::{
    CollectionPhase, CollectionRequest, Collector, CollectorCoordinator, HeapUsage, NullCollector,
};
pub use guard::{CallContext, GuardMode, NativeStateGuard};
pub use metrics::{MemorySnapshot, MetricsSummary, RuntimeMetrics, Telemetry};
pub use safepoint::SafepointOutcome;
pub use threading::{Mutator, StateWord, ThreadKey, ThreadState, ThreadStateCell};

use harness::{Harness, Scenario, Workload};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Runs managed/foreign workload scenarios against the GC bridge"
)]
pub struct Args {
    /// Scenario to run; repeat for several. Runs all of them when omitted.
    #[arg(short, long = "scenario", value_enum)]
    pub scenarios: Vec<Scenario>,
    /// Managed allocation rounds per phase (native rounds scale with it)
    #[arg(short, long, default_value_t = 50)]
    pub iterations: usize,
    /// Stall watchdog in milliseconds, 0 to disable
    #[arg(long, value_name = "MS")]
    pub watchdog_ms: Option<u64>,
    /// Checkpoint interval for safepoint-aware loops, 0 for every checkpoint
    #[arg(long, value_name = "MS")]
    pub checkpoint_ms: Option<u64>,
    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::from_env();
        if let Some(ms) = self.watchdog_ms {
            config = match ms {
                0 => config.without_watchdog(),
                ms => config.with_watchdog(std::time::Duration::from_millis(ms)),
            };
        }
        if let Some(ms) = self.checkpoint_ms {
            config = config.with_checkpoint_interval(std::time::Duration::from_millis(ms));
        }
        config
    }
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();
    let harness = Harness::new(args.config(), Workload::from_iterations(args.iterations));

    let scenarios = if args.scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        args.scenarios.clone()
    };

    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        match harness.run(scenario) {
            Ok(report) => {
                if !args.json {
                    print!("{report}");
                }
                reports.push(report);
            }
            Err(e) => {
                eprintln!("Scenario '{}' failed: {}", scenario, e);
                return ExitCode::from(1);
            }
        }
    }

    if args.json {
        match serde_json::to_string_pretty(&reports) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing reports: {}", e);
                return ExitCode::from(1);
            }
        }
    }

    ExitCode::SUCCESS
}
