//! Bridge tuning knobs.
//!
//! Defaults suit an interactive runtime. Each value can be overridden from the
//! environment:
//!
//! - `GC_BRIDGE_WATCHDOG_MS`: stall watchdog in milliseconds (`0` disables it)
//! - `GC_BRIDGE_WARN_MS`: delay before the slow stop-the-world warning is logged
//! - `GC_BRIDGE_CHECKPOINT_MS`: checkpoint interval for safepoint-aware loops
//!   (`0` yields at every checkpoint)
//! - `GC_BRIDGE_ALLOC_THRESHOLD`: bytes a thread may allocate before it asks
//!   for a collection
use crate::checkpoint::CheckpointPolicy;
use std::{env, time::Duration};

const DEFAULT_WATCHDOG: Duration = Duration::from_secs(10);
const DEFAULT_WARN_AFTER: Duration = Duration::from_secs(1);
const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_millis(10);
/// 1MB per-thread trigger
pub const DEFAULT_ALLOCATION_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How long a collection request may wait for threads before
    /// `UnboundedStall` is reported. `None` waits forever.
    pub watchdog_timeout: Option<Duration>,
    /// When to log which threads are holding up a request
    pub warn_after: Duration,
    pub checkpoint_interval: Duration,
    pub allocation_threshold: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Some(DEFAULT_WATCHDOG),
            warn_after: DEFAULT_WARN_AFTER,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            allocation_threshold: DEFAULT_ALLOCATION_THRESHOLD,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_u64("GC_BRIDGE_WATCHDOG_MS") {
            config.watchdog_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = env_u64("GC_BRIDGE_WARN_MS") {
            config.warn_after = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("GC_BRIDGE_CHECKPOINT_MS") {
            config.checkpoint_interval = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_u64("GC_BRIDGE_ALLOC_THRESHOLD") {
            config.allocation_threshold = bytes as usize;
        }

        config
    }

    pub fn with_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = Some(timeout);
        self
    }

    pub fn without_watchdog(mut self) -> Self {
        self.watchdog_timeout = None;
        self
    }

    pub fn with_warn_after(mut self, after: Duration) -> Self {
        self.warn_after = after;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_allocation_threshold(mut self, bytes: usize) -> Self {
        self.allocation_threshold = bytes;
        self
    }

    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        if self.checkpoint_interval.is_zero() {
            CheckpointPolicy::Always
        } else {
            CheckpointPolicy::Interval(self.checkpoint_interval)
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
