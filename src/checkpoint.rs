//! Long-running foreign work that stays collection-responsive.
//!
//! A plain guard is enough when foreign code never touches managed state. Work
//! that must occasionally call back, or that simply runs for a long time under
//! a runtime that wants tight pauses, runs inside a safepoint-aware loop
//! instead: the callee holds a [`Checkpoint`] and calls
//! [`checkpoint`](Checkpoint::checkpoint) between units of work.
use crate::{
    error::Result,
    guard::{GuardMode, ManagedScope, NativeStateGuard},
    safepoint::SafepointOutcome,
    threading::Mutator,
};
use std::time::{Duration, Instant};
use tracing::error;

/// When a checkpoint actually steps back into managed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    Always,
    /// At most once per interval
    Interval(Duration),
    /// Every n-th call; `EveryN(0)` and `EveryN(1)` behave like `Always`
    EveryN(u32),
}

pub struct Checkpoint<'m> {
    mutator: &'m Mutator,
    policy: CheckpointPolicy,
    last_taken: Instant,
    calls: u64,
    taken: u64,
}

impl<'m> Checkpoint<'m> {
    fn new(mutator: &'m Mutator, policy: CheckpointPolicy) -> Self {
        Self {
            mutator,
            policy,
            last_taken: Instant::now(),
            calls: 0,
            taken: 0,
        }
    }

    fn due_at(&self, call: u64) -> bool {
        match self.policy {
            CheckpointPolicy::Always => true,
            CheckpointPolicy::Interval(interval) => self.last_taken.elapsed() >= interval,
            CheckpointPolicy::EveryN(n) => n <= 1 || call % u64::from(n) == 0,
        }
    }

    /// Whether the next call to [`checkpoint`](Self::checkpoint) will step
    /// into managed code.
    pub fn is_due(&self) -> bool {
        self.due_at(self.calls + 1)
    }

    /// Whether a collection is waiting on any thread right now.
    pub fn safepoint_pending(&self) -> bool {
        self.mutator.cell().is_safepoint_requested()
    }

    /// `Native -> Managed -> poll -> Native` when the policy says so. Returns
    /// whether the thread yielded to a collection or ran one.
    pub fn checkpoint(&mut self) -> bool {
        self.calls += 1;
        let metrics = self.mutator.coordinator().metrics();
        if !self.due_at(self.calls) {
            metrics.record_checkpoint(false);
            return false;
        }

        let acknowledged = self.mutator.cell().acknowledged_epoch();
        let outcome = match ManagedScope::enter(self.mutator) {
            // Entering managed state parks on its own if a request is pending.
            Ok(_scope) => self.mutator.poll_safepoint(),
            Err(err) => {
                error!(thread = %self.mutator.key(), %err, "checkpoint could not enter managed state");
                SafepointOutcome::Clear
            }
        };

        self.last_taken = Instant::now();
        self.taken += 1;
        metrics.record_checkpoint(true);

        matches!(
            outcome,
            SafepointOutcome::Yielded { .. } | SafepointOutcome::Collected { .. }
        ) || self.mutator.cell().acknowledged_epoch() != acknowledged
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Checkpoints that actually stepped into managed code.
    pub fn taken(&self) -> u64 {
        self.taken
    }

    pub fn policy(&self) -> CheckpointPolicy {
        self.policy
    }
}

impl Mutator {
    /// Guarded foreign call whose body yields at checkpoints, paced by the
    /// configured checkpoint interval.
    pub fn with_safepoint_aware_loop<T>(&self, f: impl FnOnce(&mut Checkpoint<'_>) -> T) -> Result<T> {
        let policy = self.coordinator().config().checkpoint_policy();
        self.with_checkpoint_policy(policy, f)
    }

    pub fn with_checkpoint_policy<T>(
        &self,
        policy: CheckpointPolicy,
        f: impl FnOnce(&mut Checkpoint<'_>) -> T,
    ) -> Result<T> {
        let guard = NativeStateGuard::enter_with_mode(self, GuardMode::Polling)?;
        let mut checkpoint = Checkpoint::new(self, policy);
        let out = f(&mut checkpoint);
        drop(guard);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BridgeConfig,
        gc::{CollectorCoordinator, NullCollector},
        threading::ThreadState,
    };

    fn mutator() -> Mutator {
        CollectorCoordinator::new(BridgeConfig::default(), NullCollector)
            .register_thread()
            .unwrap()
    }

    #[test]
    fn every_n_counts_calls() {
        let mutator = mutator();
        let taken = mutator
            .with_checkpoint_policy(CheckpointPolicy::EveryN(3), |cp| {
                for _ in 0..9 {
                    cp.checkpoint();
                }
                assert_eq!(cp.calls(), 9);
                cp.taken()
            })
            .unwrap();
        assert_eq!(taken, 3);

        let summary = mutator.coordinator().metrics().summary();
        assert_eq!(summary.checkpoints_taken, 3);
        assert_eq!(summary.checkpoints_skipped, 6);
    }

    #[test]
    fn every_zero_is_always() {
        let mutator = mutator();
        mutator
            .with_checkpoint_policy(CheckpointPolicy::EveryN(0), |cp| {
                assert!(cp.is_due());
                assert!(!cp.checkpoint());
                assert_eq!(cp.taken(), 1);
            })
            .unwrap();
    }

    #[test]
    fn interval_skips_until_elapsed() {
        let mutator = mutator();
        mutator
            .with_checkpoint_policy(CheckpointPolicy::Interval(Duration::from_secs(60)), |cp| {
                assert!(!cp.is_due());
                cp.checkpoint();
                assert_eq!(cp.taken(), 0);
            })
            .unwrap();
    }

    #[test]
    fn loop_body_runs_native() {
        let mutator = mutator();
        let (inside, after_checkpoint) = mutator
            .with_checkpoint_policy(CheckpointPolicy::Always, |cp| {
                let inside = mutator.current_state();
                cp.checkpoint();
                (inside, mutator.current_state())
            })
            .unwrap();
        assert_eq!(inside, ThreadState::Native);
        assert_eq!(after_checkpoint, ThreadState::Native);
        assert_eq!(mutator.current_state(), ThreadState::Managed);
    }
}
