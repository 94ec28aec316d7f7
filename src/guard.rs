//! Scoped `Managed -> Native` transitions around foreign calls.
//!
//! While a thread is inside a guard the coordinator treats it as safe and
//! never waits for it. The guard restores the previous state on every exit
//! path, unwinding included. A thread that returns to managed code while a
//! collection is pending parks on the way back in.
use crate::{
    error::Result,
    threading::{Mutator, ThreadState},
};
use std::thread;
use tracing::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Plain guarded call: native for the whole duration
    Strict,
    /// Safepoint-aware loop: the callee steps back into managed code at
    /// checkpoints
    Polling,
}

/// What a guard needs to undo its transition.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'m> {
    mutator: &'m Mutator,
    pre_call: ThreadState,
    mode: GuardMode,
}

impl<'m> CallContext<'m> {
    pub fn mutator(&self) -> &'m Mutator {
        self.mutator
    }

    pub fn pre_call_state(&self) -> ThreadState {
        self.pre_call
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }
}

/// RAII marker for a native region.
///
/// ```no_run
/// # use gc_bridge::{BridgeConfig, CollectorCoordinator, NativeStateGuard, NullCollector};
/// let coordinator = CollectorCoordinator::new(BridgeConfig::default(), NullCollector);
/// let mutator = coordinator.register_thread()?;
/// {
///     let guard = NativeStateGuard::enter(&mutator)?;
///     // foreign work, no managed references touched
///     guard.reenter_managed(|m| m.poll_safepoint())?;
/// }
/// # Ok::<(), gc_bridge::BridgeError>(())
/// ```
#[must_use = "the thread returns to managed state as soon as the guard is dropped"]
pub struct NativeStateGuard<'m> {
    context: CallContext<'m>,
}

impl<'m> NativeStateGuard<'m> {
    /// Fails with `IllegalTransition` if the thread is already native.
    pub fn enter(mutator: &'m Mutator) -> Result<Self> {
        Self::enter_with_mode(mutator, GuardMode::Strict)
    }

    pub(crate) fn enter_with_mode(mutator: &'m Mutator, mode: GuardMode) -> Result<Self> {
        let pre_call = mutator.cell().execution_state();
        mutator.transition_to(ThreadState::Native)?;
        trace!(thread = %mutator.key(), ?mode, "entered native region");
        Ok(Self {
            context: CallContext {
                mutator,
                pre_call,
                mode,
            },
        })
    }

    pub fn context(&self) -> &CallContext<'m> {
        &self.context
    }

    pub fn mode(&self) -> GuardMode {
        self.context.mode
    }

    pub fn mutator(&self) -> &'m Mutator {
        self.context.mutator
    }

    /// Call back into managed code from inside the native region.
    ///
    /// The thread becomes `Managed` for the duration of `f` (parking first if
    /// a collection is pending) and is native again when this returns or
    /// unwinds.
    pub fn reenter_managed<R>(&self, f: impl FnOnce(&'m Mutator) -> R) -> Result<R> {
        let mutator = self.context.mutator;
        let _scope = ManagedScope::enter(mutator)?;
        mutator.poll_safepoint();
        Ok(f(mutator))
    }
}

impl Drop for NativeStateGuard<'_> {
    fn drop(&mut self) {
        let mutator = self.context.mutator;
        if let Err(err) = mutator.transition_to(self.context.pre_call) {
            restore_failed(&err.to_string());
        }
        trace!(thread = %mutator.key(), "left native region");
    }
}

/// Temporary managed window inside a native region.
pub(crate) struct ManagedScope<'m> {
    mutator: &'m Mutator,
}

impl<'m> ManagedScope<'m> {
    pub(crate) fn enter(mutator: &'m Mutator) -> Result<Self> {
        mutator.transition_to(ThreadState::Managed)?;
        Ok(Self { mutator })
    }
}

impl Drop for ManagedScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutator.transition_to(ThreadState::Native) {
            restore_failed(&err.to_string());
        }
    }
}

fn restore_failed(err: &str) {
    error!(%err, "failed to restore thread state");
    // A second panic while unwinding would abort the process.
    if !thread::panicking() {
        panic!("failed to restore thread state: {err}");
    }
}

impl Mutator {
    /// Run `f` as a foreign call. The thread is `Native` while `f` runs and
    /// `Managed` again afterwards, however `f` exits. `f`'s result is passed
    /// through untouched.
    pub fn with_native_guard<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let guard = NativeStateGuard::enter(self)?;
        let out = f();
        drop(guard);
        Ok(out)
    }

    /// Run `f` with no transition at all: the thread keeps reporting
    /// `Managed` while it cannot reach a safepoint. Any collection requested
    /// meanwhile waits for it and eventually trips the watchdog.
    pub fn call_unguarded<T>(&self, f: impl FnOnce() -> T) -> T {
        trace!(thread = %self.key(), "unguarded foreign call");
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BridgeConfig,
        error::{BridgeError, TransitionFault},
        gc::{CollectorCoordinator, NullCollector},
    };
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn mutator() -> Mutator {
        CollectorCoordinator::new(BridgeConfig::default(), NullCollector)
            .register_thread()
            .unwrap()
    }

    #[test]
    fn native_only_inside_guard() {
        let mutator = mutator();
        let seen = mutator.with_native_guard(|| 42).unwrap();
        assert_eq!(seen, 42);
        assert_eq!(mutator.current_state(), ThreadState::Managed);

        let inside = mutator
            .with_native_guard(|| mutator.current_state())
            .unwrap();
        assert_eq!(inside, ThreadState::Native);
    }

    #[test]
    fn inner_errors_pass_through() {
        let mutator = mutator();
        let out: Result<std::result::Result<(), &str>> = mutator.with_native_guard(|| Err("boom"));
        assert_eq!(out, Ok(Err("boom")));
        assert_eq!(mutator.current_state(), ThreadState::Managed);
    }

    #[test]
    fn panics_restore_managed() {
        let mutator = mutator();
        let result = catch_unwind(AssertUnwindSafe(|| {
            mutator.with_native_guard(|| panic!("foreign failure")).unwrap();
        }));
        assert!(result.is_err());
        assert_eq!(mutator.current_state(), ThreadState::Managed);
    }

    #[test]
    fn nested_guard_is_rejected() {
        let mutator = mutator();
        let nested = mutator
            .with_native_guard(|| NativeStateGuard::enter(&mutator).map(|_| ()))
            .unwrap();
        assert!(matches!(
            nested,
            Err(BridgeError::IllegalTransition {
                from: ThreadState::Native,
                to: ThreadState::Native,
                reason: TransitionFault::InvalidDirection,
                ..
            })
        ));
        assert_eq!(mutator.current_state(), ThreadState::Managed);
    }

    #[test]
    fn callbacks_run_managed() {
        let mutator = mutator();
        let guard = NativeStateGuard::enter(&mutator).unwrap();
        assert_eq!(guard.mode(), GuardMode::Strict);
        assert_eq!(guard.context().pre_call_state(), ThreadState::Managed);

        let during = guard.reenter_managed(|m| m.current_state()).unwrap();
        assert_eq!(during, ThreadState::Managed);
        assert_eq!(mutator.current_state(), ThreadState::Native);

        drop(guard);
        assert_eq!(mutator.current_state(), ThreadState::Managed);
    }

    #[test]
    fn unguarded_call_stays_managed() {
        let mutator = mutator();
        let state = mutator.call_unguarded(|| mutator.current_state());
        assert_eq!(state, ThreadState::Managed);
    }
}
