use crate::threading::{ThreadKey, ThreadState};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Illegal transition on thread {thread}: {from:?} -> {to:?} ({reason})")]
    IllegalTransition {
        thread: ThreadKey,
        from: ThreadState,
        to: ThreadState,
        reason: TransitionFault,
    },

    #[error("Stale acknowledgement from thread {thread}: acknowledged epoch {acknowledged}, current request {current:?}")]
    StaleAcknowledgement {
        thread: ThreadKey,
        acknowledged: u64,
        current: Option<u64>,
    },

    #[error("Collection {epoch} stalled for {waited:?}; threads never reached a safe state: {pending:?}")]
    UnboundedStall {
        epoch: u64,
        waited: Duration,
        pending: Vec<ThreadKey>,
    },

    #[error("Thread is already registered as {0}")]
    AlreadyRegistered(ThreadKey),

    #[error("Thread {0} is not registered")]
    NotRegistered(ThreadKey),

    #[error("Native library error: {0}")]
    NativeLibrary(#[from] NativeLibraryError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransitionFault {
    #[error("caller does not own the cell")]
    NotOwner,
    #[error("invalid direction")]
    InvalidDirection,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NativeLibraryError {
    #[error("Unable to find library '{0}'")]
    LibraryNotFound(String),
    #[error("Unable to find entry point '{1}' in library '{0}'")]
    SymbolNotFound(String, String),
    #[error("Failed to load library '{0}': {1}")]
    LoadError(String, String),
}

impl BridgeError {
    pub fn is_stall(&self) -> bool {
        matches!(self, BridgeError::UnboundedStall { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_readable_messages() {
        let err = BridgeError::IllegalTransition {
            thread: ThreadKey::new(3),
            from: ThreadState::Native,
            to: ThreadState::Native,
            reason: TransitionFault::InvalidDirection,
        };
        assert_eq!(
            err.to_string(),
            "Illegal transition on thread T3: Native -> Native (invalid direction)"
        );

        let err = NativeLibraryError::SymbolNotFound("libc".into(), "nope".into());
        assert_eq!(
            err.to_string(),
            "Unable to find entry point 'nope' in library 'libc'"
        );
    }

    #[test]
    fn stall_is_detectable() {
        let err = BridgeError::UnboundedStall {
            epoch: 1,
            waited: Duration::from_millis(100),
            pending: vec![ThreadKey::new(1)],
        };
        assert!(err.is_stall());
        assert!(!BridgeError::NotRegistered(ThreadKey::new(1)).is_stall());
    }
}
