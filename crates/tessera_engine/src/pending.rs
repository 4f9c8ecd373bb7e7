//! The request-completion protocol between engines and the access layer.

use crate::error::{EngineError, EngineResult};
use std::sync::mpsc::{self, Receiver, Sender};

/// One pending asynchronous engine operation.
///
/// An engine starts every operation by creating a [`Completion`]/`Pending`
/// pair, hands the `Pending` back to the caller, and settles the
/// `Completion` exactly once when the work finishes. The caller blocks on
/// [`Pending::wait`] and observes the result no earlier than the engine
/// signals it.
///
/// Dropping a `Pending` abandons the result without disturbing the engine:
/// the completion's send simply becomes a no-op.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<EngineResult<T>>,
}

impl<T> Pending<T> {
    /// Creates a linked completion/pending pair.
    #[must_use]
    pub fn pair() -> (Completion<T>, Pending<T>) {
        let (tx, rx) = mpsc::channel();
        (Completion { tx }, Pending { rx })
    }

    /// Creates a pending result that is already settled.
    ///
    /// Convenience for engines that finish work before returning.
    #[must_use]
    pub fn settled(result: EngineResult<T>) -> Self {
        let (completion, pending) = Self::pair();
        completion.settle(result);
        pending
    }

    /// Blocks until the engine settles this request.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or an unknown error if the engine
    /// dropped the completion without settling it.
    pub fn wait(self) -> EngineResult<T> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(EngineError::unknown("engine dropped request completion")))
    }
}

/// The engine-side half of a pending request.
#[derive(Debug)]
pub struct Completion<T> {
    tx: Sender<EngineResult<T>>,
}

impl<T> Completion<T> {
    /// Settles the request with a result.
    ///
    /// If the caller abandoned the pending half this is a no-op.
    pub fn settle(self, result: EngineResult<T>) {
        let _ = self.tx.send(result);
    }

    /// Settles the request successfully.
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    /// Settles the request with an error.
    pub fn reject(self, error: EngineError) {
        self.settle(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_then_wait() {
        let (completion, pending) = Pending::pair();
        completion.resolve(42u32);
        assert_eq!(pending.wait().unwrap(), 42);
    }

    #[test]
    fn reject_then_wait() {
        let (completion, pending) = Pending::<()>::pair();
        completion.reject(EngineError::TransactionInactive);
        assert!(matches!(
            pending.wait(),
            Err(EngineError::TransactionInactive)
        ));
    }

    #[test]
    fn abandoned_pending_does_not_block_completion() {
        let (completion, pending) = Pending::pair();
        drop(pending);
        completion.resolve(1u8);
    }

    #[test]
    fn dropped_completion_surfaces_as_error() {
        let (completion, pending) = Pending::<u8>::pair();
        drop(completion);
        assert!(matches!(pending.wait(), Err(EngineError::Unknown { .. })));
    }

    #[test]
    fn settled_is_immediate() {
        let pending = Pending::settled(Ok(7i32));
        assert_eq!(pending.wait().unwrap(), 7);
    }
}
