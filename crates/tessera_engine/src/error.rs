//! Error types for engine operations.

use crate::key::Key;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the engine itself.
///
/// The access layer above never exposes these directly; every one is
/// wrapped into the typed hierarchy at the request-adapter boundary with
/// the original error preserved as a cause.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A key or unique index value is already present.
    #[error("constraint violation in store {store} on key {key}")]
    Constraint {
        /// Store where the violation occurred.
        store: String,
        /// Violated unique index, if the clash was on an index key.
        index: Option<String>,
        /// The conflicting key.
        key: Key,
    },

    /// The storage quota is exhausted.
    #[error("quota exceeded in store {store}: {used} of {limit} bytes used")]
    QuotaExceeded {
        /// Store receiving the write.
        store: String,
        /// Bytes in use.
        used: u64,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// The transaction already finished.
    #[error("transaction is no longer active")]
    TransactionInactive,

    /// A write was attempted through a readonly transaction.
    #[error("store {store} is readonly in this transaction")]
    ReadOnly {
        /// Store receiving the write.
        store: String,
    },

    /// A value could not serve the requested operation.
    #[error("data error: {message}")]
    Data {
        /// What was wrong with the data.
        message: String,
    },

    /// The transaction was rolled back.
    #[error("transaction aborted")]
    Abort,

    /// The requested store is not declared in the schema.
    #[error("unknown store: {name}")]
    UnknownStore {
        /// The undeclared name.
        name: String,
    },

    /// The requested store is outside the transaction's scope.
    #[error("store {name} is not in this transaction's scope ({scope:?})")]
    OutOfScope {
        /// The requested name.
        name: String,
        /// The transaction's fixed scope.
        scope: Vec<String>,
    },

    /// The requested index is not declared on the store.
    #[error("unknown index {name} on store {store}")]
    UnknownIndex {
        /// The store searched.
        store: String,
        /// The undeclared index name.
        name: String,
    },

    /// Engine version mismatch.
    #[error("version error: {message}")]
    Version {
        /// Description of the mismatch.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Why the operation is invalid.
        message: String,
    },

    /// Any other engine failure.
    #[error("engine error: {message}")]
    Unknown {
        /// Description of the failure.
        message: String,
    },
}

impl EngineError {
    /// Creates a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an unknown error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }
}
