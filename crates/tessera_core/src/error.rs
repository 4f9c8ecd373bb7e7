//! Error types for the access layer.
//!
//! The taxonomy is flat: one error kind with a [`ErrorCode`] discriminant.
//! Engine-native errors are never exposed directly — every one is wrapped
//! at the request-adapter boundary, preserving the original error as an
//! inspectable cause.

use crate::request::RequestContext;
use tessera_engine::{EngineError, Key};
use thiserror::Error;

/// Result type for access-layer operations.
pub type DbResult<T> = Result<T, DbError>;

/// Discriminant codes for [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required record is absent.
    NotFound,
    /// A key or unique-indexed value is already present.
    Constraint,
    /// Host storage quota exhausted.
    QuotaExceeded,
    /// The transaction was rolled back.
    TransactionAborted,
    /// Use after transaction finish, or out-of-scope store access.
    TransactionInactive,
    /// Schema migration failure.
    UpgradeFailed,
    /// Upgrade blocked by other open connections.
    UpgradeBlocked,
    /// Connection could not be established.
    OpenFailed,
    /// A value could not serve the requested operation.
    Data,
    /// A write was attempted through a readonly scope.
    ReadOnly,
    /// Engine version mismatch.
    Version,
    /// Operation not permitted in the current state.
    InvalidState,
    /// The engine reported a timeout.
    Timeout,
    /// Native failure with no closer semantic match.
    Unknown,
}

/// Errors surfaced by every Tessera operation.
#[derive(Debug, Error)]
pub enum DbError {
    /// A key required by `resolve` is absent.
    ///
    /// Record-level absence; distinct from [`DbError::StoreNotFound`] and
    /// [`DbError::IndexNotFound`], which are configuration errors.
    #[error("key not found in store {store}: {key}")]
    NotFound {
        /// Store searched.
        store: String,
        /// The missing key.
        key: Key,
    },

    /// A key or unique-indexed value is already present.
    #[error("constraint violation in store {store}")]
    Constraint {
        /// Store receiving the write.
        store: String,
        /// The engine's constraint error.
        #[source]
        source: EngineError,
    },

    /// Host storage quota exhausted.
    #[error("quota exceeded writing to store {store}")]
    QuotaExceeded {
        /// Store receiving the write.
        store: String,
        /// The engine's quota error.
        #[source]
        source: EngineError,
    },

    /// The transaction was rolled back.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Why the transaction rolled back.
        reason: String,
    },

    /// Use after finish, or out-of-scope store access.
    #[error("transaction inactive: {message}")]
    TransactionInactive {
        /// What was attempted and the valid scope where relevant.
        message: String,
    },

    /// Schema migration failure.
    #[error("upgrade failed: {message}")]
    UpgradeFailed {
        /// Description of the failure.
        message: String,
    },

    /// Upgrade blocked by other open connections.
    #[error("upgrade blocked: {message}")]
    UpgradeBlocked {
        /// Description of the blockage.
        message: String,
    },

    /// Connection could not be established.
    #[error("open failed: {message}")]
    OpenFailed {
        /// Description of the failure.
        message: String,
    },

    /// The store name is not declared in the schema.
    #[error("store not declared in schema: {name}")]
    StoreNotFound {
        /// The undeclared name.
        name: String,
    },

    /// The index name is not declared on the store.
    #[error("index {name} not declared on store {store}")]
    IndexNotFound {
        /// Store searched.
        store: String,
        /// The undeclared index name.
        name: String,
    },

    /// A value could not serve the requested operation.
    #[error("data error: {message}")]
    Data {
        /// What was wrong with the data.
        message: String,
        /// The engine's data error, when the engine raised it.
        #[source]
        source: Option<EngineError>,
    },

    /// A write through a readonly scope.
    #[error("store {store} is readonly in this scope")]
    ReadOnly {
        /// Store receiving the write.
        store: String,
        /// The engine's error.
        #[source]
        source: EngineError,
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

    /// The engine reported a timeout.
    #[error("timeout: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// Native failure with no closer semantic match.
    #[error("engine failure")]
    Unknown {
        /// The engine's error.
        #[source]
        source: EngineError,
    },
}

impl DbError {
    /// Returns the discriminant code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Constraint { .. } => ErrorCode::Constraint,
            Self::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Self::TransactionAborted { .. } => ErrorCode::TransactionAborted,
            Self::TransactionInactive { .. } => ErrorCode::TransactionInactive,
            Self::UpgradeFailed { .. } => ErrorCode::UpgradeFailed,
            Self::UpgradeBlocked { .. } => ErrorCode::UpgradeBlocked,
            Self::OpenFailed { .. } => ErrorCode::OpenFailed,
            Self::StoreNotFound { .. } | Self::IndexNotFound { .. } | Self::InvalidState { .. } => {
                ErrorCode::InvalidState
            }
            Self::Data { .. } => ErrorCode::Data,
            Self::ReadOnly { .. } => ErrorCode::ReadOnly,
            Self::Version { .. } => ErrorCode::Version,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Unknown { .. } => ErrorCode::Unknown,
        }
    }

    /// The key carried by a record-level not-found error, if any.
    #[must_use]
    pub fn key(&self) -> Option<&Key> {
        match self {
            Self::NotFound { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a data error with no engine cause.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transaction-aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(error: serde_json::Error) -> Self {
        Self::Data {
            message: error.to_string(),
            source: None,
        }
    }
}

/// Wraps an engine error into the typed hierarchy, attaching request
/// context where the engine did not carry it.
pub(crate) fn map_engine_error(error: EngineError, ctx: &RequestContext) -> DbError {
    match error {
        EngineError::Constraint { ref store, .. } => DbError::Constraint {
            store: store.clone(),
            source: error,
        },
        EngineError::QuotaExceeded { ref store, .. } => DbError::QuotaExceeded {
            store: store.clone(),
            source: error,
        },
        EngineError::TransactionInactive => DbError::TransactionInactive {
            message: match &ctx.store {
                Some(store) => format!("operation on store {store} after transaction finished"),
                None => "operation after transaction finished".to_string(),
            },
        },
        EngineError::ReadOnly { store } => DbError::ReadOnly {
            store: store.clone(),
            source: EngineError::ReadOnly { store },
        },
        EngineError::Data { ref message } => DbError::Data {
            message: match ctx.describe() {
                Some(target) => format!("{message} ({target})"),
                None => message.clone(),
            },
            source: Some(error),
        },
        EngineError::Abort => DbError::aborted("engine rolled the transaction back"),
        EngineError::UnknownStore { name } => DbError::StoreNotFound { name },
        EngineError::OutOfScope { name, scope } => DbError::TransactionInactive {
            message: format!("store {name} is outside this transaction's scope {scope:?}"),
        },
        EngineError::UnknownIndex { store, name } => DbError::IndexNotFound { store, name },
        EngineError::Version { message } => DbError::Version { message },
        EngineError::InvalidState { message } => DbError::InvalidState { message },
        EngineError::Unknown { .. } => DbError::Unknown { source: error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        let not_found = DbError::NotFound {
            store: "users".into(),
            key: Key::text("u1"),
        };
        assert_eq!(not_found.code(), ErrorCode::NotFound);
        assert_eq!(not_found.key(), Some(&Key::text("u1")));

        assert_eq!(
            DbError::StoreNotFound { name: "x".into() }.code(),
            ErrorCode::InvalidState
        );
        assert_eq!(
            DbError::aborted("test").code(),
            ErrorCode::TransactionAborted
        );
    }

    #[test]
    fn engine_cause_is_preserved() {
        let engine = EngineError::Constraint {
            store: "users".into(),
            index: Some("byEmail".into()),
            key: Key::text("a@x.com"),
        };
        let wrapped = map_engine_error(engine, &RequestContext::store("users"));
        assert_eq!(wrapped.code(), ErrorCode::Constraint);
        assert!(std::error::Error::source(&wrapped).is_some());
    }

    #[test]
    fn out_of_scope_names_the_scope() {
        let engine = EngineError::OutOfScope {
            name: "posts".into(),
            scope: vec!["users".into()],
        };
        let wrapped = map_engine_error(engine, &RequestContext::none());
        assert_eq!(wrapped.code(), ErrorCode::TransactionInactive);
        assert!(wrapped.to_string().contains("users"));
    }
}
