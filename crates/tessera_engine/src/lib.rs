//! # Tessera Engine
//!
//! Engine boundary for Tessera.
//!
//! This crate defines the lowest-level abstraction Tessera builds on: a
//! transactional key-value engine with secondary indexes. Engines are
//! **request-driven** — every operation hands back a [`Pending`] completion
//! that settles once the engine has finished the work, and the access layer
//! above adapts those completions into sequential code.
//!
//! ## Design Principles
//!
//! - Engines own storage, atomicity, and index maintenance; Tessera owns
//!   typing, change notification, and ergonomics
//! - Transactions are scoped to a fixed set of stores decided at begin time
//! - Keys follow one total order: number < date < text < binary < array,
//!   with arrays compared element-wise
//! - Must be `Send + Sync` so handles can cross threads
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - reference implementation for testing and ephemeral
//!   storage
//!
//! ## Example
//!
//! ```rust
//! use tessera_engine::{Engine, Key, MemoryEngine, Mode, Schema, StoreDefinition};
//!
//! let schema = Schema::new().store(StoreDefinition::new("users").key_path("id"));
//! let engine = MemoryEngine::new(schema);
//!
//! let txn = engine.begin(&["users"], Mode::ReadWrite).unwrap();
//! let users = txn.store("users").unwrap();
//! users
//!     .put(serde_json::json!({"id": "u1", "name": "Ada"}), None)
//!     .wait()
//!     .unwrap();
//! txn.commit().wait().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod key;
mod keypath;
mod memory;
mod schema;

pub use engine::{
    CursorHandle, CursorRow, CursorStep, Engine, EngineTransaction, IndexHandle, Mode, StoreHandle,
};
pub use error::{EngineError, EngineResult};
pub use key::{Direction, Key, KeyRange, Query};
pub use keypath::{index_keys, key_from_value};
pub use memory::MemoryEngine;
pub use schema::{IndexDefinition, KeyPath, Schema, StoreDefinition, TtlConfig};

mod pending;
pub use pending::{Completion, Pending};
