//! Tessera: a strongly-typed access layer over transactional,
//! index-capable key-value engines.
//!
//! The crate wraps an [`Engine`] (such as the in-memory engine from
//! `tessera_engine`) behind typed surfaces: a [`Database`] connection,
//! per-type [`Store`] handles, secondary [`Index`] lookups, consuming
//! [`Cursor`] navigation, declarative [`QueryBuilder`] scans, opt-in TTL
//! expiry, and committed-change notification with optional cross-context
//! broadcast over a [`BroadcastBus`].
//!
//! Records are any `serde::Serialize + DeserializeOwned` type; keys follow
//! a total order over numbers, dates, text, binary, and arrays.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tessera_core::{Database, IndexDefinition, Schema, StoreDefinition};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     email: String,
//! }
//!
//! let schema = Schema::new().store(
//!     StoreDefinition::new("users")
//!         .key_path("id")
//!         .index(IndexDefinition::new("byEmail", "email").unique()),
//! );
//! let db = Database::open_in_memory("app", schema);
//!
//! let users = db.store::<User>("users")?;
//! users.set(&User {
//!     id: "u1".into(),
//!     email: "alice@example.com".into(),
//! })?;
//!
//! let alice = users.index("byEmail")?.resolve("alice@example.com")?;
//! assert_eq!(alice.id, "u1");
//! # Ok::<(), tessera_core::DbError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod database;
mod error;
mod events;
mod index;
mod iter;
mod query;
mod request;
mod store;
mod sync;
mod transaction;

pub use cursor::{Cursor, CursorOptions, KeyCursor};
pub use database::Database;
pub use error::{DbError, DbResult, ErrorCode};
pub use events::{ChangeEvent, ChangeKind, ChangeSource, ListenerError, Subscription};
pub use index::{Index, TransactionIndex};
pub use iter::{IterateOptions, KeyIter, RecordIter};
pub use query::QueryBuilder;
pub use store::{PruneStats, Store, TransactionStore};
pub use sync::{channel_for, BroadcastBus, BusHandler, LocalBus, CHANNEL_PREFIX};
pub use transaction::Transaction;

pub use tessera_engine::{
    Direction, Engine, IndexDefinition, Key, KeyPath, KeyRange, MemoryEngine, Mode, Query, Schema,
    StoreDefinition, TtlConfig,
};
