//! `shardq-store`: durable storage for events and the transactional outbox.
//!
//! # Overview
//!
//! The worker pipeline talks to storage only through the [`EventStore`]
//! trait. Every trait method runs as a single transaction:
//!
//! | Operation            | Transaction                                             |
//! |----------------------|---------------------------------------------------------|
//! | `claim_due`          | select due `PENDING` rows, mark `IN_PROGRESS`, commit   |
//! | `complete_batch`     | insert outbox rows + save terminal statuses, or nothing |
//! | `reset_stale_claims` | return abandoned `IN_PROGRESS` rows to `PENDING`        |
//! | `delete_outbox`      | remove rows confirmed by the message bus                |
//!
//! Two implementations ship:
//!
//! - [`SqliteStore`]: on-disk store shared by every node pointing at the same
//!   database file. Writers serialize on `BEGIN IMMEDIATE`, so no two claims
//!   can return the same row.
//! - [`MemoryStore`]: in-process store with explicit row locks that claims
//!   skip, used by tests and single-process deployments.

pub mod db;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{MemoryStore, RowLock};
pub use sqlite::SqliteStore;
pub use store::EventStore;
