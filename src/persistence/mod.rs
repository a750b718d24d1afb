//! Async persistence — §5, §6.
//!
//! The kernel never writes to the store inline: every mutation enqueues a
//! [`queue::PersistenceTask`] onto a bounded channel and a background worker
//! drains it against a [`store::Store`]. A slow or unreachable database
//! degrades persistence, never order execution.

pub mod queue;
pub mod store;

pub use queue::{PersistenceQueue, PersistenceTask};
pub use store::{SqliteStore, Store};
