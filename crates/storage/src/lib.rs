//! SQLite-backed persistence for AI function executions.
//!
//! This crate provides the two stores an execution engine may lean on:
//!
//! 1. **Event log**: [`EventStore`] keeps every lifecycle event of every
//!    execution (function start/end, model calls, tool calls, retries),
//!    enabling "why did it answer that?" debugging after the fact.
//!
//! 2. **Response cache**: [`CacheStore`] keeps model outputs keyed by a
//!    content hash, with per-entry TTL and a bounded row count.
//!
//! Both stores wrap a single SQLite connection behind a mutex and hold the
//! lock for one statement at a time, so they can be shared across
//! concurrent executions.
//!
//! # Example
//!
//! ```no_run
//! use storage::{Event, EventKind, EventStore, ExecutionId};
//!
//! let store = EventStore::open("events.db")?;
//!
//! let execution = ExecutionId::new();
//! store.append(&Event::new(execution, EventKind::AiFunctionStart).with_function("adder"))?;
//! store.append(&Event::new(execution, EventKind::AiFunctionEnd).with_function("adder"))?;
//!
//! for summary in store.list_executions()? {
//!     println!("{}: {} events", summary.id, summary.event_count);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod cache;
mod error;
mod event;
mod store;

pub use cache::{CacheStore, DEFAULT_CAPACITY};
pub use error::{Error, Result};
pub use event::{Event, EventKind, ExecutionId};
pub use store::{EventStore, ExecutionSummary};
