//! Storage traits and backends for KyroLog.
//!
//! The engine is written against [`EventLog`] and [`CommandLog`]; the
//! in-memory backends in [`memory`] are the reference implementation.

pub mod memory;
mod traits;

pub use memory::{InMemoryCommandLog, InMemoryEventLog};
pub use traits::{
    CommandLog, DeletedMarker, EventLog, RewriteMarker, RewritePhase, StorageError, StreamInfo,
};
