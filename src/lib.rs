//! # KyroLog - branchable event sourcing
//!
//! KyroLog layers git-like timelines, causal dependency tracking and
//! retroactive rewrites on top of an append-only event log.
//!
//! ## Core Concepts
//!
//! - **Timeline**: a named line of history; branching one is copy-on-write
//! - **Stream**: an ordered, gapless sequence of events inside a timeline
//! - **Causality graph**: a DAG over streams, events and commands with a
//!   Merkle hash chain per stream
//! - **Retroactive rewrite**: inserting into or removing from the middle of a
//!   stream without editing the log in place
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kyrolog::{
//!     BranchOptions, EventDraft, ExpectedVersion, StreamDescriptor, TimelineId, TimelineStore,
//! };
//! use serde_json::json;
//!
//! let store = TimelineStore::in_memory()?;
//! let master = store.root_context();
//! let root = StreamDescriptor::aggregate("Root", "1");
//! let created = vec![EventDraft::new("RootCreated", json!({}))];
//! store.append(&master, &root, created, ExpectedVersion::Any)?;
//!
//! let name = TimelineId::new("test")?;
//! let test = store.branch(&master, &name, store.clock().now(), &BranchOptions::default())?;
//! let updated = vec![EventDraft::new("RootUpdated", json!({}))];
//! store.append(&test, &root, updated, ExpectedVersion::Any)?;
//! store.merge(&master, test.timeline(), false)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Values and identity
pub mod error;
pub mod message;
pub mod stream;
pub mod time;

// Storage and graph
pub mod causality;
pub mod storage;

// Store and its operations
pub mod branch;
pub mod bus;
pub mod config;
pub mod retroactive;
pub mod signal;
pub mod store;

// Execution
pub mod engine;

pub use branch::{
    BranchOptions, FastForwardResult, FastForwardStatus, MergeOutcome, StreamConflict,
    TransferFailure,
};
pub use bus::{CommandBus, FnBus};
pub use causality::{CancellationToken, CausalityGraph, EdgeKind, Vertex, VertexId};
pub use config::StoreConfig;
pub use engine::runtime::{ExecutionHandle, TimelineRuntime};
pub use engine::{Operation, Response, TimelineEngine};
pub use error::{CorruptionError, ExecutionError, KyroError, KyroResult, ValidationError};
pub use message::{Command, CommandDraft, ContentHash, Event, EventDraft, MessageId};
pub use retroactive::{
    InsertOutcome, InvalidEvent, InvalidReason, RecoveryAction, RollbackOutcome,
};
pub use signal::{Signal, SignalBus, SignalStream};
pub use storage::{
    CommandLog, EventLog, InMemoryCommandLog, InMemoryEventLog, RewriteMarker, RewritePhase,
    StorageError,
};
pub use store::TimelineStore;
pub use stream::{
    ExpectedVersion, Stream, StreamDescriptor, StreamFilter, StreamKey, StreamKind, StreamRef,
    StreamVersion, TimelineContext, TimelineId,
};
pub use time::{ClockSource, HybridClock, LogicalTime, ManualClock, SystemClock};
