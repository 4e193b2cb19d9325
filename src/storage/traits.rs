//! Abstract storage traits for KyroLog.
//!
//! These traits define the contract that storage backends must implement.
//! The engine only ever talks to an [`EventLog`] and a [`CommandLog`], so an
//! external event store can be plugged in behind them:
//! - In-memory backends for testing and embedded use
//! - Persistent backends for production

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Command, Event, MessageId};
use crate::stream::{
    ExpectedVersion, StreamFilter, StreamKey, StreamMetadata, StreamVersion, TimelineId,
};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Optimistic concurrency check failed.
    #[error("Wrong expected version for {key}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        /// Stream key.
        key: String,
        /// Rendered expectation.
        expected: String,
        /// Version found.
        actual: StreamVersion,
    },

    /// Stream not found.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// A run of own events removed by truncation.
///
/// `at` is the own-event index at which the removed run started; `count`
/// physical positions were consumed and will never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedMarker {
    /// Own-event index where the removed run began.
    pub at: u64,
    /// Number of physical positions consumed by the run.
    pub count: u64,
}

/// Snapshot of one physical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream key.
    pub key: StreamKey,
    /// Ancestor pointer and kind.
    pub metadata: StreamMetadata,
    /// Number of live own events.
    pub live_count: u64,
    /// Truncation history, ordered by `at`.
    pub deleted: Vec<DeletedMarker>,
}

impl StreamInfo {
    /// Total physical positions consumed by truncations.
    #[must_use]
    pub fn deleted_count(&self) -> u64 {
        self.deleted.iter().map(|m| m.count).sum()
    }

    /// First logical version stored in this stream.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.metadata.parent.as_ref().map_or(0, |p| p.version.count())
    }

    /// Current logical version.
    #[must_use]
    pub fn version(&self) -> StreamVersion {
        StreamVersion::from_count(self.base() + self.live_count)
    }
}

/// Progress of a multi-step retroactive rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewritePhase {
    /// The temporary timeline exists.
    Branched,
    /// New and re-appended events are in the temporary timeline.
    Written,
    /// The original stream has been truncated.
    Trimmed,
    /// The temporary timeline has been merged back.
    Merged,
}

/// Durable record of an in-flight retroactive rewrite.
///
/// Written before each step and cleared once the temporary timeline is gone,
/// so a crash mid-rewrite can be rolled back or forward on restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteMarker {
    /// Stream being rewritten.
    pub stream: StreamKey,
    /// Scratch timeline holding the rewritten tail.
    pub temp_timeline: TimelineId,
    /// Version at which the rewrite splices.
    pub version: u64,
    /// Last completed step.
    pub phase: RewritePhase,
    /// When the rewrite began.
    pub started_at: DateTime<Utc>,
}

/// Storage contract for streams of events.
///
/// Positions passed to [`EventLog::read_stream`] are physical: they are
/// assigned on append and never reused, so truncation leaves gaps that the
/// registry maps over via [`DeletedMarker`]s.
pub trait EventLog: Send + Sync {
    /// Lists streams, optionally restricted to one timeline.
    fn list_streams(
        &self,
        timeline: Option<&TimelineId>,
        filter: &StreamFilter,
    ) -> Result<Vec<StreamInfo>, StorageError>;

    /// Returns a stream snapshot, or `None` if it does not exist.
    fn stream_info(&self, key: &StreamKey) -> Result<Option<StreamInfo>, StorageError>;

    /// Creates an empty stream. Fails with `DuplicateKey` if it exists.
    fn create_stream(
        &self,
        key: &StreamKey,
        metadata: StreamMetadata,
    ) -> Result<StreamInfo, StorageError>;

    /// Reads up to `count` live events starting at physical `from_position`.
    fn read_stream(
        &self,
        key: &StreamKey,
        from_position: u64,
        count: u64,
    ) -> Result<Vec<Event>, StorageError>;

    /// Appends events whose versions continue the stream's logical version.
    ///
    /// Returns the new logical version.
    fn append_to_stream(
        &self,
        key: &StreamKey,
        events: Vec<Event>,
        expected: ExpectedVersion,
    ) -> Result<StreamVersion, StorageError>;

    /// Removes own events with a logical version greater than `keep`.
    ///
    /// Returns the removed events.
    fn truncate_stream(
        &self,
        key: &StreamKey,
        keep: StreamVersion,
    ) -> Result<Vec<Event>, StorageError>;

    /// Deletes a stream and all its own events.
    fn delete_stream(&self, key: &StreamKey) -> Result<(), StorageError>;

    /// Reads stream metadata.
    fn get_stream_metadata(&self, key: &StreamKey) -> Result<Option<StreamMetadata>, StorageError>;

    /// Replaces stream metadata.
    fn set_stream_metadata(
        &self,
        key: &StreamKey,
        metadata: StreamMetadata,
    ) -> Result<(), StorageError>;

    /// Inserts or replaces the rewrite marker for `marker.stream`.
    fn put_rewrite_marker(&self, marker: &RewriteMarker) -> Result<(), StorageError>;

    /// Lists outstanding rewrite markers.
    fn list_rewrite_markers(&self) -> Result<Vec<RewriteMarker>, StorageError>;

    /// Removes the rewrite marker for `stream`, if any.
    fn clear_rewrite_marker(&self, stream: &StreamKey) -> Result<(), StorageError>;
}

/// Storage contract for per-timeline command logs.
pub trait CommandLog: Send + Sync {
    /// Appends a command to its timeline's log.
    fn append(&self, command: Command) -> Result<(), StorageError>;

    /// Lists a timeline's commands in append order.
    fn list(&self, timeline: &TimelineId) -> Result<Vec<Command>, StorageError>;

    /// Removes commands by id. Returns how many were removed.
    fn remove(&self, timeline: &TimelineId, ids: &[MessageId]) -> Result<usize, StorageError>;

    /// Drops a timeline's whole log.
    fn delete_timeline(&self, timeline: &TimelineId) -> Result<(), StorageError>;

    /// Timelines that currently hold commands.
    fn timelines(&self) -> Result<Vec<TimelineId>, StorageError>;
}
