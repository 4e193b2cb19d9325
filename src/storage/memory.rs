//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//! Stream metadata and rewrite markers are kept as JSON blobs, the same shape a
//! persistent backend stores them in.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::message::{Command, Event, MessageId};
use crate::storage::traits::{
    CommandLog, DeletedMarker, EventLog, RewriteMarker, StorageError, StreamInfo,
};
use crate::stream::{
    ExpectedVersion, StreamFilter, StreamKey, StreamMetadata, StreamVersion, TimelineId,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug)]
struct PhysicalStream {
    metadata: String,
    events: BTreeMap<u64, Event>,
    next_position: u64,
    deleted: Vec<DeletedMarker>,
}

impl PhysicalStream {
    fn new(metadata: &StreamMetadata) -> Result<Self, StorageError> {
        Ok(Self {
            metadata: serde_json::to_string(metadata)?,
            events: BTreeMap::new(),
            next_position: 0,
            deleted: Vec::new(),
        })
    }

    fn metadata(&self) -> Result<StreamMetadata, StorageError> {
        Ok(serde_json::from_str(&self.metadata)?)
    }

    fn info(&self, key: &StreamKey) -> Result<StreamInfo, StorageError> {
        Ok(StreamInfo {
            key: key.clone(),
            metadata: self.metadata()?,
            live_count: self.events.len() as u64,
            deleted: self.deleted.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct LogState {
    streams: BTreeMap<StreamKey, PhysicalStream>,
    rewrites: BTreeMap<StreamKey, String>,
}

/// Thread-safe in-memory event log.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    state: RwLock<LogState>,
}

impl InMemoryEventLog {
    /// Create a new empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for InMemoryEventLog {
    fn list_streams(
        &self,
        timeline: Option<&TimelineId>,
        filter: &StreamFilter,
    ) -> Result<Vec<StreamInfo>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.list_streams"))?;
        let mut out = Vec::new();
        for (key, stream) in &state.streams {
            if timeline.is_some_and(|t| key.timeline() != t) {
                continue;
            }
            let info = stream.info(key)?;
            if filter.matches(key, info.metadata.kind) {
                out.push(info);
            }
        }
        Ok(out)
    }

    fn stream_info(&self, key: &StreamKey) -> Result<Option<StreamInfo>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.stream_info"))?;
        state.streams.get(key).map(|s| s.info(key)).transpose()
    }

    fn create_stream(
        &self,
        key: &StreamKey,
        metadata: StreamMetadata,
    ) -> Result<StreamInfo, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("log.create_stream"))?;
        if state.streams.contains_key(key) {
            return Err(StorageError::DuplicateKey(key.to_string()));
        }
        let stream = PhysicalStream::new(&metadata)?;
        let info = stream.info(key)?;
        state.streams.insert(key.clone(), stream);
        Ok(info)
    }

    fn read_stream(
        &self,
        key: &StreamKey,
        from_position: u64,
        count: u64,
    ) -> Result<Vec<Event>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.read_stream"))?;
        let stream = state
            .streams
            .get(key)
            .ok_or_else(|| StorageError::StreamNotFound(key.to_string()))?;
        let take = usize::try_from(count).unwrap_or(usize::MAX);
        Ok(stream
            .events
            .range(from_position..)
            .take(take)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn append_to_stream(
        &self,
        key: &StreamKey,
        events: Vec<Event>,
        expected: ExpectedVersion,
    ) -> Result<StreamVersion, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("log.append"))?;
        let stream = state
            .streams
            .get_mut(key)
            .ok_or_else(|| StorageError::StreamNotFound(key.to_string()))?;
        let info = stream.info(key)?;
        let actual = info.version();
        if !expected.matches(actual) {
            return Err(StorageError::WrongExpectedVersion {
                key: key.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        let mut next = actual.count();
        for event in &events {
            if &event.stream != key {
                return Err(StorageError::BackendError(format!(
                    "event {} addressed to {} appended to {key}",
                    event.message_id, event.stream
                )));
            }
            if event.version != next {
                return Err(StorageError::BackendError(format!(
                    "non-contiguous append to {key}: expected version {next}, got {}",
                    event.version
                )));
            }
            next += 1;
        }

        for event in events {
            let position = stream.next_position;
            stream.next_position += 1;
            stream.events.insert(position, event);
        }
        Ok(StreamVersion::from_count(next))
    }

    fn truncate_stream(
        &self,
        key: &StreamKey,
        keep: StreamVersion,
    ) -> Result<Vec<Event>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("log.truncate"))?;
        let stream = state
            .streams
            .get_mut(key)
            .ok_or_else(|| StorageError::StreamNotFound(key.to_string()))?;
        let base = stream.info(key)?.base();
        let keep_own = keep.count().saturating_sub(base);
        let live = stream.events.len() as u64;
        if keep_own >= live {
            return Ok(Vec::new());
        }

        let skip = usize::try_from(keep_own).unwrap_or(usize::MAX);
        let doomed: Vec<u64> = stream.events.keys().skip(skip).copied().collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for position in doomed {
            if let Some(event) = stream.events.remove(&position) {
                removed.push(event);
            }
        }

        // Markers past the new tail now describe gaps inside the removed run.
        let stale: u64 = stream
            .deleted
            .iter()
            .filter(|m| m.at > keep_own)
            .map(|m| m.count)
            .sum();
        stream.deleted.retain(|m| m.at <= keep_own);
        stream.deleted.push(DeletedMarker {
            at: keep_own,
            count: removed.len() as u64 + stale,
        });
        Ok(removed)
    }

    fn delete_stream(&self, key: &StreamKey) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("log.delete_stream"))?;
        state
            .streams
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::StreamNotFound(key.to_string()))
    }

    fn get_stream_metadata(&self, key: &StreamKey) -> Result<Option<StreamMetadata>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.get_metadata"))?;
        state.streams.get(key).map(PhysicalStream::metadata).transpose()
    }

    fn set_stream_metadata(
        &self,
        key: &StreamKey,
        metadata: StreamMetadata,
    ) -> Result<(), StorageError> {
        let blob = serde_json::to_string(&metadata)?;
        let mut state = self.state.write().map_err(|_| lock_err("log.set_metadata"))?;
        let stream = state
            .streams
            .get_mut(key)
            .ok_or_else(|| StorageError::StreamNotFound(key.to_string()))?;
        stream.metadata = blob;
        Ok(())
    }

    fn put_rewrite_marker(&self, marker: &RewriteMarker) -> Result<(), StorageError> {
        let blob = serde_json::to_string(marker)?;
        let mut state = self.state.write().map_err(|_| lock_err("log.put_marker"))?;
        state.rewrites.insert(marker.stream.clone(), blob);
        Ok(())
    }

    fn list_rewrite_markers(&self) -> Result<Vec<RewriteMarker>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("log.list_markers"))?;
        state
            .rewrites
            .values()
            .map(|blob| serde_json::from_str(blob).map_err(StorageError::from))
            .collect()
    }

    fn clear_rewrite_marker(&self, stream: &StreamKey) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("log.clear_marker"))?;
        state.rewrites.remove(stream);
        Ok(())
    }
}

/// Thread-safe in-memory command log.
#[derive(Debug, Default)]
pub struct InMemoryCommandLog {
    state: RwLock<HashMap<TimelineId, Vec<Command>>>,
}

impl InMemoryCommandLog {
    /// Create a new empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandLog for InMemoryCommandLog {
    fn append(&self, command: Command) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("commands.append"))?;
        let log = state.entry(command.timeline.clone()).or_default();
        if log.iter().any(|c| c.message_id == command.message_id) {
            return Err(StorageError::DuplicateKey(command.message_id.to_string()));
        }
        log.push(command);
        Ok(())
    }

    fn list(&self, timeline: &TimelineId) -> Result<Vec<Command>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("commands.list"))?;
        Ok(state.get(timeline).cloned().unwrap_or_default())
    }

    fn remove(&self, timeline: &TimelineId, ids: &[MessageId]) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("commands.remove"))?;
        let Some(log) = state.get_mut(timeline) else {
            return Ok(0);
        };
        let before = log.len();
        log.retain(|c| !ids.contains(&c.message_id));
        Ok(before - log.len())
    }

    fn delete_timeline(&self, timeline: &TimelineId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("commands.delete"))?;
        state.remove(timeline);
        Ok(())
    }

    fn timelines(&self) -> Result<Vec<TimelineId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("commands.timelines"))?;
        let mut out: Vec<TimelineId> = state
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        out.sort();
        Ok(out)
    }
}
