//! Stream registry: logical views over the physical event log.
//!
//! The registry resolves a stream's logical versions to either an ancestor's
//! events (the inherited prefix) or its own physical positions.

use std::sync::Arc;

use tracing::debug;

use crate::error::{CorruptionError, ExecutionError, KyroError, KyroResult, ValidationError};
use crate::message::Event;
use crate::storage::{DeletedMarker, EventLog, StorageError, StreamInfo};
use crate::stream::{
    ExpectedVersion, Stream, StreamDescriptor, StreamFilter, StreamKey, StreamMetadata, StreamRef,
    StreamVersion, TimelineContext, TimelineId,
};

/// Upper bound on ancestor hops before a chain is treated as corrupt.
const MAX_ANCESTRY: usize = 1024;

/// Where a logical version physically lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalPosition {
    /// Stream that physically stores the event.
    pub key: StreamKey,
    /// Position within that stream's own log.
    pub position: u64,
}

fn own_position(markers: &[DeletedMarker], index: u64) -> u64 {
    index
        + markers
            .iter()
            .filter(|m| m.at <= index)
            .map(|m| m.count)
            .sum::<u64>()
}

fn to_stream(info: StreamInfo) -> Stream {
    Stream {
        version: info.version(),
        deleted_count: info.deleted_count(),
        kind: info.metadata.kind,
        parent: info.metadata.parent,
        key: info.key,
    }
}

/// Registry of streams backed by an [`EventLog`].
#[derive(Clone)]
pub struct StreamRegistry {
    log: Arc<dyn EventLog>,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry").finish_non_exhaustive()
    }
}

impl StreamRegistry {
    /// Creates a registry over `log`.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// The underlying log.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Looks up a stream.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn find(&self, key: &StreamKey) -> KyroResult<Option<Stream>> {
        Ok(self.log.stream_info(key)?.map(to_stream))
    }

    /// Looks up a stream that must exist.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` if it does not.
    pub fn get(&self, key: &StreamKey) -> KyroResult<Stream> {
        self.find(key)?.ok_or_else(|| {
            ExecutionError::StreamNotFound {
                key: key.to_string(),
            }
            .into()
        })
    }

    /// Returns the stream for `descriptor` in `ctx`, creating it as a root
    /// stream if absent. The flag is true when the stream was created.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed descriptor.
    pub fn get_or_add(
        &self,
        ctx: &TimelineContext,
        descriptor: &StreamDescriptor,
    ) -> KyroResult<(Stream, bool)> {
        let key = descriptor.key(ctx)?;
        if let Some(stream) = self.find(&key)? {
            return Ok((stream, false));
        }
        match self
            .log
            .create_stream(&key, StreamMetadata::root(descriptor.kind))
        {
            Ok(info) => {
                debug!(stream = %key, kind = %descriptor.kind, "stream created");
                Ok((to_stream(info), true))
            }
            // Lost a creation race; the winner's stream is the one we want.
            Err(StorageError::DuplicateKey(_)) => Ok((self.get(&key)?, false)),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists streams, optionally restricted to one timeline.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn list(
        &self,
        timeline: Option<&TimelineId>,
        filter: &StreamFilter,
    ) -> KyroResult<Vec<Stream>> {
        Ok(self
            .log
            .list_streams(timeline, filter)?
            .into_iter()
            .map(to_stream)
            .collect())
    }

    /// Streams whose parent pointer names `key`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn children(&self, key: &StreamKey) -> KyroResult<Vec<Stream>> {
        Ok(self
            .list(None, &StreamFilter::All)?
            .into_iter()
            .filter(|s| s.parent.as_ref().is_some_and(|p| &p.key == key))
            .collect())
    }

    /// The ancestor chain of `stream`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns `DanglingParent` if a link is missing.
    pub fn ancestors(&self, stream: &Stream) -> KyroResult<Vec<StreamRef>> {
        let mut chain = Vec::new();
        let mut current = stream.clone();
        while let Some(parent) = current.parent.clone() {
            if chain.len() >= MAX_ANCESTRY {
                return Err(KyroError::internal(format!(
                    "ancestor chain of {} exceeded hop limit",
                    stream.key
                )));
            }
            current = self.find(&parent.key)?.ok_or_else(|| CorruptionError::DanglingParent {
                key: current.key.to_string(),
                parent: parent.key.to_string(),
            })?;
            chain.push(parent);
        }
        Ok(chain)
    }

    /// Creates a child of `source` in `timeline` that inherits versions up to `at`.
    ///
    /// No events are copied.
    ///
    /// # Errors
    ///
    /// Returns `VersionOutOfRange` if `at` lies beyond the source's version,
    /// or a storage error if the child already exists.
    pub fn branch(
        &self,
        source: &Stream,
        timeline: &TimelineId,
        at: StreamVersion,
    ) -> KyroResult<Stream> {
        let at = at.max(StreamVersion::Empty);
        if at > source.version {
            return Err(ValidationError::VersionOutOfRange {
                key: source.key.to_string(),
                version: at.last().unwrap_or(0),
                current: source.version,
            }
            .into());
        }
        let key = source.key.with_timeline(timeline);
        let metadata = StreamMetadata {
            parent: Some(StreamRef {
                key: source.key.clone(),
                version: at,
            }),
            kind: source.kind,
        };
        let info = self.log.create_stream(&key, metadata)?;
        debug!(stream = %key, parent = %source.key, at = %at, "stream branched");
        Ok(to_stream(info))
    }

    /// Resolves logical `version` of `stream` to the stream and position that
    /// physically store it.
    ///
    /// # Errors
    ///
    /// Returns `VersionOutOfRange` for versions the stream does not hold.
    pub fn resolve_physical_position(
        &self,
        stream: &Stream,
        version: u64,
    ) -> KyroResult<PhysicalPosition> {
        if !stream.version.contains(version) {
            return Err(ValidationError::VersionOutOfRange {
                key: stream.key.to_string(),
                version,
                current: stream.version,
            }
            .into());
        }
        let mut current = stream.clone();
        for _ in 0..MAX_ANCESTRY {
            let base = current.base();
            if version >= base {
                let info = self.info(&current.key)?;
                return Ok(PhysicalPosition {
                    position: own_position(&info.deleted, version - base),
                    key: current.key,
                });
            }
            current = self.parent_of(&current)?;
        }
        Err(KyroError::internal(format!(
            "ancestor chain of {} exceeded hop limit",
            stream.key
        )))
    }

    /// Reads up to `count` events starting at logical version `from`.
    ///
    /// Inherited events keep the key of the ancestor that stores them.
    ///
    /// # Errors
    ///
    /// Returns `VersionGap` if the resolved events are not contiguous.
    pub fn read(&self, stream: &Stream, from: u64, count: u64) -> KyroResult<Vec<Event>> {
        let end = from.saturating_add(count);
        let events = self.read_range(stream, from, end, 0)?;
        for (expected, event) in (from..).zip(&events) {
            if event.version != expected {
                return Err(CorruptionError::VersionGap {
                    key: stream.key.to_string(),
                    expected,
                    found: event.version,
                }
                .into());
            }
        }
        Ok(events)
    }

    /// Reads the whole logical history of `stream`.
    ///
    /// # Errors
    ///
    /// See [`StreamRegistry::read`].
    pub fn read_all(&self, stream: &Stream) -> KyroResult<Vec<Event>> {
        self.read(stream, 0, stream.version.count())
    }

    fn read_range(
        &self,
        stream: &Stream,
        from: u64,
        end: u64,
        depth: usize,
    ) -> KyroResult<Vec<Event>> {
        if depth > MAX_ANCESTRY {
            return Err(KyroError::internal(format!(
                "ancestor chain of {} exceeded hop limit",
                stream.key
            )));
        }
        let end = end.min(stream.version.count());
        if from >= end {
            return Ok(Vec::new());
        }
        let base = stream.base();
        let mut out = Vec::new();
        if from < base {
            let parent = self.parent_of(stream)?;
            let inherited_end = end.min(base);
            let inherited = self.read_range(&parent, from, inherited_end, depth + 1)?;
            let found = from + inherited.len() as u64;
            if found != inherited_end {
                return Err(CorruptionError::VersionGap {
                    key: stream.key.to_string(),
                    expected: inherited_end,
                    found,
                }
                .into());
            }
            out.extend(inherited);
        }
        if end > base {
            let own_from = from.max(base);
            let info = self.info(&stream.key)?;
            let position = own_position(&info.deleted, own_from - base);
            out.extend(self.log.read_stream(&stream.key, position, end - own_from)?);
        }
        Ok(out)
    }

    /// Appends stamped events to `stream`'s own log.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` if `expected` does not match.
    pub fn append(
        &self,
        stream: &Stream,
        events: Vec<Event>,
        expected: ExpectedVersion,
    ) -> KyroResult<StreamVersion> {
        Ok(self.log.append_to_stream(&stream.key, events, expected)?)
    }

    /// Trims `stream` so that its last version is `keep`.
    ///
    /// Trimming into the inherited prefix drops every own event and lowers
    /// the parent pointer. Returns the own events that were removed.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn trim(&self, stream: &Stream, keep: StreamVersion) -> KyroResult<Vec<Event>> {
        let keep = keep.max(StreamVersion::Empty);
        if keep >= stream.version {
            return Ok(Vec::new());
        }
        let removed = self.log.truncate_stream(&stream.key, keep)?;
        if keep.count() < stream.base() {
            let mut metadata = self.log.get_stream_metadata(&stream.key)?.ok_or_else(|| {
                KyroError::from(ExecutionError::StreamNotFound {
                    key: stream.key.to_string(),
                })
            })?;
            if let Some(parent) = metadata.parent.as_mut() {
                parent.version = keep;
            }
            self.log.set_stream_metadata(&stream.key, metadata)?;
        }
        debug!(stream = %stream.key, keep = %keep, removed = removed.len(), "stream trimmed");
        Ok(removed)
    }

    /// Deletes a stream's own log.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` if it does not exist.
    pub fn delete(&self, key: &StreamKey) -> KyroResult<()> {
        self.log.delete_stream(key)?;
        debug!(stream = %key, "stream deleted");
        Ok(())
    }

    fn info(&self, key: &StreamKey) -> KyroResult<StreamInfo> {
        self.log.stream_info(key)?.ok_or_else(|| {
            ExecutionError::StreamNotFound {
                key: key.to_string(),
            }
            .into()
        })
    }

    fn parent_of(&self, stream: &Stream) -> KyroResult<Stream> {
        let parent = stream.parent.as_ref().ok_or_else(|| {
            KyroError::internal(format!("{} has no parent to resolve", stream.key))
        })?;
        self.find(&parent.key)?.ok_or_else(|| {
            CorruptionError::DanglingParent {
                key: stream.key.to_string(),
                parent: parent.key.to_string(),
            }
            .into()
        })
    }
}
