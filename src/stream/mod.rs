//! Stream model: timelines, keys, versions and ancestor chains.
//!
//! A stream is addressed by `"{timeline}:{type}:{id}"`. A stream created by
//! branching carries a `parent` [`StreamRef`] naming the ancestor stream and
//! the version at which it diverged. Logical versions are contiguous across
//! the inherited prefix and the stream's own events.

mod registry;

pub use registry::{PhysicalPosition, StreamRegistry};

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default name of the root timeline.
pub const ROOT_TIMELINE: &str = "master";

/// A timeline (branch) identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimelineId(String);

impl TimelineId {
    /// Creates a timeline id.
    ///
    /// # Errors
    ///
    /// Rejects empty ids and ids containing the key separator `':'`.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyTimeline);
        }
        if id.contains(':') {
            return Err(ValidationError::InvalidTimeline { timeline: id });
        }
        Ok(Self(id))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TimelineId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TimelineId> for String {
    fn from(value: TimelineId) -> Self {
        value.0
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Explicit timeline context threaded through every stream and branch call.
///
/// There is no ambient "active branch": the caller holds the context it is
/// working in, which makes concurrent multi-timeline work inside one process
/// safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineContext {
    timeline: TimelineId,
}

impl TimelineContext {
    /// Creates a context for `timeline`.
    #[must_use]
    pub const fn new(timeline: TimelineId) -> Self {
        Self { timeline }
    }

    /// Creates a context from a raw timeline name.
    ///
    /// # Errors
    ///
    /// See [`TimelineId::new`].
    pub fn named(timeline: impl Into<String>) -> Result<Self, ValidationError> {
        Ok(Self::new(TimelineId::new(timeline)?))
    }

    /// The timeline this context addresses.
    #[must_use]
    pub const fn timeline(&self) -> &TimelineId {
        &self.timeline
    }

    /// Key of the stream `(stream_type, id)` in this timeline.
    #[must_use]
    pub fn key(&self, stream_type: &str, id: &str) -> StreamKey {
        StreamKey {
            timeline: self.timeline.clone(),
            stream_type: stream_type.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for TimelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timeline)
    }
}

/// What kind of event-sourced entity owns a stream.
///
/// Resolved once when the stream is created and persisted in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// An aggregate root.
    #[default]
    Aggregate,
    /// A saga / process manager.
    Saga,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggregate => write!(f, "aggregate"),
            Self::Saga => write!(f, "saga"),
        }
    }
}

/// Stream address: `"{timeline}:{type}:{id}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamKey {
    timeline: TimelineId,
    stream_type: String,
    id: String,
}

impl StreamKey {
    /// Builds a key from its parts.
    ///
    /// # Errors
    ///
    /// Rejects empty parts and a type containing `':'`.
    pub fn new(
        timeline: TimelineId,
        stream_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let stream_type = stream_type.into();
        let id = id.into();
        if stream_type.is_empty() || id.is_empty() || stream_type.contains(':') {
            return Err(ValidationError::InvalidStreamKey {
                key: format!("{timeline}:{stream_type}:{id}"),
            });
        }
        Ok(Self {
            timeline,
            stream_type,
            id,
        })
    }

    /// Parses `"{timeline}:{type}:{id}"`. The id may itself contain `':'`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStreamKey` for malformed input.
    pub fn parse(key: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidStreamKey {
            key: key.to_string(),
        };
        let mut parts = key.splitn(3, ':');
        let (Some(timeline), Some(stream_type), Some(id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let timeline = TimelineId::new(timeline).map_err(|_| invalid())?;
        Self::new(timeline, stream_type, id)
    }

    /// Timeline part.
    #[must_use]
    pub const fn timeline(&self) -> &TimelineId {
        &self.timeline
    }

    /// Type part.
    #[must_use]
    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    /// Id part.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The same `(type, id)` in another timeline.
    #[must_use]
    pub fn with_timeline(&self, timeline: &TimelineId) -> Self {
        Self {
            timeline: timeline.clone(),
            stream_type: self.stream_type.clone(),
            id: self.id.clone(),
        }
    }

    /// True if both keys address the same `(type, id)`.
    #[must_use]
    pub fn same_entity(&self, other: &Self) -> bool {
        self.stream_type == other.stream_type && self.id == other.id
    }
}

impl TryFrom<String> for StreamKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StreamKey> for String {
    fn from(value: StreamKey) -> Self {
        value.to_string()
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.timeline, self.stream_type, self.id)
    }
}

/// Stream version including the reserved sentinels.
///
/// `NoStream` (the stream does not exist) and `Empty` (it exists with no
/// events) are distinct from `At(0)` (one event). Ordered
/// `NoStream < Empty < At(0) < At(1) < ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum StreamVersion {
    /// The stream does not exist.
    NoStream,
    /// The stream exists and holds no events.
    Empty,
    /// Version of the last event.
    At(u64),
}

impl StreamVersion {
    /// Persisted encoding of `NoStream`.
    pub const NO_STREAM_RAW: i64 = -2;
    /// Persisted encoding of `Empty`.
    pub const EMPTY_RAW: i64 = -1;

    /// Version of a stream holding `count` events.
    #[must_use]
    pub const fn from_count(count: u64) -> Self {
        if count == 0 {
            Self::Empty
        } else {
            Self::At(count - 1)
        }
    }

    /// Number of events up to and including this version.
    #[must_use]
    pub const fn count(self) -> u64 {
        match self {
            Self::NoStream | Self::Empty => 0,
            Self::At(v) => v + 1,
        }
    }

    /// Version of the last event, if any.
    #[must_use]
    pub const fn last(self) -> Option<u64> {
        match self {
            Self::NoStream | Self::Empty => None,
            Self::At(v) => Some(v),
        }
    }

    /// True if `version` is covered by this version.
    #[must_use]
    pub const fn contains(self, version: u64) -> bool {
        version < self.count()
    }

    /// Version directly preceding event `version`.
    #[must_use]
    pub const fn before(version: u64) -> Self {
        Self::from_count(version)
    }
}

impl From<StreamVersion> for i64 {
    fn from(value: StreamVersion) -> Self {
        match value {
            StreamVersion::NoStream => StreamVersion::NO_STREAM_RAW,
            StreamVersion::Empty => StreamVersion::EMPTY_RAW,
            StreamVersion::At(v) => i64::try_from(v).unwrap_or(i64::MAX),
        }
    }
}

impl TryFrom<i64> for StreamVersion {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            Self::NO_STREAM_RAW => Ok(Self::NoStream),
            Self::EMPTY_RAW => Ok(Self::Empty),
            v if v >= 0 => Ok(Self::At(v.unsigned_abs())),
            v => Err(format!("invalid stream version {v}")),
        }
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStream => write!(f, "no-stream"),
            Self::Empty => write!(f, "empty"),
            Self::At(v) => write!(f, "{v}"),
        }
    }
}

/// Optimistic concurrency expectation for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Accept whatever the current version is.
    #[default]
    Any,
    /// The stream must be at exactly this version.
    Exact(StreamVersion),
}

impl ExpectedVersion {
    /// True if `actual` satisfies the expectation.
    #[must_use]
    pub fn matches(self, actual: StreamVersion) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == actual,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Pointer to an ancestor stream and the version at which a child diverged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    /// Ancestor stream.
    pub key: StreamKey,
    /// Last inherited version; `Empty` marks a branch root with no history.
    pub version: StreamVersion,
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}

/// Metadata persisted alongside each physical stream.
///
/// Serialized as `{ "parent_key": string?, "parent_version": int?, "kind": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "MetadataBlob", into = "MetadataBlob")]
pub struct StreamMetadata {
    /// Ancestor pointer.
    pub parent: Option<StreamRef>,
    /// Aggregate or saga.
    pub kind: StreamKind,
}

impl StreamMetadata {
    /// Metadata for a root stream.
    #[must_use]
    pub const fn root(kind: StreamKind) -> Self {
        Self { parent: None, kind }
    }
}

#[derive(Serialize, Deserialize)]
struct MetadataBlob {
    parent_key: Option<String>,
    parent_version: Option<i64>,
    #[serde(default)]
    kind: StreamKind,
}

impl From<StreamMetadata> for MetadataBlob {
    fn from(value: StreamMetadata) -> Self {
        let (parent_key, parent_version) = match value.parent {
            Some(parent) => (Some(parent.key.to_string()), Some(i64::from(parent.version))),
            None => (None, None),
        };
        Self {
            parent_key,
            parent_version,
            kind: value.kind,
        }
    }
}

impl TryFrom<MetadataBlob> for StreamMetadata {
    type Error = String;

    fn try_from(value: MetadataBlob) -> Result<Self, Self::Error> {
        let parent = match (value.parent_key, value.parent_version) {
            (None, None) => None,
            (Some(key), Some(version)) => Some(StreamRef {
                key: StreamKey::parse(&key).map_err(|e| e.to_string())?,
                version: StreamVersion::try_from(version)?,
            }),
            (Some(key), None) => Some(StreamRef {
                key: StreamKey::parse(&key).map_err(|e| e.to_string())?,
                version: StreamVersion::Empty,
            }),
            (None, Some(_)) => return Err("parent_version without parent_key".to_string()),
        };
        Ok(Self {
            parent,
            kind: value.kind,
        })
    }
}

/// Describes a stream independently of the timeline it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Type part of the key.
    pub stream_type: String,
    /// Id part of the key.
    pub id: String,
    /// Aggregate or saga.
    pub kind: StreamKind,
}

impl StreamDescriptor {
    /// Descriptor of an aggregate stream.
    pub fn aggregate(stream_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            stream_type: stream_type.into(),
            id: id.into(),
            kind: StreamKind::Aggregate,
        }
    }

    /// Descriptor of a saga stream.
    pub fn saga(stream_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            stream_type: stream_type.into(),
            id: id.into(),
            kind: StreamKind::Saga,
        }
    }

    /// Key of this stream within `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStreamKey` for empty parts.
    pub fn key(&self, ctx: &TimelineContext) -> Result<StreamKey, ValidationError> {
        StreamKey::new(ctx.timeline().clone(), &self.stream_type, &self.id)
    }
}

/// A stream as seen through its metadata and current logical version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Address.
    pub key: StreamKey,
    /// Aggregate or saga.
    pub kind: StreamKind,
    /// Logical version: inherited prefix plus own events.
    pub version: StreamVersion,
    /// Ancestor pointer.
    pub parent: Option<StreamRef>,
    /// Events physically removed from this stream's own log.
    pub deleted_count: u64,
}

impl Stream {
    /// First logical version owned by this stream rather than inherited.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.parent.as_ref().map_or(0, |p| p.version.count())
    }

    /// Number of events physically stored in this stream.
    #[must_use]
    pub fn own_count(&self) -> u64 {
        self.version.count().saturating_sub(self.base())
    }

    /// Descriptor of this stream.
    #[must_use]
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            stream_type: self.key.stream_type().to_string(),
            id: self.key.id().to_string(),
            kind: self.kind,
        }
    }
}

/// Stream selection used by listings and partial branches.
#[derive(Debug, Clone, Default)]
pub enum StreamFilter {
    /// Every stream.
    #[default]
    All,
    /// Streams of one kind.
    Kind(StreamKind),
    /// Streams of one type.
    Type(String),
    /// Streams whose `(type, id)` matches one of the given keys.
    Keys(Vec<StreamKey>),
    /// Streams whose `"{type}:{id}"` matches the pattern.
    Pattern(Regex),
}

impl StreamFilter {
    /// Compiles a pattern filter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStreamKey` if the pattern does not compile.
    pub fn pattern(pattern: &str) -> Result<Self, ValidationError> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| ValidationError::InvalidStreamKey {
                key: format!("{pattern}: {e}"),
            })
    }

    /// True if the stream passes the filter.
    #[must_use]
    pub fn matches(&self, key: &StreamKey, kind: StreamKind) -> bool {
        match self {
            Self::All => true,
            Self::Kind(k) => *k == kind,
            Self::Type(t) => key.stream_type() == t,
            Self::Keys(keys) => keys.iter().any(|k| k.same_entity(key)),
            Self::Pattern(re) => re.is_match(&format!("{}:{}", key.stream_type(), key.id())),
        }
    }
}
