//! Vertices and edges of the causality graph.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{Command, ContentHash, Event, MessageId};
use crate::stream::{StreamKey, StreamVersion, TimelineId};
use crate::time::LogicalTime;

/// Identifier of a graph vertex.
///
/// Events and commands share the message id space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VertexId {
    /// A physical stream.
    Stream(StreamKey),
    /// An event or command.
    Message(MessageId),
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(key) => write!(f, "stream:{key}"),
            Self::Message(id) => write!(f, "message:{id}"),
        }
    }
}

impl From<MessageId> for VertexId {
    fn from(id: MessageId) -> Self {
        Self::Message(id)
    }
}

impl From<StreamKey> for VertexId {
    fn from(key: StreamKey) -> Self {
        Self::Stream(key)
    }
}

/// Edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Previous event to next event within one physical stream, or the
    /// stream vertex to its first own event.
    Stream,
    /// Causal ancestor to dependent, across streams.
    Causality,
    /// Command to an event it produced.
    Command,
}

/// A directed edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source vertex.
    pub from: VertexId,
    /// Target vertex.
    pub to: VertexId,
    /// Edge kind.
    pub kind: EdgeKind,
    /// Physical stream a `Stream` edge belongs to.
    pub stream: Option<StreamKey>,
}

/// Where an event sits within one physical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    /// Logical version.
    pub version: u64,
    /// Chain hash up to and including this event.
    pub chain: ContentHash,
    /// Timestamp at this position. A rewrite may stamp a relocated event
    /// later than where it was first recorded.
    pub timestamp: LogicalTime,
}

/// A stream vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamVertex {
    /// Stream key.
    pub key: StreamKey,
    /// Logical version including the inherited prefix.
    pub version: StreamVersion,
    /// Current stream hash.
    pub hash: ContentHash,
}

/// An event vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventVertex {
    /// Message id.
    pub id: MessageId,
    /// Event type.
    pub label: String,
    /// Timestamp the event was first recorded with.
    pub timestamp: LogicalTime,
    /// Causal ancestor.
    pub ancestor_id: Option<MessageId>,
    /// Producing command.
    pub command_id: Option<MessageId>,
    /// Leaf hash.
    pub leaf: ContentHash,
    /// Physical streams holding this event. Merges copy the same message
    /// into the target stream, so there can be several.
    pub occurrences: BTreeMap<StreamKey, Occurrence>,
}

impl EventVertex {
    pub(crate) fn from_event(event: &Event) -> Self {
        Self {
            id: event.message_id,
            label: event.event_type.clone(),
            timestamp: event.timestamp,
            ancestor_id: event.ancestor_id,
            command_id: event.command_id,
            leaf: event.content_hash,
            occurrences: BTreeMap::new(),
        }
    }
}

/// A command vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandVertex {
    /// Message id.
    pub id: MessageId,
    /// Command type.
    pub label: String,
    /// Timeline whose log holds the command.
    pub timeline: TimelineId,
    /// Command timestamp.
    pub timestamp: LogicalTime,
    /// Causal ancestor.
    pub ancestor_id: Option<MessageId>,
    /// Leaf hash.
    pub leaf: ContentHash,
}

impl CommandVertex {
    pub(crate) fn from_command(command: &Command) -> Self {
        Self {
            id: command.message_id,
            label: command.command_type.clone(),
            timeline: command.timeline.clone(),
            timestamp: command.timestamp,
            ancestor_id: command.ancestor_id,
            leaf: command.content_hash,
        }
    }
}

/// A vertex of the causality graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vertex {
    /// Stream vertex.
    Stream(StreamVertex),
    /// Event vertex.
    Event(EventVertex),
    /// Command vertex.
    Command(CommandVertex),
}

impl Vertex {
    /// Vertex id.
    #[must_use]
    pub fn id(&self) -> VertexId {
        match self {
            Self::Stream(s) => VertexId::Stream(s.key.clone()),
            Self::Event(e) => VertexId::Message(e.id),
            Self::Command(c) => VertexId::Message(c.id),
        }
    }

    /// Human-readable label.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Stream(s) => s.key.to_string(),
            Self::Event(e) => e.label.clone(),
            Self::Command(c) => c.label.clone(),
        }
    }

    /// Merkle hash: the stream hash for streams, the leaf hash otherwise.
    #[must_use]
    pub const fn merkle_hash(&self) -> ContentHash {
        match self {
            Self::Stream(s) => s.hash,
            Self::Event(e) => e.leaf,
            Self::Command(c) => c.leaf,
        }
    }

    /// Timestamp of a message vertex.
    #[must_use]
    pub const fn timestamp(&self) -> Option<LogicalTime> {
        match self {
            Self::Stream(_) => None,
            Self::Event(e) => Some(e.timestamp),
            Self::Command(c) => Some(c.timestamp),
        }
    }

    /// Causal ancestor of a message vertex.
    #[must_use]
    pub const fn ancestor_id(&self) -> Option<MessageId> {
        match self {
            Self::Stream(_) => None,
            Self::Event(e) => e.ancestor_id,
            Self::Command(c) => c.ancestor_id,
        }
    }

    /// The event payload, if this is an event vertex.
    #[must_use]
    pub const fn as_event(&self) -> Option<&EventVertex> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }
}
