//! Messages recorded in the log: events and commands.
//!
//! Both carry a globally unique [`MessageId`], a [`LogicalTime`] stamp and an
//! optional `ancestor_id` naming the message that causally produced them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::{StreamKey, TimelineId};
use crate::time::LogicalTime;

/// Globally unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    /// Creates a new random message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A BLAKE3 digest used for leaf and chain hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// The all-zero hash, used as the chain seed of a stream with no history.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blake3:{}", self.to_hex())
    }
}

// Field separator that cannot appear in JSON text or UUID strings.
const SEP: &[u8] = &[0xff];

fn leaf_hash(
    domain: &[u8],
    id: MessageId,
    kind: &str,
    payload: &serde_json::Value,
    ancestor: Option<MessageId>,
    extra: &[u8],
) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    hasher.update(SEP);
    hasher.update(id.as_uuid().as_bytes());
    hasher.update(SEP);
    hasher.update(kind.as_bytes());
    hasher.update(SEP);
    // serde_json::Value orders object keys, so this is canonical.
    hasher.update(payload.to_string().as_bytes());
    hasher.update(SEP);
    if let Some(ancestor) = ancestor {
        hasher.update(ancestor.as_uuid().as_bytes());
    }
    hasher.update(SEP);
    hasher.update(extra);
    hasher.finalize().into()
}

/// An event appended to a stream.
///
/// Immutable once appended. A retroactive rewrite re-appends the same message
/// at a new version rather than editing it in place, so `content_hash`
/// deliberately excludes version and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique id.
    pub message_id: MessageId,
    /// Owning stream.
    pub stream: StreamKey,
    /// 0-based, gapless position within the stream.
    pub version: u64,
    /// When the event was stamped.
    pub timestamp: LogicalTime,
    /// The message (event or command) that causally produced this one.
    pub ancestor_id: Option<MessageId>,
    /// The command whose execution emitted this event.
    pub command_id: Option<MessageId>,
    /// Event type name.
    pub event_type: String,
    /// Event body.
    pub payload: serde_json::Value,
    /// Leaf hash of payload and metadata.
    pub content_hash: ContentHash,
}

impl Event {
    /// Computes the leaf hash for the given content.
    #[must_use]
    pub fn compute_hash(
        message_id: MessageId,
        event_type: &str,
        payload: &serde_json::Value,
        ancestor_id: Option<MessageId>,
        command_id: Option<MessageId>,
    ) -> ContentHash {
        let command = command_id.map(|c| *c.as_uuid().as_bytes()).unwrap_or_default();
        leaf_hash(b"event", message_id, event_type, payload, ancestor_id, &command)
    }

    /// Returns true if the stored hash matches the content.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.content_hash
            == Self::compute_hash(
                self.message_id,
                &self.event_type,
                &self.payload,
                self.ancestor_id,
                self.command_id,
            )
    }

    /// Returns a copy of this event relocated to another stream position.
    ///
    /// Identity, content and timestamp are preserved.
    #[must_use]
    pub fn relocated(&self, stream: &StreamKey, version: u64) -> Self {
        Self {
            stream: stream.clone(),
            version,
            ..self.clone()
        }
    }
}

/// An event that has not yet been appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Pre-assigned id; a fresh one is generated when `None`.
    pub message_id: Option<MessageId>,
    /// Event type name.
    pub event_type: String,
    /// Event body.
    pub payload: serde_json::Value,
    /// Causal ancestor.
    pub ancestor_id: Option<MessageId>,
    /// Producing command.
    pub command_id: Option<MessageId>,
}

impl EventDraft {
    /// Creates a draft with the given type and payload.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_id: None,
            event_type: event_type.into(),
            payload,
            ancestor_id: None,
            command_id: None,
        }
    }

    /// Sets the causal ancestor.
    #[must_use]
    pub fn caused_by(mut self, ancestor: MessageId) -> Self {
        self.ancestor_id = Some(ancestor);
        self
    }

    /// Sets the producing command.
    #[must_use]
    pub fn from_command(mut self, command: MessageId) -> Self {
        self.command_id = Some(command);
        self
    }

    /// Pins the message id.
    #[must_use]
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Stamps the draft into an event.
    #[must_use]
    pub fn into_event(self, stream: &StreamKey, version: u64, timestamp: LogicalTime) -> Event {
        let message_id = self.message_id.unwrap_or_default();
        let content_hash = Event::compute_hash(
            message_id,
            &self.event_type,
            &self.payload,
            self.ancestor_id,
            self.command_id,
        );
        Event {
            message_id,
            stream: stream.clone(),
            version,
            timestamp,
            ancestor_id: self.ancestor_id,
            command_id: self.command_id,
            event_type: self.event_type,
            payload: self.payload,
            content_hash,
        }
    }
}

/// A command recorded in the per-timeline command log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Globally unique id.
    pub message_id: MessageId,
    /// Timeline whose command log holds this record.
    pub timeline: TimelineId,
    /// Target aggregate id.
    pub target: String,
    /// Command type name.
    pub command_type: String,
    /// Command body.
    pub payload: serde_json::Value,
    /// When the command was stamped.
    pub timestamp: LogicalTime,
    /// Causal ancestor.
    pub ancestor_id: Option<MessageId>,
    /// The command this record was copied from, if it was replicated or merged.
    pub origin: Option<MessageId>,
    /// Leaf hash of payload and metadata.
    pub content_hash: ContentHash,
}

impl Command {
    /// Id of the original command this record descends from.
    #[must_use]
    pub fn origin_id(&self) -> MessageId {
        self.origin.unwrap_or(self.message_id)
    }

    /// Computes the leaf hash for the given content.
    #[must_use]
    pub fn compute_hash(
        message_id: MessageId,
        command_type: &str,
        payload: &serde_json::Value,
        ancestor_id: Option<MessageId>,
        target: &str,
    ) -> ContentHash {
        leaf_hash(
            b"command",
            message_id,
            command_type,
            payload,
            ancestor_id,
            target.as_bytes(),
        )
    }

    /// Copies this command into another timeline's log under a fresh id.
    #[must_use]
    pub fn copied_to(&self, timeline: &TimelineId) -> Self {
        let message_id = MessageId::new();
        Self {
            message_id,
            timeline: timeline.clone(),
            origin: Some(self.origin_id()),
            content_hash: Self::compute_hash(
                message_id,
                &self.command_type,
                &self.payload,
                self.ancestor_id,
                &self.target,
            ),
            ..self.clone()
        }
    }
}

/// A command that has not yet been recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDraft {
    /// Pre-assigned id; a fresh one is generated when `None`.
    pub message_id: Option<MessageId>,
    /// Target aggregate id.
    pub target: String,
    /// Command type name.
    pub command_type: String,
    /// Command body.
    pub payload: serde_json::Value,
    /// Causal ancestor.
    pub ancestor_id: Option<MessageId>,
    /// Explicit timestamp for retroactive commands; the clock stamps it otherwise.
    pub timestamp: Option<LogicalTime>,
}

impl CommandDraft {
    /// Creates a draft.
    pub fn new(
        target: impl Into<String>,
        command_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: None,
            target: target.into(),
            command_type: command_type.into(),
            payload,
            ancestor_id: None,
            timestamp: None,
        }
    }

    /// Sets the causal ancestor.
    #[must_use]
    pub fn caused_by(mut self, ancestor: MessageId) -> Self {
        self.ancestor_id = Some(ancestor);
        self
    }

    /// Backdates the command.
    #[must_use]
    pub fn at(mut self, timestamp: LogicalTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamps the draft into a command.
    #[must_use]
    pub fn into_command(self, timeline: &TimelineId, timestamp: LogicalTime) -> Command {
        let message_id = self.message_id.unwrap_or_default();
        let content_hash = Command::compute_hash(
            message_id,
            &self.command_type,
            &self.payload,
            self.ancestor_id,
            &self.target,
        );
        Command {
            message_id,
            timeline: timeline.clone(),
            target: self.target,
            command_type: self.command_type,
            payload: self.payload,
            timestamp: self.timestamp.unwrap_or(timestamp),
            ancestor_id: self.ancestor_id,
            origin: None,
            content_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> StreamKey {
        StreamKey::parse("master:Root:1").unwrap()
    }

    #[test]
    fn test_event_hash_ignores_position_and_time() {
        let draft = EventDraft::new("RootCreated", json!({"name": "r"}));
        let e = draft.into_event(&key(), 0, LogicalTime::new(1, 0));
        let moved = e.relocated(&StreamKey::parse("test:Root:1").unwrap(), 5);
        assert_eq!(e.content_hash, moved.content_hash);
        assert!(moved.verify_hash());
    }

    #[test]
    fn test_event_hash_is_sensitive_to_payload() {
        let id = MessageId::new();
        let a = Event::compute_hash(id, "T", &json!({"v": 1}), None, None);
        let b = Event::compute_hash(id, "T", &json!({"v": 2}), None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_event_hash_is_key_order_independent() {
        let id = MessageId::new();
        let a = Event::compute_hash(id, "T", &json!({"a": 1, "b": 2}), None, None);
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(a, Event::compute_hash(id, "T", &b, None, None));
    }

    #[test]
    fn test_tampered_event_fails_verification() {
        let mut e = EventDraft::new("T", json!(1)).into_event(&key(), 0, LogicalTime::ZERO);
        e.payload = json!(2);
        assert!(!e.verify_hash());
    }

    #[test]
    fn test_command_copy_keeps_origin() {
        let master = TimelineId::new("master").unwrap();
        let test = TimelineId::new("test").unwrap();
        let cmd = CommandDraft::new("1", "CreateRoot", json!({}))
            .into_command(&master, LogicalTime::new(3, 0));
        let copy = cmd.copied_to(&test);
        assert_ne!(copy.message_id, cmd.message_id);
        assert_eq!(copy.origin_id(), cmd.message_id);
        assert_eq!(copy.copied_to(&master).origin_id(), cmd.message_id);
        assert_eq!(copy.timeline, test);
    }

    #[test]
    fn test_content_hash_display() {
        let h = ContentHash::from(blake3::hash(b"abc"));
        assert_eq!(
            h.to_string(),
            format!("blake3:{}", hex::encode(h.as_bytes()))
        );
    }
}
