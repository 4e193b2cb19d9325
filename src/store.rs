//! The timeline store: clock, stream registry, command log, causality graph
//! and signal bus behind one handle.
//!
//! Every write that goes through the store is linked into the graph before it
//! lands in the backing log. A batch the graph refuses never reaches the log,
//! and a batch the log refuses is unlinked again, so the two never disagree.

use std::sync::Arc;

use tracing::debug;

use crate::causality::{CancellationToken, CausalityGraph, PopulateStats};
use crate::config::StoreConfig;
use crate::error::{ExecutionError, KyroResult};
use crate::message::{Command, CommandDraft, ContentHash, Event, EventDraft, MessageId};
use crate::signal::{Signal, SignalBus, SignalStream};
use crate::storage::{CommandLog, EventLog, InMemoryCommandLog, InMemoryEventLog};
use crate::stream::{
    ExpectedVersion, Stream, StreamDescriptor, StreamFilter, StreamKey, StreamRegistry,
    StreamVersion, TimelineContext, TimelineId,
};
use crate::time::{ClockSource, HybridClock, LogicalTime, SystemClock};

/// A branchable event store.
pub struct TimelineStore {
    config: StoreConfig,
    root: TimelineId,
    clock: HybridClock,
    registry: StreamRegistry,
    commands: Arc<dyn CommandLog>,
    graph: CausalityGraph,
    signals: SignalBus,
}

impl std::fmt::Debug for TimelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineStore")
            .field("root", &self.root)
            .field("clock", &self.clock)
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

impl TimelineStore {
    /// Creates a store over the given logs, stamped by the system clock.
    ///
    /// The graph starts empty; call [`TimelineStore::populate`] when the logs
    /// already hold data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(
        config: StoreConfig,
        events: Arc<dyn EventLog>,
        commands: Arc<dyn CommandLog>,
    ) -> KyroResult<Self> {
        Self::with_clock(config, events, commands, SystemClock)
    }

    /// Creates a store stamped by `source`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn with_clock(
        config: StoreConfig,
        events: Arc<dyn EventLog>,
        commands: Arc<dyn CommandLog>,
        source: impl ClockSource + 'static,
    ) -> KyroResult<Self> {
        let config = config.validate()?;
        let root = config.root()?;
        Ok(Self {
            root,
            clock: HybridClock::new(source),
            registry: StreamRegistry::new(events),
            commands,
            graph: CausalityGraph::new(config.read_timeout(), config.max_pause()),
            signals: SignalBus::new(config.signal_capacity),
            config,
        })
    }

    /// A store over fresh in-memory logs with the default configuration.
    ///
    /// # Errors
    ///
    /// Never fails with the default configuration.
    pub fn in_memory() -> KyroResult<Self> {
        Self::new(
            StoreConfig::default(),
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemoryCommandLog::new()),
        )
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The root timeline.
    #[must_use]
    pub const fn root(&self) -> &TimelineId {
        &self.root
    }

    /// A context addressing the root timeline.
    #[must_use]
    pub fn root_context(&self) -> TimelineContext {
        TimelineContext::new(self.root.clone())
    }

    /// The store's clock.
    #[must_use]
    pub const fn clock(&self) -> &HybridClock {
        &self.clock
    }

    /// The stream registry.
    #[must_use]
    pub const fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// The command log.
    #[must_use]
    pub fn command_log(&self) -> &Arc<dyn CommandLog> {
        &self.commands
    }

    /// The causality graph.
    #[must_use]
    pub const fn graph(&self) -> &CausalityGraph {
        &self.graph
    }

    /// Subscribes to store signals.
    pub fn subscribe(&self) -> SignalStream {
        self.signals.subscribe()
    }

    pub(crate) fn publish(&self, signal: &Signal) {
        self.signals.publish(signal);
    }

    /// Rebuilds the causality graph from the logs.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` past the configured population bound, `Cancelled`
    /// if `cancel` fires, or corruption found while replaying.
    pub fn populate(&self, cancel: &CancellationToken) -> KyroResult<PopulateStats> {
        self.graph.populate(
            &self.registry,
            self.commands.as_ref(),
            cancel,
            self.config.populate_timeout(),
        )
    }

    /// Looks up a stream.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn find_stream(&self, key: &StreamKey) -> KyroResult<Option<Stream>> {
        self.registry.find(key)
    }

    /// Looks up a stream that must exist.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` if it does not.
    pub fn stream(&self, key: &StreamKey) -> KyroResult<Stream> {
        self.registry.get(key)
    }

    /// Streams of the context's timeline matching `filter`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn list_streams(
        &self,
        ctx: &TimelineContext,
        filter: &StreamFilter,
    ) -> KyroResult<Vec<Stream>> {
        self.registry.list(Some(ctx.timeline()), filter)
    }

    /// Current version of a stream, `NoStream` if absent.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn version(&self, key: &StreamKey) -> KyroResult<StreamVersion> {
        Ok(self
            .registry
            .find(key)?
            .map_or(StreamVersion::NoStream, |s| s.version))
    }

    /// Appends drafts to the stream `descriptor` addresses in `ctx`,
    /// creating the stream on first write.
    ///
    /// Returns the stamped events.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` if `expected` does not match the
    /// stream's current version.
    pub fn append(
        &self,
        ctx: &TimelineContext,
        descriptor: &StreamDescriptor,
        drafts: Vec<EventDraft>,
        expected: ExpectedVersion,
    ) -> KyroResult<Vec<Event>> {
        let key = descriptor.key(ctx)?;
        let actual = self.version(&key)?;
        if !expected.matches(actual) {
            return Err(ExecutionError::ConcurrencyConflict {
                key: key.to_string(),
                expected: expected.to_string(),
                actual,
            }
            .into());
        }
        let (stream, created) = self.registry.get_or_add(ctx, descriptor)?;
        let next = stream.version.count();
        let events: Vec<Event> = drafts
            .into_iter()
            .zip(next..)
            .map(|(draft, version)| draft.into_event(&key, version, self.clock.now()))
            .collect();
        if let Err(e) = self.append_events(&stream, events.clone()) {
            if created {
                self.discard_stream(&key)?;
            }
            return Err(e);
        }
        Ok(events)
    }

    /// Appends already stamped events to `stream`, keeping their ids and
    /// timestamps. Versions must continue the stream.
    ///
    /// Nothing is written unless the graph accepts the whole batch.
    pub(crate) fn append_events(
        &self,
        stream: &Stream,
        events: Vec<Event>,
    ) -> KyroResult<StreamVersion> {
        self.link_stream(stream)?;
        if events.is_empty() {
            return Ok(stream.version);
        }
        self.graph.add_events(&events)?;
        let version = match self
            .registry
            .append(stream, events, ExpectedVersion::Exact(stream.version))
        {
            Ok(version) => version,
            Err(e) => {
                self.graph.trim_stream(&stream.key, stream.version)?;
                return Err(e);
            }
        };
        debug!(stream = %stream.key, version = %version, "events appended");
        Ok(version)
    }

    /// Drops a stream created by a write that was then refused.
    fn discard_stream(&self, key: &StreamKey) -> KyroResult<()> {
        if self.graph.get_stream_version(key)?.is_some() {
            self.graph.delete_stream(key)?;
        }
        self.registry.delete(key)
    }

    /// Registers `stream` and its ancestors with the graph, oldest first.
    pub(crate) fn link_stream(&self, stream: &Stream) -> KyroResult<()> {
        let ancestors = self.registry.ancestors(stream)?;
        for link in ancestors.iter().rev() {
            let ancestor = self.registry.get(&link.key)?;
            self.graph
                .register_stream(&ancestor.key, ancestor.parent.clone())?;
        }
        self.graph.register_stream(&stream.key, stream.parent.clone())
    }

    /// Reads up to `count` events from logical version `from`.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` or `VersionGap`.
    pub fn read(&self, key: &StreamKey, from: u64, count: u64) -> KyroResult<Vec<Event>> {
        let stream = self.registry.get(key)?;
        self.registry.read(&stream, from, count)
    }

    /// Reads a stream's whole logical history.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` or `VersionGap`.
    pub fn read_all(&self, key: &StreamKey) -> KyroResult<Vec<Event>> {
        let stream = self.registry.get(key)?;
        self.registry.read_all(&stream)
    }

    /// Records a command in the context's command log.
    ///
    /// # Errors
    ///
    /// Returns a storage error for duplicate ids.
    pub fn record_command(
        &self,
        ctx: &TimelineContext,
        draft: CommandDraft,
    ) -> KyroResult<Command> {
        let command = draft.into_command(ctx.timeline(), self.clock.now());
        self.insert_command(command.clone())?;
        Ok(command)
    }

    pub(crate) fn insert_command(&self, command: Command) -> KyroResult<()> {
        self.commands.append(command.clone())?;
        if let Err(e) = self.graph.add_command(&command) {
            self.commands
                .remove(&command.timeline, &[command.message_id])?;
            return Err(e);
        }
        Ok(())
    }

    /// The context's command log in append order.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn commands(&self, ctx: &TimelineContext) -> KyroResult<Vec<Command>> {
        Ok(self.commands.list(ctx.timeline())?)
    }

    /// Finds a command in a timeline's log.
    ///
    /// # Errors
    ///
    /// Returns `CommandNotFound` if it is not there.
    pub fn command(&self, timeline: &TimelineId, id: MessageId) -> KyroResult<Command> {
        self.commands
            .list(timeline)?
            .into_iter()
            .find(|c| c.message_id == id)
            .ok_or_else(|| {
                ExecutionError::CommandNotFound {
                    id,
                    timeline: timeline.to_string(),
                }
                .into()
            })
    }

    /// Timestamp of `version` in `key`.
    ///
    /// # Errors
    ///
    /// Returns `TimestampUnresolved` if the graph holds no such event.
    pub fn timestamp(&self, key: &StreamKey, version: u64) -> KyroResult<LogicalTime> {
        self.graph.get_timestamp(key, version)?.ok_or_else(|| {
            ExecutionError::TimestampUnresolved {
                key: key.to_string(),
                version,
            }
            .into()
        })
    }

    /// Verifies and returns a stream's Merkle hash.
    ///
    /// # Errors
    ///
    /// Returns `VersionGap` or `HashMismatch` on corruption.
    pub fn verify_stream(&self, key: &StreamKey) -> KyroResult<ContentHash> {
        self.graph.verify_stream(key)
    }
}

/// A store over in-memory logs driven by a manual clock.
#[cfg(test)]
pub(crate) fn manual_store() -> (Arc<crate::time::ManualClock>, TimelineStore) {
    let source = Arc::new(crate::time::ManualClock::new(1_000));
    let store = TimelineStore::with_clock(
        StoreConfig::default(),
        Arc::new(InMemoryEventLog::new()),
        Arc::new(InMemoryCommandLog::new()),
        Arc::clone(&source),
    )
    .unwrap();
    (source, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (Arc<crate::time::ManualClock>, TimelineStore) {
        manual_store()
    }

    #[test]
    fn test_append_creates_stream_and_links_graph() {
        let (_, store) = store();
        let ctx = store.root_context();
        let root = StreamDescriptor::aggregate("Root", "1");
        let events = store
            .append(
                &ctx,
                &root,
                vec![EventDraft::new("RootCreated", json!({}))],
                ExpectedVersion::Exact(StreamVersion::NoStream),
            )
            .unwrap();
        let key = ctx.key("Root", "1");
        assert_eq!(events[0].version, 0);
        assert_eq!(store.version(&key).unwrap(), StreamVersion::At(0));
        assert_eq!(
            store.graph().get_stream_version(&key).unwrap(),
            Some(StreamVersion::At(0))
        );
        assert_eq!(
            store.verify_stream(&key).unwrap(),
            store.graph().stream_hash(&key).unwrap().unwrap()
        );
    }

    #[test]
    fn test_wrong_expected_version_is_a_conflict() {
        let (_, store) = store();
        let ctx = store.root_context();
        let root = StreamDescriptor::aggregate("Root", "1");
        store
            .append(
                &ctx,
                &root,
                vec![EventDraft::new("RootCreated", json!({}))],
                ExpectedVersion::Any,
            )
            .unwrap();
        let err = store
            .append(
                &ctx,
                &root,
                vec![EventDraft::new("RootUpdated", json!({}))],
                ExpectedVersion::Exact(StreamVersion::Empty),
            )
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.version(&ctx.key("Root", "1")).unwrap(), StreamVersion::At(0));
    }

    #[test]
    fn test_refused_append_leaves_log_and_graph_alone() {
        let (_, store) = store();
        let ctx = store.root_context();
        let root = StreamDescriptor::aggregate("Root", "1");
        let key = ctx.key("Root", "1");
        let looped = || {
            let id = MessageId::new();
            EventDraft::new("Loop", json!({})).with_id(id).caused_by(id)
        };

        // A refused first write does not leave an empty stream behind.
        let err = store
            .append(&ctx, &root, vec![looped()], ExpectedVersion::Any)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.version(&key).unwrap(), StreamVersion::NoStream);
        assert_eq!(store.graph().get_stream_version(&key).unwrap(), None);

        store
            .append(&ctx, &root, vec![EventDraft::new("A", json!(1))], ExpectedVersion::Any)
            .unwrap();
        let err = store
            .append(
                &ctx,
                &root,
                vec![EventDraft::new("B", json!(2)), looped()],
                ExpectedVersion::Any,
            )
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(store.version(&key).unwrap(), StreamVersion::At(0));
        assert_eq!(
            store.graph().get_stream_version(&key).unwrap(),
            Some(StreamVersion::At(0))
        );

        let next = store
            .append(&ctx, &root, vec![EventDraft::new("C", json!(3))], ExpectedVersion::Any)
            .unwrap();
        assert_eq!(next[0].version, 1);
        let hash = store.verify_stream(&key).unwrap();
        let stats = store.populate(&CancellationToken::new()).unwrap();
        assert_eq!(stats.events, 2);
        assert_eq!(store.verify_stream(&key).unwrap(), hash);
    }

    #[test]
    fn test_timestamps_increase_along_a_stream() {
        let (_, store) = store();
        let ctx = store.root_context();
        let events = store
            .append(
                &ctx,
                &StreamDescriptor::aggregate("Root", "1"),
                vec![EventDraft::new("A", json!(1)), EventDraft::new("B", json!(2))],
                ExpectedVersion::Any,
            )
            .unwrap();
        assert!(events[0].timestamp < events[1].timestamp);
        assert_eq!(store.timestamp(&ctx.key("Root", "1"), 1).unwrap(), events[1].timestamp);
        assert!(store.timestamp(&ctx.key("Root", "1"), 2).is_err());
    }

    #[test]
    fn test_record_command_links_events() {
        let (_, store) = store();
        let ctx = store.root_context();
        let command = store
            .record_command(&ctx, CommandDraft::new("1", "CreateRoot", json!({})))
            .unwrap();
        store
            .append(
                &ctx,
                &StreamDescriptor::aggregate("Root", "1"),
                vec![EventDraft::new("RootCreated", json!({})).from_command(command.message_id)],
                ExpectedVersion::Any,
            )
            .unwrap();
        assert_eq!(store.graph().events_of_command(command.message_id).unwrap().len(), 1);
        assert_eq!(store.command(ctx.timeline(), command.message_id).unwrap(), command);
        assert!(store.command(ctx.timeline(), MessageId::new()).is_err());
    }

    #[test]
    fn test_populate_rebuilds_the_same_graph() {
        let (_, store) = store();
        let ctx = store.root_context();
        store
            .append(
                &ctx,
                &StreamDescriptor::aggregate("Root", "1"),
                vec![EventDraft::new("A", json!(1)), EventDraft::new("B", json!(2))],
                ExpectedVersion::Any,
            )
            .unwrap();
        let key = ctx.key("Root", "1");
        let before = store.graph().stream_hash(&key).unwrap();
        let stats = store.populate(&CancellationToken::new()).unwrap();
        assert_eq!(stats.streams, 1);
        assert_eq!(stats.events, 2);
        assert_eq!(store.graph().stream_hash(&key).unwrap(), before);
    }
}
