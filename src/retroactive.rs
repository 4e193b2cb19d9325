//! Retroactive mutation: inserting into and removing from the middle of a
//! stream on an append-only log.
//!
//! A rewrite never edits events in place. It branches the stream just before
//! the splice point into a scratch timeline, writes the new tail there, trims
//! the original back to the splice point and merges the scratch timeline in.
//! Each step is recorded in a [`RewriteMarker`] first so a crashed rewrite
//! can be finished or undone by [`TimelineStore::recover_rewrites`].
//!
//! The graph stays paused for the whole rewrite; readers on other threads
//! never see the stream half-spliced.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::branch::MergeOutcome;
use crate::bus::CommandBus;
use crate::causality::VertexId;
use crate::error::{ExecutionError, KyroError, KyroResult, ValidationError};
use crate::message::{Event, EventDraft, MessageId};
use crate::signal::Signal;
use crate::storage::{RewriteMarker, RewritePhase};
use crate::store::TimelineStore;
use crate::stream::{
    ExpectedVersion, Stream, StreamFilter, StreamKey, StreamVersion, TimelineContext, TimelineId,
};
use crate::time::LogicalTime;

/// Why an event cannot be inserted where requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidReason {
    /// The ancestor sits at or after the insertion point of the same stream.
    AncestorAfterInsertionPoint {
        /// The offending ancestor.
        ancestor: MessageId,
        /// Its version.
        version: u64,
    },
    /// The ancestor is this event or a later event of the same batch.
    ForwardReference {
        /// The offending ancestor.
        ancestor: MessageId,
    },
    /// The ancestor is stamped at or after the event being displaced.
    AncestorInFuture {
        /// The offending ancestor.
        ancestor: MessageId,
        /// Its timestamp.
        timestamp: LogicalTime,
    },
}

/// An event refused by [`TimelineStore::validate_insert`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidEvent {
    /// Position in the submitted batch.
    pub index: usize,
    /// Id of the draft, if it carried one.
    pub message_id: Option<MessageId>,
    /// What is wrong with it.
    pub reason: InvalidReason,
}

/// Result of a retroactive insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertOutcome {
    /// The events now occupy `version..version + count`.
    Inserted {
        /// Stream written.
        key: StreamKey,
        /// First inserted version.
        version: u64,
        /// Events inserted.
        count: usize,
    },
    /// Nothing was written.
    Rejected(Vec<InvalidEvent>),
}

impl InsertOutcome {
    /// True if the events were inserted.
    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

/// Result of [`TimelineStore::rollback_commands`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// Commands removed from the log.
    pub commands: usize,
    /// Events removed from streams.
    pub events: usize,
}

/// What recovery did with one interrupted rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// The scratch timeline was discarded; the stream is as before.
    RolledBack {
        /// Stream that was being rewritten.
        stream: StreamKey,
        /// Discarded scratch timeline.
        temp_timeline: TimelineId,
    },
    /// The rewrite was completed.
    RolledForward {
        /// Stream that was being rewritten.
        stream: StreamKey,
        /// Merged scratch timeline.
        temp_timeline: TimelineId,
    },
}

struct InsertPlan {
    invalid: Vec<InvalidEvent>,
    stamps: Vec<LogicalTime>,
}

/// Stamp for an event inserted after `floor`. With nothing before it, the
/// event goes just ahead of `ceiling`'s physical tick.
fn stamp_after(floor: Option<LogicalTime>, ceiling: LogicalTime) -> LogicalTime {
    match floor {
        Some(floor) => floor.successor(),
        None => LogicalTime::new(ceiling.physical.saturating_sub(1), 0),
    }
}

/// Moves each displaced event that no longer sorts after its predecessor
/// to the next free stamp.
fn restamp_after(prev: LogicalTime, events: Vec<Event>) -> Vec<Event> {
    let mut prev = prev;
    events
        .into_iter()
        .map(|mut event| {
            if event.timestamp <= prev {
                event.timestamp = prev.successor();
            }
            prev = event.timestamp;
            event
        })
        .collect()
}

impl TimelineStore {
    /// Checks a retroactive insert of `drafts` at `version` of `key` without
    /// writing anything. Returns the offending events; empty means valid.
    ///
    /// # Errors
    ///
    /// Returns `VersionOutOfRange` past the end of the stream, `StreamInUse`
    /// when a branch inherits versions at or after `version`, or
    /// `TimestampUnresolved` if the graph lacks the displaced event.
    pub fn validate_insert(
        &self,
        key: &StreamKey,
        version: u64,
        drafts: &[EventDraft],
    ) -> KyroResult<Vec<InvalidEvent>> {
        let stream = self.stream(key)?;
        Ok(self.plan_insert(&stream, version, drafts)?.invalid)
    }

    fn plan_insert(
        &self,
        stream: &Stream,
        version: u64,
        drafts: &[EventDraft],
    ) -> KyroResult<InsertPlan> {
        let count = stream.version.count();
        if version > count {
            return Err(ValidationError::VersionOutOfRange {
                key: stream.key.to_string(),
                version,
                current: stream.version,
            }
            .into());
        }
        self.check_dependents(stream, version)?;

        let history = self.registry().read_all(stream)?;
        let position: HashMap<MessageId, u64> =
            history.iter().map(|e| (e.message_id, e.version)).collect();
        let batch: HashMap<MessageId, usize> = drafts
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.message_id.map(|id| (id, i)))
            .collect();
        let ceiling = if version < count {
            Some(self.timestamp(&stream.key, version)?)
        } else {
            None
        };
        let mut floor = match version.checked_sub(1) {
            Some(prev) => Some(self.timestamp(&stream.key, prev)?),
            None => None,
        };

        let mut plan = InsertPlan {
            invalid: Vec::new(),
            stamps: Vec::with_capacity(drafts.len()),
        };
        for (index, draft) in drafts.iter().enumerate() {
            let mut event_floor = floor;
            let mut reason = None;
            for cause in draft.ancestor_id.iter().chain(draft.command_id.iter()) {
                if let Some(&at) = position.get(cause) {
                    if at >= version {
                        reason = Some(InvalidReason::AncestorAfterInsertionPoint {
                            ancestor: *cause,
                            version: at,
                        });
                        break;
                    }
                } else if let Some(&j) = batch.get(cause) {
                    if j >= index {
                        reason = Some(InvalidReason::ForwardReference { ancestor: *cause });
                        break;
                    }
                } else if let Some(stamp) = self
                    .graph()
                    .vertex(&VertexId::Message(*cause))?
                    .and_then(|v| v.timestamp())
                {
                    if ceiling.is_some_and(|c| stamp >= c) {
                        reason = Some(InvalidReason::AncestorInFuture {
                            ancestor: *cause,
                            timestamp: stamp,
                        });
                        break;
                    }
                    event_floor = event_floor.max(Some(stamp));
                }
            }
            if let (None, Some(ceiling)) = (&reason, ceiling) {
                let stamp = stamp_after(event_floor, ceiling);
                plan.stamps.push(stamp);
                floor = Some(stamp);
            }
            if let Some(reason) = reason {
                plan.invalid.push(InvalidEvent {
                    index,
                    message_id: draft.message_id,
                    reason,
                });
            }
        }
        Ok(plan)
    }

    /// Refuses to rewrite `stream` from `from` on while another stream
    /// inherits versions at or after it.
    fn check_dependents(&self, stream: &Stream, from: u64) -> KyroResult<()> {
        for child in self.registry().children(&stream.key)? {
            if child.base() > from {
                return Err(ValidationError::StreamInUse {
                    key: stream.key.to_string(),
                    dependent: child.key.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Inserts `drafts` so the first lands at `version` and every event
    /// previously at or after `version` shifts up.
    ///
    /// Inserted events are stamped right after their predecessor. Displaced
    /// events that would no longer sort after them are stamped anew, so the
    /// stream stays ordered in time. Inserting at the end is a plain append.
    ///
    /// # Errors
    ///
    /// See [`TimelineStore::validate_insert`]; also `RewriteInProgress` if
    /// the stream is already being rewritten.
    pub fn insert_into_stream(
        &self,
        key: &StreamKey,
        version: u64,
        drafts: Vec<EventDraft>,
    ) -> KyroResult<InsertOutcome> {
        let drafts: Vec<EventDraft> = drafts
            .into_iter()
            .map(|d| match d.message_id {
                Some(_) => d,
                None => d.with_id(MessageId::new()),
            })
            .collect();
        let stream = self.stream(key)?;
        let plan = self.plan_insert(&stream, version, &drafts)?;
        if !plan.invalid.is_empty() {
            warn!(
                stream = %key,
                version,
                invalid = plan.invalid.len(),
                "retroactive insert rejected"
            );
            return Ok(InsertOutcome::Rejected(plan.invalid));
        }
        let count = drafts.len();
        if count == 0 {
            return Ok(InsertOutcome::Inserted {
                key: key.clone(),
                version,
                count,
            });
        }

        if version == stream.version.count() {
            let ctx = TimelineContext::new(key.timeline().clone());
            self.append(
                &ctx,
                &stream.descriptor(),
                drafts,
                ExpectedVersion::Exact(stream.version),
            )?;
        } else {
            let mut tail: Vec<Event> = drafts
                .into_iter()
                .zip(plan.stamps)
                .map(|(draft, stamp)| draft.into_event(key, version, stamp))
                .collect();
            let displaced = self
                .registry()
                .read(&stream, version, stream.version.count() - version)?;
            let last = tail.last().map(|e| e.timestamp).unwrap_or_default();
            tail.extend(restamp_after(last, displaced));
            if let Some(latest) = tail.last() {
                self.clock().receive(latest.timestamp);
            }
            self.splice(&stream, version, tail)?;
        }
        info!(stream = %key, version, count, "events inserted retroactively");
        Ok(InsertOutcome::Inserted {
            key: key.clone(),
            version,
            count,
        })
    }

    /// Removes the given messages from `key`, shifting later events down.
    ///
    /// Returns how many events were removed; unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns `StreamInUse` if a branch inherits an affected version.
    pub fn remove_events(&self, key: &StreamKey, ids: &[MessageId]) -> KyroResult<usize> {
        let stream = self.stream(key)?;
        let doomed: HashSet<MessageId> = ids.iter().copied().collect();
        let history = self.registry().read_all(&stream)?;
        let Some(from) = history.iter().position(|e| doomed.contains(&e.message_id)) else {
            return Ok(0);
        };
        let tail: Vec<Event> = history[from..]
            .iter()
            .filter(|e| !doomed.contains(&e.message_id))
            .cloned()
            .collect();
        let removed = history.len() - from - tail.len();
        let from = from as u64;
        if tail.is_empty() {
            self.trim_stream(key, StreamVersion::before(from))?;
        } else {
            self.check_dependents(&stream, from)?;
            self.splice(&stream, from, tail)?;
        }
        info!(stream = %key, removed, "events removed retroactively");
        Ok(removed)
    }

    /// Truncates `key` so its last version is `keep` and signals that
    /// projections past it are stale. Returns the physically removed events.
    ///
    /// # Errors
    ///
    /// Returns `StreamInUse` if a branch inherits a removed version.
    pub fn trim_stream(&self, key: &StreamKey, keep: StreamVersion) -> KyroResult<Vec<Event>> {
        let stream = self.stream(key)?;
        let keep = keep.max(StreamVersion::Empty);
        if keep >= stream.version {
            return Ok(Vec::new());
        }
        self.check_dependents(&stream, keep.count())?;
        let removed = self.trim_linked(&stream, keep)?;
        self.publish(&Signal::ProjectionsInvalidated {
            stream: key.clone(),
            from_version: keep.count(),
        });
        Ok(removed)
    }

    fn trim_linked(&self, stream: &Stream, keep: StreamVersion) -> KyroResult<Vec<Event>> {
        let removed = self.registry().trim(stream, keep)?;
        if self.graph().get_stream_version(&stream.key)?.is_some() {
            self.graph().trim_stream(&stream.key, keep)?;
        }
        Ok(removed)
    }

    /// Replaces `stream`'s history from `from` on with `tail`.
    fn splice(&self, stream: &Stream, from: u64, tail: Vec<Event>) -> KyroResult<()> {
        let _paused = self.graph().pause(self.config().max_pause())?;
        let log = self.registry().log();
        if log
            .list_rewrite_markers()?
            .iter()
            .any(|m| m.stream == stream.key)
        {
            return Err(ExecutionError::RewriteInProgress {
                key: stream.key.to_string(),
            }
            .into());
        }

        let mut marker = RewriteMarker {
            stream: stream.key.clone(),
            temp_timeline: TimelineId::new(format!("rewrite-{}", uuid::Uuid::new_v4().simple()))?,
            version: from,
            phase: RewritePhase::Branched,
            started_at: Utc::now(),
        };
        self.advance(&mut marker, RewritePhase::Branched)?;
        let scratch = self
            .registry()
            .branch(stream, &marker.temp_timeline, StreamVersion::before(from))?;
        self.link_stream(&scratch)?;

        self.advance(&mut marker, RewritePhase::Written)?;
        let events: Vec<Event> = tail
            .iter()
            .zip(from..)
            .map(|(event, version)| event.relocated(&scratch.key, version))
            .collect();
        self.append_events(&scratch, events)?;

        self.advance(&mut marker, RewritePhase::Trimmed)?;
        self.roll_forward(&mut marker)
    }

    fn advance(&self, marker: &mut RewriteMarker, phase: RewritePhase) -> KyroResult<()> {
        marker.phase = phase;
        self.registry().log().put_rewrite_marker(marker)?;
        debug!(
            stream = %marker.stream,
            scratch = %marker.temp_timeline,
            phase = ?phase,
            "rewrite phase"
        );
        Ok(())
    }

    /// Trims the original (unless already merging), merges the scratch
    /// timeline back and discards it.
    fn roll_forward(&self, marker: &mut RewriteMarker) -> KyroResult<()> {
        if marker.phase <= RewritePhase::Trimmed {
            let stream = self.stream(&marker.stream)?;
            self.trim_linked(&stream, StreamVersion::before(marker.version))?;
            self.advance(marker, RewritePhase::Merged)?;
        }

        let ctx = TimelineContext::new(marker.stream.timeline().clone());
        let only = StreamFilter::Keys(vec![marker.stream.clone()]);
        if let MergeOutcome::Failed(failure) =
            self.merge_filtered(&ctx, &marker.temp_timeline, false, &only)?
        {
            return Err(KyroError::internal(format!(
                "rewrite of {} could not merge back: {failure}",
                marker.stream
            )));
        }
        self.remove_timeline(&marker.temp_timeline)?;
        self.registry().log().clear_rewrite_marker(&marker.stream)?;
        self.publish(&Signal::ProjectionsInvalidated {
            stream: marker.stream.clone(),
            from_version: marker.version,
        });
        Ok(())
    }

    /// Finishes or undoes every rewrite interrupted by a crash.
    ///
    /// Rewrites that had not started trimming are rolled back; the rest are
    /// rolled forward. Run after [`TimelineStore::populate`].
    ///
    /// # Errors
    ///
    /// Propagates storage failures; a failed recovery leaves its marker in
    /// place for the next attempt.
    pub fn recover_rewrites(&self) -> KyroResult<Vec<RecoveryAction>> {
        let _paused = self.graph().pause(self.config().max_pause())?;
        let mut actions = Vec::new();
        for mut marker in self.registry().log().list_rewrite_markers()? {
            if marker.phase < RewritePhase::Trimmed {
                self.remove_timeline(&marker.temp_timeline)?;
                self.registry().log().clear_rewrite_marker(&marker.stream)?;
                warn!(
                    stream = %marker.stream,
                    phase = ?marker.phase,
                    "interrupted rewrite rolled back"
                );
                actions.push(RecoveryAction::RolledBack {
                    stream: marker.stream,
                    temp_timeline: marker.temp_timeline,
                });
            } else {
                self.roll_forward(&mut marker)?;
                warn!(stream = %marker.stream, "interrupted rewrite rolled forward");
                actions.push(RecoveryAction::RolledForward {
                    stream: marker.stream,
                    temp_timeline: marker.temp_timeline,
                });
            }
        }
        Ok(actions)
    }

    /// Re-executes a recorded command through `bus` at its original place
    /// in time, replacing whatever events it produced before.
    ///
    /// # Errors
    ///
    /// Returns `CommandNotFound` if the command is not in the context's log,
    /// or whatever the bus rejects it with.
    pub fn replay_command(
        &self,
        ctx: &TimelineContext,
        id: MessageId,
        bus: &dyn CommandBus,
    ) -> KyroResult<InsertOutcome> {
        let command = self.command(ctx.timeline(), id)?;
        let descriptor = bus.target(&command);
        let key = descriptor.key(ctx)?;

        if self.find_stream(&key)?.is_some() {
            let previous: Vec<MessageId> = self
                .graph()
                .events_of_command(id)?
                .into_iter()
                .map(|e| e.id)
                .collect();
            self.remove_events(&key, &previous)?;
        }
        let (stream, _) = self.registry().get_or_add(ctx, &descriptor)?;
        self.link_stream(&stream)?;

        let at = self
            .graph()
            .version_at(&key, command.timestamp)?
            .unwrap_or(StreamVersion::Empty)
            .count();
        let history = self.registry().read(&stream, 0, at)?;
        let drafts: Vec<EventDraft> = bus
            .handle(&command, &history)?
            .into_iter()
            .map(|d| {
                let d = d.from_command(id);
                if d.ancestor_id.is_some() {
                    d
                } else {
                    d.caused_by(id)
                }
            })
            .collect();
        debug!(command = %id, stream = %key, at, events = drafts.len(), "replaying command");
        self.insert_into_stream(&key, at, drafts)
    }

    /// Removes commands from the context's log together with the events
    /// they produced in the context's timeline.
    ///
    /// # Errors
    ///
    /// Returns `StreamInUse` if a branch inherits an affected event.
    pub fn rollback_commands(
        &self,
        ctx: &TimelineContext,
        ids: &[MessageId],
    ) -> KyroResult<RollbackOutcome> {
        let wanted: BTreeSet<MessageId> = ids.iter().copied().collect();
        let present: Vec<MessageId> = self
            .commands(ctx)?
            .into_iter()
            .map(|c| c.message_id)
            .filter(|id| wanted.contains(id))
            .collect();

        let mut by_stream: BTreeMap<StreamKey, Vec<MessageId>> = BTreeMap::new();
        for id in &present {
            for event in self.graph().events_of_command(*id)? {
                for key in event.occurrences.keys() {
                    by_stream
                        .entry(key.with_timeline(ctx.timeline()))
                        .or_default()
                        .push(event.id);
                }
            }
        }

        let mut outcome = RollbackOutcome::default();
        for (key, doomed) in by_stream {
            if self.find_stream(&key)?.is_some() {
                outcome.events += self.remove_events(&key, &doomed)?;
            }
        }
        outcome.commands = self.command_log().remove(ctx.timeline(), &present)?;
        self.graph().remove_commands(&present)?;
        info!(
            timeline = %ctx.timeline(),
            commands = outcome.commands,
            events = outcome.events,
            "commands rolled back"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchOptions;
    use crate::bus::FnBus;
    use crate::message::{Command, CommandDraft};
    use crate::store::manual_store;
    use crate::stream::StreamDescriptor;
    use crate::time::ManualClock;
    use serde_json::json;

    /// Appends `n` events one clock tick apart.
    fn seeded(clock: &ManualClock, store: &TimelineStore, n: usize) -> (StreamKey, Vec<Event>) {
        let ctx = store.root_context();
        let mut events = Vec::new();
        for i in 0..n {
            clock.advance(1);
            events.extend(
                store
                    .append(
                        &ctx,
                        &StreamDescriptor::aggregate("Root", "1"),
                        vec![EventDraft::new("Step", json!({ "n": i }))],
                        ExpectedVersion::Any,
                    )
                    .unwrap(),
            );
        }
        (ctx.key("Root", "1"), events)
    }

    fn payloads(store: &TimelineStore, key: &StreamKey) -> Vec<serde_json::Value> {
        store.read_all(key).unwrap().into_iter().map(|e| e.payload).collect()
    }

    #[test]
    fn test_insert_shifts_the_tail() {
        let (clock, store) = manual_store();
        let (key, original) = seeded(&clock, &store, 3);
        let signals = store.subscribe();

        let outcome = store
            .insert_into_stream(&key, 1, vec![EventDraft::new("Extra", json!("x"))])
            .unwrap();
        assert!(outcome.is_inserted());

        let events = store.read_all(&key).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[1].payload, json!("x"));
        assert_eq!(events[2].message_id, original[1].message_id);
        assert_eq!(events[3].message_id, original[2].message_id);
        assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(events.iter().zip(0..).all(|(e, v)| e.version == v));

        store.verify_stream(&key).unwrap();
        assert_eq!(store.graph().get_stream_version(&key).unwrap(), Some(StreamVersion::At(3)));
        assert!(store.registry().log().list_rewrite_markers().unwrap().is_empty());
        assert!(signals
            .drain()
            .contains(&Signal::ProjectionsInvalidated { stream: key.clone(), from_version: 1 }));
    }

    #[test]
    fn test_insert_then_remove_restores_history() {
        let (clock, store) = manual_store();
        let (key, original) = seeded(&clock, &store, 3);
        let before = store.graph().stream_hash(&key).unwrap();
        let id = MessageId::new();
        store
            .insert_into_stream(&key, 1, vec![EventDraft::new("Extra", json!("x")).with_id(id)])
            .unwrap();
        assert_eq!(store.remove_events(&key, &[id]).unwrap(), 1);

        let restored = store.read_all(&key).unwrap();
        assert_eq!(restored, original);
        assert_eq!(store.graph().stream_hash(&key).unwrap(), before);
    }

    #[test]
    fn test_forward_ancestors_are_rejected() {
        let (clock, store) = manual_store();
        let (key, original) = seeded(&clock, &store, 3);
        let later = EventDraft::new("Bad", json!({})).caused_by(original[2].message_id);
        let self_ref_id = MessageId::new();
        let self_ref = EventDraft::new("Bad", json!({}))
            .with_id(self_ref_id)
            .caused_by(self_ref_id);

        let invalid = store
            .validate_insert(&key, 1, &[EventDraft::new("Ok", json!({})), later.clone(), self_ref])
            .unwrap();
        assert_eq!(invalid.len(), 2);
        assert_eq!(invalid[0].index, 1);
        assert!(matches!(
            invalid[0].reason,
            InvalidReason::AncestorAfterInsertionPoint { version: 2, .. }
        ));
        assert!(matches!(invalid[1].reason, InvalidReason::ForwardReference { .. }));

        let outcome = store.insert_into_stream(&key, 1, vec![later]).unwrap();
        assert!(!outcome.is_inserted());
        assert_eq!(store.read_all(&key).unwrap(), original);
    }

    #[test]
    fn test_insert_bounds_and_branch_guard() {
        let (clock, store) = manual_store();
        let (key, _) = seeded(&clock, &store, 2);
        assert!(store
            .insert_into_stream(&key, 5, vec![EventDraft::new("X", json!({}))])
            .unwrap_err()
            .is_validation());

        let appended = store
            .insert_into_stream(&key, 2, vec![EventDraft::new("Tail", json!({}))])
            .unwrap();
        assert!(appended.is_inserted());
        assert_eq!(store.version(&key).unwrap(), StreamVersion::At(2));

        store
            .branch(
                &store.root_context(),
                &TimelineId::new("b").unwrap(),
                store.clock().now(),
                &BranchOptions::default(),
            )
            .unwrap();
        let err = store
            .insert_into_stream(&key, 1, vec![EventDraft::new("X", json!({}))])
            .unwrap_err();
        assert!(matches!(err, KyroError::Validation(ValidationError::StreamInUse { .. })));
    }

    #[test]
    fn test_trim_signals_invalidation() {
        let (clock, store) = manual_store();
        let (key, _) = seeded(&clock, &store, 3);
        let signals = store.subscribe();
        let removed = store.trim_stream(&key, StreamVersion::At(0)).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(payloads(&store, &key), vec![json!({ "n": 0 })]);
        assert_eq!(store.graph().get_stream_version(&key).unwrap(), Some(StreamVersion::At(0)));
        assert_eq!(
            signals.drain(),
            vec![Signal::ProjectionsInvalidated { stream: key, from_version: 1 }]
        );
    }

    fn counter_bus() -> impl CommandBus {
        FnBus::new(
            |_: &Command| StreamDescriptor::aggregate("Root", "1"),
            |c: &Command, history: &[Event]| {
                Ok(vec![EventDraft::new(
                    "Counted",
                    json!({ "command": c.command_type, "seen": history.len() }),
                )])
            },
        )
    }

    #[test]
    fn test_replay_command_lands_at_its_time() {
        let (clock, store) = manual_store();
        let ctx = store.root_context();
        let (key, _) = seeded(&clock, &store, 1);
        clock.advance(10);
        let command = store
            .record_command(&ctx, CommandDraft::new("1", "Count", json!({})))
            .unwrap();
        clock.advance(10);
        store
            .append(
                &ctx,
                &StreamDescriptor::aggregate("Root", "1"),
                vec![EventDraft::new("Later", json!({}))],
                ExpectedVersion::Any,
            )
            .unwrap();

        let bus = counter_bus();
        let outcome = store.replay_command(&ctx, command.message_id, &bus).unwrap();
        assert!(outcome.is_inserted());
        let events = store.read_all(&key).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].payload, json!({ "command": "Count", "seen": 1 }));
        assert_eq!(events[1].command_id, Some(command.message_id));
        assert_eq!(events[1].ancestor_id, Some(command.message_id));

        store.replay_command(&ctx, command.message_id, &bus).unwrap();
        assert_eq!(store.read_all(&key).unwrap().len(), 3);
    }

    #[test]
    fn test_rollback_removes_commands_and_their_events() {
        let (clock, store) = manual_store();
        let ctx = store.root_context();
        let (key, _) = seeded(&clock, &store, 1);
        let command = store
            .record_command(&ctx, CommandDraft::new("1", "Count", json!({})))
            .unwrap();
        store
            .append(
                &ctx,
                &StreamDescriptor::aggregate("Root", "1"),
                vec![
                    EventDraft::new("Counted", json!(1)).from_command(command.message_id),
                    EventDraft::new("Other", json!(2)),
                ],
                ExpectedVersion::Any,
            )
            .unwrap();

        let outcome = store.rollback_commands(&ctx, &[command.message_id]).unwrap();
        assert_eq!(outcome, RollbackOutcome { commands: 1, events: 1 });
        assert_eq!(payloads(&store, &key), vec![json!({ "n": 0 }), json!(2)]);
        assert!(store.commands(&ctx).unwrap().is_empty());
        assert!(store
            .graph()
            .vertex(&VertexId::Message(command.message_id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_insert_between_same_tick_events_restamps_the_tail() {
        let (_, store) = manual_store();
        let ctx = store.root_context();
        let root = StreamDescriptor::aggregate("Root", "1");
        let key = ctx.key("Root", "1");
        let original = store
            .append(
                &ctx,
                &root,
                (0..3).map(|i| EventDraft::new("Step", json!({ "n": i }))).collect(),
                ExpectedVersion::Any,
            )
            .unwrap();
        assert_eq!(original[0].timestamp.physical, original[2].timestamp.physical);

        let outcome = store
            .insert_into_stream(&key, 1, vec![EventDraft::new("Extra", json!("x"))])
            .unwrap();
        assert!(outcome.is_inserted());

        let events = store.read_all(&key).unwrap();
        assert_eq!(events[0], original[0]);
        assert_eq!(events[1].payload, json!("x"));
        assert_eq!(events[2].message_id, original[1].message_id);
        assert_eq!(events[3].message_id, original[2].message_id);
        assert!(events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        for event in &events {
            assert_eq!(store.timestamp(&key, event.version).unwrap(), event.timestamp);
        }
        store.verify_stream(&key).unwrap();

        let later = store
            .append(&ctx, &root, vec![EventDraft::new("Later", json!({}))], ExpectedVersion::Any)
            .unwrap();
        assert!(later[0].timestamp > events[3].timestamp);
    }

    #[test]
    fn test_restamp_only_moves_events_that_fall_behind() {
        assert_eq!(
            stamp_after(None, LogicalTime::new(10, 0)),
            LogicalTime::new(9, 0)
        );
        assert_eq!(
            stamp_after(Some(LogicalTime::new(9, 0)), LogicalTime::new(10, 0)),
            LogicalTime::new(9, 1)
        );

        let key = StreamKey::parse("master:Root:1").unwrap();
        let at = |v: u64, physical: u64, counter: u32| {
            EventDraft::new("E", json!(v)).into_event(&key, v, LogicalTime::new(physical, counter))
        };
        let behind = vec![at(1, 5, 1), at(2, 5, 3), at(3, 9, 0)];
        let moved = restamp_after(LogicalTime::new(5, 2), behind);
        let stamps: Vec<LogicalTime> = moved.iter().map(|e| e.timestamp).collect();
        assert_eq!(
            stamps,
            vec![LogicalTime::new(5, 3), LogicalTime::new(5, 4), LogicalTime::new(9, 0)]
        );
    }
}
