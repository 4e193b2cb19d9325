//! Operation executor for a timeline store.
//!
//! Every mutating call on [`TimelineStore`] has an [`Operation`] variant so
//! writes can be queued and serialized by [`runtime::TimelineRuntime`].

/// Single-writer runtime.
pub mod runtime;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::branch::{BranchOptions, FastForwardResult, MergeOutcome};
use crate::bus::CommandBus;
use crate::error::{KyroResult, ValidationError};
use crate::message::{Command, CommandDraft, Event, EventDraft, MessageId};
use crate::retroactive::{InsertOutcome, RecoveryAction, RollbackOutcome};
use crate::store::TimelineStore;
use crate::stream::{
    ExpectedVersion, StreamDescriptor, StreamKey, StreamVersion, TimelineContext, TimelineId,
};
use crate::time::LogicalTime;

/// A mutating request.
#[derive(Clone)]
pub enum Operation {
    /// Append events to a stream, creating it if needed.
    Append {
        /// Timeline to write in.
        ctx: TimelineContext,
        /// Target stream.
        stream: StreamDescriptor,
        /// Events to append.
        events: Vec<EventDraft>,
        /// Optimistic concurrency check.
        expected: ExpectedVersion,
    },
    /// Record a command in the timeline's command log.
    RecordCommand {
        /// Timeline to record in.
        ctx: TimelineContext,
        /// The command.
        command: CommandDraft,
    },
    /// Fork the timeline at a point in time.
    Branch {
        /// Source timeline.
        ctx: TimelineContext,
        /// New timeline.
        id: TimelineId,
        /// Events stamped after this are not inherited.
        at: LogicalTime,
        /// Stream selection.
        options: BranchOptions,
    },
    /// Merge a branch back.
    Merge {
        /// Destination timeline.
        ctx: TimelineContext,
        /// Branch to merge.
        branch: TimelineId,
        /// Also create streams that exist only on the branch.
        include_new_streams: bool,
    },
    /// Delete a branch timeline.
    DeleteBranch {
        /// The branch.
        id: TimelineId,
    },
    /// Insert events into the middle of a stream.
    Insert {
        /// Stream to rewrite.
        key: StreamKey,
        /// Version the first event lands at.
        version: u64,
        /// Events to insert.
        events: Vec<EventDraft>,
    },
    /// Remove specific events from a stream.
    RemoveEvents {
        /// Stream to rewrite.
        key: StreamKey,
        /// Messages to drop.
        ids: Vec<MessageId>,
    },
    /// Truncate a stream.
    Trim {
        /// Stream to truncate.
        key: StreamKey,
        /// Last version to keep.
        keep: StreamVersion,
    },
    /// Re-execute a command at its original place in time.
    ReplayCommand {
        /// Timeline of the command.
        ctx: TimelineContext,
        /// The command.
        id: MessageId,
    },
    /// Remove commands and the events they produced.
    RollbackCommands {
        /// Timeline of the commands.
        ctx: TimelineContext,
        /// The commands.
        ids: Vec<MessageId>,
    },
    /// Copy what `remote` lacks of the timeline to it.
    Push {
        /// Timeline to replicate.
        ctx: TimelineContext,
        /// Destination store.
        remote: Arc<TimelineStore>,
    },
    /// Copy what this store lacks of the timeline from `remote`.
    Pull {
        /// Timeline to replicate.
        ctx: TimelineContext,
        /// Source store.
        remote: Arc<TimelineStore>,
    },
    /// Finish or undo interrupted rewrites.
    RecoverRewrites,
}

impl Operation {
    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Append { .. } => "append",
            Self::RecordCommand { .. } => "record_command",
            Self::Branch { .. } => "branch",
            Self::Merge { .. } => "merge",
            Self::DeleteBranch { .. } => "delete_branch",
            Self::Insert { .. } => "insert",
            Self::RemoveEvents { .. } => "remove_events",
            Self::Trim { .. } => "trim",
            Self::ReplayCommand { .. } => "replay_command",
            Self::RollbackCommands { .. } => "rollback_commands",
            Self::Push { .. } => "push",
            Self::Pull { .. } => "pull",
            Self::RecoverRewrites => "recover_rewrites",
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Operation").field(&self.name()).finish()
    }
}

/// Result of executing an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Result of an append.
    Appended {
        /// The stored events.
        events: Vec<Event>,
    },
    /// Result of recording a command.
    CommandRecorded {
        /// The stored command.
        command: Command,
    },
    /// Result of a branch.
    Branched {
        /// Context of the new timeline.
        context: TimelineContext,
    },
    /// Result of a merge.
    Merged(MergeOutcome),
    /// Result of deleting a branch.
    BranchDeleted {
        /// The deleted timeline.
        id: TimelineId,
    },
    /// Result of a retroactive insert.
    Inserted(InsertOutcome),
    /// Result of removing events.
    EventsRemoved {
        /// Events removed.
        count: usize,
    },
    /// Result of a trim.
    Trimmed {
        /// Physically removed events.
        removed: Vec<Event>,
    },
    /// Result of a command replay.
    Replayed(InsertOutcome),
    /// Result of a command rollback.
    RolledBack(RollbackOutcome),
    /// Result of a push or pull.
    FastForward(FastForwardResult),
    /// Result of rewrite recovery.
    Recovered(Vec<RecoveryAction>),
}

/// Executes operations against one store.
#[derive(Clone)]
pub struct TimelineEngine {
    store: Arc<TimelineStore>,
    bus: Option<Arc<dyn CommandBus>>,
}

impl fmt::Debug for TimelineEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineEngine")
            .field("root", self.store.root())
            .field("bus", &self.bus.is_some())
            .finish()
    }
}

impl TimelineEngine {
    /// Creates an engine without a command bus; replays will be refused.
    #[must_use]
    pub const fn new(store: Arc<TimelineStore>) -> Self {
        Self { store, bus: None }
    }

    /// Sets the bus used by command replay.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn CommandBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<TimelineStore> {
        &self.store
    }

    /// Executes one operation.
    ///
    /// # Errors
    ///
    /// Propagates the store's errors. Recoverable validation failures of
    /// merge, fast-forward and insert come back inside the response.
    pub fn execute(&self, op: Operation) -> KyroResult<Response> {
        let name = op.name();
        debug!(operation = name, "executing");
        let result = self.dispatch(op);
        if let Err(err) = &result {
            warn!(operation = name, error = %err, "operation failed");
        }
        result
    }

    fn dispatch(&self, op: Operation) -> KyroResult<Response> {
        let store = &self.store;
        match op {
            Operation::Append {
                ctx,
                stream,
                events,
                expected,
            } => store
                .append(&ctx, &stream, events, expected)
                .map(|events| Response::Appended { events }),
            Operation::RecordCommand { ctx, command } => store
                .record_command(&ctx, command)
                .map(|command| Response::CommandRecorded { command }),
            Operation::Branch {
                ctx,
                id,
                at,
                options,
            } => store
                .branch(&ctx, &id, at, &options)
                .map(|context| Response::Branched { context }),
            Operation::Merge {
                ctx,
                branch,
                include_new_streams,
            } => store
                .merge(&ctx, &branch, include_new_streams)
                .map(Response::Merged),
            Operation::DeleteBranch { id } => {
                store.delete_branch(&id)?;
                Ok(Response::BranchDeleted { id })
            }
            Operation::Insert {
                key,
                version,
                events,
            } => store
                .insert_into_stream(&key, version, events)
                .map(Response::Inserted),
            Operation::RemoveEvents { key, ids } => store
                .remove_events(&key, &ids)
                .map(|count| Response::EventsRemoved { count }),
            Operation::Trim { key, keep } => store
                .trim_stream(&key, keep)
                .map(|removed| Response::Trimmed { removed }),
            Operation::ReplayCommand { ctx, id } => {
                let bus = self.bus.as_deref().ok_or_else(|| ValidationError::InvalidConfig {
                    reason: "command replay needs a command bus".to_string(),
                })?;
                store
                    .replay_command(&ctx, id, bus)
                    .map(Response::Replayed)
            }
            Operation::RollbackCommands { ctx, ids } => store
                .rollback_commands(&ctx, &ids)
                .map(Response::RolledBack),
            Operation::Push { ctx, remote } => {
                store.push(&ctx, &remote).map(Response::FastForward)
            }
            Operation::Pull { ctx, remote } => {
                store.pull(&ctx, &remote).map(Response::FastForward)
            }
            Operation::RecoverRewrites => store.recover_rewrites().map(Response::Recovered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FnBus;
    use crate::error::KyroError;
    use serde_json::json;

    fn engine() -> TimelineEngine {
        TimelineEngine::new(Arc::new(TimelineStore::in_memory().unwrap()))
    }

    fn append(ctx: &TimelineContext, kind: &str) -> Operation {
        Operation::Append {
            ctx: ctx.clone(),
            stream: StreamDescriptor::aggregate("Root", "1"),
            events: vec![EventDraft::new(kind, json!({}))],
            expected: ExpectedVersion::Any,
        }
    }

    #[test]
    fn branch_update_merge_through_operations() {
        let engine = engine();
        let master = engine.store().root_context();
        let response = engine.execute(append(&master, "RootCreated")).unwrap();
        let Response::Appended { events } = response else {
            panic!("expected Appended");
        };
        let created = events[0].message_id;

        let Response::Branched { context: test } = engine
            .execute(Operation::Branch {
                ctx: master.clone(),
                id: TimelineId::new("test").unwrap(),
                at: engine.store().clock().now(),
                options: BranchOptions::default(),
            })
            .unwrap()
        else {
            panic!("expected Branched");
        };
        engine
            .execute(Operation::Append {
                ctx: test.clone(),
                stream: StreamDescriptor::aggregate("Root", "1"),
                events: vec![EventDraft::new("RootUpdated", json!({})).caused_by(created)],
                expected: ExpectedVersion::Exact(StreamVersion::At(0)),
            })
            .unwrap();

        let merged = engine
            .execute(Operation::Merge {
                ctx: master.clone(),
                branch: test.timeline().clone(),
                include_new_streams: false,
            })
            .unwrap();
        assert!(matches!(merged, Response::Merged(MergeOutcome::Merged { events: 1, .. })));
        assert_eq!(
            engine.store().version(&master.key("Root", "1")).unwrap(),
            StreamVersion::At(1)
        );
    }

    #[test]
    fn replay_requires_a_bus() {
        let engine = engine();
        let ctx = engine.store().root_context();
        let Response::CommandRecorded { command } = engine
            .execute(Operation::RecordCommand {
                ctx: ctx.clone(),
                command: CommandDraft::new("1", "Touch", json!({})),
            })
            .unwrap()
        else {
            panic!("expected CommandRecorded");
        };

        let op = Operation::ReplayCommand {
            ctx: ctx.clone(),
            id: command.message_id,
        };
        let err = engine.execute(op.clone()).unwrap_err();
        assert!(matches!(
            err,
            KyroError::Validation(ValidationError::InvalidConfig { .. })
        ));

        let engine = engine.with_bus(Arc::new(FnBus::new(
            |_: &Command| StreamDescriptor::aggregate("Root", "1"),
            |_: &Command, _: &[Event]| Ok(vec![EventDraft::new("Touched", json!({}))]),
        )));
        let Response::Replayed(outcome) = engine.execute(op).unwrap() else {
            panic!("expected Replayed");
        };
        assert!(outcome.is_inserted());
        assert_eq!(engine.store().read_all(&ctx.key("Root", "1")).unwrap().len(), 1);
    }

    #[test]
    fn operation_names_are_stable() {
        let ctx = TimelineContext::named("master").unwrap();
        assert_eq!(append(&ctx, "X").name(), "append");
        assert_eq!(Operation::RecoverRewrites.name(), "recover_rewrites");
        assert_eq!(format!("{:?}", Operation::RecoverRewrites), "Operation(\"recover_rewrites\")");
    }
}
