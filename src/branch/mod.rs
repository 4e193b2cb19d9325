//! Branch manager: copy-on-write timelines, diffs and merges.
//!
//! A branch never copies events. Branching creates one child stream per
//! source stream whose parent pointer names the source and the version it
//! diverged at; merging appends the child's extra events onto the parent
//! timeline after the whole merge has been validated.

mod replication;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{KyroResult, ValidationError};
use crate::message::{Event, MessageId};
use crate::signal::Signal;
use crate::store::TimelineStore;
use crate::stream::{
    Stream, StreamFilter, StreamKey, StreamMetadata, StreamRef, StreamVersion, TimelineContext,
    TimelineId,
};
use crate::time::LogicalTime;

/// Upper bound on ancestor hops before a chain is treated as corrupt.
const MAX_ANCESTRY: usize = 1024;

pub use replication::{FastForwardResult, FastForwardStatus};

/// Options for [`TimelineStore::branch`].
#[derive(Debug, Clone, Default)]
pub struct BranchOptions {
    /// Streams to branch; all by default.
    pub keys: StreamFilter,
    /// Drop any existing timeline with the target id first.
    pub delete_existing: bool,
}

/// Two histories that disagree at the same version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConflict {
    /// Destination stream.
    pub key: StreamKey,
    /// First version at which the histories differ.
    pub version: u64,
    /// Message held by the destination.
    pub local: MessageId,
    /// Message offered by the source.
    pub remote: MessageId,
}

/// Why a merge or fast-forward was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFailure {
    /// A stream's ancestor chain is incomplete on the destination.
    MissingAncestor {
        /// Stream being transferred.
        stream: StreamKey,
        /// The link that could not be found.
        ancestor: StreamKey,
    },
    /// Destination history is not a prefix of the source history.
    Conflict(StreamConflict),
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingAncestor { stream, ancestor } => {
                write!(f, "{stream} is missing ancestor {ancestor}")
            }
            Self::Conflict(c) => write!(
                f,
                "{} diverges at version {}: local {} vs remote {}",
                c.key, c.version, c.local, c.remote
            ),
        }
    }
}

/// Result of [`TimelineStore::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    /// The merge landed.
    Merged {
        /// Streams that received events.
        streams: usize,
        /// Events appended.
        events: usize,
        /// Commands copied.
        commands: usize,
    },
    /// Validation failed; nothing was written.
    Failed(TransferFailure),
}

impl MergeOutcome {
    /// True if the merge landed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }
}

/// One validated stream transfer.
#[derive(Debug)]
pub(crate) struct StreamTransfer {
    pub(crate) key: StreamKey,
    pub(crate) target: Option<Stream>,
    /// Metadata for a target that does not exist yet.
    pub(crate) create: StreamMetadata,
    pub(crate) missing: Vec<Event>,
}

/// Compares destination ids against source events.
///
/// Returns the source events the destination lacks, or the first conflict.
pub(crate) fn diff_prefix(
    key: &StreamKey,
    local: &[MessageId],
    remote: &[Event],
) -> Result<Vec<Event>, StreamConflict> {
    for (version, (l, r)) in (0u64..).zip(local.iter().zip(remote)) {
        if *l != r.message_id {
            return Err(StreamConflict {
                key: key.clone(),
                version,
                local: *l,
                remote: r.message_id,
            });
        }
    }
    Ok(remote.iter().skip(local.len()).cloned().collect())
}

fn ids(events: &[Event]) -> Vec<MessageId> {
    events.iter().map(|e| e.message_id).collect()
}

impl TimelineStore {
    /// Branches the context's timeline into `id` as of `at`.
    ///
    /// Every matching stream with at least one event stamped at or before
    /// `at` gets a child in `id` that inherits exactly those events. Streams
    /// already present in `id` are left alone. Returns the new context.
    ///
    /// # Errors
    ///
    /// Returns `SameTimeline` when branching a timeline onto itself.
    pub fn branch(
        &self,
        ctx: &TimelineContext,
        id: &TimelineId,
        at: LogicalTime,
        options: &BranchOptions,
    ) -> KyroResult<TimelineContext> {
        if id == ctx.timeline() {
            return Err(ValidationError::SameTimeline {
                timeline: id.to_string(),
            }
            .into());
        }
        if options.delete_existing
            && (!self.registry().list(Some(id), &StreamFilter::All)?.is_empty()
                || !self.command_log().list(id)?.is_empty())
        {
            self.delete_branch(id)?;
        }

        let mut created = 0usize;
        for source in self.registry().list(Some(ctx.timeline()), &options.keys)? {
            self.link_stream(&source)?;
            let version = self
                .graph()
                .version_at(&source.key, at)?
                .unwrap_or(StreamVersion::Empty);
            if version == StreamVersion::Empty {
                continue;
            }
            let child_key = source.key.with_timeline(id);
            if self.registry().find(&child_key)?.is_some() {
                debug!(stream = %child_key, "stream already branched");
                continue;
            }
            let child = self.registry().branch(&source, id, version)?;
            self.graph()
                .register_stream(&child.key, child.parent.clone())?;
            created += 1;
        }

        info!(from = %ctx.timeline(), to = %id, at = %at, streams = created, "timeline branched");
        self.publish(&Signal::TimelineChanged {
            from: ctx.timeline().clone(),
            to: id.clone(),
        });
        Ok(TimelineContext::new(id.clone()))
    }

    /// Per-stream count of messages present on only one side of `branch`
    /// and the context's timeline.
    ///
    /// Streams without differences are omitted. Keys are the branch's.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn get_changes(
        &self,
        ctx: &TimelineContext,
        branch: &TimelineId,
    ) -> KyroResult<BTreeMap<StreamKey, usize>> {
        let mut changes = BTreeMap::new();
        for stream in self.registry().list(Some(branch), &StreamFilter::All)? {
            let theirs: HashSet<MessageId> =
                ids(&self.registry().read_all(&stream)?).into_iter().collect();
            let local_key = stream.key.with_timeline(ctx.timeline());
            let ours: HashSet<MessageId> = match self.registry().find(&local_key)? {
                Some(local) => ids(&self.registry().read_all(&local)?).into_iter().collect(),
                None => HashSet::new(),
            };
            let count = theirs.symmetric_difference(&ours).count();
            if count > 0 {
                changes.insert(stream.key, count);
            }
        }
        Ok(changes)
    }

    /// Merges `branch` into the context's timeline.
    ///
    /// Validates every stream first: each branched stream's ancestor chain
    /// must resolve and the entity must already exist on the destination,
    /// and the destination history must be a prefix of the branch history.
    /// Nothing is written unless every stream passes. Merging an unchanged
    /// branch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns storage errors raised while applying a validated merge; those
    /// writes are not rolled back.
    pub fn merge(
        &self,
        ctx: &TimelineContext,
        branch: &TimelineId,
        include_new_streams: bool,
    ) -> KyroResult<MergeOutcome> {
        self.merge_filtered(ctx, branch, include_new_streams, &StreamFilter::All)
    }

    pub(crate) fn merge_filtered(
        &self,
        ctx: &TimelineContext,
        branch: &TimelineId,
        include_new_streams: bool,
        filter: &StreamFilter,
    ) -> KyroResult<MergeOutcome> {
        let transfers = match self.plan_merge(ctx, branch, include_new_streams, filter)? {
            Ok(transfers) => transfers,
            Err(failure) => {
                warn!(
                    from = %branch,
                    into = %ctx.timeline(),
                    reason = %failure,
                    "merge failed validation"
                );
                return Ok(MergeOutcome::Failed(failure));
            }
        };

        let mut streams = 0usize;
        let mut events = 0usize;
        for transfer in transfers {
            let n = self.commit_transfer(transfer)?;
            if n > 0 {
                streams += 1;
                events += n;
            }
        }

        let known: HashSet<MessageId> = self
            .command_log()
            .list(ctx.timeline())?
            .iter()
            .map(crate::message::Command::origin_id)
            .collect();
        let mut commands = 0usize;
        for command in self.command_log().list(branch)? {
            if !known.contains(&command.origin_id()) {
                self.insert_command(command.copied_to(ctx.timeline()))?;
                commands += 1;
            }
        }

        info!(from = %branch, into = %ctx.timeline(), streams, events, commands, "branch merged");
        Ok(MergeOutcome::Merged {
            streams,
            events,
            commands,
        })
    }

    fn plan_merge(
        &self,
        ctx: &TimelineContext,
        branch: &TimelineId,
        include_new_streams: bool,
        filter: &StreamFilter,
    ) -> KyroResult<Result<Vec<StreamTransfer>, TransferFailure>> {
        let mut transfers = Vec::new();
        for source in self.registry().list(Some(branch), filter)? {
            let key = source.key.with_timeline(ctx.timeline());
            if let Some(link) = self.first_missing_ancestor(&source, self)? {
                return Ok(Err(TransferFailure::MissingAncestor {
                    stream: source.key,
                    ancestor: link.key,
                }));
            }
            let target = self.registry().find(&key)?;
            if target.is_none() {
                if source.parent.is_some() {
                    return Ok(Err(TransferFailure::MissingAncestor {
                        stream: source.key,
                        ancestor: key,
                    }));
                }
                if !include_new_streams {
                    debug!(stream = %source.key, "new stream skipped");
                    continue;
                }
            }
            let remote = self.registry().read_all(&source)?;
            let local = match &target {
                Some(t) => ids(&self.registry().read_all(t)?),
                None => Vec::new(),
            };
            let missing = match diff_prefix(&key, &local, &remote) {
                Ok(missing) => missing,
                Err(conflict) => return Ok(Err(TransferFailure::Conflict(conflict))),
            };
            if missing.is_empty() && target.is_some() {
                continue;
            }
            transfers.push(StreamTransfer {
                key,
                target,
                create: StreamMetadata::root(source.kind),
                missing,
            });
        }
        Ok(Ok(transfers))
    }

    /// Applies one validated transfer. Returns the number of events appended.
    pub(crate) fn commit_transfer(&self, transfer: StreamTransfer) -> KyroResult<usize> {
        let stream = match transfer.target {
            Some(stream) => stream,
            None => {
                self.registry()
                    .log()
                    .create_stream(&transfer.key, transfer.create)?;
                self.registry().get(&transfer.key)?
            }
        };
        let events: Vec<Event> = transfer
            .missing
            .iter()
            .zip(stream.version.count()..)
            .map(|(event, version)| event.relocated(&stream.key, version))
            .collect();
        let n = events.len();
        self.append_events(&stream, events)?;
        Ok(n)
    }

    /// Deletes a timeline: its streams, graph vertices and command log.
    ///
    /// # Errors
    ///
    /// Returns `RootTimeline` for the root, or `StreamInUse` while a stream
    /// of another timeline still branches off one of its streams.
    pub fn delete_branch(&self, id: &TimelineId) -> KyroResult<()> {
        if id == self.root() {
            return Err(ValidationError::RootTimeline {
                timeline: id.to_string(),
            }
            .into());
        }
        self.remove_timeline(id)?;
        info!(timeline = %id, "branch deleted");
        self.publish(&Signal::BranchDeleted {
            branch_id: id.clone(),
        });
        Ok(())
    }

    pub(crate) fn remove_timeline(&self, id: &TimelineId) -> KyroResult<()> {
        let streams = self.registry().list(Some(id), &StreamFilter::All)?;
        for stream in &streams {
            if let Some(child) = self
                .registry()
                .children(&stream.key)?
                .into_iter()
                .find(|c| c.key.timeline() != id)
            {
                return Err(ValidationError::StreamInUse {
                    key: stream.key.to_string(),
                    dependent: child.key.to_string(),
                }
                .into());
            }
        }
        for stream in &streams {
            self.registry().delete(&stream.key)?;
        }
        self.graph().delete_timeline(id)?;
        self.command_log().delete_timeline(id)?;
        Ok(())
    }

    /// Returns the root context.
    pub fn reset(&self, ctx: &TimelineContext) -> TimelineContext {
        let root = self.root_context();
        if ctx != &root {
            self.publish(&Signal::TimelineChanged {
                from: ctx.timeline().clone(),
                to: root.timeline().clone(),
            });
        }
        root
    }

    /// First link of `stream`'s ancestor chain that `dest` cannot resolve
    /// at the version the link requires.
    pub(crate) fn first_missing_ancestor(
        &self,
        stream: &Stream,
        dest: &Self,
    ) -> KyroResult<Option<StreamRef>> {
        let mut current = stream.clone();
        let mut hops = 0usize;
        while let Some(link) = current.parent.clone() {
            hops += 1;
            if hops > MAX_ANCESTRY {
                return Err(crate::KyroError::internal(format!(
                    "ancestor chain of {} exceeded hop limit",
                    stream.key
                )));
            }
            match dest.registry().find(&link.key)? {
                Some(found) if found.version >= link.version => {}
                _ => return Ok(Some(link)),
            }
            current = match self.registry().find(&link.key)? {
                Some(next) => next,
                None => return Ok(Some(link)),
            };
        }
        Ok(None)
    }
}
