//! Fast-forward replication between two stores.
//!
//! A transfer copies the missing suffix of every stream in one timeline
//! from a source store to a destination store, plus the commands the
//! destination has not seen. Validation covers every stream before the first
//! write.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::branch::{diff_prefix, StreamTransfer, TransferFailure};
use crate::error::KyroResult;
use crate::message::{Event, MessageId};
use crate::signal::Signal;
use crate::store::TimelineStore;
use crate::stream::{StreamFilter, StreamMetadata, TimelineContext};
use crate::time::LogicalTime;

/// Fast-forward status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FastForwardStatus {
    /// Everything missing was copied.
    Success,
    /// Validation failed; nothing was written.
    Failed,
}

/// Result of a push or pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastForwardResult {
    /// Outcome.
    pub status: FastForwardStatus,
    /// Events and commands copied.
    pub message_count: usize,
    /// Streams that received events or were created.
    pub stream_count: usize,
    /// Why validation failed, if it did.
    pub failure: Option<TransferFailure>,
}

impl FastForwardResult {
    fn failed(failure: TransferFailure) -> Self {
        Self {
            status: FastForwardStatus::Failed,
            message_count: 0,
            stream_count: 0,
            failure: Some(failure),
        }
    }

    /// True on success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == FastForwardStatus::Success
    }
}

impl TimelineStore {
    /// Copies what `remote` lacks of the context's timeline to `remote`.
    ///
    /// Callers that write through a runtime should drain both sides first;
    /// [`crate::TimelineRuntime::push`] does.
    ///
    /// # Errors
    ///
    /// Returns storage errors raised after validation; earlier writes are
    /// not rolled back.
    pub fn push(&self, ctx: &TimelineContext, remote: &Self) -> KyroResult<FastForwardResult> {
        fast_forward(self, remote, ctx)
    }

    /// Copies what this store lacks of the context's timeline from `remote`.
    ///
    /// # Errors
    ///
    /// See [`TimelineStore::push`].
    pub fn pull(&self, ctx: &TimelineContext, remote: &Self) -> KyroResult<FastForwardResult> {
        let result = fast_forward(remote, self, ctx)?;
        if result.is_success() {
            self.publish(&Signal::PullCompleted {
                timeline: ctx.timeline().clone(),
                messages: result.message_count,
                streams: result.stream_count,
            });
        }
        Ok(result)
    }
}

fn fast_forward(
    source: &TimelineStore,
    dest: &TimelineStore,
    ctx: &TimelineContext,
) -> KyroResult<FastForwardResult> {
    let mut transfers: Vec<StreamTransfer> = Vec::new();
    for stream in source.registry().list(Some(ctx.timeline()), &StreamFilter::All)? {
        if let Some(link) = source.first_missing_ancestor(&stream, dest)? {
            let failure = TransferFailure::MissingAncestor {
                stream: stream.key.clone(),
                ancestor: link.key,
            };
            warn!(timeline = %ctx.timeline(), reason = %failure, "fast-forward failed validation");
            return Ok(FastForwardResult::failed(failure));
        }

        let remote = source.registry().read_all(&stream)?;
        let target = dest.registry().find(&stream.key)?;
        // A missing target would inherit its parent's prefix on creation.
        let local: Vec<MessageId> = match (&target, &stream.parent) {
            (Some(t), _) => dest.registry().read_all(t)?.iter().map(|e| e.message_id).collect(),
            (None, Some(parent)) => {
                let inherited = dest.registry().get(&parent.key)?;
                dest.registry()
                    .read(&inherited, 0, parent.version.count())?
                    .iter()
                    .map(|e| e.message_id)
                    .collect()
            }
            (None, None) => Vec::new(),
        };
        let missing = match diff_prefix(&stream.key, &local, &remote) {
            Ok(missing) => missing,
            Err(conflict) => {
                let failure = TransferFailure::Conflict(conflict);
                warn!(
                    timeline = %ctx.timeline(),
                    reason = %failure,
                    "fast-forward failed validation"
                );
                return Ok(FastForwardResult::failed(failure));
            }
        };
        if missing.is_empty() && target.is_some() {
            continue;
        }
        transfers.push(StreamTransfer {
            key: stream.key.clone(),
            target,
            create: StreamMetadata {
                parent: stream.parent.clone(),
                kind: stream.kind,
            },
            missing,
        });
    }

    let known: HashSet<MessageId> = dest
        .command_log()
        .list(ctx.timeline())?
        .iter()
        .map(crate::message::Command::origin_id)
        .collect();
    let commands: Vec<_> = source
        .command_log()
        .list(ctx.timeline())?
        .into_iter()
        .filter(|c| !known.contains(&c.origin_id()))
        .collect();

    let latest = transfers
        .iter()
        .flat_map(|t| t.missing.iter().map(|e: &Event| e.timestamp))
        .chain(commands.iter().map(|c| c.timestamp))
        .max();

    let stream_count = transfers.len();
    let mut message_count = 0usize;
    for transfer in transfers {
        message_count += dest.commit_transfer(transfer)?;
    }
    for command in commands {
        dest.insert_command(command)?;
        message_count += 1;
    }
    if let Some(latest) = latest {
        let stamped: LogicalTime = dest.clock().receive(latest);
        info!(timeline = %ctx.timeline(), clock = %stamped, "destination clock advanced");
    }

    info!(
        timeline = %ctx.timeline(),
        messages = message_count,
        streams = stream_count,
        "fast-forward completed"
    );
    Ok(FastForwardResult {
        status: FastForwardStatus::Success,
        message_count,
        stream_count,
        failure: None,
    })
}
