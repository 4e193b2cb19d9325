//! Single-writer runtime.
//!
//! All mutations of a store funnel through one worker thread fed by a
//! bounded queue, giving a total order of appends and at most one mutation
//! in flight. Reads go straight to the store. A push writes into the other
//! runtime's store, so it runs on the other runtime's writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info};

use crate::branch::FastForwardResult;
use crate::engine::{Operation, Response, TimelineEngine};
use crate::error::{ExecutionError, KyroError, KyroResult};
use crate::store::TimelineStore;
use crate::stream::TimelineContext;

const WRITER_PATH: &str = "writer";

fn timeout_error(timeout: Duration) -> KyroError {
    KyroError::Execution(ExecutionError::Timeout {
        duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    })
}

fn disconnected() -> KyroError {
    KyroError::Execution(ExecutionError::Disconnected {
        path: WRITER_PATH.to_string(),
    })
}

enum Job {
    Execute {
        op: Operation,
        reply: Sender<KyroResult<Response>>,
    },
    Barrier {
        reply: Sender<()>,
    },
    Receive {
        ctx: TimelineContext,
        source: Arc<TimelineStore>,
        // Set by whichever side gets there first: the writer starting the
        // transfer or the pusher giving up on it.
        claimed: Arc<AtomicBool>,
        reply: Sender<KyroResult<FastForwardResult>>,
    },

    #[cfg(test)]
    Block {
        started: Sender<()>,
        release: Receiver<()>,
    },
}

struct Writer {
    tx: Sender<Job>,
    worker: Option<JoinHandle<()>>,
    queue_capacity: usize,
}

impl Writer {
    fn start(engine: Arc<TimelineEngine>, queue_capacity: usize) -> KyroResult<Self> {
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);
        let worker = thread::Builder::new()
            .name("kyrolog-writer".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Execute { op, reply } => {
                            let _ = reply.send(engine.execute(op));
                        }
                        Job::Barrier { reply } => {
                            let _ = reply.send(());
                        }
                        Job::Receive {
                            ctx,
                            source,
                            claimed,
                            reply,
                        } => {
                            if !claimed.swap(true, Ordering::AcqRel) {
                                debug!(timeline = %ctx.timeline(), "receiving push");
                                let _ = reply.send(source.push(&ctx, engine.store()));
                            }
                        }

                        #[cfg(test)]
                        Job::Block { started, release } => {
                            let _ = started.send(());
                            let _ = release.recv();
                        }
                    }
                }
            })
            .map_err(|e| KyroError::internal(format!("failed to spawn writer: {e}")))?;

        Ok(Self {
            tx,
            worker: Some(worker),
            queue_capacity,
        })
    }

    fn idle() -> Self {
        Self {
            tx: bounded::<Job>(1).0,
            worker: None,
            queue_capacity: 1,
        }
    }

    fn try_submit(&self, job: Job) -> KyroResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(KyroError::Execution(ExecutionError::QueueFull {
                path: WRITER_PATH.to_string(),
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    fn shutdown(self) {
        // Closing the channel lets the worker finish queued jobs, then exit.
        drop(self.tx);
        if let Some(worker) = self.worker {
            let _ = worker.join();
        }
    }
}

/// Handle returned by [`TimelineRuntime::submit`].
#[derive(Debug)]
pub struct ExecutionHandle {
    operation: &'static str,
    rx: Receiver<KyroResult<Response>>,
}

impl ExecutionHandle {
    /// Name of the submitted operation.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    /// Waits for the operation to complete.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or `Disconnected` if the writer died.
    pub fn join(self) -> KyroResult<Response> {
        self.rx.recv().map_err(|_| disconnected())?
    }

    /// Waits for the operation to complete with a timeout.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no reply arrives in time; the operation itself
    /// keeps running.
    pub fn join_timeout(self, timeout: Duration) -> KyroResult<Response> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => timeout_error(timeout),
            RecvTimeoutError::Disconnected => disconnected(),
        })?
    }
}

/// A store with a single-writer queue in front of it.
pub struct TimelineRuntime {
    engine: Arc<TimelineEngine>,
    writer: Writer,
}

impl std::fmt::Debug for TimelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineRuntime")
            .field("engine", &self.engine)
            .field("queue_capacity", &self.writer.queue_capacity)
            .finish()
    }
}

impl TimelineRuntime {
    /// Starts the writer thread, sized by the store's `queue_capacity`.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the thread cannot be spawned.
    pub fn start(engine: TimelineEngine) -> KyroResult<Self> {
        let capacity = engine.store().config().queue_capacity;
        let engine = Arc::new(engine);
        let writer = Writer::start(Arc::clone(&engine), capacity)?;
        info!(capacity, "writer started");
        Ok(Self { engine, writer })
    }

    /// The engine operations run on.
    #[must_use]
    pub fn engine(&self) -> &TimelineEngine {
        &self.engine
    }

    /// The underlying store, for reads.
    #[must_use]
    pub fn store(&self) -> &Arc<TimelineStore> {
        self.engine.store()
    }

    /// Queues an operation without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the queue is at capacity or `Disconnected`
    /// if the writer has stopped.
    pub fn submit(&self, op: Operation) -> KyroResult<ExecutionHandle> {
        let operation = op.name();
        let (reply, rx) = bounded::<KyroResult<Response>>(1);
        self.writer.try_submit(Job::Execute { op, reply })?;
        Ok(ExecutionHandle { operation, rx })
    }

    /// Queues an operation and waits for its result.
    ///
    /// # Errors
    ///
    /// See [`TimelineRuntime::submit`] and [`ExecutionHandle::join`].
    pub fn execute(&self, op: Operation) -> KyroResult<Response> {
        self.submit(op)?.join()
    }

    /// Operations waiting in the queue, not counting the one running.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.writer.tx.len()
    }

    /// Waits until every operation queued before this call has completed.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the queue does not drain in time.
    pub fn drain(&self, timeout: Duration) -> KyroResult<()> {
        let (reply, rx) = bounded::<()>(1);
        self.writer.try_submit(Job::Barrier { reply })?;
        rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => timeout_error(timeout),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Drains this runtime, then pushes the timeline to `remote`.
    ///
    /// The transfer is queued on `remote`'s writer behind whatever it already
    /// holds, so writes to `remote` never overlap it.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if either writer does not get to the transfer
    /// within the store's `drain_timeout`; the transfer is then dropped
    /// unstarted.
    pub fn push(&self, ctx: &TimelineContext, remote: &Self) -> KyroResult<FastForwardResult> {
        let timeout = self.store().config().drain_timeout();
        self.drain(timeout)?;
        let claimed = Arc::new(AtomicBool::new(false));
        let (reply, rx) = bounded::<KyroResult<FastForwardResult>>(1);
        remote.writer.try_submit(Job::Receive {
            ctx: ctx.clone(),
            source: Arc::clone(self.store()),
            claimed: Arc::clone(&claimed),
            reply,
        })?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) if !claimed.swap(true, Ordering::AcqRel) => {
                Err(timeout_error(timeout))
            }
            // Already running; it finishes regardless.
            Err(RecvTimeoutError::Timeout) => rx.recv().map_err(|_| disconnected())?,
            Err(RecvTimeoutError::Disconnected) => Err(disconnected()),
        }
    }

    /// Drains both runtimes, then pulls the timeline from `remote` on this
    /// runtime's writer.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if either queue does not drain within the store's
    /// `drain_timeout`.
    pub fn pull(&self, ctx: &TimelineContext, remote: &Self) -> KyroResult<FastForwardResult> {
        let timeout = self.store().config().drain_timeout();
        self.drain(timeout)?;
        remote.drain(timeout)?;
        debug!("both writers drained");
        let op = Operation::Pull {
            ctx: ctx.clone(),
            remote: Arc::clone(remote.store()),
        };
        match self.execute(op)? {
            Response::FastForward(result) => Ok(result),
            other => Err(KyroError::internal(format!(
                "unexpected fast-forward response: {other:?}"
            ))),
        }
    }

    #[cfg(test)]
    fn block(&self) -> KyroResult<Sender<()>> {
        let (started_tx, started_rx) = bounded::<()>(1);
        let (release_tx, release_rx) = bounded::<()>(1);
        self.writer.try_submit(Job::Block {
            started: started_tx,
            release: release_rx,
        })?;
        started_rx.recv().map_err(|_| disconnected())?;
        Ok(release_tx)
    }
}

impl Drop for TimelineRuntime {
    fn drop(&mut self) {
        let writer = std::mem::replace(&mut self.writer, Writer::idle());
        writer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::message::EventDraft;
    use crate::storage::{InMemoryCommandLog, InMemoryEventLog};
    use crate::stream::{ExpectedVersion, StreamDescriptor};
    use serde_json::json;

    fn runtime(queue_capacity: usize) -> TimelineRuntime {
        runtime_with(StoreConfig {
            queue_capacity,
            ..StoreConfig::default()
        })
    }

    fn runtime_with(config: StoreConfig) -> TimelineRuntime {
        let store = TimelineStore::new(
            config,
            Arc::new(InMemoryEventLog::new()),
            Arc::new(InMemoryCommandLog::new()),
        )
        .unwrap();
        TimelineRuntime::start(TimelineEngine::new(Arc::new(store))).unwrap()
    }

    fn append(ctx: &TimelineContext, kind: &str) -> Operation {
        Operation::Append {
            ctx: ctx.clone(),
            stream: StreamDescriptor::aggregate("Root", "1"),
            events: vec![EventDraft::new(kind, json!({}))],
            expected: ExpectedVersion::Any,
        }
    }

    fn kinds(runtime: &TimelineRuntime, ctx: &TimelineContext) -> Vec<String> {
        runtime
            .store()
            .read_all(&ctx.key("Root", "1"))
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[test]
    fn writes_are_applied_in_submission_order() {
        let runtime = runtime(16);
        let ctx = runtime.store().root_context();
        let handles: Vec<_> = (0..5)
            .map(|i| runtime.submit(append(&ctx, &format!("E{i}"))).unwrap())
            .collect();
        for handle in handles {
            assert_eq!(handle.operation(), "append");
            handle.join_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(kinds(&runtime, &ctx), vec!["E0", "E1", "E2", "E3", "E4"]);
    }

    #[test]
    fn full_queue_is_rejected_not_blocked() {
        let runtime = runtime(1);
        let ctx = runtime.store().root_context();
        let release = runtime.block().unwrap();

        let queued = runtime.submit(append(&ctx, "A")).unwrap();
        let err = runtime.submit(append(&ctx, "B")).unwrap_err();
        let KyroError::Execution(ExecutionError::QueueFull { path, capacity }) = err else {
            panic!("expected QueueFull, got {err:?}");
        };
        assert_eq!(path, "writer");
        assert_eq!(capacity, 1);

        release.send(()).unwrap();
        queued.join_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn drain_times_out_while_writer_is_busy() {
        let runtime = runtime(4);
        let release = runtime.block().unwrap();
        let err = runtime.drain(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());

        release.send(()).unwrap();
        runtime.drain(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn push_and_pull_between_runtimes() {
        let local = runtime(8);
        let remote = runtime(8);
        let ctx = local.store().root_context();
        local.execute(append(&ctx, "A")).unwrap();

        let pushed = local.push(&ctx, &remote).unwrap();
        assert!(pushed.is_success());
        assert_eq!(pushed.message_count, 1);

        remote.execute(append(&ctx, "B")).unwrap();
        let pulled = local.pull(&ctx, &remote).unwrap();
        assert_eq!(pulled.message_count, 1);
        assert_eq!(
            local.store().read_all(&ctx.key("Root", "1")).unwrap(),
            remote.store().read_all(&ctx.key("Root", "1")).unwrap()
        );
    }

    #[test]
    fn push_is_ordered_with_the_destination_writer() {
        let local = runtime(8);
        let remote = runtime(8);
        let ctx = local.store().root_context();
        local.execute(append(&ctx, "A")).unwrap();

        let release = remote.block().unwrap();
        thread::scope(|s| {
            let pushing = s.spawn(|| local.push(&ctx, &remote));
            while remote.queued() == 0 {
                thread::yield_now();
            }
            // Queued behind the transfer, so it lands after the pushed event.
            let later = remote.submit(append(&ctx, "B")).unwrap();
            release.send(()).unwrap();
            let pushed = pushing.join().unwrap().unwrap();
            assert_eq!(pushed.message_count, 1);
            later.join_timeout(Duration::from_secs(5)).unwrap();
        });
        assert_eq!(kinds(&remote, &ctx), vec!["A", "B"]);
        remote.store().verify_stream(&ctx.key("Root", "1")).unwrap();
    }

    #[test]
    fn push_gives_up_while_the_destination_is_busy() {
        let local = runtime_with(StoreConfig {
            drain_timeout_ms: 20,
            ..StoreConfig::default()
        });
        let remote = runtime(8);
        let ctx = local.store().root_context();
        local.execute(append(&ctx, "A")).unwrap();

        let release = remote.block().unwrap();
        let err = local.push(&ctx, &remote).unwrap_err();
        assert!(err.is_timeout());
        release.send(()).unwrap();
        remote.drain(Duration::from_secs(5)).unwrap();
        assert!(remote.store().find_stream(&ctx.key("Root", "1")).unwrap().is_none());
    }

    #[test]
    fn join_reports_disconnected_when_reply_sender_dropped() {
        let (tx, rx) = bounded::<KyroResult<Response>>(1);
        drop(tx);
        let handle = ExecutionHandle {
            operation: "append",
            rx,
        };
        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        let KyroError::Execution(ExecutionError::Disconnected { path }) = err else {
            panic!("expected Disconnected, got {err:?}");
        };
        assert_eq!(path, "writer");
    }

    #[test]
    fn drop_finishes_queued_work() {
        let runtime = runtime(8);
        let store = Arc::clone(runtime.store());
        let ctx = store.root_context();
        let handle = runtime.submit(append(&ctx, "A")).unwrap();
        drop(runtime);
        assert!(matches!(handle.join(), Ok(Response::Appended { .. })));
        assert_eq!(store.read_all(&ctx.key("Root", "1")).unwrap().len(), 1);
    }
}
