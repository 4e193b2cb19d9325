//! Alerting signals for read-model rebuilders.
//!
//! Each subscriber owns a bounded crossbeam channel. Publishing never
//! blocks: a full subscriber misses the signal (logged), a dropped one is
//! pruned.

use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ExecutionError, KyroError, KyroResult};
use crate::stream::{StreamKey, TimelineId};

/// A published signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// A timeline and everything in it was removed.
    BranchDeleted {
        /// The deleted timeline.
        branch_id: TimelineId,
    },
    /// A caller switched timelines through `branch` or `reset`.
    TimelineChanged {
        /// Previous timeline.
        from: TimelineId,
        /// New timeline.
        to: TimelineId,
    },
    /// A fast-forward pull landed.
    PullCompleted {
        /// Destination timeline.
        timeline: TimelineId,
        /// Messages copied.
        messages: usize,
        /// Streams touched.
        streams: usize,
    },
    /// Projections over a stream must be rebuilt from `from_version` on.
    ProjectionsInvalidated {
        /// Affected stream.
        stream: StreamKey,
        /// First version whose derived state is stale.
        from_version: u64,
    },
}

/// Fan-out publisher.
#[derive(Debug)]
pub struct SignalBus {
    capacity: usize,
    subscribers: Mutex<Vec<Sender<Signal>>>,
}

impl SignalBus {
    /// Creates a bus whose subscribers buffer up to `capacity` signals.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Opens a new subscription.
    pub fn subscribe(&self) -> SignalStream {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(tx);
        SignalStream { rx }
    }

    /// Publishes to every live subscriber.
    pub fn publish(&self, signal: &Signal) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(signal.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(?signal, "signal subscriber is full; signal dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// A subscription to the signal bus.
#[derive(Debug)]
pub struct SignalStream {
    rx: Receiver<Signal>,
}

impl SignalStream {
    /// Receive the next signal (blocking).
    ///
    /// # Errors
    ///
    /// Returns `Disconnected` once the bus is gone.
    pub fn recv(&self) -> KyroResult<Signal> {
        self.rx.recv().map_err(|_| {
            KyroError::Execution(ExecutionError::Disconnected {
                path: "signal_stream".to_string(),
            })
        })
    }

    /// Receive the next signal with a timeout.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Disconnected`.
    pub fn recv_timeout(&self, timeout: Duration) -> KyroResult<Signal> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => KyroError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => KyroError::Execution(ExecutionError::Disconnected {
                path: "signal_stream".to_string(),
            }),
        })
    }

    /// Drains whatever is buffered without blocking.
    pub fn drain(&self) -> Vec<Signal> {
        self.rx.try_iter().collect()
    }
}
