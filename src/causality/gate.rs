//! Read/update admission for the causality graph.
//!
//! The graph is either sleeping, serving any number of readers, or serving a
//! single updater. A waiting updater blocks new readers, so outstanding reads
//! drain before the write lands. A pause blocks every other thread's reads
//! and updates for a bounded time while its owner lands a batch of updates.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ExecutionError, KyroResult};

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Idle.
    Sleeping,
    /// Serving this many readers.
    Reading(usize),
    /// Serving one updater.
    Updating,
    /// Paused by a batch owner.
    Paused,
}

#[derive(Debug)]
struct Pause {
    owner: ThreadId,
    until: Instant,
}

#[derive(Debug, Default)]
struct GateInner {
    readers: usize,
    updating: bool,
    waiting_updaters: usize,
    pause: Option<Pause>,
}

impl GateInner {
    /// The active pause held by another thread, if it has not expired.
    fn foreign_pause(&mut self, now: Instant) -> Option<Instant> {
        match &self.pause {
            Some(p) if p.until <= now => {
                warn!("graph pause expired before release");
                self.pause = None;
                None
            }
            Some(p) if p.owner != thread::current().id() => Some(p.until),
            _ => None,
        }
    }
}

/// Admission gate guarding the graph data.
pub struct GraphGate {
    inner: Mutex<GateInner>,
    cond: Condvar,
    max_pause: Duration,
}

impl fmt::Debug for GraphGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphGate")
            .field("state", &self.state())
            .field("max_pause", &self.max_pause)
            .finish()
    }
}

fn timeout_err(timeout: Duration) -> ExecutionError {
    ExecutionError::Timeout {
        duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

impl GraphGate {
    /// Creates a sleeping gate.
    #[must_use]
    pub fn new(max_pause: Duration) -> Self {
        Self {
            inner: Mutex::new(GateInner::default()),
            cond: Condvar::new(),
            max_pause,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        // Counters stay consistent under poisoning: every mutation is a single store.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        let inner = self.lock();
        if inner.pause.as_ref().is_some_and(|p| p.until > Instant::now()) {
            GateState::Paused
        } else if inner.updating {
            GateState::Updating
        } else if inner.readers > 0 {
            GateState::Reading(inner.readers)
        } else {
            GateState::Sleeping
        }
    }

    /// Blocks until `blocked` is false or `deadline` passes, waking early for
    /// pause expiry.
    fn wait_until<'a>(
        &'a self,
        mut inner: MutexGuard<'a, GateInner>,
        deadline: Instant,
        timeout: Duration,
        mut blocked: impl FnMut(&mut GateInner, Instant) -> Option<Option<Instant>>,
    ) -> KyroResult<MutexGuard<'a, GateInner>> {
        loop {
            let now = Instant::now();
            let Some(wake) = blocked(&mut *inner, now) else {
                return Ok(inner);
            };
            if now >= deadline {
                return Err(timeout_err(timeout).into());
            }
            let until = wake.map_or(deadline, |w| w.min(deadline));
            let wait = until.saturating_duration_since(now).max(Duration::from_millis(1));
            inner = self
                .cond
                .wait_timeout(inner, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Admits a reader, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if admission is not granted in time.
    pub fn read(&self, timeout: Duration) -> KyroResult<ReadGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let inner = self.lock();
        let mut inner = self.wait_until(inner, deadline, timeout, |g, now| {
            if let Some(until) = g.foreign_pause(now) {
                return Some(Some(until));
            }
            (g.updating || g.waiting_updaters > 0).then_some(None)
        })?;
        inner.readers += 1;
        Ok(ReadGuard { gate: self })
    }

    /// Admits the single updater after outstanding reads drain.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the gate does not drain in time.
    pub fn update(&self, timeout: Duration) -> KyroResult<UpdateGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        inner.waiting_updaters += 1;
        let waited = self.wait_until(inner, deadline, timeout, |g, now| {
            if let Some(until) = g.foreign_pause(now) {
                return Some(Some(until));
            }
            (g.updating || g.readers > 0).then_some(None)
        });
        match waited {
            Ok(mut inner) => {
                inner.waiting_updaters -= 1;
                inner.updating = true;
                Ok(UpdateGuard { gate: self })
            }
            Err(e) => {
                let mut inner = self.lock();
                inner.waiting_updaters -= 1;
                drop(inner);
                self.cond.notify_all();
                Err(e)
            }
        }
    }

    /// Pauses the graph for the calling thread, capped at the configured
    /// maximum. Other threads' reads and updates wait until the guard drops or
    /// the pause expires.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if another pause or update does not clear in time.
    pub fn pause(&self, duration: Duration, timeout: Duration) -> KyroResult<PauseGuard<'_>> {
        let duration = duration.min(self.max_pause);
        let deadline = Instant::now() + timeout;
        let inner = self.lock();
        let mut inner = self.wait_until(inner, deadline, timeout, |g, now| {
            if let Some(until) = g.foreign_pause(now) {
                return Some(Some(until));
            }
            g.updating.then_some(None)
        })?;
        let owner = thread::current().id();
        inner.pause = Some(Pause {
            owner,
            until: Instant::now() + duration,
        });
        debug!(duration_ms = duration.as_millis(), "graph paused");
        Ok(PauseGuard { gate: self, owner })
    }
}

/// Shared read admission; released on drop.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    gate: &'a GraphGate,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.gate.lock();
        inner.readers = inner.readers.saturating_sub(1);
        drop(inner);
        self.gate.cond.notify_all();
    }
}

/// Exclusive update admission; released on drop.
#[derive(Debug)]
pub struct UpdateGuard<'a> {
    gate: &'a GraphGate,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.gate.lock();
        inner.updating = false;
        drop(inner);
        self.gate.cond.notify_all();
    }
}

/// An active pause; resumes the graph on drop.
#[derive(Debug)]
pub struct PauseGuard<'a> {
    gate: &'a GraphGate,
    owner: ThreadId,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.gate.lock();
        if inner.pause.as_ref().is_some_and(|p| p.owner == self.owner) {
            inner.pause = None;
        }
        drop(inner);
        self.gate.cond.notify_all();
        debug!("graph resumed");
    }
}

/// Cooperative cancellation flag for long graph operations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with `Cancelled` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled { operation }`.
    pub fn check(&self, operation: &str) -> KyroResult<()> {
        if self.is_cancelled() {
            return Err(ExecutionError::Cancelled {
                operation: operation.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
