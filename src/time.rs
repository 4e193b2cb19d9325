//! Hybrid logical time.
//!
//! Every write path stamps its messages with a [`LogicalTime`] issued by the
//! process-wide [`HybridClock`]. The clock is the one place where global
//! order is serialized: all updates happen under a single mutex.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A hybrid logical timestamp.
///
/// Compared lexicographically: `physical` first, `counter` as the tiebreak.
/// For two causally related messages the cause is always strictly less than
/// the effect.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogicalTime {
    /// Physical component in clock ticks (microseconds since the Unix epoch).
    pub physical: u64,
    /// Logical tiebreak counter.
    pub counter: u32,
}

impl LogicalTime {
    /// The smallest representable time.
    pub const ZERO: Self = Self {
        physical: 0,
        counter: 0,
    };

    /// The greatest representable time.
    pub const MAX: Self = Self {
        physical: u64::MAX,
        counter: u32::MAX,
    };

    /// Creates a time from its components.
    #[must_use]
    pub const fn new(physical: u64, counter: u32) -> Self {
        Self { physical, counter }
    }

    /// The time one clock tick earlier (saturating at [`LogicalTime::ZERO`]).
    #[must_use]
    pub const fn predecessor(self) -> Self {
        if self.counter > 0 {
            Self::new(self.physical, self.counter - 1)
        } else if self.physical > 0 {
            Self::new(self.physical - 1, u32::MAX)
        } else {
            Self::ZERO
        }
    }

    /// The time one clock tick later (saturating at [`LogicalTime::MAX`]).
    #[must_use]
    pub const fn successor(self) -> Self {
        if self.counter < u32::MAX {
            Self::new(self.physical, self.counter + 1)
        } else if self.physical < u64::MAX {
            Self::new(self.physical + 1, 0)
        } else {
            Self::MAX
        }
    }

    /// Converts the physical component to wall-clock time.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        let micros = i64::try_from(self.physical).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// The earliest logical time at a given wall-clock instant.
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self::new(u64::try_from(at.timestamp_micros()).unwrap_or(0), 0)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.counter)
    }
}

/// Source of physical clock readings.
pub trait ClockSource: Send + Sync {
    /// Current reading in ticks.
    fn now_ticks(&self) -> u64;
}

/// Wall-clock source backed by `chrono::Utc::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ticks(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
    }
}

/// Manually driven clock source for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock at the given reading.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Sets the reading.
    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Advances the reading.
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl<T: ClockSource + ?Sized> ClockSource for std::sync::Arc<T> {
    fn now_ticks(&self) -> u64 {
        (**self).now_ticks()
    }
}

/// Hybrid logical clock.
///
/// Never fails; under contention it only stalls on its mutex.
pub struct HybridClock {
    source: Box<dyn ClockSource>,
    last: Mutex<LogicalTime>,
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &self.peek())
            .finish_non_exhaustive()
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl HybridClock {
    /// Creates a clock reading from `source`.
    pub fn new(source: impl ClockSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            last: Mutex::new(LogicalTime::ZERO),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogicalTime> {
        // The guarded value is a plain Copy pair; a poisoned guard still holds a valid time.
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Issues a new local timestamp.
    ///
    /// `physical = max(physical, reading)`; the counter increments only if the
    /// physical component did not advance.
    pub fn now(&self) -> LogicalTime {
        let reading = self.source.now_ticks();
        let mut last = self.lock();
        let next = if reading > last.physical {
            LogicalTime::new(reading, 0)
        } else {
            last.successor()
        };
        *last = next;
        next
    }

    /// Merges a remote timestamp into the clock.
    ///
    /// The result is strictly greater than both the prior local value and
    /// `remote`.
    pub fn receive(&self, remote: LogicalTime) -> LogicalTime {
        let reading = self.source.now_ticks();
        let mut last = self.lock();
        let physical = last.physical.max(remote.physical).max(reading);
        let next = if physical > last.physical && physical > remote.physical {
            LogicalTime::new(physical, 0)
        } else {
            let counter = match (physical == last.physical, physical == remote.physical) {
                (true, true) => last.counter.max(remote.counter),
                (true, false) => last.counter,
                (false, true) => remote.counter,
                (false, false) => 0,
            };
            LogicalTime::new(physical, counter).successor()
        };
        *last = next;
        next
    }

    /// Returns the last issued time without advancing the clock.
    pub fn peek(&self) -> LogicalTime {
        *self.lock()
    }
}
