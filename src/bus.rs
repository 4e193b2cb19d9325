//! Message bus contract consumed by command replay.
//!
//! The store never touches aggregate logic itself; replaying a command asks
//! the bus which stream the command targets and which events it produces
//! against that stream's history.

use crate::error::KyroResult;
use crate::message::{Command, Event, EventDraft};
use crate::stream::StreamDescriptor;

/// Command handler seam.
pub trait CommandBus: Send + Sync {
    /// The stream a command is addressed to.
    fn target(&self, command: &Command) -> StreamDescriptor;

    /// Executes `command` against `history` (the target's events that precede
    /// it) and returns the events it emits.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler rejects the command with.
    fn handle(&self, command: &Command, history: &[Event]) -> KyroResult<Vec<EventDraft>>;
}

/// A bus backed by two closures. Handy for tests and embedding.
pub struct FnBus<T, H> {
    target: T,
    handle: H,
}

impl<T, H> FnBus<T, H>
where
    T: Fn(&Command) -> StreamDescriptor + Send + Sync,
    H: Fn(&Command, &[Event]) -> KyroResult<Vec<EventDraft>> + Send + Sync,
{
    /// Wraps the given closures.
    pub const fn new(target: T, handle: H) -> Self {
        Self { target, handle }
    }
}

impl<T, H> std::fmt::Debug for FnBus<T, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBus").finish_non_exhaustive()
    }
}

impl<T, H> CommandBus for FnBus<T, H>
where
    T: Fn(&Command) -> StreamDescriptor + Send + Sync,
    H: Fn(&Command, &[Event]) -> KyroResult<Vec<EventDraft>> + Send + Sync,
{
    fn target(&self, command: &Command) -> StreamDescriptor {
        (self.target)(command)
    }

    fn handle(&self, command: &Command, history: &[Event]) -> KyroResult<Vec<EventDraft>> {
        (self.handle)(command, history)
    }
}
