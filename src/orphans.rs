//! Orphan collector for background tasks.
//!
//! Tasks spawned through a collector are still children of the spawning
//! task, but their handles are parked in the collector instead of being
//! returned. [`Orphans::care`] retrieves settled ones non-blockingly; each
//! retrieved promise must still be awaited. A collector dropped with
//! entries left inside does not absolve the parent: the abandoned children
//! surface as a *still-has-children* fatal when the parent terminates.

use crate::promise::Promise;
use core::fmt;
use parking_lot::Mutex;

/// Outcome of a [`Orphans::care`] probe.
#[derive(Debug)]
pub enum Care<T> {
    /// A settled background task, ready to be awaited without blocking.
    Ready(Promise<T>),
    /// Tasks are attached but none has settled yet.
    Pending,
    /// No tasks are attached; there is no more work.
    Empty,
}

/// A collector of background tasks created by the current task.
///
/// The collector lives with its creator; the promises inside remain the
/// creator's children and must each be retrieved and awaited.
pub struct Orphans<T> {
    attached: Mutex<Vec<Promise<T>>>,
}

impl<T> Orphans<T> {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attached: Mutex::new(Vec::new()),
        }
    }

    /// Number of attached, not yet retrieved tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attached.lock().len()
    }

    /// True when nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attached.lock().is_empty()
    }

    /// Retrieves one settled task, if any.
    ///
    /// Returns [`Care::Ready`] with a terminal promise, [`Care::Pending`]
    /// while attached tasks are still running, and [`Care::Empty`] once the
    /// collector has handed everything back.
    pub fn care(&self) -> Care<T> {
        let mut attached = self.attached.lock();
        if attached.is_empty() {
            return Care::Empty;
        }
        match attached.iter().position(|p| p.state().is_terminal()) {
            Some(idx) => Care::Ready(attached.remove(idx)),
            None => Care::Pending,
        }
    }

    pub(crate) fn attach(&self, promise: Promise<T>) {
        self.attached.lock().push(promise);
    }
}

impl<T> Default for Orphans<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Orphans<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orphans").field("attached", &self.len()).finish()
    }
}
