//! The events-provider seam.
//!
//! An [`Events`] provider is the scheduler's only window onto the outside
//! world. Each domain owns one provider instance, created once from the
//! factory given to [`Config::events`](crate::Config::events). The executor
//! calls [`Events::select`] at every reschedule point with the domain's
//! pending suspension ids; the provider answers with [`Resume`] records for
//! the suspensions it wants released. Other domains wake a blocked provider
//! through its [`InterruptHook`].
//!
//! The default provider, [`ParkEvents`], releases nothing and simply parks
//! the thread until interrupted. It is what makes `run` usable with no
//! system integration at all.

use crate::types::{DomainId, SyscallUid};
use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// A released-suspension record produced by a provider inside `select`.
///
/// Pairs the suspension to release with a pre-function that runs on the
/// owning domain before the suspended task is re-enqueued. A panic in the
/// pre-function discontinues the suspension: the owning task observes the
/// payload as its own unwind when it resumes.
pub struct Resume {
    uid: SyscallUid,
    pre: Box<dyn FnOnce() + Send>,
}

impl Resume {
    /// Builds a resume record for the given suspension id.
    #[must_use]
    pub fn new(uid: SyscallUid, pre: impl FnOnce() + Send + 'static) -> Self {
        Self {
            uid,
            pre: Box::new(pre),
        }
    }

    /// The suspension this record releases.
    #[must_use]
    pub const fn uid(&self) -> SyscallUid {
        self.uid
    }

    pub(crate) fn into_parts(self) -> (SyscallUid, Box<dyn FnOnce() + Send>) {
        (self.uid, self.pre)
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume").field("uid", &self.uid).finish_non_exhaustive()
    }
}

/// A cloneable handle that wakes a domain out of a blocking `select`.
///
/// Safe to fire from any thread, concurrently with the owning domain's
/// `select`. Firing when the domain is not blocked must be harmless.
#[derive(Clone)]
pub struct InterruptHook(Arc<dyn Fn() + Send + Sync>);

impl InterruptHook {
    /// Wraps an interrupt closure.
    #[must_use]
    pub fn new(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    /// Wakes the owning domain.
    pub fn fire(&self) {
        (self.0)();
    }
}

impl fmt::Debug for InterruptHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHook").finish_non_exhaustive()
    }
}

/// Per-domain events provider.
pub trait Events {
    /// Polls for released suspensions.
    ///
    /// `pending` holds every suspension id currently parked on this domain.
    /// With `block = false` the call must return promptly. With
    /// `block = true` the provider may block indefinitely; it must return
    /// promptly once its interrupt hook fires. Returning an empty list from
    /// a blocking call is allowed; the executor simply calls again.
    ///
    /// [`is_pending`](crate::is_pending) may be called from inside this
    /// method (and only from inside it) to probe a specific id.
    fn select(&mut self, block: bool, pending: &[SyscallUid]) -> Vec<Resume>;

    /// Returns the hook other domains use to wake this provider.
    ///
    /// Called once, before the first `select`.
    fn interrupt_hook(&self) -> InterruptHook;
}

/// Factory invoked once per domain, with that domain's id, to build its
/// events provider.
pub type EventsFactory = Arc<dyn Fn(DomainId) -> Box<dyn Events> + Send + Sync>;

#[derive(Default)]
struct ParkCell {
    permit: Mutex<bool>,
    cond: Condvar,
}

impl ParkCell {
    fn wake(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.cond.notify_one();
    }

    fn park(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.cond.wait(&mut permit);
        }
        *permit = false;
    }
}

/// The default provider: no suspensions of its own, parks until interrupted.
#[derive(Default)]
pub struct ParkEvents {
    cell: Arc<ParkCell>,
}

impl ParkEvents {
    /// Creates a parker provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Events for ParkEvents {
    fn select(&mut self, block: bool, _pending: &[SyscallUid]) -> Vec<Resume> {
        if block {
            self.cell.park();
        }
        Vec::new()
    }

    fn interrupt_hook(&self) -> InterruptHook {
        let cell = Arc::clone(&self.cell);
        InterruptHook::new(move || cell.wake())
    }
}

impl fmt::Debug for ParkEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkEvents").finish_non_exhaustive()
    }
}
