//! Promise state machine and result slots.
//!
//! A [`Promise`] is the observable handle of a task. The type-erased
//! lifecycle state ([`PromiseState`]) is shared between the owning domain,
//! the parent's domain, and any domain holding the handle; the typed result
//! value lives in a separate slot written exactly once by the task wrapper.
//!
//! Phase transitions are: pending, then one of resolved / failed /
//! cancelled, and finally terminal once every child has settled. Only the
//! owning domain stamps phases; other domains may read them, request
//! cancellation, or register wakers.

use crate::error::TaskError;
use crate::runtime::mailbox::DomainShared;
use crate::types::{DomainId, TaskId, TaskUid};
use core::fmt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::Waker;

/// Result-slot phase tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    /// Not settled yet.
    Pending = 0,
    /// The body returned a value.
    Resolved = 1,
    /// The body unwound.
    Failed = 2,
    /// Cancellation won, possibly retroactively.
    Cancelled = 3,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Resolved,
            2 => Self::Failed,
            3 => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// Type-erased shared lifecycle state of one task.
pub(crate) struct PromiseState {
    /// Identity: owning domain plus per-domain uid.
    pub(crate) id: TaskId,
    /// The creating task, `None` only for the root.
    pub(crate) parent: Option<TaskId>,
    /// Mailbox of the parent's domain, used for settle pings.
    pub(crate) parent_home: Option<Arc<DomainShared>>,
    phase: AtomicU8,
    terminal: AtomicBool,
    cancel_requested: AtomicBool,
    failure: Mutex<Option<Box<dyn Any + Send>>>,
    waiters: Mutex<Vec<Waker>>,
}

impl PromiseState {
    pub(crate) fn new(
        id: TaskId,
        parent: Option<TaskId>,
        parent_home: Option<Arc<DomainShared>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent,
            parent_home,
            phase: AtomicU8::new(Phase::Pending as u8),
            terminal: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            failure: Mutex::new(None),
            waiters: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Stamps a result phase. Owning domain only.
    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Marks the promise terminal and wakes every registered waiter.
    pub(crate) fn set_terminal(&self) {
        let mut waiters = self.waiters.lock();
        self.terminal.store(true, Ordering::Release);
        for waker in waiters.drain(..) {
            waker.wake();
        }
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Sets the cancel-request mark. Returns true on the first request.
    pub(crate) fn request_cancel(&self) -> bool {
        !self.cancel_requested.swap(true, Ordering::AcqRel)
    }

    /// Registers a waker to fire at terminal. Wakes immediately if the
    /// promise is already terminal.
    pub(crate) fn add_waiter(&self, waker: &Waker) {
        let mut waiters = self.waiters.lock();
        if self.terminal.load(Ordering::Acquire) {
            waker.wake_by_ref();
            return;
        }
        if !waiters.iter().any(|known| known.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    /// Wakes waiters without changing the terminal flag. Used when a
    /// retroactive cancellation rewrites an already-terminal result.
    pub(crate) fn wake_waiters(&self) {
        let mut waiters = self.waiters.lock();
        for waker in waiters.drain(..) {
            waker.wake();
        }
    }

    pub(crate) fn store_failure(&self, payload: Box<dyn Any + Send>) {
        *self.failure.lock() = Some(payload);
    }

    pub(crate) fn take_failure(&self) -> Option<Box<dyn Any + Send>> {
        self.failure.lock().take()
    }
}

impl fmt::Debug for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseState")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("terminal", &self.is_terminal())
            .field("cancel_requested", &self.cancel_requested())
            .finish_non_exhaustive()
    }
}

/// Typed result storage, written once by the task wrapper.
pub(crate) enum Slot<T> {
    Empty,
    Value(T),
}

pub(crate) type SlotHandle<T> = Arc<Mutex<Slot<T>>>;

/// Wraps a task body into the type-erased future the executor stores,
/// returning the slot the body's value lands in.
pub(crate) fn completion<T, F>(
    task: F,
) -> (SlotHandle<T>, Pin<Box<dyn Future<Output = ()> + Send>>)
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let slot: SlotHandle<T> = Arc::new(Mutex::new(Slot::Empty));
    let sink = Arc::clone(&slot);
    let wrapped = Box::pin(async move {
        let value = task.await;
        *sink.lock() = Slot::Value(value);
    });
    (slot, wrapped)
}

/// The observable handle of a task's lifecycle and result.
///
/// Promises are affine: awaiting consumes the handle. Only the creating
/// task may await or cancel one; anything else is a structural fatal.
pub struct Promise<T> {
    state: Arc<PromiseState>,
    slot: SlotHandle<T>,
}

impl<T> Promise<T> {
    pub(crate) fn new(state: Arc<PromiseState>, slot: SlotHandle<T>) -> Self {
        Self { state, slot }
    }

    pub(crate) fn state(&self) -> &Arc<PromiseState> {
        &self.state
    }

    /// The full identity of the underlying task.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.state.id
    }

    /// The domain-local uid of the underlying task.
    #[must_use]
    pub fn uid(&self) -> TaskUid {
        self.state.id.uid
    }

    /// The domain hosting the underlying task.
    #[must_use]
    pub fn domain(&self) -> DomainId {
        self.state.id.domain
    }

    /// Reads out the settled result. Callers must have observed terminal.
    pub(crate) fn take_result(self) -> Result<T, TaskError> {
        debug_assert!(self.state.is_terminal());
        match self.state.phase() {
            Phase::Resolved => match std::mem::replace(&mut *self.slot.lock(), Slot::Empty) {
                Slot::Value(value) => Ok(value),
                Slot::Empty => panic!("attent: resolved promise {} has no value", self.state.id),
            },
            Phase::Failed => {
                let payload = self
                    .state
                    .take_failure()
                    .unwrap_or_else(|| Box::new("task failed"));
                Err(TaskError::Failed(payload))
            }
            Phase::Cancelled => Err(TaskError::Cancelled),
            Phase::Pending => panic!("attent: result taken from pending promise {}", self.state.id),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.state.id)
            .field("phase", &self.state.phase())
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state.id)
    }
}
