//! User-defined suspension points.
//!
//! [`make`] declares a suspension template bound to the current domain;
//! [`suspend`] parks the current task on it until the domain's events
//! provider releases it with a [`Resume`](crate::events::Resume) record.
//! The callback given to `make` runs inside the resumed task and produces
//! the value `suspend` returns.
//!
//! Suspension ids never leave their domain: an id is meaningful only to the
//! provider instance of the domain that created it.

use crate::runtime::domain::{self, Charge};
use crate::types::{DomainId, SyscallUid};
use core::fmt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::resume_unwind;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Release state of one parked suspension, shared between the suspended
/// task and the event bridge.
pub(crate) enum SuspendStatus {
    /// Still parked.
    Waiting,
    /// Released by the provider; the syscall callback may run.
    Released,
    /// The pre-function unwound; the payload is re-raised in the task.
    Discontinued(Box<dyn Any + Send>),
}

pub(crate) struct SuspendCell {
    pub(crate) status: Mutex<SuspendStatus>,
}

impl SuspendCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(SuspendStatus::Waiting),
        })
    }
}

/// A declared suspension point, consumed by [`suspend`].
///
/// At most one suspension can ever be outstanding per `Syscall` value,
/// which `suspend` enforces by taking it.
pub struct Syscall<T> {
    uid: SyscallUid,
    domain: DomainId,
    call: Box<dyn FnOnce() -> T + Send>,
}

impl<T> Syscall<T> {
    /// The domain-local identifier handed to the events provider.
    #[must_use]
    pub fn uid(&self) -> SyscallUid {
        self.uid
    }
}

impl<T> fmt::Debug for Syscall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syscall")
            .field("uid", &self.uid)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Declares a suspension point on the current domain.
///
/// `call` runs inside the owning task when the suspension is released and
/// produces the value returned by [`suspend`].
///
/// # Panics
///
/// Panics when called outside a scheduler domain.
pub fn make<T>(call: impl FnOnce() -> T + Send + 'static) -> Syscall<T> {
    domain::with_ctx(|ctx| Syscall {
        uid: ctx.shared().next_syscall_uid(),
        domain: ctx.domain_id(),
        call: Box::new(call),
    })
}

/// Parks the current task until the events provider releases the syscall.
#[must_use = "futures do nothing unless awaited"]
pub fn suspend<T>(syscall: Syscall<T>) -> Suspend<T> {
    Suspend {
        uid: syscall.uid,
        domain: syscall.domain,
        call: Some(syscall.call),
        cell: None,
    }
}

/// Future returned by [`suspend`].
pub struct Suspend<T> {
    uid: SyscallUid,
    domain: DomainId,
    call: Option<Box<dyn FnOnce() -> T + Send>>,
    cell: Option<Arc<SuspendCell>>,
}

impl<T> Future for Suspend<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(cell) = &this.cell {
            let mut status = cell.status.lock();
            return match std::mem::replace(&mut *status, SuspendStatus::Waiting) {
                SuspendStatus::Waiting => Poll::Pending,
                SuspendStatus::Released => {
                    drop(status);
                    let call = this.call.take().expect("suspension resumed twice");
                    Poll::Ready(call())
                }
                SuspendStatus::Discontinued(payload) => {
                    drop(status);
                    resume_unwind(payload)
                }
            };
        }
        let parked = domain::with_ctx(|ctx| {
            assert!(
                this.domain == ctx.domain_id(),
                "attent: syscall {} belongs to domain {}, used on {}",
                this.uid,
                this.domain,
                ctx.domain_id()
            );
            if let Charge::Yield = ctx.charge(cx) {
                return None;
            }
            let cell = SuspendCell::new();
            ctx.register_suspension(this.uid, Arc::clone(&cell));
            Some(cell)
        });
        match parked {
            Some(cell) => {
                this.cell = Some(cell);
                Poll::Pending
            }
            None => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Suspend<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspend")
            .field("uid", &self.uid)
            .field("parked", &self.cell.is_some())
            .finish_non_exhaustive()
    }
}

/// Probes whether a suspension id is still parked on the current domain.
///
/// Only legal inside a provider's `select` call.
///
/// # Panics
///
/// Panics when called outside `select`.
pub fn is_pending(uid: SyscallUid) -> bool {
    domain::with_ctx(|ctx| {
        assert!(
            ctx.in_select(),
            "attent: is_pending is only callable from within select"
        );
        ctx.has_suspension(uid)
    })
}
