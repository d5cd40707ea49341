//! Error types: task-local outcomes and uncatchable structural fatals.
//!
//! These are two deliberately separate channels. A [`TaskError`] is the
//! ordinary result of awaiting a task that failed or was cancelled; it is
//! delivered through [`Promise::join`](crate::Promise::join) and nowhere
//! else. A [`Fatal`] is a violation of the structural rules (orphaned
//! children, foreign awaits, leaked resources). Fatals unwind through the
//! scheduler and re-raise from [`run`](crate::run); they are never
//! converted into a `TaskError`, and a program that observes one should
//! treat the scheduler state as invalid.

use crate::types::{ResourceUid, TaskId};
use core::fmt;
use std::any::Any;
use std::panic::panic_any;
use thiserror::Error;

/// The abnormal outcome of an awaited task.
#[derive(Error)]
pub enum TaskError {
    /// The task was cancelled before it could settle, or retroactively
    /// after settling.
    #[error("task cancelled")]
    Cancelled,
    /// The task body unwound. The payload is the original panic payload.
    #[error("task failed")]
    Failed(Box<dyn Any + Send>),
}

impl TaskError {
    /// Returns true if the task was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if the task body unwound.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Extracts the original panic payload from a failed outcome.
    #[must_use]
    pub fn into_panic(self) -> Option<Box<dyn Any + Send>> {
        match self {
            Self::Cancelled => None,
            Self::Failed(payload) => Some(payload),
        }
    }

    /// Best-effort rendering of a failed task's panic message.
    #[must_use]
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            Self::Cancelled => None,
            Self::Failed(payload) => payload
                .downcast_ref::<&'static str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str)),
        }
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed(_) => match self.panic_message() {
                Some(msg) => write!(f, "Failed({msg:?})"),
                None => write!(f, "Failed(..)"),
            },
        }
    }
}

/// An uncatchable structural violation.
///
/// Raised by unwinding with the `Fatal` value itself as the panic payload,
/// so a caller wrapping [`run`](crate::run) in `catch_unwind` can downcast
/// and inspect the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    /// A task terminated while owning children it neither awaited nor
    /// cancelled.
    StillHasChildren {
        /// The terminating task.
        task: TaskId,
        /// One of the children it abandoned.
        child: TaskId,
    },
    /// A task awaited or cancelled a promise it did not create.
    NotAChild {
        /// The offending task.
        caller: TaskId,
        /// The promise it tried to reach.
        target: TaskId,
    },
    /// A resource operation was attempted by a task that does not own the
    /// resource.
    NotOwner {
        /// The offending task.
        caller: TaskId,
        /// The resource in question.
        resource: ResourceUid,
    },
    /// A task terminated normally while still holding a resource. The
    /// finaliser has been run, but the omission is a programming error.
    ResourceLeak {
        /// The terminating task.
        task: TaskId,
        /// The leaked resource.
        resource: ResourceUid,
    },
    /// No worker domain is eligible to receive a parallel task.
    NoDomainAvailable,
    /// A cancelled result was re-raised through an await that does not
    /// tolerate cancellation.
    Cancelled {
        /// The cancelled promise.
        target: TaskId,
    },
}

impl Fatal {
    /// Unwinds with `self` as the panic payload.
    pub(crate) fn raise(self) -> ! {
        panic_any(self)
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StillHasChildren { task, child } => {
                write!(f, "task {task} still has children (for instance {child})")
            }
            Self::NotAChild { caller, target } => {
                write!(f, "task {caller} does not own promise {target}")
            }
            Self::NotOwner { caller, resource } => {
                write!(f, "task {caller} does not own resource {resource}")
            }
            Self::ResourceLeak { task, resource } => {
                write!(f, "task {task} leaked resource {resource}")
            }
            Self::NoDomainAvailable => write!(f, "no worker domain available"),
            Self::Cancelled { target } => {
                write!(f, "promise {target} was cancelled")
            }
        }
    }
}
