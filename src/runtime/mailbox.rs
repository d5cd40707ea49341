//! Cross-domain mailboxes.
//!
//! Each domain owns one lock-free inbox. Peers write, the owner drains.
//! Everything that crosses a domain boundary travels here: task start
//! envelopes, cancel requests, waker-driven re-enqueues, settle pings, and
//! resource adoptions. Every post is followed by an interrupt so a domain
//! blocked inside its provider's `select` notices promptly.

use crate::events::InterruptHook;
use crate::ledger::{Resource, ResourceCell};
use crate::promise::PromiseState;
use crate::types::{DomainId, ResourceUid, SyscallUid, TaskUid};
use core::fmt;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A new task shipped to its owning domain.
pub(crate) struct Envelope {
    pub(crate) state: Arc<PromiseState>,
    pub(crate) future: Pin<Box<dyn Future<Output = ()> + Send>>,
    pub(crate) gifts: Vec<Resource>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope").field("id", &self.state.id).finish_non_exhaustive()
    }
}

/// One inbox message.
pub(crate) enum Message {
    /// Start a task on the receiving domain.
    Start(Envelope),
    /// Apply a cancel request to a task the receiving domain owns.
    Cancel(Arc<PromiseState>),
    /// Re-enqueue a parked task; sent by wakers.
    Wake(TaskUid),
    /// A child of the named task settled; re-check its settling state.
    Settled(TaskUid),
    /// Adopt a resource transferred up from a child on another domain.
    Adopt {
        parent: TaskUid,
        cell: Arc<ResourceCell>,
    },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(env) => f.debug_tuple("Start").field(&env.state.id).finish(),
            Self::Cancel(state) => f.debug_tuple("Cancel").field(&state.id).finish(),
            Self::Wake(uid) => f.debug_tuple("Wake").field(uid).finish(),
            Self::Settled(uid) => f.debug_tuple("Settled").field(uid).finish(),
            Self::Adopt { parent, cell } => f
                .debug_struct("Adopt")
                .field("parent", parent)
                .field("resource", &cell.uid)
                .finish(),
        }
    }
}

/// The cross-thread face of one domain: inbox, uid counters, interrupt.
pub(crate) struct DomainShared {
    pub(crate) id: DomainId,
    inbox: SegQueue<Message>,
    task_uids: AtomicU64,
    syscall_uids: AtomicU64,
    resource_uids: AtomicU64,
    hook: Mutex<Option<InterruptHook>>,
}

impl DomainShared {
    pub(crate) fn new(id: DomainId) -> Arc<Self> {
        Arc::new(Self {
            id,
            inbox: SegQueue::new(),
            task_uids: AtomicU64::new(0),
            syscall_uids: AtomicU64::new(0),
            resource_uids: AtomicU64::new(0),
            hook: Mutex::new(None),
        })
    }

    /// Queues a message and interrupts the owner.
    pub(crate) fn post(&self, message: Message) {
        self.inbox.push(message);
        self.interrupt();
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        self.inbox.pop()
    }

    pub(crate) fn inbox_is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    /// Registers the interrupt hook; done once before the domain's first
    /// `select`. Posts arriving earlier are picked up by the initial drain.
    pub(crate) fn set_hook(&self, hook: InterruptHook) {
        *self.hook.lock() = Some(hook);
    }

    pub(crate) fn interrupt(&self) {
        if let Some(hook) = &*self.hook.lock() {
            hook.fire();
        }
    }

    pub(crate) fn next_task_uid(&self) -> TaskUid {
        TaskUid(self.task_uids.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_syscall_uid(&self) -> SyscallUid {
        SyscallUid(self.syscall_uids.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_resource_uid(&self) -> ResourceUid {
        ResourceUid(self.resource_uids.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for DomainShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainShared")
            .field("id", &self.id)
            .field("inbox", &self.inbox.len())
            .finish_non_exhaustive()
    }
}
