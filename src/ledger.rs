//! Per-task resource ledger.
//!
//! Every task carries a stack of owned resources, each with a finaliser.
//! The finaliser runs at most once, automatically, when the owning task
//! terminates abnormally while the entry is still held. Terminating
//! normally with a held entry also runs the finaliser but is reported as a
//! resource leak, which is fatal.
//!
//! Gifting a resource at spawn time duplicates the ledger entry: giver and
//! receiver each hold one, and each must disown independently. The
//! underlying finaliser cell is shared and take-once, so duplication never
//! makes it run twice.

use crate::error::Fatal;
use crate::runtime::domain;
use crate::runtime::mailbox::Message;
use crate::types::{ResourceUid, TaskId};
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Shared backing cell of one resource: current owner plus the take-once
/// finaliser.
pub(crate) struct ResourceCell {
    pub(crate) uid: ResourceUid,
    owner: Mutex<TaskId>,
    finalize: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ResourceCell {
    pub(crate) fn new(
        uid: ResourceUid,
        owner: TaskId,
        finalize: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid,
            owner: Mutex::new(owner),
            finalize: Mutex::new(Some(finalize)),
        })
    }

    pub(crate) fn owner(&self) -> TaskId {
        *self.owner.lock()
    }

    pub(crate) fn set_owner(&self, owner: TaskId) {
        *self.owner.lock() = owner;
    }

    /// Runs the finaliser if it has not run yet.
    pub(crate) fn run_finalizer(&self) {
        let finalize = self.finalize.lock().take();
        if let Some(finalize) = finalize {
            finalize();
        }
    }
}

impl fmt::Debug for ResourceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCell")
            .field("uid", &self.uid)
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// State of one ledger entry, per holding task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Still the holder's responsibility.
    Held,
    /// Explicitly released; the finaliser will not run for this holder.
    Disowned,
    /// Moved up to the parent; a stub remains for ownership checks.
    Transferred,
}

pub(crate) struct Entry {
    pub(crate) cell: Arc<ResourceCell>,
    pub(crate) state: EntryState,
}

/// The per-task resource stack, in acquisition order.
#[derive(Default)]
pub(crate) struct Ledger {
    entries: Vec<Entry>,
}

impl Ledger {
    pub(crate) fn push_held(&mut self, cell: Arc<ResourceCell>) {
        self.entries.push(Entry {
            cell,
            state: EntryState::Held,
        });
    }

    /// Most recent entry for the uid, if any.
    fn find_mut(&mut self, uid: ResourceUid) -> Option<&mut Entry> {
        self.entries.iter_mut().rev().find(|e| e.cell.uid == uid)
    }

    fn mark(&mut self, uid: ResourceUid, state: EntryState) -> bool {
        match self.find_mut(uid) {
            Some(entry) if entry.state == EntryState::Held => {
                entry.state = state;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Earliest-acquired entry still held, for leak reporting.
    pub(crate) fn first_held(&self) -> Option<ResourceUid> {
        self.entries
            .iter()
            .find(|e| e.state == EntryState::Held)
            .map(|e| e.cell.uid)
    }

    /// Marks every held entry disowned and hands back its cell, in reverse
    /// acquisition order. The executor runs the finalisers afterwards,
    /// outside any task context.
    pub(crate) fn collect_held(&mut self) -> Vec<Arc<ResourceCell>> {
        let mut cells = Vec::new();
        for entry in self.entries.iter_mut().rev() {
            if entry.state == EntryState::Held {
                entry.state = EntryState::Disowned;
                cells.push(Arc::clone(&entry.cell));
            }
        }
        cells
    }

    /// Reaps held entries after an abnormal termination, in reverse
    /// acquisition order. Never fatal.
    #[cfg(test)]
    pub(crate) fn reap_abnormal(&mut self) {
        for cell in self.collect_held() {
            cell.run_finalizer();
        }
    }

    /// Reaps held entries after a normal termination. Finalisers still run
    /// (reverse order), but any held entry is a leak; the earliest-acquired
    /// one is returned for the fatal report.
    #[cfg(test)]
    pub(crate) fn drain_normal(&mut self) -> Option<ResourceUid> {
        let leaked = self.first_held();
        self.reap_abnormal();
        leaked
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger").field("entries", &self.entries.len()).finish()
    }
}

/// A cloneable handle to an owned resource.
///
/// Handles are plain references; the authoritative owner lives in the
/// shared cell and moves with [`transfer`] and spawn-time gifts.
#[derive(Clone)]
pub struct Resource {
    uid: ResourceUid,
    cell: Arc<ResourceCell>,
}

impl Resource {
    /// The resource's identifier.
    #[must_use]
    pub fn uid(&self) -> ResourceUid {
        self.uid
    }

    pub(crate) fn cell(&self) -> &Arc<ResourceCell> {
        &self.cell
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("uid", &self.uid).finish_non_exhaustive()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uid)
    }
}

/// Registers a finaliser with the current task and returns its handle.
///
/// The finaliser runs exactly once if the task fails or is cancelled while
/// the resource is held. It must not call back into the scheduler.
///
/// # Panics
///
/// Panics when called outside a task.
pub fn own(finalize: impl FnOnce() + Send + 'static) -> Resource {
    domain::with_ctx(|ctx| {
        let current = ctx.current_task_id();
        let uid = ctx.shared().next_resource_uid();
        let cell = ResourceCell::new(uid, current, Box::new(finalize));
        ctx.ledger_mut(current.uid).push_held(Arc::clone(&cell));
        Resource { uid, cell }
    })
}

/// Releases the current task from the resource. The finaliser is skipped.
///
/// Judged against the caller's own ledger, not the shared owner: after a
/// gift, giver and receiver each hold a duplicate entry and each must
/// disown theirs. Fatal with *not-owner* when the caller holds no live
/// entry for the resource.
pub fn disown(resource: &Resource) {
    domain::with_ctx(|ctx| {
        let current = ctx.current_task_id();
        if !ctx
            .ledger_mut(current.uid)
            .mark(resource.uid, EntryState::Disowned)
        {
            Fatal::NotOwner {
                caller: current,
                resource: resource.uid,
            }
            .raise();
        }
    });
}

/// Moves responsibility for the resource to the current task's parent.
///
/// A transferred stub stays in the caller's ledger, so a later
/// [`check`] by the caller fails with *not-owner* rather than reporting an
/// unknown handle.
///
/// # Panics
///
/// Panics when called from the root task, which has no parent.
pub fn transfer(resource: &Resource) {
    domain::with_ctx(|ctx| {
        let current = ctx.current_task_id();
        check_owner(current, resource);
        let parent = ctx
            .task_parent(current.uid)
            .unwrap_or_else(|| panic!("attent: transfer from the root task"));
        if !ctx
            .ledger_mut(current.uid)
            .mark(resource.uid, EntryState::Transferred)
        {
            Fatal::NotOwner {
                caller: current,
                resource: resource.uid,
            }
            .raise();
        }
        resource.cell.set_owner(parent);
        if parent.domain == ctx.domain_id() {
            match ctx.try_ledger_mut(parent.uid) {
                Some(ledger) => ledger.push_held(Arc::clone(&resource.cell)),
                None => {
                    debug!(resource = %resource.uid, parent = %parent, "transfer to settled parent");
                    resource.cell.run_finalizer();
                }
            }
        } else {
            let home = ctx
                .parent_home(current.uid)
                .expect("cross-domain parent always has a mailbox");
            home.post(Message::Adopt {
                parent: parent.uid,
                cell: Arc::clone(&resource.cell),
            });
        }
    });
}

/// Fails with *not-owner* unless the current task owns the resource.
pub fn check(resource: &Resource) {
    domain::with_ctx(|ctx| {
        let current = ctx.current_task_id();
        check_owner(current, resource);
    });
}

fn check_owner(current: TaskId, resource: &Resource) {
    if resource.cell.owner() != current {
        Fatal::NotOwner {
            caller: current,
            resource: resource.uid,
        }
        .raise();
    }
}
