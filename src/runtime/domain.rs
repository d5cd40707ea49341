//! The per-domain quantum executor.
//!
//! Each domain runs one instance of the loop in [`event_loop`]: drain the
//! inbox, settle finished tasks, pop one ready task, grant it a quantum,
//! and drain the event bridge before the next pop. When the ready queue is
//! empty but live work remains, the executor blocks inside the provider's
//! `select` until an interrupt arrives.
//!
//! All mutable scheduling state lives in a thread-local [`DomainCtx`]. The
//! executor releases its borrow while polling a task, which is how the
//! operation futures reach the same state from inside a poll.

use crate::error::Fatal;
use crate::events::Events;
use crate::ledger::{Ledger, Resource, ResourceCell};
use crate::promise::{Phase, PromiseState};
use crate::runtime::PoolShared;
use crate::runtime::mailbox::{DomainShared, Message};
use crate::syscall::{SuspendCell, SuspendStatus};
use crate::types::{DomainId, SyscallUid, TaskId, TaskUid};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use tracing::{debug, trace};

/// Outcome of charging one scheduling slice.
pub(crate) enum Charge {
    /// Budget available; the operation proceeds.
    Go,
    /// Quantum exhausted; the operation must yield to the tail of the
    /// ready queue and retry under a fresh budget.
    Yield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Queued,
    Running,
    Parked,
    Settling,
}

/// Parent-side record of one child promise.
pub(crate) struct ChildRef {
    pub(crate) state: Arc<PromiseState>,
    /// Set once the parent has awaited or cancelled the child.
    pub(crate) released: bool,
}

pub(crate) struct TaskRecord {
    pub(crate) state: Arc<PromiseState>,
    future: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    run: RunState,
    pub(crate) children: SmallVec<[ChildRef; 4]>,
    pub(crate) ledger: Ledger,
    waker: Waker,
}

pub(crate) struct Suspension {
    pub(crate) task: TaskUid,
    pub(crate) cell: Arc<SuspendCell>,
}

/// Mutable per-domain scheduling state, reachable from the executor and
/// from operation futures via the thread-local slot.
pub(crate) struct DomainCtx {
    shared: Arc<DomainShared>,
    pool: Arc<PoolShared>,
    ready: VecDeque<TaskUid>,
    tasks: BTreeMap<TaskUid, TaskRecord>,
    suspensions: BTreeMap<SyscallUid, Suspension>,
    settling: Vec<TaskUid>,
    quanta: u32,
    slices: u32,
    current: Option<TaskUid>,
    in_select: bool,
}

impl DomainCtx {
    pub(crate) fn new(shared: Arc<DomainShared>, pool: Arc<PoolShared>, quanta: u32) -> Self {
        Self {
            shared,
            pool,
            ready: VecDeque::new(),
            tasks: BTreeMap::new(),
            suspensions: BTreeMap::new(),
            settling: Vec::new(),
            quanta,
            slices: 0,
            current: None,
            in_select: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<DomainShared> {
        &self.shared
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    pub(crate) fn domain_id(&self) -> DomainId {
        self.shared.id
    }

    /// Identity of the task currently being polled.
    ///
    /// # Panics
    ///
    /// Panics when no task is running, e.g. from a finaliser or from
    /// outside the scheduler.
    pub(crate) fn current_task_id(&self) -> TaskId {
        match self.current {
            Some(uid) => TaskId::new(self.shared.id, uid),
            None => panic!("attent: operation outside of a task"),
        }
    }

    /// Charges one scheduling slice against the running task's quantum.
    pub(crate) fn charge(&mut self, cx: &mut Context<'_>) -> Charge {
        if self.slices == 0 {
            cx.waker().wake_by_ref();
            Charge::Yield
        } else {
            self.slices -= 1;
            Charge::Go
        }
    }

    fn make_waker(&self, uid: TaskUid) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            home: Arc::clone(&self.shared),
            uid,
        }))
    }

    /// Inserts a task record and enqueues it at the tail.
    pub(crate) fn spawn_ready(
        &mut self,
        state: Arc<PromiseState>,
        future: Pin<Box<dyn Future<Output = ()> + Send>>,
        gifts: Vec<Resource>,
    ) {
        let uid = state.id.uid;
        let waker = self.make_waker(uid);
        let mut ledger = Ledger::default();
        for gift in gifts {
            ledger.push_held(Arc::clone(gift.cell()));
        }
        trace!(task = %state.id, "task start");
        self.tasks.insert(
            uid,
            TaskRecord {
                state,
                future: Some(future),
                run: RunState::Queued,
                children: SmallVec::new(),
                ledger,
                waker,
            },
        );
        self.ready.push_back(uid);
    }

    /// Records a freshly spawned child under its parent.
    pub(crate) fn add_child(&mut self, parent: TaskUid, child: Arc<PromiseState>) {
        let rec = self
            .tasks
            .get_mut(&parent)
            .expect("spawning task has a record");
        rec.children.push(ChildRef {
            state: child,
            released: false,
        });
    }

    /// Marks a child as awaited or cancelled and prunes settled entries.
    pub(crate) fn release_child(&mut self, parent: TaskUid, child: TaskId) {
        if let Some(rec) = self.tasks.get_mut(&parent) {
            for entry in &mut rec.children {
                if entry.state.id == child {
                    entry.released = true;
                }
            }
            rec.children
                .retain(|entry| !(entry.released && entry.state.is_terminal()));
        }
    }

    fn requeue(&mut self, uid: TaskUid) {
        if let Some(rec) = self.tasks.get_mut(&uid)
            && rec.run == RunState::Parked
        {
            rec.run = RunState::Queued;
            self.ready.push_back(uid);
        }
    }

    fn next_ready(&mut self) -> Option<TaskUid> {
        self.ready.pop_front()
    }

    pub(crate) fn register_suspension(&mut self, uid: SyscallUid, cell: Arc<SuspendCell>) {
        let task = self
            .current
            .expect("suspension registered outside of a task");
        self.suspensions.insert(uid, Suspension { task, cell });
    }

    pub(crate) fn has_suspension(&self, uid: SyscallUid) -> bool {
        self.suspensions.contains_key(&uid)
    }

    pub(crate) fn in_select(&self) -> bool {
        self.in_select
    }

    pub(crate) fn ledger_mut(&mut self, uid: TaskUid) -> &mut Ledger {
        &mut self
            .tasks
            .get_mut(&uid)
            .expect("running task has a record")
            .ledger
    }

    pub(crate) fn try_ledger_mut(&mut self, uid: TaskUid) -> Option<&mut Ledger> {
        self.tasks.get_mut(&uid).map(|rec| &mut rec.ledger)
    }

    pub(crate) fn task_parent(&self, uid: TaskUid) -> Option<TaskId> {
        self.tasks.get(&uid).and_then(|rec| rec.state.parent)
    }

    pub(crate) fn parent_home(&self, uid: TaskUid) -> Option<Arc<DomainShared>> {
        self.tasks
            .get(&uid)
            .and_then(|rec| rec.state.parent_home.clone())
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn suspended_len(&self) -> usize {
        self.suspensions.len()
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn current_task_shape(&self) -> Option<(usize, usize)> {
        let uid = self.current?;
        let rec = self.tasks.get(&uid)?;
        Some((rec.children.len(), rec.ledger.len()))
    }
}

struct TaskWaker {
    home: Arc<DomainShared>,
    uid: TaskUid,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.home.post(Message::Wake(self.uid));
    }
}

thread_local! {
    static CTX: RefCell<Option<DomainCtx>> = const { RefCell::new(None) };
}

/// Installs a domain context on the current thread for the duration of the
/// returned guard.
pub(crate) fn install(ctx: DomainCtx) -> CtxGuard {
    CTX.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(
            slot.is_none(),
            "attent: a scheduler domain is already running on this thread"
        );
        *slot = Some(ctx);
    });
    CtxGuard
}

pub(crate) struct CtxGuard;

impl Drop for CtxGuard {
    fn drop(&mut self) {
        CTX.with(|slot| slot.borrow_mut().take());
    }
}

/// Runs a closure against the current thread's domain context.
///
/// # Panics
///
/// Panics outside of a `run` call, and on reentry (e.g. from a finaliser
/// that calls back into the scheduler).
pub(crate) fn with_ctx<R>(f: impl FnOnce(&mut DomainCtx) -> R) -> R {
    CTX.with(|slot| {
        let mut slot = slot.borrow_mut();
        let ctx = slot
            .as_mut()
            .unwrap_or_else(|| panic!("attent: scheduler operation outside of a run context"));
        f(ctx)
    })
}

/// What the executor does for a living on one domain.
pub(crate) enum Role {
    /// Domain 0: runs until the root promise is terminal.
    Main { root: Arc<PromiseState> },
    /// Worker: runs until the pool shuts down and local work drains.
    Worker,
}

enum PollOutcome {
    Completed,
    Progress,
    Skipped,
}

/// The domain loop. Returns when the role's exit condition holds or when a
/// peer domain recorded a failure.
pub(crate) fn event_loop(events: &mut dyn Events, role: &Role) {
    let (shared, pool) = with_ctx(|c| (Arc::clone(c.shared()), Arc::clone(c.pool())));
    loop {
        drain_inbox(&shared);
        settle_pass();
        if pool.failed() {
            break;
        }
        if matches!(role, Role::Main { root } if root.is_terminal()) {
            break;
        }
        let next = with_ctx(DomainCtx::next_ready);
        if let Some(uid) = next {
            match poll_task(uid) {
                PollOutcome::Progress => bridge(events, false),
                PollOutcome::Completed | PollOutcome::Skipped => {}
            }
        } else if idle_exit(&shared, &pool, role) {
            break;
        } else {
            bridge(events, true);
        }
    }
}

fn idle_exit(shared: &Arc<DomainShared>, pool: &Arc<PoolShared>, role: &Role) -> bool {
    match role {
        Role::Main { .. } => false,
        Role::Worker => {
            pool.is_shutdown() && shared.inbox_is_empty() && with_ctx(|c| c.tasks.is_empty())
        }
    }
}

fn drain_inbox(shared: &Arc<DomainShared>) {
    let mut reaped: Vec<Arc<ResourceCell>> = Vec::new();
    while let Some(message) = shared.pop() {
        match message {
            Message::Start(env) => with_ctx(|c| {
                let state = Arc::clone(&env.state);
                c.spawn_ready(env.state, env.future, env.gifts);
                // A cancel can outrun the start envelope when it comes from
                // a third domain. The mark survives; honour it now.
                if state.cancel_requested() {
                    apply_cancel(c, &state, &mut reaped);
                }
            }),
            Message::Cancel(state) => with_ctx(|c| apply_cancel(c, &state, &mut reaped)),
            Message::Wake(uid) => with_ctx(|c| c.requeue(uid)),
            Message::Settled(_) => {
                // Only a wakeup; the settle pass below re-checks.
            }
            Message::Adopt { parent, cell } => {
                let adopted = with_ctx(|c| match c.try_ledger_mut(parent) {
                    Some(ledger) => {
                        ledger.push_held(Arc::clone(&cell));
                        true
                    }
                    None => false,
                });
                if !adopted {
                    debug!(resource = %cell.uid, "adopting task is gone, reaping");
                    reaped.push(cell);
                }
            }
        }
    }
    for cell in reaped {
        cell.run_finalizer();
    }
}

/// Applies a cancel request to a locally owned task: discard its
/// suspensions, drop its continuation, reap held resources, and propagate
/// to children. Collected finalisers run once the context borrow ends.
fn apply_cancel(
    ctx: &mut DomainCtx,
    state: &Arc<PromiseState>,
    reaped: &mut Vec<Arc<ResourceCell>>,
) {
    debug_assert_eq!(state.id.domain, ctx.domain_id());
    state.request_cancel();
    if state.is_terminal() {
        // Cancellation wins retroactively over an already settled result.
        state.set_phase(Phase::Cancelled);
        state.wake_waiters();
        return;
    }
    let uid = state.id.uid;
    let mut propagate: Vec<Arc<PromiseState>> = Vec::new();
    match ctx.tasks.get_mut(&uid) {
        None => {
            // Not started here yet; the start envelope will see the mark.
        }
        Some(rec) if rec.run == RunState::Settling => {
            for child in &rec.children {
                if !child.state.is_terminal() {
                    propagate.push(Arc::clone(&child.state));
                }
            }
        }
        Some(rec) => {
            trace!(task = %state.id, "cancelling");
            rec.future = None;
            rec.run = RunState::Settling;
            for child in &mut rec.children {
                if !child.released {
                    child.released = true;
                    propagate.push(Arc::clone(&child.state));
                }
            }
            reaped.extend(rec.ledger.collect_held());
            ctx.suspensions.retain(|_, susp| susp.task != uid);
            ctx.settling.push(uid);
        }
    }
    for child in propagate {
        route_cancel(ctx, child, reaped);
    }
}

/// Sends a cancel request towards the domain owning the target.
fn route_cancel(
    ctx: &mut DomainCtx,
    state: Arc<PromiseState>,
    reaped: &mut Vec<Arc<ResourceCell>>,
) {
    if state.id.domain == ctx.domain_id() {
        apply_cancel(ctx, &state, reaped);
    } else {
        state.request_cancel();
        ctx.pool().domain(state.id.domain).post(Message::Cancel(state));
    }
}

fn poll_task(uid: TaskUid) -> PollOutcome {
    let popped = with_ctx(|c| {
        let quanta = c.quanta;
        let rec = c.tasks.get_mut(&uid)?;
        if rec.run != RunState::Queued {
            return None;
        }
        let future = rec.future.take()?;
        rec.run = RunState::Running;
        c.current = Some(uid);
        c.slices = quanta;
        Some((future, rec.waker.clone()))
    });
    let Some((mut future, waker)) = popped else {
        return PollOutcome::Skipped;
    };
    let mut cx = Context::from_waker(&waker);
    let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
    with_ctx(|c| c.current = None);
    match polled {
        Ok(Poll::Pending) => {
            with_ctx(|c| {
                if let Some(rec) = c.tasks.get_mut(&uid) {
                    rec.future = Some(future);
                    rec.run = RunState::Parked;
                }
            });
            PollOutcome::Progress
        }
        Ok(Poll::Ready(())) => {
            complete_normal(uid);
            PollOutcome::Completed
        }
        Err(payload) => {
            if payload.is::<Fatal>() {
                resume_unwind(payload);
            }
            complete_failed(uid, payload);
            PollOutcome::Progress
        }
    }
}

fn complete_normal(uid: TaskUid) {
    let (id, abandoned, leaked, cells) = with_ctx(|c| {
        let rec = c.tasks.get_mut(&uid).expect("completed task has a record");
        rec.state.set_phase(Phase::Resolved);
        rec.run = RunState::Settling;
        let abandoned = rec
            .children
            .iter()
            .find(|child| !child.released)
            .map(|child| child.state.id);
        let leaked = rec.ledger.first_held();
        let cells = rec.ledger.collect_held();
        c.settling.push(uid);
        (rec.state.id, abandoned, leaked, cells)
    });
    trace!(task = %id, "task resolved");
    for cell in cells {
        cell.run_finalizer();
    }
    if let Some(child) = abandoned {
        Fatal::StillHasChildren { task: id, child }.raise();
    }
    if let Some(resource) = leaked {
        Fatal::ResourceLeak { task: id, resource }.raise();
    }
}

fn complete_failed(uid: TaskUid, payload: Box<dyn std::any::Any + Send>) {
    let (id, cells, cancels) = with_ctx(|c| {
        let rec = c.tasks.get_mut(&uid).expect("failed task has a record");
        rec.state.store_failure(payload);
        rec.state.set_phase(Phase::Failed);
        rec.run = RunState::Settling;
        let mut cancels = Vec::new();
        for child in &mut rec.children {
            if !child.released {
                child.released = true;
                cancels.push(Arc::clone(&child.state));
            }
        }
        let cells = rec.ledger.collect_held();
        c.settling.push(uid);
        (rec.state.id, cells, cancels)
    });
    debug!(task = %id, "task failed");
    for cell in cells {
        cell.run_finalizer();
    }
    let mut reaped = Vec::new();
    with_ctx(|c| {
        for child in cancels {
            route_cancel(c, child, &mut reaped);
        }
    });
    for cell in reaped {
        cell.run_finalizer();
    }
}

/// Finalises every settling task whose children have all drained.
fn settle_pass() {
    loop {
        let next = with_ctx(|c| {
            c.settling.iter().copied().find(|uid| {
                c.tasks
                    .get(uid)
                    .is_none_or(|rec| rec.children.iter().all(|ch| ch.state.is_terminal()))
            })
        });
        let Some(uid) = next else { break };
        finalize_task(uid);
    }
}

fn finalize_task(uid: TaskUid) {
    let state = with_ctx(|c| {
        c.settling.retain(|queued| *queued != uid);
        c.tasks.remove(&uid).map(|rec| rec.state)
    });
    let Some(state) = state else { return };
    if state.cancel_requested() {
        state.set_phase(Phase::Cancelled);
    }
    state.set_terminal();
    trace!(task = %state.id, phase = ?state.phase(), "task terminal");
    if let (Some(parent), Some(home)) = (state.parent, state.parent_home.clone()) {
        home.post(Message::Settled(parent.uid));
    }
}

/// The event bridge: one `select` round plus application of the returned
/// resume records.
fn bridge(events: &mut dyn Events, block: bool) {
    let pending = with_ctx(|c| {
        c.in_select = true;
        c.suspensions.keys().copied().collect::<Vec<_>>()
    });
    let resumes = events.select(block, &pending);
    with_ctx(|c| c.in_select = false);
    for resume in resumes {
        let (uid, pre) = resume.into_parts();
        let Some(susp) = with_ctx(|c| c.suspensions.remove(&uid)) else {
            debug!(%uid, "resume for unknown suspension");
            continue;
        };
        let outcome = catch_unwind(AssertUnwindSafe(pre));
        *susp.cell.status.lock() = match outcome {
            Ok(()) => SuspendStatus::Released,
            Err(payload) => SuspendStatus::Discontinued(payload),
        };
        with_ctx(|c| c.requeue(susp.task));
    }
}
