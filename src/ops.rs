//! Core operation futures.
//!
//! Every operation here is a scheduling point: it charges one slice of the
//! running task's quantum, and a charge against an exhausted quantum forces
//! a yield to the tail of the ready queue before the operation proceeds.
//! The executor drains the event bridge after every poll that leaves a task
//! unfinished, so no sequence of operations can starve external events.

use crate::error::{Fatal, TaskError};
use crate::ledger::Resource;
use crate::orphans::Orphans;
use crate::promise::{self, Phase, Promise, PromiseState, SlotHandle};
use crate::runtime::domain::{self, Charge, DomainCtx};
use crate::runtime::mailbox::{DomainShared, Envelope, Message};
use crate::types::{DomainId, TaskId};
use core::fmt;
use serde::Serialize;
use std::future::Future;
use std::panic::resume_unwind;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone, Copy)]
enum Placement {
    /// The caller's own domain; the child runs behind it in the same queue.
    Local,
    /// Round-robin over eligible workers: never domain 0, never the caller.
    Worker,
    /// A fixed worker index; used by [`parallel`] for even distribution.
    Pinned(usize),
}

/// Spawns a task on the current domain and returns its promise.
///
/// The child is enqueued at the tail of the ready queue; the parent keeps
/// running until its own next scheduling point.
#[must_use = "futures do nothing unless awaited"]
pub fn spawn_local<T, F>(task: F) -> Spawn<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Spawn::new(task, Vec::new(), Placement::Local)
}

/// Spawns a task on the current domain, gifting it resources.
///
/// Each gifted entry is duplicated: the giver keeps its ledger entry and
/// the child receives one of its own, and both must disown independently.
#[must_use = "futures do nothing unless awaited"]
pub fn spawn_local_give<T, F>(gifts: Vec<Resource>, task: F) -> Spawn<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Spawn::new(task, gifts, Placement::Local)
}

/// Spawns a task on a worker domain and returns its promise.
///
/// The target is chosen round-robin among eligible workers; domain 0 and
/// the caller's own domain are never eligible. With no eligible worker the
/// *no-domain-available* fatal is raised.
#[must_use = "futures do nothing unless awaited"]
pub fn spawn<T, F>(task: F) -> Spawn<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Spawn::new(task, Vec::new(), Placement::Worker)
}

/// Spawns a task on a worker domain, gifting it resources.
#[must_use = "futures do nothing unless awaited"]
pub fn spawn_give<T, F>(gifts: Vec<Resource>, task: F) -> Spawn<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Spawn::new(task, gifts, Placement::Worker)
}

fn spawn_pinned<T, F>(worker: usize, task: F) -> Spawn<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Spawn::new(task, Vec::new(), Placement::Pinned(worker))
}

/// Future returned by the spawn family; yields the child's [`Promise`].
pub struct Spawn<T> {
    body: Option<(SlotHandle<T>, BoxedTask)>,
    gifts: Vec<Resource>,
    placement: Placement,
}

impl<T: Send + 'static> Spawn<T> {
    fn new<F>(task: F, gifts: Vec<Resource>, placement: Placement) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (slot, wrapped) = promise::completion(task);
        Self {
            body: Some((slot, wrapped)),
            gifts,
            placement,
        }
    }
}

impl<T: Send + 'static> Future for Spawn<T> {
    type Output = Promise<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let spawned = domain::with_ctx(|c| {
            let parent = c.current_task_id();
            if let Charge::Yield = c.charge(cx) {
                return None;
            }
            let (slot, future) = this
                .body
                .take()
                .expect("spawn polled after completion");
            let gifts = std::mem::take(&mut this.gifts);
            Some(dispatch(c, parent, this.placement, slot, future, gifts))
        });
        match spawned {
            Some(promise) => Poll::Ready(promise),
            None => Poll::Pending,
        }
    }
}

fn dispatch<T>(
    c: &mut DomainCtx,
    parent: TaskId,
    placement: Placement,
    slot: SlotHandle<T>,
    future: BoxedTask,
    gifts: Vec<Resource>,
) -> Promise<T> {
    match placement {
        Placement::Local => {
            let shared = Arc::clone(c.shared());
            let id = TaskId::new(shared.id, shared.next_task_uid());
            let state = PromiseState::new(id, Some(parent), Some(Arc::clone(c.shared())));
            hand_over_gifts(parent, id, &gifts);
            c.add_child(parent.uid, Arc::clone(&state));
            c.spawn_ready(Arc::clone(&state), future, gifts);
            Promise::new(state, slot)
        }
        Placement::Worker => {
            let caller_domain = c.domain_id();
            let eligible: Vec<Arc<DomainShared>> = c
                .pool()
                .workers()
                .iter()
                .filter(|d| d.id != caller_domain)
                .cloned()
                .collect();
            if eligible.is_empty() {
                Fatal::NoDomainAvailable.raise();
            }
            let target = Arc::clone(&eligible[c.pool().next_rr() % eligible.len()]);
            dispatch_remote(c, parent, &target, slot, future, gifts)
        }
        Placement::Pinned(worker) => {
            let workers = c.pool().workers();
            if workers.is_empty() {
                Fatal::NoDomainAvailable.raise();
            }
            let target = Arc::clone(&workers[worker % workers.len()]);
            dispatch_remote(c, parent, &target, slot, future, gifts)
        }
    }
}

fn dispatch_remote<T>(
    c: &mut DomainCtx,
    parent: TaskId,
    target: &Arc<DomainShared>,
    slot: SlotHandle<T>,
    future: BoxedTask,
    gifts: Vec<Resource>,
) -> Promise<T> {
    let id = TaskId::new(target.id, target.next_task_uid());
    let state = PromiseState::new(id, Some(parent), Some(Arc::clone(c.shared())));
    hand_over_gifts(parent, id, &gifts);
    c.add_child(parent.uid, Arc::clone(&state));
    target.post(Message::Start(Envelope {
        state: Arc::clone(&state),
        future,
        gifts,
    }));
    Promise::new(state, slot)
}

fn hand_over_gifts(giver: TaskId, receiver: TaskId, gifts: &[Resource]) {
    for gift in gifts {
        if gift.cell().owner() != giver {
            Fatal::NotOwner {
                caller: giver,
                resource: gift.uid(),
            }
            .raise();
        }
        gift.cell().set_owner(receiver);
    }
}

impl<T> Promise<T> {
    /// Awaits the task until it is terminal and returns its result.
    ///
    /// Only the creating task may await; anything else raises the
    /// *not-a-child* fatal. The result is `Err` for a failed or cancelled
    /// task, and the target's whole subtree is settled by the time this
    /// returns.
    #[must_use = "futures do nothing unless awaited"]
    pub fn join(self) -> Join<T> {
        Join {
            promise: Some(self),
            verified: false,
        }
    }

    /// Like [`join`](Self::join), but re-raises failure instead of
    /// returning it: a failed task's panic payload resumes in the caller,
    /// and a cancelled result raises the uncatchable *cancelled* fatal.
    #[must_use = "futures do nothing unless awaited"]
    pub fn join_exn(self) -> JoinExn<T> {
        let id = self.id();
        JoinExn {
            inner: self.join(),
            id,
        }
    }

    /// Requests cancellation of the task and its whole subtree.
    ///
    /// Asynchronous: completion of this future does not mean the target
    /// has stopped, only that the request is on its way. Await the promise
    /// afterwards to observe the drained, cancelled state.
    #[must_use = "futures do nothing unless awaited"]
    pub fn cancel(&self) -> CancelOp {
        CancelOp {
            state: Arc::clone(self.state()),
            requested: false,
        }
    }
}

/// Future returned by [`Promise::join`].
pub struct Join<T> {
    promise: Option<Promise<T>>,
    verified: bool,
}

enum JoinStep {
    Yield,
    Park,
    Take,
}

impl<T> Future for Join<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let step = domain::with_ctx(|c| {
            let caller = c.current_task_id();
            let state = this
                .promise
                .as_ref()
                .expect("join polled after completion")
                .state();
            if !this.verified {
                if state.parent != Some(caller) {
                    Fatal::NotAChild {
                        caller,
                        target: state.id,
                    }
                    .raise();
                }
                this.verified = true;
            }
            if let Charge::Yield = c.charge(cx) {
                return JoinStep::Yield;
            }
            if state.is_terminal() {
                c.release_child(caller.uid, state.id);
                JoinStep::Take
            } else {
                JoinStep::Park
            }
        });
        match step {
            JoinStep::Yield => Poll::Pending,
            JoinStep::Park => {
                this.promise
                    .as_ref()
                    .expect("join polled after completion")
                    .state()
                    .add_waiter(cx.waker());
                Poll::Pending
            }
            JoinStep::Take => {
                let promise = this.promise.take().expect("join polled after completion");
                Poll::Ready(promise.take_result())
            }
        }
    }
}

/// Future returned by [`Promise::join_exn`].
pub struct JoinExn<T> {
    inner: Join<T>,
    id: TaskId,
}

impl<T> Future for JoinExn<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(TaskError::Failed(payload))) => resume_unwind(payload),
            Poll::Ready(Err(TaskError::Cancelled)) => {
                Fatal::Cancelled { target: this.id }.raise()
            }
        }
    }
}

/// Future returned by [`Promise::cancel`].
pub struct CancelOp {
    state: Arc<PromiseState>,
    requested: bool,
}

impl Future for CancelOp {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.requested {
            return Poll::Ready(());
        }
        let sent = domain::with_ctx(|c| {
            let caller = c.current_task_id();
            if this.state.parent != Some(caller) {
                Fatal::NotAChild {
                    caller,
                    target: this.state.id,
                }
                .raise();
            }
            if let Charge::Yield = c.charge(cx) {
                return false;
            }
            c.release_child(caller.uid, this.state.id);
            this.state.request_cancel();
            c.pool()
                .domain(this.state.id.domain)
                .post(Message::Cancel(Arc::clone(&this.state)));
            true
        });
        if sent {
            // One forced reschedule so the request is processed promptly on
            // the local domain before the caller continues.
            this.requested = true;
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

/// Awaits every promise and returns the results positionally.
///
/// A cancelled result is re-raised as the uncatchable *cancelled* fatal;
/// ordinary failures are delivered in place.
pub async fn join_all<T>(promises: Vec<Promise<T>>) -> Vec<Result<T, TaskError>> {
    let mut results = Vec::with_capacity(promises.len());
    for promise in promises {
        let id = promise.id();
        match promise.join().await {
            Err(TaskError::Cancelled) => Fatal::Cancelled { target: id }.raise(),
            outcome => results.push(outcome),
        }
    }
    results
}

/// Awaits two promises as a pair.
pub async fn both<A, B>(
    left: Promise<A>,
    right: Promise<B>,
) -> (Result<A, TaskError>, Result<B, TaskError>) {
    let left = left.join().await;
    let right = right.join().await;
    (left, right)
}

/// Returns the first settled result and cancels the rest.
///
/// When several promises settle within the same tick the list is scanned
/// in order and the earliest resolved entry wins over any failed or
/// cancelled one, which makes the choice reproducible. Every loser is
/// cancelled and fully drained before this returns.
///
/// # Panics
///
/// Panics on an empty list.
#[must_use = "futures do nothing unless awaited"]
pub fn join_first<T>(promises: Vec<Promise<T>>) -> JoinFirst<T> {
    assert!(!promises.is_empty(), "attent: join_first on an empty list");
    JoinFirst {
        items: promises.into_iter().map(Some).collect(),
        verified: false,
        winner: None,
    }
}

/// Future returned by [`join_first`].
pub struct JoinFirst<T> {
    items: Vec<Option<Promise<T>>>,
    verified: bool,
    winner: Option<Result<T, TaskError>>,
}

impl<T> Unpin for JoinFirst<T> {}

enum FirstStep {
    Yield,
    Park,
    Settle(usize),
    Drain,
    Done,
}

/// Deterministic pick among settled entries: earliest resolved, else
/// earliest settled of any kind.
fn pick_settled<T>(items: &[Option<Promise<T>>]) -> Option<usize> {
    let mut pick = None;
    for (index, item) in items.iter().enumerate() {
        let Some(promise) = item else { continue };
        if promise.state().is_terminal() {
            if promise.state().phase() == Phase::Resolved {
                return Some(index);
            }
            if pick.is_none() {
                pick = Some(index);
            }
        }
    }
    pick
}

impl<T> Future for JoinFirst<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let step = domain::with_ctx(|c| {
            let caller = c.current_task_id();
            if !this.verified {
                for item in this.items.iter().flatten() {
                    if item.state().parent != Some(caller) {
                        Fatal::NotAChild {
                            caller,
                            target: item.id(),
                        }
                        .raise();
                    }
                }
                this.verified = true;
            }
            if let Charge::Yield = c.charge(cx) {
                return FirstStep::Yield;
            }
            if this.winner.is_none() {
                let Some(pick) = pick_settled(&this.items) else {
                    return FirstStep::Park;
                };
                for (index, item) in this.items.iter().enumerate() {
                    if index == pick {
                        continue;
                    }
                    if let Some(loser) = item {
                        c.release_child(caller.uid, loser.id());
                        loser.state().request_cancel();
                        c.pool()
                            .domain(loser.domain())
                            .post(Message::Cancel(Arc::clone(loser.state())));
                    }
                }
                let winner_id = this.items[pick]
                    .as_ref()
                    .expect("picked entry present")
                    .id();
                c.release_child(caller.uid, winner_id);
                return FirstStep::Settle(pick);
            }
            if this
                .items
                .iter()
                .flatten()
                .all(|loser| loser.state().is_terminal())
            {
                FirstStep::Done
            } else {
                FirstStep::Drain
            }
        });
        match step {
            FirstStep::Yield => Poll::Pending,
            FirstStep::Park | FirstStep::Drain => {
                for item in this.items.iter().flatten() {
                    item.state().add_waiter(cx.waker());
                }
                Poll::Pending
            }
            FirstStep::Settle(pick) => {
                let winner = this.items[pick].take().expect("picked entry present");
                this.winner = Some(winner.take_result());
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            FirstStep::Done => Poll::Ready(this.winner.take().expect("winner recorded")),
        }
    }
}

/// Returns the first settled result without touching the rest.
///
/// The remaining promises come back alongside the result; the caller is
/// still responsible for awaiting or cancelling every one of them.
///
/// # Panics
///
/// Panics on an empty list.
#[must_use = "futures do nothing unless awaited"]
pub fn join_one<T>(promises: Vec<Promise<T>>) -> JoinOne<T> {
    assert!(!promises.is_empty(), "attent: join_one on an empty list");
    JoinOne {
        items: promises.into_iter().map(Some).collect(),
        verified: false,
    }
}

/// Future returned by [`join_one`].
pub struct JoinOne<T> {
    items: Vec<Option<Promise<T>>>,
    verified: bool,
}

impl<T> Future for JoinOne<T> {
    type Output = (Result<T, TaskError>, Vec<Promise<T>>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let pick = domain::with_ctx(|c| {
            let caller = c.current_task_id();
            if !this.verified {
                for item in this.items.iter().flatten() {
                    if item.state().parent != Some(caller) {
                        Fatal::NotAChild {
                            caller,
                            target: item.id(),
                        }
                        .raise();
                    }
                }
                this.verified = true;
            }
            if let Charge::Yield = c.charge(cx) {
                return None;
            }
            let pick = pick_settled(&this.items);
            if let Some(index) = pick {
                let id = this.items[index].as_ref().expect("picked entry present").id();
                c.release_child(caller.uid, id);
            }
            pick
        });
        match pick {
            Some(index) => {
                let winner = this.items[index].take().expect("picked entry present");
                let rest: Vec<Promise<T>> = this.items.drain(..).flatten().collect();
                Poll::Ready((winner.take_result(), rest))
            }
            None => {
                for item in this.items.iter().flatten() {
                    item.state().add_waiter(cx.waker());
                }
                Poll::Pending
            }
        }
    }
}

/// Yields to the tail of the ready queue, letting peers run.
#[must_use = "futures do nothing unless awaited"]
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            domain::with_ctx(|c| {
                let _ = c.current_task_id();
                if let Charge::Go = c.charge(cx) {
                    cx.waker().wake_by_ref();
                }
            });
            self.yielded = true;
            Poll::Pending
        }
    }
}

/// Explicit fork-join over worker domains.
///
/// The items are split into `ceil(N / workers)`-sized runs assigned to
/// workers in index order; domain 0 never receives a share. Results come
/// back positionally. Raises *no-domain-available* when no worker exists.
pub async fn parallel<I, T, F, Fut>(f: F, items: Vec<I>) -> Vec<Result<T, TaskError>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = domain::with_ctx(|c| c.pool().workers().len());
    if workers == 0 {
        Fatal::NoDomainAvailable.raise();
    }
    let chunk = items.len().div_ceil(workers);
    let mut promises = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        promises.push(spawn_pinned(index / chunk, f(item)).await);
    }
    let mut results = Vec::with_capacity(promises.len());
    for promise in promises {
        results.push(promise.join().await);
    }
    results
}

impl<T: Send + 'static> Orphans<T> {
    /// Spawns a background task on the current domain, parking its promise
    /// in this collector.
    #[must_use = "futures do nothing unless awaited"]
    pub fn spawn_local<F>(&self, task: F) -> OrphanSpawn<'_, T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        OrphanSpawn {
            inner: spawn_local(task),
            orphans: self,
        }
    }

    /// Spawns a background task on a worker domain, parking its promise in
    /// this collector.
    #[must_use = "futures do nothing unless awaited"]
    pub fn spawn<F>(&self, task: F) -> OrphanSpawn<'_, T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        OrphanSpawn {
            inner: spawn(task),
            orphans: self,
        }
    }
}

/// Future returned by the [`Orphans`] spawn methods.
pub struct OrphanSpawn<'a, T> {
    inner: Spawn<T>,
    orphans: &'a Orphans<T>,
}

impl<T: Send + 'static> Future for OrphanSpawn<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(promise) => {
                this.orphans.attach(promise);
                Poll::Ready(())
            }
        }
    }
}

/// Identity of the currently running task.
///
/// # Panics
///
/// Panics outside of a task.
#[must_use]
pub fn task_id() -> TaskId {
    domain::with_ctx(|c| c.current_task_id())
}

/// Identity of the current domain.
///
/// # Panics
///
/// Panics outside of a scheduler domain.
#[must_use]
pub fn domain_id() -> DomainId {
    domain::with_ctx(|c| c.domain_id())
}

/// A point-in-time snapshot of the current domain's load.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    /// The domain the snapshot was taken on.
    pub domain: DomainId,
    /// Tasks with live records on this domain, settling included.
    pub live_tasks: usize,
    /// Tasks queued to run.
    pub ready: usize,
    /// Parked suspension points.
    pub suspended: usize,
    /// Children of the current task, when called from one.
    pub children: usize,
    /// Ledger entries of the current task, when called from one.
    pub resources: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} tasks ({} ready, {} suspended), {} children, {} resources",
            self.domain,
            self.live_tasks,
            self.ready,
            self.suspended,
            self.children,
            self.resources
        )
    }
}

/// Snapshots the current domain's load.
///
/// # Panics
///
/// Panics outside of a scheduler domain.
#[must_use]
pub fn stats() -> Stats {
    domain::with_ctx(|c| {
        let (children, resources) = c.current_task_shape().unwrap_or((0, 0));
        Stats {
            domain: c.domain_id(),
            live_tasks: c.task_count(),
            ready: c.ready_len(),
            suspended: c.suspended_len(),
            children,
            resources,
        }
    })
}
