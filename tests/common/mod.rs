//! Shared helpers for the end-to-end suites: logging init, fatal
//! extraction, and purpose-built events providers (timer, counting,
//! release-all).
#![allow(dead_code)]

use attent::{Config, DomainId, Events, Fatal, InterruptHook, ParkEvents, Resume, SyscallUid};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Runs the configuration expecting a structural fatal, and returns it.
pub fn run_expect_fatal<T, F>(config: Config, task: F) -> Fatal
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let payload = catch_unwind(AssertUnwindSafe(move || {
        let _ = config.run(task);
    }))
    .expect_err("expected a fatal");
    match payload.downcast::<Fatal>() {
        Ok(fatal) => *fatal,
        Err(other) => panic!("expected a Fatal payload, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Timer provider: releases suspensions when their registered deadline passes.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TimerShared {
    deadlines: Mutex<Vec<(Instant, SyscallUid)>>,
    permit: Mutex<bool>,
    cond: Condvar,
}

impl TimerShared {
    fn take_due(&self, pending: &[SyscallUid]) -> Vec<Resume> {
        let now = Instant::now();
        let mut deadlines = self.deadlines.lock();
        let mut due = Vec::new();
        deadlines.retain(|(at, uid)| {
            if *at > now {
                return true;
            }
            if pending.contains(uid) {
                due.push(Resume::new(*uid, || ()));
            }
            // A due entry with no matching suspension was cancelled.
            false
        });
        due
    }

    fn next_deadline(&self, pending: &[SyscallUid]) -> Option<Instant> {
        self.deadlines
            .lock()
            .iter()
            .filter(|(_, uid)| pending.contains(uid))
            .map(|(at, _)| *at)
            .min()
    }
}

pub struct TimerEvents {
    shared: Arc<TimerShared>,
}

impl Events for TimerEvents {
    fn select(&mut self, block: bool, pending: &[SyscallUid]) -> Vec<Resume> {
        let due = self.shared.take_due(pending);
        if !due.is_empty() || !block {
            return due;
        }
        let next = self.shared.next_deadline(pending);
        {
            let mut permit = self.shared.permit.lock();
            if !*permit {
                match next {
                    Some(at) => {
                        let now = Instant::now();
                        if at > now {
                            let _ = self.shared.cond.wait_for(&mut permit, at - now);
                        }
                    }
                    None => self.shared.cond.wait(&mut permit),
                }
            }
            *permit = false;
        }
        self.shared.take_due(pending)
    }

    fn interrupt_hook(&self) -> InterruptHook {
        let shared = Arc::clone(&self.shared);
        InterruptHook::new(move || {
            let mut permit = shared.permit.lock();
            *permit = true;
            shared.cond.notify_one();
        })
    }
}

thread_local! {
    static TIMER: RefCell<Option<Arc<TimerShared>>> = const { RefCell::new(None) };
}

/// Factory installing one timer provider per domain.
pub fn timer_events() -> impl Fn(DomainId) -> Box<dyn Events> + Send + Sync + 'static {
    |_id| {
        let shared = Arc::new(TimerShared::default());
        TIMER.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&shared)));
        Box::new(TimerEvents { shared })
    }
}

/// Parks the current task until the duration elapses, through the timer
/// provider of the current domain.
pub async fn sleep(duration: Duration) {
    let syscall = attent::make(|| ());
    let shared = TIMER
        .with(|slot| slot.borrow().clone())
        .expect("timer provider installed on this domain");
    shared
        .deadlines
        .lock()
        .push((Instant::now() + duration, syscall.uid()));
    attent::suspend(syscall).await;
}

// ---------------------------------------------------------------------------
// Counting provider: delegates to a parker, counts select calls.
// ---------------------------------------------------------------------------

pub struct CountingEvents {
    inner: ParkEvents,
    selects: Arc<AtomicUsize>,
}

impl Events for CountingEvents {
    fn select(&mut self, block: bool, pending: &[SyscallUid]) -> Vec<Resume> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        self.inner.select(block, pending)
    }

    fn interrupt_hook(&self) -> InterruptHook {
        self.inner.interrupt_hook()
    }
}

pub fn counting_events(
    selects: Arc<AtomicUsize>,
) -> impl Fn(DomainId) -> Box<dyn Events> + Send + Sync + 'static {
    move |_id| {
        Box::new(CountingEvents {
            inner: ParkEvents::new(),
            selects: Arc::clone(&selects),
        })
    }
}

// ---------------------------------------------------------------------------
// Release-all provider: frees every pending suspension on sight, with a
// configurable pre-function.
// ---------------------------------------------------------------------------

type PreFactory = Arc<dyn Fn(SyscallUid) -> Box<dyn FnOnce() + Send> + Send + Sync>;

pub struct ReleaseAllEvents {
    inner: ParkEvents,
    pre: PreFactory,
    probe: bool,
}

impl Events for ReleaseAllEvents {
    fn select(&mut self, block: bool, pending: &[SyscallUid]) -> Vec<Resume> {
        if pending.is_empty() {
            return self.inner.select(block, pending);
        }
        pending
            .iter()
            .map(|uid| {
                if self.probe {
                    assert!(attent::is_pending(*uid), "pending id must probe true");
                }
                Resume::new(*uid, (self.pre)(*uid))
            })
            .collect()
    }

    fn interrupt_hook(&self) -> InterruptHook {
        self.inner.interrupt_hook()
    }
}

pub fn release_all_events(
    probe: bool,
    pre: impl Fn(SyscallUid) -> Box<dyn FnOnce() + Send> + Send + Sync + 'static,
) -> impl Fn(DomainId) -> Box<dyn Events> + Send + Sync + 'static {
    let pre: PreFactory = Arc::new(pre);
    move |_id| {
        Box::new(ReleaseAllEvents {
            inner: ParkEvents::new(),
            pre: Arc::clone(&pre),
            probe,
        })
    }
}
