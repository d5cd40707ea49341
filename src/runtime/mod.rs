//! Domain pool and the top-level driver.
//!
//! [`run`] (or [`Config::run`]) brings up one worker thread per worker
//! domain, executes the root task on the calling thread as domain 0, loops
//! until the root promise settles, then tears the pool down and returns
//! the root's value. Structural fatals recorded by any domain re-raise
//! here, after the pool has been stopped.

pub(crate) mod domain;
pub(crate) mod mailbox;

use crate::events::{Events, EventsFactory, ParkEvents};
use crate::promise::{self, Phase, PromiseState, Slot};
use crate::runtime::domain::{DomainCtx, Role};
use crate::runtime::mailbox::DomainShared;
use crate::types::{DomainId, TaskId};
use crate::util::DetRng;
use core::fmt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::debug;

/// Shared state of one scheduler pool.
pub(crate) struct PoolShared {
    domains: Vec<Arc<DomainShared>>,
    rr: AtomicUsize,
    shutdown: AtomicBool,
    failure: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PoolShared {
    fn new(count: usize, rr_start: usize) -> Arc<Self> {
        let domains = (0..count)
            .map(|index| DomainShared::new(DomainId(index as u32)))
            .collect();
        Arc::new(Self {
            domains,
            rr: AtomicUsize::new(rr_start),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    pub(crate) fn main_domain(&self) -> &Arc<DomainShared> {
        &self.domains[0]
    }

    /// Every domain except domain 0.
    pub(crate) fn workers(&self) -> &[Arc<DomainShared>] {
        &self.domains[1..]
    }

    pub(crate) fn domain(&self, id: DomainId) -> &Arc<DomainShared> {
        &self.domains[id.0 as usize]
    }

    /// Advances the round-robin dispatch cursor.
    pub(crate) fn next_rr(&self) -> usize {
        self.rr.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn interrupt_all(&self) {
        for domain in &self.domains {
            domain.interrupt();
        }
    }

    /// Records the first failure and stops the pool.
    pub(crate) fn fail(&self, payload: Box<dyn Any + Send>) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(payload);
            }
        }
        self.set_shutdown();
        self.interrupt_all();
    }

    pub(crate) fn failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    fn take_failure(&self) -> Option<Box<dyn Any + Send>> {
        self.failure.lock().take()
    }
}

impl fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolShared")
            .field("domains", &self.domains.len())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
}

fn seed_from_entropy() -> u64 {
    getrandom::u64().unwrap_or(0x4d59_5df4_d0f3_3173)
}

/// Scheduler configuration, builder style.
///
/// ```no_run
/// let value = attent::Config::new()
///     .quanta(4)
///     .domains(2)
///     .run(async { 40 + 2 });
/// assert_eq!(value, 42);
/// ```
pub struct Config {
    quanta: u32,
    domains: Option<usize>,
    seed: Option<u64>,
    events: Option<EventsFactory>,
}

impl Config {
    /// Starts from the defaults: quantum of 2 slices, one worker domain
    /// per spare hardware thread, entropy-derived seed, parker provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            quanta: 2,
            domains: None,
            seed: None,
            events: None,
        }
    }

    /// Scheduling slices a task may consume before a forced yield.
    /// Clamped to at least 1.
    #[must_use]
    pub fn quanta(mut self, quanta: u32) -> Self {
        self.quanta = quanta.max(1);
        self
    }

    /// Number of worker domains. Zero is legal; parallel spawns then fail
    /// with *no-domain-available*.
    #[must_use]
    pub fn domains(mut self, workers: usize) -> Self {
        self.domains = Some(workers);
        self
    }

    /// Seed for deterministic scheduling choices.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Events-provider factory, invoked once per domain with its id.
    #[must_use]
    pub fn events(
        mut self,
        factory: impl Fn(DomainId) -> Box<dyn Events> + Send + Sync + 'static,
    ) -> Self {
        self.events = Some(Arc::new(factory));
        self
    }

    /// Runs the scheduler to completion with `task` as the root.
    ///
    /// Returns the root's value. A root failure re-raises the original
    /// panic; a structural fatal re-raises as a [`Fatal`](crate::Fatal)
    /// payload.
    pub fn run<T, F>(self, task: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let quanta = self.quanta.max(1);
        let workers = self.domains.unwrap_or_else(default_worker_count);
        let mut rng = DetRng::new(self.seed.unwrap_or_else(seed_from_entropy));
        let factory: EventsFactory = self
            .events
            .unwrap_or_else(|| Arc::new(|_| Box::new(ParkEvents::new()) as Box<dyn Events>));
        let rr_start = if workers > 0 { rng.next_usize(workers) } else { 0 };
        let pool = PoolShared::new(workers + 1, rr_start);
        debug!(workers, quanta, "pool start");

        let handles: Vec<thread::JoinHandle<()>> = pool
            .workers()
            .iter()
            .map(|shared| {
                let shared = Arc::clone(shared);
                let pool = Arc::clone(&pool);
                let factory = Arc::clone(&factory);
                thread::Builder::new()
                    .name(format!("attent-d{}", shared.id.index()))
                    .spawn(move || {
                        let mut events = factory(shared.id);
                        shared.set_hook(events.interrupt_hook());
                        let _guard = domain::install(DomainCtx::new(
                            Arc::clone(&shared),
                            Arc::clone(&pool),
                            quanta,
                        ));
                        let looped = catch_unwind(AssertUnwindSafe(|| {
                            domain::event_loop(events.as_mut(), &Role::Worker)
                        }));
                        if let Err(payload) = looped {
                            pool.fail(payload);
                        }
                    })
                    .expect("attent: failed to spawn a domain thread")
            })
            .collect();

        let main = Arc::clone(pool.main_domain());
        let mut events = factory(DomainId::MAIN);
        main.set_hook(events.interrupt_hook());
        let root_id = TaskId::new(DomainId::MAIN, main.next_task_uid());
        let root_state = PromiseState::new(root_id, None, None);
        let (slot, wrapped) = promise::completion(task);
        let looped = {
            let _guard = domain::install(DomainCtx::new(
                Arc::clone(&main),
                Arc::clone(&pool),
                quanta,
            ));
            domain::with_ctx(|c| c.spawn_ready(Arc::clone(&root_state), wrapped, Vec::new()));
            let role = Role::Main {
                root: Arc::clone(&root_state),
            };
            catch_unwind(AssertUnwindSafe(|| {
                domain::event_loop(events.as_mut(), &role)
            }))
        };

        if let Err(payload) = looped {
            // Recording the failure lets workers with live tasks break out
            // of their loops instead of waiting for a quiescence that will
            // never come.
            pool.fail(payload);
        }
        pool.set_shutdown();
        pool.interrupt_all();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("pool stop");
        if let Some(payload) = pool.take_failure() {
            resume_unwind(payload);
        }
        match root_state.phase() {
            Phase::Resolved => match std::mem::replace(&mut *slot.lock(), Slot::Empty) {
                Slot::Value(value) => value,
                Slot::Empty => panic!("attent: root task resolved without a value"),
            },
            Phase::Failed => {
                let payload = root_state
                    .take_failure()
                    .unwrap_or_else(|| Box::new("root task failed"));
                resume_unwind(payload)
            }
            Phase::Pending | Phase::Cancelled => panic!("attent: root task did not settle"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("quanta", &self.quanta)
            .field("domains", &self.domains)
            .field("seed", &self.seed)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// Runs a root task under the default configuration.
pub fn run<T, F>(task: F) -> T
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Config::new().run(task)
}
