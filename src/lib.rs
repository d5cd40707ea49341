//! Attent: availability-first cooperative scheduler with structured
//! ownership of tasks.
//!
//! # Overview
//!
//! Attent runs concurrent tasks across parallel domains (one OS thread
//! each) while staying responsive to external events: every core operation
//! is a scheduling point, and after each one the executor drains the
//! domain's events provider before running anything else. Availability is
//! chosen over raw throughput by design.
//!
//! Concurrency is structured. Every task is owned by the task that created
//! it and must be awaited or cancelled; a task that forgets a child dies
//! with an uncatchable *still-has-children* fatal. Cancellation reaches the
//! whole subtree, across domains, and runs registered finalisers before a
//! cancelled task is observed terminal.
//!
//! # Core guarantees
//!
//! - **No orphan tasks**: a promise is awaited or cancelled by its creator,
//!   or the creator's termination is fatal
//! - **Cancellation drains**: a cancelled promise is only observed terminal
//!   once every descendant has settled and every held finaliser has run
//! - **Events before progress**: between any scheduling point and the next
//!   task pop, the domain's `select` has been called
//! - **Domain locality**: task records, ledgers, and suspension tables are
//!   touched only by their owning domain; cross-domain traffic is message
//!   passing plus an interrupt hook
//!
//! # Example
//!
//! ```
//! let total = attent::run(async {
//!     let child = attent::spawn_local(async { 21 * 2 }).await;
//!     child.join().await.expect("child resolved")
//! });
//! assert_eq!(total, 42);
//! ```
//!
//! # Module structure
//!
//! - [`types`]: identifier types
//! - [`error`](mod@error): task outcomes and structural fatals
//! - [`promise`]: promise lifecycle and result slots
//! - [`ledger`]: owned resources and finalisers
//! - [`orphans`]: background-task collector
//! - [`syscall`]: user-defined suspension points
//! - [`events`]: the provider seam (`select` + interrupt)
//! - [`runtime`]: domain pool, quantum executor, driver
//! - [`util`]: deterministic RNG

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod events;
pub mod ledger;
mod ops;
pub mod orphans;
pub mod promise;
pub mod runtime;
pub mod syscall;
pub mod types;
pub mod util;

pub use error::{Fatal, TaskError};
pub use events::{Events, EventsFactory, InterruptHook, ParkEvents, Resume};
pub use ledger::{Resource, check, disown, own, transfer};
pub use ops::{
    CancelOp, Join, JoinExn, JoinFirst, JoinOne, OrphanSpawn, Spawn, Stats, YieldNow, both,
    domain_id, join_all, join_first, join_one, parallel, spawn, spawn_give, spawn_local,
    spawn_local_give, stats, task_id, yield_now,
};
pub use orphans::{Care, Orphans};
pub use promise::Promise;
pub use runtime::{Config, run};
pub use syscall::{Suspend, Syscall, is_pending, make, suspend};
pub use types::{DomainId, ResourceUid, SyscallUid, TaskId, TaskUid};
