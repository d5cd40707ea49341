//! End-to-end coverage of the cancellation engine: retroactive wins,
//! subtree propagation, cross-domain requests, and race losers.

mod common;

use attent::{Config, Fatal, TaskError};
use common::{init_logging, run_expect_fatal};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn cancellation_wins_over_a_prior_resolve() {
    init_logging();
    let (ran, outcome) = Config::new().domains(0).run(async {
        let ran = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&ran);
        let p = attent::spawn_local(async move {
            seen.store(true, Ordering::SeqCst);
        })
        .await;
        attent::yield_now().await; // p resolves here
        p.cancel().await;
        let outcome = p.join().await;
        (ran.load(Ordering::SeqCst), outcome)
    });
    assert!(ran, "the body had already run");
    assert!(matches!(outcome, Err(TaskError::Cancelled)));
}

#[test]
fn cancel_reaches_grandchildren_and_their_finalisers() {
    init_logging();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    Config::new().domains(0).run(async move {
        let inner = Arc::clone(&counter);
        let child = attent::spawn_local(async move {
            let grandchild = attent::spawn_local(async move {
                let guard = attent::own(move || {
                    inner.fetch_add(1, Ordering::SeqCst);
                });
                attent::suspend(attent::make(|| ())).await;
                attent::disown(&guard);
            })
            .await;
            grandchild.join().await.expect("discarded by cancellation");
        })
        .await;
        for _ in 0..4 {
            attent::yield_now().await;
        }
        child.cancel().await;
        let outcome = child.join().await;
        assert!(matches!(outcome, Err(TaskError::Cancelled)));
    });
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_crosses_domains() {
    init_logging();
    let outcome = Config::new().domains(1).run(async {
        let sleeper = attent::spawn(async {
            attent::suspend(attent::make(|| ())).await;
        })
        .await;
        attent::yield_now().await;
        sleeper.cancel().await;
        sleeper.join().await
    });
    assert!(matches!(outcome, Err(TaskError::Cancelled)));
}

#[test]
fn join_first_prefers_resolved_and_drains_losers() {
    init_logging();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let winner = Config::new().domains(0).run(async move {
        let inner = Arc::clone(&counter);
        let slow = attent::spawn_local(async move {
            let guard = attent::own(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            });
            attent::suspend(attent::make(|| ())).await;
            attent::disown(&guard);
            "slow"
        })
        .await;
        let fast = attent::spawn_local(async {
            attent::yield_now().await;
            "fast"
        })
        .await;
        // The slow task comes first in the list; the resolved one wins.
        attent::join_first(vec![slow, fast]).await
    });
    assert_eq!(winner.expect("winner"), "fast");
    assert_eq!(
        finalized.load(Ordering::SeqCst),
        1,
        "the loser was drained before control returned"
    );
}

#[test]
fn failed_task_cancels_its_children() {
    init_logging();
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let outcome = Config::new().domains(0).run(async move {
        let inner = Arc::clone(&counter);
        let child = attent::spawn_local(async move {
            let _grandchild = attent::spawn_local(async move {
                let guard = attent::own(move || {
                    inner.fetch_add(1, Ordering::SeqCst);
                });
                attent::suspend(attent::make(|| ())).await;
                attent::disown(&guard);
            })
            .await;
            attent::yield_now().await;
            panic!("child blew up");
        })
        .await;
        child.join().await
    });
    match outcome {
        Err(err) => assert_eq!(err.panic_message(), Some("child blew up")),
        Ok(()) => panic!("child must fail"),
    }
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn join_all_reraises_cancellation_as_fatal() {
    init_logging();
    let fatal = run_expect_fatal(Config::new().domains(0), async {
        let p = attent::spawn_local(async {}).await;
        attent::yield_now().await;
        p.cancel().await;
        let _ = attent::join_all(vec![p]).await;
    });
    assert!(matches!(fatal, Fatal::Cancelled { .. }), "got {fatal}");
}

#[test]
fn join_exn_resumes_the_original_panic() {
    init_logging();
    let payload = catch_unwind(AssertUnwindSafe(|| {
        Config::new().domains(0).run(async {
            let p = attent::spawn_local(async {
                panic!("original payload");
            })
            .await;
            p.join_exn().await
        })
    }))
    .expect_err("root must fail");
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .expect("panic payload is a str");
    assert_eq!(message, "original payload");
}
