//! End-to-end coverage of the structured-concurrency discipline: spawn
//! order, ownership rules, quantum enforcement, and the orphan collector.

mod common;

use attent::{Care, Config, Fatal, Orphans};
use common::{init_logging, run_expect_fatal};
use parking_lot::Mutex;
use std::sync::Arc;

#[test]
fn root_value_comes_back() {
    init_logging();
    let value = attent::run(async { 42 });
    assert_eq!(value, 42);
}

#[test]
fn spawn_local_and_join() {
    init_logging();
    let value = Config::new().domains(0).run(async {
        let child = attent::spawn_local(async { 6 * 7 }).await;
        child.join().await.expect("child resolved")
    });
    assert_eq!(value, 42);
}

#[test]
fn children_run_in_spawn_order() {
    init_logging();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    Config::new().domains(0).run(async move {
        let a_log = Arc::clone(&seen);
        let b_log = Arc::clone(&seen);
        let a = attent::spawn_local(async move { a_log.lock().push("a") }).await;
        let b = attent::spawn_local(async move { b_log.lock().push("b") }).await;
        a.join().await.expect("a");
        b.join().await.expect("b");
    });
    assert_eq!(*order.lock(), vec!["a", "b"]);
}

#[test]
fn exhausted_quantum_forces_a_yield() {
    init_logging();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    Config::new().domains(0).quanta(1).run(async move {
        let a_log = Arc::clone(&seen);
        seen.lock().push("root1");
        let a = attent::spawn_local(async move { a_log.lock().push("a") }).await;
        seen.lock().push("root2");
        // The quantum is spent; this spawn yields first, letting `a` run.
        let b = attent::spawn_local(async {}).await;
        seen.lock().push("root3");
        a.join().await.expect("a");
        b.join().await.expect("b");
    });
    let order = order.lock();
    let a_at = order.iter().position(|s| *s == "a").expect("a ran");
    let root3_at = order.iter().position(|s| *s == "root3").expect("root3");
    assert!(a_at < root3_at, "forced yield should run the child first: {order:?}");
}

#[test]
fn generous_quantum_keeps_the_parent_running() {
    init_logging();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    Config::new().domains(0).quanta(16).run(async move {
        let a_log = Arc::clone(&seen);
        let a = attent::spawn_local(async move { a_log.lock().push("a") }).await;
        seen.lock().push("root-continued");
        a.join().await.expect("a");
    });
    let order = order.lock();
    let a_at = order.iter().position(|s| *s == "a").expect("a ran");
    let cont_at = order.iter().position(|s| *s == "root-continued").expect("root");
    assert!(cont_at < a_at, "parent continues until its next yield: {order:?}");
}

#[test]
fn forgotten_child_is_fatal() {
    init_logging();
    let fatal = run_expect_fatal(Config::new().domains(0), async {
        let _forgotten = attent::spawn_local(async {}).await;
        // Terminating without awaiting or cancelling the child.
    });
    assert!(
        matches!(fatal, Fatal::StillHasChildren { .. }),
        "got {fatal}"
    );
}

#[test]
fn awaiting_a_foreign_promise_is_fatal() {
    init_logging();
    let fatal = run_expect_fatal(Config::new().domains(0), async {
        let p = attent::spawn_local(async { 1 }).await;
        let q = attent::spawn_local(async move {
            // `p` was created by the root, not by this task.
            let _ = p.join().await;
        })
        .await;
        q.join().await.expect("q");
    });
    assert!(matches!(fatal, Fatal::NotAChild { .. }), "got {fatal}");
}

#[test]
fn both_is_the_pair_of_awaits() {
    init_logging();
    let (left, right) = Config::new().domains(0).run(async {
        let p = attent::spawn_local(async { "left" }).await;
        let q = attent::spawn_local(async { "right" }).await;
        attent::both(p, q).await
    });
    assert_eq!(left.expect("left"), "left");
    assert_eq!(right.expect("right"), "right");
}

#[test]
fn join_all_returns_positionally() {
    init_logging();
    let values = Config::new().domains(0).run(async {
        let mut promises = Vec::new();
        for n in 0..4_u32 {
            promises.push(attent::spawn_local(async move { n * 10 }).await);
        }
        attent::join_all(promises).await
    });
    let values: Vec<u32> = values.into_iter().map(|r| r.expect("resolved")).collect();
    assert_eq!(values, vec![0, 10, 20, 30]);
}

#[test]
fn join_one_leaves_the_rest_owned() {
    init_logging();
    let (first, rest_count) = Config::new().domains(0).run(async {
        let quick = attent::spawn_local(async { "quick" }).await;
        let slow = attent::spawn_local(async {
            for _ in 0..8 {
                attent::yield_now().await;
            }
            "slow"
        })
        .await;
        let (first, rest) = attent::join_one(vec![quick, slow]).await;
        let rest_count = rest.len();
        // Still our children; drain them properly.
        for leftover in rest {
            leftover.join().await.expect("leftover");
        }
        (first.expect("first"), rest_count)
    });
    assert_eq!(first, "quick");
    assert_eq!(rest_count, 1);
}

#[test]
fn orphans_care_retrieves_everything() {
    init_logging();
    let collected = Config::new().domains(0).run(async {
        let orphans = Orphans::new();
        for n in 0..3_u32 {
            orphans.spawn_local(async move { n }).await;
        }
        let mut collected = Vec::new();
        loop {
            match orphans.care() {
                Care::Ready(promise) => collected.push(promise.join().await.expect("orphan")),
                Care::Pending => attent::yield_now().await,
                Care::Empty => break,
            }
        }
        collected.sort_unstable();
        collected
    });
    assert_eq!(collected, vec![0, 1, 2]);
}

#[test]
fn abandoned_collector_is_fatal() {
    init_logging();
    let fatal = run_expect_fatal(Config::new().domains(0), async {
        let orphans = Orphans::new();
        orphans.spawn_local(async { 7 }).await;
        drop(orphans);
        // The background task was never retrieved nor cancelled.
    });
    assert!(
        matches!(fatal, Fatal::StillHasChildren { .. }),
        "got {fatal}"
    );
}

#[test]
fn identity_and_stats_are_visible_from_tasks() {
    init_logging();
    let (domain, same_task, child_count) = Config::new().domains(0).run(async {
        let me = attent::task_id();
        let child = attent::spawn_local(async {}).await;
        let snapshot = attent::stats();
        let child_count = snapshot.children;
        child.join().await.expect("child");
        (attent::domain_id(), me == attent::task_id(), child_count)
    });
    assert!(domain.is_main());
    assert!(same_task);
    assert_eq!(child_count, 1);
}
