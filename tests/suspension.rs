//! End-to-end coverage of user-defined suspension points and the event
//! bridge: release ordering, discontinuation, per-domain uid scoping, and
//! the select-before-next-pop cadence.

mod common;

use attent::{Config, SyscallUid};
use common::{counting_events, init_logging, release_all_events};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn suspend_returns_the_callback_value() {
    init_logging();
    let value = Config::new()
        .domains(0)
        .events(release_all_events(false, |_| Box::new(|| ())))
        .run(async {
            let syscall = attent::make(|| 7_u32);
            attent::suspend(syscall).await
        });
    assert_eq!(value, 7);
}

#[test]
fn pre_function_runs_before_the_callback() {
    init_logging();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let in_pre = Arc::clone(&order);
    let seen = Arc::clone(&order);
    Config::new()
        .domains(0)
        .events(release_all_events(false, move |_| {
            let log = Arc::clone(&in_pre);
            Box::new(move || log.lock().push("pre"))
        }))
        .run(async move {
            let log = Arc::clone(&seen);
            let syscall = attent::make(move || log.lock().push("callback"));
            attent::suspend(syscall).await;
        });
    assert_eq!(*order.lock(), vec!["pre", "callback"]);
}

#[test]
fn panicking_pre_function_fails_the_suspended_task() {
    init_logging();
    let outcome = Config::new()
        .domains(0)
        .events(release_all_events(false, |_| {
            Box::new(|| panic!("pre failed"))
        }))
        .run(async {
            let child = attent::spawn_local(async {
                attent::suspend(attent::make(|| ())).await;
            })
            .await;
            child.join().await
        });
    match outcome {
        Err(err) => assert_eq!(err.panic_message(), Some("pre failed")),
        Ok(()) => panic!("the discontinued task must fail"),
    }
}

#[test]
fn providers_may_probe_pending_ids() {
    init_logging();
    // The release-all provider asserts `is_pending` for every id it sees.
    let value = Config::new()
        .domains(0)
        .events(release_all_events(true, |_| Box::new(|| ())))
        .run(async {
            let syscall = attent::make(|| "probed");
            attent::suspend(syscall).await
        });
    assert_eq!(value, "probed");
}

#[test]
fn syscall_uids_are_scoped_per_domain() {
    init_logging();
    let ((d1, a), (d2, b)) = Config::new().domains(2).run(async {
        let first = attent::spawn(async {
            let one = attent::make(|| ()).uid();
            let two = attent::make(|| ()).uid();
            (attent::domain_id(), (one, two))
        })
        .await;
        let second = attent::spawn(async {
            let one = attent::make(|| ()).uid();
            let two = attent::make(|| ()).uid();
            (attent::domain_id(), (one, two))
        })
        .await;
        let a = first.join().await.expect("first");
        let b = second.join().await.expect("second");
        (a, b)
    });
    assert_ne!(d1, d2, "round-robin spreads the two spawns");
    let (a1, a2): (SyscallUid, SyscallUid) = a;
    let (b1, b2) = b;
    assert_ne!(a1, a2, "uids are unique within a domain");
    assert_eq!(a1, b1, "each domain starts from the same counter");
    assert_eq!(a2, b2);
}

#[test]
fn select_runs_between_scheduling_points() {
    init_logging();
    let selects = Arc::new(AtomicUsize::new(0));
    Config::new()
        .domains(0)
        .events(counting_events(Arc::clone(&selects)))
        .run(async {
            for _ in 0..5 {
                attent::yield_now().await;
            }
        });
    assert!(
        selects.load(Ordering::SeqCst) >= 5,
        "every yield must be followed by a select, saw {}",
        selects.load(Ordering::SeqCst)
    );
}
