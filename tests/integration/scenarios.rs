//! Behavioral scenarios: spawn ordering, lost updates, locking, self-deadlock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as Collected;
use tangle::{HarnessError, ScheduleStep, TaskId};

use crate::common::{crossed_locks, quiet, runtime, two_increments};

#[test]
fn test_spawner_keeps_turn_until_its_next_yield() {
    let report = tangle::check_random(
        |ctx| {
            let flag = Arc::new(AtomicUsize::new(0));
            let child_flag = flag.clone();
            ctx.spawn(move |_ctx| {
                child_flag.store(1, Ordering::SeqCst);
            });
            ctx.assert(flag.load(Ordering::SeqCst) == 0, "flag should be 0");
        },
        "spawner_keeps_turn",
        100,
        100,
    );
    assert_eq!(report.len(), 100);
}

#[test]
fn test_unguarded_increments_lose_updates() {
    let results = Arc::new(Collected::new(Vec::new()));
    let mut runtime = runtime("lost_update", quiet(200));
    runtime.run(two_increments(false, results.clone())).unwrap();

    let results = results.lock();
    assert_eq!(results.len(), 200);
    assert!(results.iter().all(|&v| v == 1 || v == 2));
    assert!(
        results.iter().any(|&v| v == 1),
        "no interleaving lost an update"
    );
}

#[test]
fn test_guarded_increments_never_lose_updates() {
    let results = Arc::new(Collected::new(Vec::new()));
    let mut runtime = runtime("guarded", quiet(200));
    runtime.run(two_increments(true, results.clone())).unwrap();

    let results = results.lock();
    assert_eq!(results.len(), 200);
    assert!(results.iter().all(|&v| v == 2), "lost update: {:?}", *results);
}

#[test]
fn test_reacquire_aborts_with_deadlock() {
    let mut runtime = runtime("self_deadlock", quiet(100));
    let failure = runtime
        .run(|ctx| {
            let mutex = ctx.new_mutex();
            let _held = mutex.lock(ctx);
            let _again = mutex.lock(ctx);
            ctx.assert(false, "second acquire returned");
        })
        .unwrap_err();

    assert_eq!(failure.iteration, 0);
    assert!(matches!(
        failure.source,
        HarnessError::DeadlockDetected { task } if task == TaskId::ROOT
    ));
}

#[test]
fn test_deadlock_detected_within_two_steps() {
    let dir = tempfile::tempdir().unwrap();
    let config = quiet(1).with_schedule_dir(dir.path());
    let mut runtime = runtime("deadlock_steps", config);
    let failure = runtime
        .run(|ctx| {
            let mutex = ctx.new_mutex();
            mutex.acquire(ctx);
            mutex.acquire(ctx);
        })
        .unwrap_err();

    let path = failure.schedule_path.clone().unwrap();
    let schedule = tangle::runtime::schedule::load_file(&path).unwrap();
    assert!(schedule.task_steps().count() <= 2);
    assert!(matches!(schedule.outcome(), Some(ScheduleStep::Error(_))));
}

#[test]
fn test_crossed_locks_report_all_blocked() {
    let mut runtime = runtime("crossed", quiet(20));
    let failure = runtime.run(crossed_locks).unwrap_err();

    match failure.source {
        HarnessError::AllTasksBlocked { blocked } => {
            assert_eq!(blocked, vec![TaskId(0), TaskId(1)]);
        }
        other => panic!("unexpected failure: {}", other),
    }
}

#[test]
fn test_lock_cycle_after_budget_is_reported() {
    // One step: both tasks take their locks while draining.
    let mut runtime = runtime("crossed_draining", quiet(10).with_max_steps(1));
    let failure = runtime.run(crossed_locks).unwrap_err();

    assert_eq!(failure.iteration, 0);
    match failure.source {
        HarnessError::LockCycle { tasks } => {
            assert_eq!(tasks, vec![TaskId(0), TaskId(1)]);
        }
        other => panic!("unexpected failure: {}", other),
    }
}

#[test]
fn test_assertion_failure_reported_with_seed() {
    let mut runtime = runtime("assertion", quiet(100));
    let failure = runtime
        .run(|ctx| {
            let child = ctx.spawn(|ctx| ctx.assert(false, "child gave up"));
            child.join(ctx);
        })
        .unwrap_err();

    match &failure.source {
        HarnessError::AssertionFailed { task, message } => {
            assert_eq!(*task, TaskId(1));
            assert_eq!(message, "child gave up");
        }
        other => panic!("unexpected failure: {}", other),
    }
    assert!(failure.to_string().contains(&failure.seed.to_string()));
}

#[test]
fn test_lock_reacquired_after_holder_finishes() {
    let mut runtime = runtime("reacquire_after_join", quiet(10));
    let report = runtime
        .run(|ctx| {
            let mutex = ctx.new_mutex();
            let child_mutex = mutex.clone();
            let child = ctx.spawn(move |ctx| {
                let _guard = child_mutex.lock(ctx);
                ctx.yield_now();
            });
            child.join(ctx);
            ctx.assert(!mutex.is_locked(), "child released the mutex");
            let _guard = mutex.lock(ctx);
            ctx.assert(mutex.holder() == ctx.task_id(), "root holds the mutex");
        })
        .unwrap();
    assert_eq!(report.completed(), 10);
}
