//! Same seed, same interleaving; replay reproduces a recorded run.

use std::sync::Arc;

use parking_lot::Mutex as Collected;
use tangle::runtime::ReplayScheduler;
use tangle::{HarnessError, Schedule, Scheduler, Termination};

use crate::common::{quiet, runtime, two_increments};

fn schedule_for(seed: i64) -> Schedule {
    let results = Arc::new(Collected::new(Vec::new()));
    let mut runtime = runtime("determinism", quiet(1));
    runtime
        .run_seed(seed, two_increments(true, results))
        .unwrap()
        .schedule
}

#[test]
fn test_same_seed_same_schedule() {
    for seed in [0, 1, 42, 7_777_777] {
        assert_eq!(schedule_for(seed), schedule_for(seed));
    }
}

#[test]
fn test_seeds_produce_different_schedules() {
    let distinct: std::collections::HashSet<_> = (0..20)
        .map(|seed| format!("{:?}", schedule_for(seed).steps()))
        .collect();
    assert!(distinct.len() > 1);
}

#[test]
fn test_fixed_generator_seed_repeats_run() {
    let run = || {
        let results = Arc::new(Collected::new(Vec::new()));
        let mut runtime = runtime("fixed_generator", quiet(10));
        let report = runtime.run(two_increments(false, results.clone())).unwrap();
        let seeds: Vec<i64> = report.iterations.iter().map(|r| r.seed).collect();
        let values = results.lock().clone();
        (seeds, values)
    };
    assert_eq!(run(), run());
}

#[test]
fn test_replay_reproduces_schedule() {
    let original = schedule_for(99);
    let results = Arc::new(Collected::new(Vec::new()));
    let mut runtime = runtime("replay", quiet(1));
    let replayed = runtime
        .replay(&original, two_increments(true, results))
        .unwrap();
    assert_eq!(replayed.schedule, original);
    assert_eq!(replayed.seed, 99);
    assert!(replayed.schedule_path.is_none());
}

#[test]
fn test_replay_reproduces_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = runtime("replay_failure", quiet(200).with_schedule_dir(dir.path()));
    let body = |ctx: &tangle::Context| {
        let results = Arc::new(Collected::new(Vec::new()));
        two_increments(false, results.clone())(ctx);
        let value = results.lock()[0];
        ctx.assert(value == 2, "lost update");
    };
    let failure = runtime.run(body).unwrap_err();
    assert!(matches!(failure.source, HarnessError::AssertionFailed { .. }));

    let path = failure.schedule_path.clone().unwrap();
    let recorded = tangle::runtime::schedule::load_file(&path).unwrap();
    assert_eq!(recorded.seed(), failure.seed);

    let replayed = runtime.replay(&recorded, body).unwrap_err();
    assert_eq!(replayed.seed, failure.seed);
    assert_eq!(replayed.source.to_string(), failure.source.to_string());
    // The recorded file is left untouched by the replay.
    assert_eq!(tangle::runtime::schedule::load_file(&path).unwrap(), recorded);
}

#[test]
fn test_replay_of_budget_cut_iteration_stops_at_budget() {
    let body = |ctx: &tangle::Context| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                ctx.spawn(|ctx| {
                    for _ in 0..20 {
                        ctx.yield_now();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join(ctx);
        }
    };
    let mut recording = runtime("replay_budget", quiet(1).with_max_steps(5));
    let original = recording.run_seed(31, body).unwrap();
    assert_eq!(original.termination, Termination::StepBudgetExhausted);
    assert!(original.schedule.outcome().is_none());

    // A larger budget on the replaying runtime does not stretch the replay.
    let mut replaying = runtime("replay_budget_wide", quiet(1).with_max_steps(100));
    let replayed = replaying.replay(&original.schedule, body).unwrap();
    assert_eq!(replayed.termination, Termination::StepBudgetExhausted);
    assert_eq!(replayed.steps, 5);
    assert_eq!(replayed.schedule, original.schedule);
}

#[test]
fn test_replay_scheduler_reports_divergence() {
    let mut schedule = Schedule::new(1);
    schedule.add_task_step(tangle::TaskId(0));
    schedule.add_task_step(tangle::TaskId(5));

    let mut replay = ReplayScheduler::new(&schedule);
    replay.reset(1);
    assert!(replay.next(&[tangle::TaskId(0)]).is_error());
}
