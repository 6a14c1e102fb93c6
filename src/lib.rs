//! Tangle: a controlled-interleaving test harness for threaded code
//!
//! Test bodies run against a [`Context`]. Under the harness every spawned
//! task gets its own thread, but only one of them runs at a time: an
//! orchestrator hands out turns, a seeded [`Scheduler`] picks who goes next,
//! and every decision is recorded so a failing interleaving can be stored and
//! replayed. The same body runs unchanged as ordinary threaded code when
//! given [`Context::passthrough`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! tangle::check_random(
//!     |ctx| {
//!         let counter = Arc::new(AtomicUsize::new(0));
//!         let mutex = ctx.new_mutex();
//!         let handles: Vec<_> = (0..2)
//!             .map(|_| {
//!                 let counter = counter.clone();
//!                 let mutex = mutex.clone();
//!                 ctx.spawn(move |ctx| {
//!                     let _guard = mutex.lock(ctx);
//!                     counter.fetch_add(1, Ordering::SeqCst);
//!                 })
//!             })
//!             .collect();
//!         for handle in handles {
//!             handle.join(ctx);
//!         }
//!         ctx.assert(counter.load(Ordering::SeqCst) == 2, "lost update");
//!     },
//!     "counter_is_exact",
//!     100,
//!     200,
//! );
//! ```

#![warn(rust_2018_idioms)]

pub mod runtime;
pub mod util;

pub use runtime::{
    Context, HarnessError, IterationFailure, IterationReport, JoinHandle, Mutex, MutexGuard,
    RunReport, Runtime, Schedule, ScheduleStep, ScheduleStore, Scheduler, SchedulerKind, TaskId,
    Termination,
};
pub use util::config::RuntimeConfig;

use std::path::PathBuf;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "tangle";

/// Run `iterations` random interleavings of `root` and panic on the first
/// failure.
///
/// Schedules are written under `.tangle/<test_name>/`, one `<seed>.json` per
/// iteration, replacing whatever a previous run left there.
pub fn check_random<F>(
    root: F,
    test_name: &str,
    iterations: usize,
    max_steps: usize,
) -> RunReport
where
    F: Fn(&Context) + Send + Sync + 'static,
{
    let config = RuntimeConfig::new()
        .with_iterations(iterations)
        .with_max_steps(max_steps)
        .with_schedule_dir(schedule_dir_for(test_name));

    let mut runtime = match Runtime::initialize(test_name, config) {
        Ok(runtime) => runtime,
        Err(e) => panic!("{}: could not start harness: {}", test_name, e),
    };
    match runtime.run(root) {
        Ok(report) => report,
        Err(failure) => match &failure.schedule_path {
            Some(path) => panic!("{}: {} (schedule: {})", test_name, failure, path.display()),
            None => panic!("{}: {}", test_name, failure),
        },
    }
}

fn schedule_dir_for(test_name: &str) -> PathBuf {
    let sanitized: String = test_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    PathBuf::from(".tangle").join(sanitized)
}
