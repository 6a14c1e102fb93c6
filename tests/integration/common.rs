//! Shared test bodies and helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as Collected;
use tangle::util::logger::{self, LogLevel};
use tangle::{Context, Runtime, RuntimeConfig};

pub fn runtime(
    name: &str,
    config: RuntimeConfig,
) -> Runtime {
    let _ = logger::try_init_test(LogLevel::Warn);
    Runtime::initialize(name, config).unwrap()
}

/// Iteration settings without schedule files.
pub fn quiet(iterations: usize) -> RuntimeConfig {
    RuntimeConfig::new()
        .with_iterations(iterations)
        .with_max_steps(100)
        .with_seed(20240611)
        .without_persistence()
}

/// Two tasks each add one to a shared counter, with a yield between the
/// read and the write. With `locked`, the read-modify-write is guarded.
/// The final value of each run is pushed to `results`.
pub fn two_increments(
    locked: bool,
    results: Arc<Collected<Vec<usize>>>,
) -> impl Fn(&Context) + Send + Sync + 'static {
    move |ctx: &Context| {
        let counter = Arc::new(AtomicUsize::new(0));
        let mutex = ctx.new_mutex();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let counter = counter.clone();
                let mutex = mutex.clone();
                ctx.spawn(move |ctx| {
                    let guard = locked.then(|| mutex.lock(ctx));
                    let read = counter.load(Ordering::SeqCst);
                    ctx.yield_now();
                    counter.store(read + 1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join(ctx);
        }
        results.lock().push(counter.load(Ordering::SeqCst));
    }
}

/// The root holds `a` and wants `b`; its child holds `b` and wants `a`.
pub fn crossed_locks(ctx: &Context) {
    let a = ctx.new_mutex();
    let b = ctx.new_mutex();
    let _a = a.lock(ctx);
    let (child_a, child_b) = (a.clone(), b.clone());
    ctx.spawn(move |ctx| {
        let _b = child_b.lock(ctx);
        let _a = child_a.lock(ctx);
    });
    while !b.is_locked() {
        ctx.yield_now();
    }
    let _b = b.lock(ctx);
}
