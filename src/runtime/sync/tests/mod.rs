//! Sync 单元测试
//!
//! 测试模拟互斥锁的互斥性、死锁检测、跨迭代使用以及原生互斥锁

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::error::HarnessError;
use crate::runtime::sync::{Lock, Mutex, NativeMutex, SimMutex};
use crate::runtime::task::TaskId;
use crate::runtime::{Context, Runtime, Termination};
use crate::util::config::RuntimeConfig;

fn runtime(name: &str) -> Runtime {
    let config = RuntimeConfig::new()
        .with_iterations(50)
        .with_max_steps(500)
        .with_seed(3)
        .without_persistence();
    Runtime::initialize(name, config).unwrap()
}

#[cfg(test)]
mod sim_mutex_tests {
    use super::*;

    #[test]
    fn test_driven_context_builds_sim_mutex() {
        let mut runtime = runtime("builds_sim");
        runtime
            .run_seed(1, |ctx| {
                let mutex = Mutex::new(ctx);
                let _guard = mutex.lock(ctx);
                ctx.assert(mutex.holder() == ctx.task_id(), "holder is tracked");
            })
            .unwrap();
    }

    #[test]
    fn test_mutual_exclusion() {
        let mut runtime = runtime("exclusion");
        runtime
            .run(|ctx| {
                let mutex = ctx.new_mutex();
                let inside = Arc::new(AtomicBool::new(false));
                let handles: Vec<_> = (0..3)
                    .map(|_| {
                        let mutex = mutex.clone();
                        let inside = inside.clone();
                        ctx.spawn(move |ctx| {
                            let _guard = mutex.lock(ctx);
                            ctx.assert(!inside.swap(true, Ordering::SeqCst), "two holders");
                            ctx.yield_now();
                            inside.store(false, Ordering::SeqCst);
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join(ctx);
                }
            })
            .unwrap();
    }

    #[test]
    fn test_reacquire_is_deadlock() {
        let mut runtime = runtime("reacquire");
        let failure = runtime
            .run_seed(2, |ctx| {
                let mutex = ctx.new_mutex();
                let _first = mutex.lock(ctx);
                let _second = mutex.lock(ctx);
            })
            .unwrap_err();
        assert!(matches!(
            failure.source,
            HarnessError::DeadlockDetected { task } if task == TaskId::ROOT
        ));
        assert!(failure.schedule_path.is_none());
    }

    #[test]
    fn test_release_without_hold() {
        let mut runtime = runtime("unheld");
        let failure = runtime
            .run_seed(4, |ctx| ctx.new_mutex().release(ctx))
            .unwrap_err();
        assert!(matches!(failure.source, HarnessError::UnlockNotHeld { .. }));
    }

    #[test]
    fn test_mutex_from_previous_iteration() {
        let kept: Arc<parking_lot::Mutex<Option<Mutex>>> = Arc::new(parking_lot::Mutex::new(None));
        let mut runtime = runtime("stale");

        let slot = kept.clone();
        runtime
            .run_seed(5, move |ctx| {
                *slot.lock() = Some(ctx.new_mutex());
            })
            .unwrap();

        let slot = kept.clone();
        let failure = runtime
            .run_seed(6, move |ctx| {
                let mutex = slot.lock().clone();
                if let Some(mutex) = mutex {
                    let _guard = mutex.lock(ctx);
                }
            })
            .unwrap_err();
        assert!(matches!(
            failure.source,
            HarnessError::StaleLock {
                created: 1,
                current: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_waiters_become_eligible_on_release() {
        let mut runtime = runtime("waiters");
        let acquired = Arc::new(AtomicUsize::new(0));
        let count = acquired.clone();
        let report = runtime
            .run_seed(7, move |ctx| {
                let mutex = ctx.new_mutex();
                let guard = mutex.lock(ctx);
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        let mutex = mutex.clone();
                        let count = count.clone();
                        ctx.spawn(move |ctx| {
                            let _guard = mutex.lock(ctx);
                            count.fetch_add(1, Ordering::SeqCst);
                        })
                    })
                    .collect();
                // Give both children a chance to contend.
                for _ in 0..4 {
                    ctx.yield_now();
                }
                drop(guard);
                for handle in handles {
                    handle.join(ctx);
                }
            })
            .unwrap();
        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(acquired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_new_sim_mutex_is_unlocked() {
        let mutex = SimMutex::new(9);
        assert_eq!(mutex.epoch(), 9);
        assert!(!mutex.is_locked());
        assert!(mutex.holder().is_none());
        assert!(mutex.waiters().is_empty());
    }
}

#[cfg(test)]
mod native_mutex_tests {
    use super::*;

    #[test]
    fn test_native_mutex_excludes_threads() {
        let ctx = Context::passthrough();
        let mutex = Mutex::native();
        let inside = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                let total = total.clone();
                ctx.spawn(move |ctx| {
                    for _ in 0..100 {
                        let _guard = mutex.lock(ctx);
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        total.fetch_add(1, Ordering::SeqCst);
                        inside.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join(&ctx);
        }
        assert_eq!(total.load(Ordering::SeqCst), 800);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_native_lock_trait() {
        let ctx = Context::passthrough();
        let lock = NativeMutex::new();
        lock.acquire(&ctx);
        assert!(lock.is_locked());
        lock.release(&ctx);
        assert!(!lock.is_locked());
    }
}
