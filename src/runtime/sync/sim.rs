//! Simulated mutex whose contention path goes through the orchestrator.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::Lock;
use crate::runtime::context::Context;
use crate::runtime::error::HarnessError;
use crate::runtime::task::TaskId;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
struct SimState {
    holder: Option<TaskId>,
    waiting: BTreeSet<TaskId>,
}

/// Who holds which simulated mutex, and who waits for which.
///
/// Every holder change and every condvar wait is registered here under one
/// lock, so a wait that would close a cycle is seen by the task closing it.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
    holders: IndexMap<u64, TaskId>,
    waiting: IndexMap<TaskId, u64>,
}

impl WaitGraph {
    pub(crate) fn clear(&mut self) {
        self.holders.clear();
        self.waiting.clear();
    }

    fn hold(
        &mut self,
        lock: u64,
        task: TaskId,
    ) {
        self.holders.insert(lock, task);
        self.waiting.swap_remove(&task);
    }

    fn free(
        &mut self,
        lock: u64,
    ) {
        self.holders.swap_remove(&lock);
    }

    fn wait(
        &mut self,
        task: TaskId,
        lock: u64,
    ) {
        self.waiting.insert(task, lock);
    }

    fn stop_waiting(
        &mut self,
        task: TaskId,
    ) {
        self.waiting.swap_remove(&task);
    }

    /// The tasks, sorted, on the cycle `task` would close by waiting on `lock`.
    fn cycle_through(
        &self,
        task: TaskId,
        lock: u64,
    ) -> Option<Vec<TaskId>> {
        let mut cycle = vec![task];
        let mut lock = lock;
        loop {
            let holder = *self.holders.get(&lock)?;
            if holder == task {
                cycle.sort_unstable();
                return Some(cycle);
            }
            if cycle.contains(&holder) {
                return None;
            }
            cycle.push(holder);
            lock = *self.waiting.get(&holder)?;
        }
    }
}

/// Mutex arbitrated by the orchestrator.
///
/// Every acquire and release ends with the caller yielding its turn once, so
/// the scheduler gets to interleave other tasks around each critical section.
/// Releasing makes every waiter eligible again; the scheduler picks which of
/// them retries first.
///
/// A `SimMutex` belongs to the iteration it was created in. Using it from a
/// later iteration fails with [`HarnessError::StaleLock`].
#[derive(Debug)]
pub struct SimMutex {
    id: u64,
    epoch: u64,
    state: Mutex<SimState>,
    /// Wakes tasks that contend after cleanup released them from turn-taking.
    released: Condvar,
}

impl SimMutex {
    /// Create a mutex for the iteration with the given epoch.
    pub fn new(epoch: u64) -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            epoch,
            state: Mutex::new(SimState::default()),
            released: Condvar::new(),
        }
    }

    /// The iteration epoch this mutex belongs to.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Tasks currently waiting for the mutex.
    pub fn waiters(&self) -> Vec<TaskId> {
        self.state.lock().waiting.iter().copied().collect()
    }
}

impl Lock for SimMutex {
    fn acquire(
        &self,
        ctx: &Context,
    ) {
        let Some((shared, task)) = ctx.driven_parts() else {
            panic!("SimMutex used outside the harness; use Mutex::native instead");
        };
        let me = task.id();
        let current = shared.epoch();
        if current != self.epoch {
            ctx.fail(HarnessError::StaleLock {
                task: me,
                created: self.epoch,
                current,
            });
        }

        loop {
            let mut graph = shared.wait_graph();
            let mut state = self.state.lock();
            if state.holder == Some(me) {
                drop(state);
                drop(graph);
                ctx.fail(HarnessError::DeadlockDetected { task: me });
            }
            if state.holder.is_none() {
                state.holder = Some(me);
                state.waiting.remove(&me);
                graph.hold(self.id, me);
                break;
            }

            state.waiting.insert(me);
            if task.is_run_to_completion() {
                if task.is_cancelled() {
                    state.waiting.remove(&me);
                    graph.stop_waiting(me);
                    drop(state);
                    drop(graph);
                    ctx.abort();
                }
                // No turns are left to break a cycle, so it has to be caught here.
                if let Some(tasks) = graph.cycle_through(me, self.id) {
                    state.waiting.remove(&me);
                    graph.stop_waiting(me);
                    drop(state);
                    drop(graph);
                    warn!(task = %me, "lock cycle while draining tasks");
                    ctx.fail(HarnessError::LockCycle { tasks });
                }
                graph.wait(me, self.id);
                drop(graph);
                self.released.wait(&mut state);
                continue;
            }
            drop(state);
            drop(graph);

            debug!(task = %me, holder = ?self.holder(), "blocked on mutex");
            task.block();
            task.yield_turn();
            if task.is_cancelled() {
                self.state.lock().waiting.remove(&me);
                ctx.abort();
            }
        }

        ctx.yield_now();
    }

    fn release(
        &self,
        ctx: &Context,
    ) {
        let Some((shared, task)) = ctx.driven_parts() else {
            panic!("SimMutex used outside the harness; use Mutex::native instead");
        };
        let me = task.id();
        let unwinding = std::thread::panicking();

        let waiters = {
            let mut graph = shared.wait_graph();
            let mut state = self.state.lock();
            if state.holder != Some(me) {
                drop(state);
                drop(graph);
                if unwinding {
                    return;
                }
                ctx.fail(HarnessError::UnlockNotHeld { task: me });
            }
            state.holder = None;
            graph.free(self.id);
            self.released.notify_all();
            std::mem::take(&mut state.waiting)
        };

        for id in waiters {
            if let Some(waiter) = shared.task(id) {
                waiter.unblock();
            }
        }

        if !unwinding {
            ctx.yield_now();
        }
    }

    fn holder(&self) -> Option<TaskId> {
        self.state.lock().holder
    }

    fn is_locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }
}
