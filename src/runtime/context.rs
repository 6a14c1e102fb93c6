//! The handle user code runs against.
//!
//! Every piece of work the harness runs receives a [`Context`]. Spawning,
//! yielding, assertions and mutex construction all go through it, so the same
//! test body runs either under the orchestrator (a *driven* context) or as
//! ordinary threaded code (a *passthrough* context) depending only on which
//! context it was handed.

use std::panic;
use std::sync::Arc;
use std::thread;

use tracing::trace;

use super::error::HarnessError;
use super::sync::Mutex;
use super::task::{Task, TaskId};
use super::Shared;

/// Unwind payload used to stop a task after its failure was recorded.
pub(crate) struct Abort;

/// Boxed unit of work run as a task.
pub(crate) type Work = Box<dyn FnOnce(&Context) + Send + 'static>;

#[derive(Clone)]
enum Mode {
    Driven { shared: Arc<Shared>, task: Arc<Task> },
    Passthrough,
}

/// Per-task handle to the harness.
#[derive(Clone)]
pub struct Context {
    mode: Mode,
}

impl std::fmt::Debug for Context {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match &self.mode {
            Mode::Driven { task, .. } => f
                .debug_struct("Context")
                .field("task", &task.id())
                .finish(),
            Mode::Passthrough => f.write_str("Context(passthrough)"),
        }
    }
}

impl Context {
    pub(crate) fn driven(
        shared: Arc<Shared>,
        task: Arc<Task>,
    ) -> Self {
        Self {
            mode: Mode::Driven { shared, task },
        }
    }

    /// A context that runs everything as plain threads and native mutexes.
    pub fn passthrough() -> Self {
        Self {
            mode: Mode::Passthrough,
        }
    }

    /// Check if this context is driven by the orchestrator.
    #[inline]
    pub fn is_driven(&self) -> bool {
        matches!(self.mode, Mode::Driven { .. })
    }

    /// The task this context belongs to.
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.mode {
            Mode::Driven { task, .. } => Some(task.id()),
            Mode::Passthrough => None,
        }
    }

    /// The iteration this context belongs to.
    pub fn epoch(&self) -> Option<u64> {
        match &self.mode {
            Mode::Driven { shared, .. } => Some(shared.epoch()),
            Mode::Passthrough => None,
        }
    }

    pub(crate) fn driven_parts(&self) -> Option<(&Arc<Shared>, &Arc<Task>)> {
        match &self.mode {
            Mode::Driven { shared, task } => Some((shared, task)),
            Mode::Passthrough => None,
        }
    }

    /// Start `work` as a new task.
    ///
    /// Under the harness the task is registered with the orchestrator and the
    /// caller yields its turn. The new task does not run until the scheduler
    /// picks it.
    pub fn spawn<F>(
        &self,
        work: F,
    ) -> JoinHandle
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        match &self.mode {
            Mode::Driven { shared, task } => {
                let wait = match task.wait_group() {
                    Some(wait) if !task.is_finished() => wait,
                    _ => self.fail(HarnessError::TaskFinished { task: task.id() }),
                };
                let child = match shared.spawn_task(wait, Box::new(work)) {
                    Ok(child) => child,
                    Err(e) => self.fail(e),
                };
                trace!(parent = %task.id(), child = %child.id(), "spawned task");
                self.yield_now();
                JoinHandle {
                    inner: JoinInner::Driven(child),
                }
            }
            Mode::Passthrough => {
                let handle = thread::spawn(move || work(&Context::passthrough()));
                JoinHandle {
                    inner: JoinInner::Native(handle),
                }
            }
        }
    }

    /// Give up the turn. The scheduler decides who runs next.
    pub fn yield_now(&self) {
        match &self.mode {
            Mode::Driven { shared, task } => {
                if task.is_run_to_completion() {
                    thread::yield_now();
                    return;
                }
                shared.yield_task(task);
            }
            Mode::Passthrough => thread::yield_now(),
        }
    }

    /// Abort the iteration with an assertion failure if `condition` is false.
    pub fn assert(
        &self,
        condition: bool,
        message: impl Into<String>,
    ) {
        if condition {
            return;
        }
        let message = message.into();
        match &self.mode {
            Mode::Driven { task, .. } => self.fail(HarnessError::AssertionFailed {
                task: task.id(),
                message,
            }),
            Mode::Passthrough => panic!("assertion failed: {}", message),
        }
    }

    /// A mutex matching this context.
    pub fn new_mutex(&self) -> Mutex {
        Mutex::new(self)
    }

    /// Record `error` as the iteration's failure and stop this task.
    pub(crate) fn fail(
        &self,
        error: HarnessError,
    ) -> ! {
        match &self.mode {
            Mode::Driven { shared, .. } => {
                shared.record_failure(error);
                self.abort()
            }
            Mode::Passthrough => panic!("{}", error),
        }
    }

    /// Stop this task without recording anything.
    pub(crate) fn abort(&self) -> ! {
        panic::resume_unwind(Box::new(Abort))
    }
}

enum JoinInner {
    Driven(Arc<Task>),
    Native(thread::JoinHandle<()>),
}

/// Handle to a spawned task.
pub struct JoinHandle {
    inner: JoinInner,
}

impl std::fmt::Debug for JoinHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task_id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl JoinHandle {
    /// The spawned task's id, under the harness.
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.inner {
            JoinInner::Driven(task) => Some(task.id()),
            JoinInner::Native(_) => None,
        }
    }

    /// Check if the spawned work has returned.
    pub fn is_finished(&self) -> bool {
        match &self.inner {
            JoinInner::Driven(task) => task.is_finished(),
            JoinInner::Native(handle) => handle.is_finished(),
        }
    }

    /// Wait for the spawned work to return.
    ///
    /// Under the harness this yields until the task has finished, so every
    /// wait is a scheduling point. A panic in passthrough work is propagated.
    pub fn join(
        self,
        ctx: &Context,
    ) {
        match self.inner {
            JoinInner::Driven(task) => {
                while !task.is_finished() {
                    ctx.yield_now();
                }
            }
            JoinInner::Native(handle) => {
                if let Err(payload) = handle.join() {
                    panic::resume_unwind(payload);
                }
            }
        }
    }
}
