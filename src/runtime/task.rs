//! Task definitions for the orchestrator.
//!
//! A task is a unit of user work backed by its own OS thread. The thread only
//! executes user code while it holds the turn: the orchestrator hands the turn
//! over with [`Task::resume`] and gets it back when the task calls
//! [`Task::yield_turn`] or finishes.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Unique task identifier. The root task of every iteration is `TaskId(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub usize);

impl TaskId {
    /// The root task of an iteration.
    pub const ROOT: TaskId = TaskId(0);

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl From<usize> for TaskId {
    fn from(val: usize) -> Self {
        Self(val)
    }
}

impl From<TaskId> for usize {
    fn from(val: TaskId) -> Self {
        val.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible to be picked for the next turn.
    Available,
    /// Waiting for a mutex held by another task.
    Blocked,
    /// The task's function has returned.
    Finished,
    /// Released during cleanup: yields are no-ops until the function returns.
    RunToCompletion,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Available,
            1 => TaskState::Blocked,
            2 => TaskState::Finished,
            3 => TaskState::RunToCompletion,
            _ => TaskState::Available,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Available => 0,
            TaskState::Blocked => 1,
            TaskState::Finished => 2,
            TaskState::RunToCompletion => 3,
        }
    }
}

/// A schedulable task and its half of the turn protocol.
///
/// Both rendezvous channels have zero capacity, so a resume is never buffered:
/// the orchestrator blocks in [`Task::resume`] until the task has taken the
/// turn and handed it back.
pub struct Task {
    /// Unique task ID.
    id: TaskId,
    /// Current state (atomic for thread-safe access).
    state: AtomicU8,
    /// Set when cleanup gives up on a blocked task.
    cancelled: AtomicBool,
    /// Orchestrator -> task. Dropped to release the task permanently.
    resume_tx: Mutex<Option<Sender<()>>>,
    resume_rx: Receiver<()>,
    /// Task -> orchestrator. `true` once the function has returned.
    yield_tx: Sender<bool>,
    yield_rx: Receiver<bool>,
    /// Backing thread, joined at iteration reset.
    thread: Mutex<Option<JoinHandle<()>>>,
    /// This task's share of the iteration's wait group.
    wait: Mutex<Option<WaitGroup>>,
}

impl std::fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Task {
    /// Create a task in the `Available` state.
    pub fn new(id: TaskId) -> Self {
        Self::with_state(id, TaskState::Available)
    }

    /// Create a task in the given state.
    ///
    /// A task created as `RunToCompletion` has no resume channel and starts
    /// running as soon as its thread does.
    pub fn with_state(
        id: TaskId,
        state: TaskState,
    ) -> Self {
        let (resume_tx, resume_rx) = channel::bounded(0);
        let (yield_tx, yield_rx) = channel::bounded(0);
        let resume_tx = match state {
            TaskState::RunToCompletion => None,
            _ => Some(resume_tx),
        };

        Self {
            id,
            state: AtomicU8::new(state.as_u8()),
            cancelled: AtomicBool::new(false),
            resume_tx: Mutex::new(resume_tx),
            resume_rx,
            yield_tx,
            yield_rx,
            thread: Mutex::new(None),
            wait: Mutex::new(None),
        }
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if the task can be picked for a turn.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.state() == TaskState::Available
    }

    /// Check if the task is waiting on a mutex.
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.state() == TaskState::Blocked
    }

    /// Check if the task's function has returned.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Check if the task has been released to run without turns.
    #[inline]
    pub fn is_run_to_completion(&self) -> bool {
        self.state() == TaskState::RunToCompletion
    }

    /// Check if cleanup cancelled this task's pending lock acquisition.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Mark the task as blocked on a mutex. No-op once released or finished.
    pub fn block(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Available.as_u8(),
            TaskState::Blocked.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Make a blocked task eligible again.
    pub fn unblock(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Blocked.as_u8(),
            TaskState::Available.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Attach the backing thread.
    pub fn attach_thread(
        &self,
        handle: JoinHandle<()>,
    ) {
        *self.thread.lock() = Some(handle);
    }

    /// Take the backing thread for joining.
    pub fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }

    /// Give the task its share of the iteration's wait group.
    pub fn set_wait_group(
        &self,
        wait: WaitGroup,
    ) {
        *self.wait.lock() = Some(wait);
    }

    /// Clone this task's wait group share, for tasks it spawns.
    pub fn wait_group(&self) -> Option<WaitGroup> {
        self.wait.lock().clone()
    }

    /// Drop this task's wait group share.
    pub fn leave_wait_group(&self) {
        self.wait.lock().take();
    }

    /// Mark a task whose thread never started as finished, without
    /// signalling anyone.
    pub fn abandon(&self) {
        self.state
            .store(TaskState::Finished.as_u8(), Ordering::SeqCst);
        self.resume_tx.lock().take();
        self.leave_wait_group();
    }

    /// Hand the turn to the task and wait until it yields or finishes.
    ///
    /// Returns `true` if the task finished. Resuming a finished task reports
    /// `true` immediately.
    pub fn resume(&self) -> bool {
        if self.is_finished() {
            return true;
        }
        let Some(tx) = self.resume_tx.lock().clone() else {
            return self.is_finished();
        };
        if tx.send(()).is_err() {
            return true;
        }
        self.yield_rx.recv().unwrap_or(true)
    }

    /// Called from the task's own thread: give the turn back and park until
    /// the next resume. No-op for a task running to completion.
    pub fn yield_turn(&self) {
        if self.is_run_to_completion() {
            return;
        }
        if self.yield_tx.send(false).is_err() {
            return;
        }
        let _ = self.resume_rx.recv();
    }

    /// Called from the task's own thread before running user code.
    pub fn wait_for_turn(&self) {
        let _ = self.resume_rx.recv();
    }

    /// Called from the task's own thread once the function has returned.
    pub fn finish(&self) {
        let prev = TaskState::from_u8(
            self.state
                .swap(TaskState::Finished.as_u8(), Ordering::SeqCst),
        );
        if prev != TaskState::RunToCompletion {
            let _ = self.yield_tx.send(true);
        }
    }

    /// Release a parked task so it runs to completion without further turns.
    ///
    /// Returns `false` if the task had already finished.
    pub fn release_to_completion(&self) -> bool {
        let updated = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                match TaskState::from_u8(raw) {
                    TaskState::Finished => None,
                    _ => Some(TaskState::RunToCompletion.as_u8()),
                }
            })
            .is_ok();
        // Disconnecting the channel wakes the task wherever it is parked.
        self.resume_tx.lock().take();
        updated
    }

    /// Release a parked task and make its pending lock acquisition unwind.
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        self.release_to_completion()
    }
}

/// Sequential task ID allocation, reset every iteration.
#[derive(Debug)]
pub struct TaskIdGenerator {
    next_id: usize,
}

impl TaskIdGenerator {
    /// Create a new task ID generator.
    #[inline]
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        TaskId(id)
    }

    /// Number of IDs handed out so far.
    #[inline]
    pub fn issued(&self) -> usize {
        self.next_id
    }
}

impl Default for TaskIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
