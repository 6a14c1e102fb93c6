//! Harness errors
//!
//! Every fatal condition the orchestrator can hit during an iteration.
//! Exhausting the step budget is not an error; it is reported through
//! [`Termination`](super::Termination).

use std::path::PathBuf;

use thiserror::Error;

use super::task::TaskId;

/// Result alias used across the runtime.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors surfaced to the test that drives the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A `Context::assert` condition was false.
    #[error("assertion failed in {task}: {message}")]
    AssertionFailed { task: TaskId, message: String },

    /// A task tried to acquire a lock it already holds.
    #[error("deadlock detected: {task} acquired a mutex it already holds")]
    DeadlockDetected { task: TaskId },

    /// Every live task is blocked on a lock and the root has not finished.
    #[error("deadlock detected: all live tasks are blocked ({})", format_ids(.blocked))]
    AllTasksBlocked { blocked: Vec<TaskId> },

    /// Tasks draining after the iteration stopped wait on each other's locks.
    #[error("deadlock detected: lock cycle between {}", format_ids(.tasks))]
    LockCycle { tasks: Vec<TaskId> },

    /// A context was used after its task had finished.
    #[error("{task} was used after it finished")]
    TaskFinished { task: TaskId },

    /// A task released a mutex it does not hold.
    #[error("{task} released a mutex it does not hold")]
    UnlockNotHeld { task: TaskId },

    /// The backing thread for a task could not be started.
    #[error("failed to start thread for {task}: {source}")]
    SpawnFailed {
        task: TaskId,
        #[source]
        source: std::io::Error,
    },

    /// User code panicked inside a task.
    #[error("{task} panicked: {message}")]
    TaskPanicked { task: TaskId, message: String },

    /// The interleaving policy reported an internal error.
    #[error("scheduler error: {0}")]
    PolicyError(String),

    /// A lock created in one iteration was used in another.
    #[error("{task} used a mutex created in iteration {created} during iteration {current}")]
    StaleLock {
        task: TaskId,
        created: u64,
        current: u64,
    },

    /// The schedule for an iteration could not be written or read.
    #[error("schedule persistence failed for {path}: {source}")]
    PersistenceFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted schedule could not be decoded.
    #[error("malformed schedule {path}: {source}")]
    MalformedSchedule {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The runtime configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HarnessError {
    /// The task the failure originated in, when there is one.
    pub fn task(&self) -> Option<TaskId> {
        match self {
            HarnessError::AssertionFailed { task, .. }
            | HarnessError::DeadlockDetected { task }
            | HarnessError::UnlockNotHeld { task }
            | HarnessError::TaskFinished { task }
            | HarnessError::SpawnFailed { task, .. }
            | HarnessError::TaskPanicked { task, .. }
            | HarnessError::StaleLock { task, .. } => Some(*task),
            _ => None,
        }
    }
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Wraps a failure with the seed of the iteration that produced it.
#[derive(Debug, Error)]
#[error("iteration {iteration} (seed {seed}) failed: {source}")]
pub struct IterationFailure {
    /// Zero-based iteration index within the run.
    pub iteration: usize,
    /// Seed of the failing schedule; replays through `Runtime::replay`.
    pub seed: i64,
    /// Where the failing schedule was written, if persistence is enabled.
    pub schedule_path: Option<PathBuf>,
    /// The underlying failure.
    #[source]
    pub source: HarnessError,
}
