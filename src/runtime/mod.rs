//! Runtime system
//!
//! The orchestrator that turns real threads into a controlled interleaving.
//!
//! # Architecture
//!
//! - [`Task`](task::Task) - one OS thread per unit of work, plus its turn protocol
//! - [`Scheduler`](scheduler::Scheduler) - picks the next eligible task each step
//! - [`Mutex`](sync::Mutex) - locks whose contention goes through the orchestrator
//! - [`Schedule`](schedule::Schedule) - seed and decisions of one iteration
//! - [`Runtime`] - drives iterations, records schedules, cleans up
//!
//! Per step the runtime asks the scheduler for the next decision, resumes the
//! current task for exactly one turn, records it, then moves to the chosen
//! task. An iteration ends when the root task finishes, the scheduler reports
//! done or an error, a failure is recorded, or the step budget runs out.

pub mod context;
pub mod error;
pub mod schedule;
pub mod scheduler;
pub mod sync;
pub mod task;

pub use context::{Context, JoinHandle};
pub use error::{HarnessError, IterationFailure, Result};
pub use schedule::{Schedule, ScheduleStep, ScheduleStore};
pub use scheduler::{RandomScheduler, ReplayScheduler, Scheduler, SchedulerKind};
pub use sync::{Lock, Mutex, MutexGuard, NativeMutex, SimMutex};
pub use task::{Task, TaskId, TaskIdGenerator, TaskState};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam::sync::WaitGroup;
use indexmap::IndexMap;
use parking_lot::Mutex as StateLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::util::config::RuntimeConfig;
use context::{Abort, Work};
use sync::WaitGraph;

/// Root work, re-run once per iteration.
pub type RootFn = Arc<dyn Fn(&Context) + Send + Sync + 'static>;

/// Runtime lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    /// No iteration has started yet.
    NotStarted,
    /// An iteration is being driven.
    Running,
    /// The last iteration ended; tasks no longer take turns.
    Stopped,
}

/// How a successful iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The root task finished or the scheduler reported done.
    Completed,
    /// The step budget ran out first.
    StepBudgetExhausted,
}

/// Result of one iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// Zero-based iteration index.
    pub index: usize,
    /// Seed the scheduler was reset with.
    pub seed: i64,
    /// How the iteration ended.
    pub termination: Termination,
    /// Scheduling steps taken.
    pub steps: usize,
    /// Recorded schedule.
    pub schedule: Schedule,
    /// Number of tasks created, including the root.
    pub tasks: usize,
    /// Where the schedule was written, if persistence is enabled.
    pub schedule_path: Option<PathBuf>,
}

/// Result of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// One report per iteration, in order.
    pub iterations: Vec<IterationReport>,
}

impl RunReport {
    /// Number of iterations run.
    #[inline]
    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    /// Check if no iteration ran.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    /// Iterations that ended by completion.
    pub fn completed(&self) -> usize {
        self.count(Termination::Completed)
    }

    /// Iterations stopped by the step budget.
    pub fn budget_exhausted(&self) -> usize {
        self.count(Termination::StepBudgetExhausted)
    }

    fn count(
        &self,
        termination: Termination,
    ) -> usize {
        self.iterations
            .iter()
            .filter(|r| r.termination == termination)
            .count()
    }
}

/// Bookkeeping shared between the orchestrator and task threads.
///
/// Only held while mutating bookkeeping, never across a turn.
struct RuntimeState {
    phase: RuntimePhase,
    tasks: IndexMap<TaskId, Arc<Task>>,
    ids: TaskIdGenerator,
    current: Option<TaskId>,
    pending: Option<ScheduleStep>,
    steps_taken: usize,
    epoch: u64,
    failure: Option<HarnessError>,
    wait_group: Option<WaitGroup>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            phase: RuntimePhase::NotStarted,
            tasks: IndexMap::new(),
            ids: TaskIdGenerator::new(),
            current: None,
            pending: None,
            steps_taken: 0,
            epoch: 0,
            failure: None,
            wait_group: None,
        }
    }

    fn ids_where(
        &self,
        state: TaskState,
    ) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.state() == state)
            .map(|t| t.id())
            .collect()
    }
}

pub(crate) struct Shared {
    state: StateLock<RuntimeState>,
    /// Lock ownership and waits, taken before any `SimMutex` state.
    graph: StateLock<WaitGraph>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: StateLock::new(RuntimeState::new()),
            graph: StateLock::new(WaitGraph::default()),
        }
    }

    pub(crate) fn wait_graph(&self) -> parking_lot::MutexGuard<'_, WaitGraph> {
        self.graph.lock()
    }

    pub(crate) fn phase(&self) -> RuntimePhase {
        self.state.lock().phase
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub(crate) fn task(
        &self,
        id: TaskId,
    ) -> Option<Arc<Task>> {
        self.state.lock().tasks.get(&id).cloned()
    }

    /// Keep the first failure of the iteration; later ones are logged only.
    pub(crate) fn record_failure(
        &self,
        failure: HarnessError,
    ) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(failure);
        } else {
            debug!(%failure, "ignoring failure after the first");
        }
    }

    fn take_failure(&self) -> Option<HarnessError> {
        self.state.lock().failure.take()
    }

    fn begin_iteration(
        self: &Arc<Self>,
        root: &RootFn,
    ) -> Result<Arc<Task>> {
        let wait = WaitGroup::new();
        {
            let mut state = self.state.lock();
            state.phase = RuntimePhase::Running;
            state.epoch += 1;
            state.ids = TaskIdGenerator::new();
            state.failure = None;
            state.wait_group = Some(wait.clone());
        }

        let root = root.clone();
        let task = self.spawn_task(wait, Box::new(move |ctx: &Context| root(ctx)))?;
        self.state.lock().current = Some(task.id());
        Ok(task)
    }

    /// Register a task and start its thread. The thread waits for its first
    /// turn unless the runtime has already stopped.
    pub(crate) fn spawn_task(
        self: &Arc<Self>,
        wait: WaitGroup,
        work: Work,
    ) -> Result<Arc<Task>> {
        let task = {
            let mut state = self.state.lock();
            let id = state.ids.next();
            let initial = match state.phase {
                RuntimePhase::Stopped => TaskState::RunToCompletion,
                _ => TaskState::Available,
            };
            let task = Arc::new(Task::with_state(id, initial));
            task.set_wait_group(wait);
            state.tasks.insert(id, task.clone());
            task
        };

        let shared = self.clone();
        let ctx = Context::driven(self.clone(), task.clone());
        let thread_task = task.clone();
        let spawned = thread::Builder::new()
            .name(format!("tangle-task-{}", task.id().inner()))
            .spawn(move || shared.run_task(&thread_task, ctx, work));

        match spawned {
            Ok(handle) => {
                task.attach_thread(handle);
                Ok(task)
            }
            Err(source) => {
                task.abandon();
                Err(HarnessError::SpawnFailed {
                    task: task.id(),
                    source,
                })
            }
        }
    }

    /// Body of every task thread.
    fn run_task(
        &self,
        task: &Task,
        ctx: Context,
        work: Work,
    ) {
        task.wait_for_turn();
        trace!(task = %task.id(), "task started");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&ctx)));
        if let Err(payload) = outcome {
            self.record_panic(task.id(), payload);
        }
        drop(ctx);
        task.finish();
        trace!(task = %task.id(), "task finished");
        task.leave_wait_group();
    }

    fn record_panic(
        &self,
        task: TaskId,
        payload: Box<dyn Any + Send>,
    ) {
        if payload.is::<Abort>() {
            return;
        }
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        self.record_failure(HarnessError::TaskPanicked { task, message });
    }

    pub(crate) fn yield_task(
        &self,
        task: &Task,
    ) {
        if self.phase() == RuntimePhase::Stopped {
            return;
        }
        trace!(task = %task.id(), "yielding");
        task.yield_turn();
    }

    fn steps_taken(&self) -> usize {
        self.state.lock().steps_taken
    }

    /// Ask the scheduler for the next decision unless one is already pending.
    fn schedule_next(
        &self,
        scheduler: &mut dyn Scheduler,
    ) {
        let eligible = {
            let state = self.state.lock();
            if state.pending.is_some() {
                return;
            }
            state.ids_where(TaskState::Available)
        };
        let step = scheduler.next(&eligible);
        let mut state = self.state.lock();
        state.pending = Some(step);
        state.steps_taken += 1;
    }

    /// Count the last turn the budget allows. Nothing runs after it, so the
    /// scheduler is not consulted; only an empty eligible set is recorded.
    fn count_final_step(&self) {
        let mut state = self.state.lock();
        if state.pending.is_none() && state.ids_where(TaskState::Available).is_empty() {
            state.pending = Some(ScheduleStep::Done);
        }
        state.steps_taken += 1;
    }

    fn take_pending(&self) -> Option<ScheduleStep> {
        self.state.lock().pending.take()
    }

    fn set_current(
        &self,
        id: TaskId,
    ) {
        self.state.lock().current = Some(id);
    }

    fn blocked_ids(&self) -> Vec<TaskId> {
        self.state.lock().ids_where(TaskState::Blocked)
    }

    /// Stop turn-taking and release every unfinished task.
    fn release_all(
        &self,
        cancel_blocked: bool,
    ) -> Option<WaitGroup> {
        let mut state = self.state.lock();
        state.phase = RuntimePhase::Stopped;
        for task in state.tasks.values() {
            if cancel_blocked && task.is_blocked() {
                task.cancel();
            } else {
                task.release_to_completion();
            }
        }
        state.wait_group.take()
    }

    /// Drop every task of the finished iteration and return them for joining.
    fn reset(&self) -> Vec<Arc<Task>> {
        self.graph.lock().clear();
        let mut state = self.state.lock();
        state.current = None;
        state.pending = None;
        state.steps_taken = 0;
        state.ids = TaskIdGenerator::new();
        state.tasks.drain(..).map(|(_, task)| task).collect()
    }
}

enum Outcome {
    Completed,
    StepBudgetExhausted,
    Failed(HarnessError),
}

/// Turn loop of one iteration.
fn drive(
    shared: &Arc<Shared>,
    max_steps: usize,
    root: &RootFn,
    scheduler: &mut dyn Scheduler,
    schedule: &mut Schedule,
) -> Outcome {
    let root_task = match shared.begin_iteration(root) {
        Ok(task) => task,
        Err(e) => return Outcome::Failed(e),
    };
    let mut current = root_task.clone();

    loop {
        if shared.steps_taken() >= max_steps {
            warn!(max_steps, "step budget exhausted, stopping iteration");
            return Outcome::StepBudgetExhausted;
        }
        if shared.steps_taken() + 1 < max_steps {
            shared.schedule_next(scheduler);
        } else {
            shared.count_final_step();
        }

        // The decision was made before this turn; a task that blocked or
        // finished since then is skipped.
        if current.is_available() {
            debug!(task = %current.id(), "resuming");
            current.resume();
        }
        schedule.add_task_step(current.id());

        if let Some(failure) = shared.take_failure() {
            return Outcome::Failed(failure);
        }

        let decision = shared.take_pending();
        if root_task.is_finished() {
            return Outcome::Completed;
        }
        match decision {
            Some(ScheduleStep::Done) => {
                let blocked = shared.blocked_ids();
                if blocked.is_empty() {
                    return Outcome::Completed;
                }
                return Outcome::Failed(HarnessError::AllTasksBlocked { blocked });
            }
            Some(ScheduleStep::Error(message)) => {
                return Outcome::Failed(HarnessError::PolicyError(message));
            }
            Some(ScheduleStep::Task(id)) => match shared.task(id) {
                Some(next) => {
                    shared.set_current(id);
                    current = next;
                }
                None => {
                    return Outcome::Failed(HarnessError::PolicyError(format!(
                        "scheduler picked unknown {}",
                        id
                    )));
                }
            },
            None if shared.steps_taken() >= max_steps => continue,
            None => {
                return Outcome::Failed(HarnessError::PolicyError(
                    "no scheduling decision pending".to_string(),
                ));
            }
        }
    }
}

/// Let every task run to completion, wait for all of them, then reset.
///
/// Returns the number of tasks the iteration created.
fn cleanup(
    shared: &Shared,
    cancel_blocked: bool,
) -> usize {
    debug!("cleaning up tasks");
    if let Some(wait) = shared.release_all(cancel_blocked) {
        wait.wait();
    }
    let tasks = shared.reset();
    for task in &tasks {
        if let Some(handle) = task.take_thread() {
            let _ = handle.join();
        }
    }
    tasks.len()
}

/// Drives iterations of a test body under a scheduler.
pub struct Runtime {
    name: String,
    config: RuntimeConfig,
    shared: Arc<Shared>,
    scheduler: Box<dyn Scheduler>,
    seeds: StdRng,
    store: Option<ScheduleStore>,
    iterations_run: usize,
}

impl std::fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("scheduler", &self.scheduler.name())
            .field("phase", &self.phase())
            .field("iterations_run", &self.iterations_run)
            .finish()
    }
}

impl Runtime {
    /// Attach a runtime to the test called `name`.
    ///
    /// Stale schedules in the configured directory are removed.
    pub fn initialize(
        name: impl Into<String>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| HarnessError::InvalidConfig(e.to_string()))?;

        let store = config
            .persistence_enabled()
            .then(|| ScheduleStore::new(config.schedule_dir.clone()));
        if let Some(store) = &store {
            store.prepare()?;
        }

        let seeds = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        Ok(Self {
            name: name.into(),
            scheduler: config.scheduler.build(),
            config,
            shared: Arc::new(Shared::new()),
            seeds,
            store,
            iterations_run: 0,
        })
    }

    /// Replace the interleaving policy.
    pub fn with_scheduler(
        mut self,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replace the source of per-iteration seeds.
    pub fn with_seed_source(
        mut self,
        seeds: StdRng,
    ) -> Self {
        self.seeds = seeds;
        self
    }

    /// The test name this runtime reports under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active configuration.
    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> RuntimePhase {
        self.shared.phase()
    }

    /// Iterations executed so far, including replays.
    #[inline]
    pub fn iterations_run(&self) -> usize {
        self.iterations_run
    }

    /// Run the configured number of iterations, stopping at the first failure.
    pub fn run<F>(
        &mut self,
        root: F,
    ) -> std::result::Result<RunReport, IterationFailure>
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let root: RootFn = Arc::new(root);
        let mut report = RunReport::default();
        for index in 0..self.config.iterations {
            let seed = self.next_seed();
            report
                .iterations
                .push(self.execute(index, seed, &root, None, self.config.max_steps)?);
        }
        info!(
            test = %self.name,
            iterations = report.len(),
            budget_exhausted = report.budget_exhausted(),
            "exploration finished"
        );
        Ok(report)
    }

    /// Run a single iteration with a fresh seed.
    pub fn run_iteration<F>(
        &mut self,
        root: F,
    ) -> std::result::Result<IterationReport, IterationFailure>
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let seed = self.next_seed();
        self.run_seed(seed, root)
    }

    /// Run a single iteration with the given seed.
    pub fn run_seed<F>(
        &mut self,
        seed: i64,
        root: F,
    ) -> std::result::Result<IterationReport, IterationFailure>
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let root: RootFn = Arc::new(root);
        self.execute(self.iterations_run, seed, &root, None, self.config.max_steps)
    }

    /// Re-drive one iteration from a recorded schedule.
    ///
    /// The replay is not persisted, so the original record stays intact. A
    /// schedule without a terminal step was cut off by the step budget; its
    /// replay stops after the same number of steps.
    pub fn replay<F>(
        &mut self,
        schedule: &Schedule,
        root: F,
    ) -> std::result::Result<IterationReport, IterationFailure>
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        let root: RootFn = Arc::new(root);
        let mut replay = ReplayScheduler::new(schedule);
        let max_steps = match schedule.outcome() {
            Some(_) => self.config.max_steps,
            None => schedule.task_steps().count(),
        };
        self.execute(
            self.iterations_run,
            schedule.seed(),
            &root,
            Some(&mut replay),
            max_steps,
        )
    }

    fn next_seed(&mut self) -> i64 {
        (self.seeds.random::<u64>() >> 1) as i64
    }

    fn execute(
        &mut self,
        index: usize,
        seed: i64,
        root: &RootFn,
        replay: Option<&mut ReplayScheduler>,
        max_steps: usize,
    ) -> std::result::Result<IterationReport, IterationFailure> {
        let span = info_span!("iteration", test = %self.name, index, seed);
        let _entered = span.enter();

        let replaying = replay.is_some();
        let scheduler: &mut dyn Scheduler = match replay {
            Some(replay) => replay,
            None => self.scheduler.as_mut(),
        };
        scheduler.reset(seed);
        debug!(policy = scheduler.name(), "running iteration");

        let mut schedule = Schedule::new(seed);
        let outcome = drive(
            &self.shared,
            max_steps,
            root,
            scheduler,
            &mut schedule,
        );
        let cancel_blocked = matches!(
            outcome,
            Outcome::Failed(HarnessError::AllTasksBlocked { .. })
        );
        let tasks = cleanup(&self.shared, cancel_blocked);
        self.iterations_run += 1;

        // Failures raised while tasks drained during cleanup still count.
        let outcome = match outcome {
            Outcome::Failed(e) => Outcome::Failed(e),
            other => match self.shared.take_failure() {
                Some(e) => Outcome::Failed(e),
                None => other,
            },
        };
        match &outcome {
            Outcome::Completed => schedule.add_done_step(),
            Outcome::Failed(e) => schedule.add_error_step(e.to_string()),
            Outcome::StepBudgetExhausted => {}
        }

        let mut schedule_path = None;
        if let Some(store) = self.store.as_ref().filter(|_| !replaying) {
            match store.save(&schedule) {
                Ok(path) => schedule_path = Some(path),
                Err(e) => {
                    error!(error = %e, "could not persist schedule");
                    if !matches!(outcome, Outcome::Failed(_)) {
                        return Err(IterationFailure {
                            iteration: index,
                            seed,
                            schedule_path: None,
                            source: e,
                        });
                    }
                }
            }
        }

        let termination = match outcome {
            Outcome::Completed => Termination::Completed,
            Outcome::StepBudgetExhausted => Termination::StepBudgetExhausted,
            Outcome::Failed(source) => {
                error!(error = %source, "iteration failed");
                return Err(IterationFailure {
                    iteration: index,
                    seed,
                    schedule_path,
                    source,
                });
            }
        };

        Ok(IterationReport {
            index,
            seed,
            termination,
            steps: schedule.task_steps().count(),
            schedule,
            tasks,
            schedule_path,
        })
    }
}
