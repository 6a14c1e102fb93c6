//! Interleaving policies
//!
//! A [`Scheduler`] decides which eligible task gets the next turn. It is a
//! pure strategy: the orchestrator resets it with a fresh seed at the start of
//! every iteration and then feeds it the eligible set, in task id order, once
//! per step. The same seed and the same sequence of eligible sets must
//! produce the same decisions.

pub mod replay;

pub use replay::ReplayScheduler;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::schedule::ScheduleStep;
use super::task::TaskId;

/// Interleaving policy contract.
pub trait Scheduler: Send {
    /// Start a fresh deterministic sequence from `seed`.
    fn reset(
        &mut self,
        seed: i64,
    );

    /// Pick the next step given the currently eligible tasks.
    fn next(
        &mut self,
        eligible: &[TaskId],
    ) -> ScheduleStep;

    /// Short policy name for logs.
    fn name(&self) -> &'static str;
}

/// Uniformly random choice among the eligible tasks.
#[derive(Debug, Default)]
pub struct RandomScheduler {
    seed: Option<i64>,
    rng: Option<StdRng>,
}

impl RandomScheduler {
    /// Create a scheduler. It must be reset before use.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// The seed of the current sequence.
    #[inline]
    pub fn seed(&self) -> Option<i64> {
        self.seed
    }
}

impl Scheduler for RandomScheduler {
    fn reset(
        &mut self,
        seed: i64,
    ) {
        self.seed = Some(seed);
        self.rng = Some(StdRng::seed_from_u64(seed as u64));
    }

    fn next(
        &mut self,
        eligible: &[TaskId],
    ) -> ScheduleStep {
        let Some(rng) = self.rng.as_mut() else {
            return ScheduleStep::Error("random scheduler used before reset".to_string());
        };
        if eligible.is_empty() {
            return ScheduleStep::Done;
        }
        ScheduleStep::Task(eligible[rng.random_range(0..eligible.len())])
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Policy selection for [`RuntimeConfig`](crate::util::config::RuntimeConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// [`RandomScheduler`].
    #[default]
    Random,
}

impl SchedulerKind {
    /// Instantiate the policy.
    pub fn build(&self) -> Box<dyn Scheduler> {
        match self {
            SchedulerKind::Random => Box::new(RandomScheduler::new()),
        }
    }
}
