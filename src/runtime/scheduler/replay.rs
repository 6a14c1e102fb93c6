//! Replay of a recorded schedule.
//!
//! The task that runs at step `k + 1` is the decision made at step `k`, so a
//! recorded schedule's task steps, minus the first (always the root), are
//! exactly the decisions to hand back. Once they run out, an empty eligible
//! set is reported done as the live policy would; anything else means the
//! replay went further than the recording.

use super::Scheduler;
use crate::runtime::schedule::{Schedule, ScheduleStep};
use crate::runtime::task::TaskId;

/// Re-drives an iteration from a persisted [`Schedule`].
#[derive(Debug, Clone)]
pub struct ReplayScheduler {
    decisions: Vec<TaskId>,
    cursor: usize,
}

impl ReplayScheduler {
    /// Build a replay of `schedule`.
    pub fn new(schedule: &Schedule) -> Self {
        Self {
            decisions: schedule.task_steps().skip(1).collect(),
            cursor: 0,
        }
    }

    /// Decisions not handed out yet.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.decisions.len() - self.cursor
    }
}

impl Scheduler for ReplayScheduler {
    fn reset(
        &mut self,
        _seed: i64,
    ) {
        self.cursor = 0;
    }

    fn next(
        &mut self,
        eligible: &[TaskId],
    ) -> ScheduleStep {
        let Some(&id) = self.decisions.get(self.cursor) else {
            if eligible.is_empty() {
                return ScheduleStep::Done;
            }
            return ScheduleStep::Error(format!(
                "replay ran out of decisions after {}",
                self.decisions.len()
            ));
        };
        self.cursor += 1;
        if eligible.contains(&id) {
            ScheduleStep::Task(id)
        } else {
            ScheduleStep::Error(format!(
                "replay diverged at decision {}: {} is not eligible",
                self.cursor - 1,
                id
            ))
        }
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}
