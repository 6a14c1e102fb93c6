//! Recorded schedules
//!
//! A [`Schedule`] is the seed an iteration was driven with plus the ordered
//! list of scheduling steps it took. Schedules are written as one JSON file
//! per seed so a failing interleaving can be inspected and replayed:
//!
//! ```text
//! {"seed": 42, "steps": [{"routine": 0}, {"routine": 1}, {"done": true}]}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{HarnessError, Result};
use super::task::TaskId;

/// One scheduling decision. Exactly one variant is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepRecord", into = "StepRecord")]
pub enum ScheduleStep {
    /// Run the given task for one turn.
    Task(TaskId),
    /// The iteration ended with an error.
    Error(String),
    /// The iteration is complete.
    Done,
}

impl ScheduleStep {
    /// Check if this step selects a task.
    #[inline]
    pub fn is_task(&self) -> bool {
        matches!(self, ScheduleStep::Task(_))
    }

    /// Check if this step is an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, ScheduleStep::Error(_))
    }

    /// Check if this step ends the iteration.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, ScheduleStep::Done)
    }

    /// The selected task, if any.
    #[inline]
    pub fn task(&self) -> Option<TaskId> {
        match self {
            ScheduleStep::Task(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScheduleStep {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ScheduleStep::Task(id) => write!(f, "run {}", id),
            ScheduleStep::Error(msg) => write!(f, "error: {}", msg),
            ScheduleStep::Done => write!(f, "done"),
        }
    }
}

/// On-disk shape of a step: `{routine: id}`, `{error: msg}` or `{done: true}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StepRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    routine: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    done: Option<bool>,
}

impl From<ScheduleStep> for StepRecord {
    fn from(step: ScheduleStep) -> Self {
        match step {
            ScheduleStep::Task(id) => StepRecord {
                routine: Some(id),
                ..Default::default()
            },
            ScheduleStep::Error(msg) => StepRecord {
                error: Some(msg),
                ..Default::default()
            },
            ScheduleStep::Done => StepRecord {
                done: Some(true),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<StepRecord> for ScheduleStep {
    type Error = String;

    fn try_from(record: StepRecord) -> std::result::Result<Self, String> {
        match (record.routine, record.error, record.done) {
            (Some(id), None, None) => Ok(ScheduleStep::Task(id)),
            (None, Some(msg), None) => Ok(ScheduleStep::Error(msg)),
            (None, None, Some(true)) => Ok(ScheduleStep::Done),
            _ => Err("a schedule step must set exactly one of routine, error, done".to_string()),
        }
    }
}

/// The seed and steps of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    seed: i64,
    steps: Vec<ScheduleStep>,
}

impl Schedule {
    /// Create an empty schedule for the given seed.
    pub fn new(seed: i64) -> Self {
        Self {
            seed,
            steps: Vec::new(),
        }
    }

    /// The seed the scheduler was reset with.
    #[inline]
    pub fn seed(&self) -> i64 {
        self.seed
    }

    /// All recorded steps, in order.
    #[inline]
    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    /// Number of recorded steps.
    #[inline]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if nothing was recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Record that `task` ran for one turn.
    pub fn add_task_step(
        &mut self,
        task: TaskId,
    ) {
        self.steps.push(ScheduleStep::Task(task));
    }

    /// Record the error that ended the iteration.
    pub fn add_error_step(
        &mut self,
        message: impl Into<String>,
    ) {
        self.steps.push(ScheduleStep::Error(message.into()));
    }

    /// Record that the iteration completed.
    pub fn add_done_step(&mut self) {
        self.steps.push(ScheduleStep::Done);
    }

    /// The tasks that ran, in order.
    pub fn task_steps(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.steps.iter().filter_map(ScheduleStep::task)
    }

    /// The terminal step, if the iteration recorded one.
    pub fn outcome(&self) -> Option<&ScheduleStep> {
        self.steps.last().filter(|step| !step.is_task())
    }

    /// Serialize to the persisted JSON form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse the persisted JSON form.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Directory of persisted schedules, one `<seed>.json` file per seed.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    base: PathBuf,
}

impl ScheduleStore {
    /// Open a store rooted at `base`. Nothing is created until the first save.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The store's directory.
    #[inline]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the file for `seed`.
    pub fn path_for(
        &self,
        seed: i64,
    ) -> PathBuf {
        self.base.join(format!("{}.json", seed))
    }

    /// Remove schedules left behind by a previous run.
    ///
    /// Only files named `<seed>.json` are touched.
    pub fn prepare(&self) -> Result<usize> {
        let seeds = self.list_seeds()?;
        for seed in &seeds {
            let path = self.path_for(*seed);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(HarnessError::PersistenceFailed { path, source }),
            }
        }
        if !seeds.is_empty() {
            debug!(removed = seeds.len(), dir = %self.base.display(), "cleared stale schedules");
        }
        Ok(seeds.len())
    }

    /// Write `schedule`, creating the directory if needed.
    pub fn save(
        &self,
        schedule: &Schedule,
    ) -> Result<PathBuf> {
        let path = self.path_for(schedule.seed());
        fs::create_dir_all(&self.base).map_err(|source| HarnessError::PersistenceFailed {
            path: self.base.clone(),
            source,
        })?;
        let json = schedule.to_json().map_err(|e| HarnessError::PersistenceFailed {
            path: path.clone(),
            source: e.into(),
        })?;
        fs::write(&path, json).map_err(|source| HarnessError::PersistenceFailed {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Read the schedule stored for `seed`.
    pub fn load(
        &self,
        seed: i64,
    ) -> Result<Schedule> {
        load_file(&self.path_for(seed))
    }

    /// Seeds with a stored schedule, sorted.
    pub fn list_seeds(&self) -> Result<Vec<i64>> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HarnessError::PersistenceFailed {
                    path: self.base.clone(),
                    source,
                })
            }
        };

        let mut seeds = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| HarnessError::PersistenceFailed {
                path: self.base.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(seed) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            {
                seeds.push(seed);
            }
        }
        seeds.sort_unstable();
        Ok(seeds)
    }
}

/// Read a schedule file from an arbitrary path.
pub fn load_file(path: &Path) -> Result<Schedule> {
    let json = fs::read_to_string(path).map_err(|source| HarnessError::PersistenceFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Schedule::from_json(&json).map_err(|source| HarnessError::MalformedSchedule {
        path: path.to_path_buf(),
        source,
    })
}
