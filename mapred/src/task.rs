//! Task model: the schedulable unit is one output split of a dataset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

crate::newtype_id!(DatasetId);
crate::newtype_id!(SlaveId);
crate::newtype_id!(JobId);

/// Coordinates identifying a task within a job.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskCoord {
    pub dataset: DatasetId,
    pub split: u32,
}

impl TaskCoord {
    pub fn new(dataset: DatasetId, split: u32) -> Self {
        Self { dataset, split }
    }
}

impl fmt::Display for TaskCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}/t{}", self.dataset, self.split)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Complete,
    FailedFatal,
}

/// Master-side bookkeeping for one task.
///
/// `attempt` counts executions of this task (1-based) and increments only
/// when an attempt fails through the task's own fault; reassignment after a
/// lost slave keeps the count. `generation` increments every time a completed
/// attempt is invalidated and the task re-runs, so consumers can tell stale
/// inputs apart from fresh ones.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub state: TaskState,
    pub attempt: u32,
    pub generation: u32,
    pub assigned_to: Option<SlaveId>,
    /// One bucket URL per output split, set on completion.
    pub outputs: Vec<String>,
    /// FIFO age: the tick at which the task last became ready.
    pub queue_seq: u64,
}

impl TaskEntry {
    pub fn pending(queue_seq: u64) -> Self {
        Self {
            state: TaskState::Pending,
            attempt: 1,
            generation: 0,
            assigned_to: None,
            outputs: Vec::new(),
            queue_seq,
        }
    }

    /// A synthetic entry for source datasets whose data exists up front.
    pub fn complete() -> Self {
        Self {
            state: TaskState::Complete,
            attempt: 1,
            generation: 0,
            assigned_to: None,
            outputs: Vec::new(),
            queue_seq: 0,
        }
    }
}

/// How records in an input bucket are framed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputFormat {
    /// Plain text split on newlines; keys are line numbers.
    Lines,
    /// The length-prefixed bucket record stream.
    Records,
}

/// One input bucket feeding a task, addressed by its producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSource {
    pub dataset: DatasetId,
    /// Index of the producing task within its dataset.
    pub source: u32,
    pub url: String,
    pub format: InputFormat,
}

/// The user-function identifiers a task resolves against the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOp {
    Map { mapper: String },
    Reduce { reducer: String },
    /// Fused reduce-then-map: elides a round of disk and network between the
    /// two phases.
    ReduceMap { reducer: String, mapper: String },
}

/// Everything a slave needs to execute one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub job: JobId,
    pub coord: TaskCoord,
    pub attempt: u32,
    pub generation: u32,
    pub op: TaskOp,
    pub inputs: Vec<InputSource>,
    /// How many buckets the task partitions its output into (the dataset's
    /// own split count).
    pub output_splits: u32,
    /// Set when the inputs span the parent's whole output instead of one
    /// column: keep only records this task's split owns, judged by the
    /// named partitioner over `output_splits`.
    pub input_filter: Option<String>,
    pub parter: String,
    pub combiner: Option<String>,
    pub key_serializer: Option<String>,
    pub value_serializer: Option<String>,
    pub input_key_serializer: Option<String>,
    pub input_value_serializer: Option<String>,
    pub output_dir: Option<PathBuf>,
}
