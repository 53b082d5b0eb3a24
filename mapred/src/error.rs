//! Error types: `eyre` for propagation, small typed enums where callers
//! need to match on the cause.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::task::DatasetId;

pub type MrResult<T> = Result<T, MrError>;

pub type MrError = eyre::Report;

/// Errors surfaced synchronously from dataset submission. They affect only
/// the submitted dataset, never the rest of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitError {
    UnknownParent(DatasetId),
    ClosedParent(DatasetId),
    InvalidSplits(u32),
    JobAborted,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::UnknownParent(id) => write!(f, "unknown parent dataset d{id}"),
            SubmitError::ClosedParent(id) => write!(f, "parent dataset d{id} is closed"),
            SubmitError::InvalidSplits(n) => write!(f, "invalid split count {n}"),
            SubmitError::JobAborted => write!(f, "job aborted"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Why a task attempt failed, as reported by the executing slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskFailure {
    /// The user function returned an error (or panicked).
    UserError(String),
    /// A wire name did not resolve against the program's registry.
    UnknownFunction(String),
    /// A serializer rejected a key or value, or a bucket stream was corrupt.
    Serialization(String),
    /// An input bucket answered 404/410 or the producer was unreachable.
    /// The producer must re-run; this is not the reporting task's fault.
    InputMissing { dataset: DatasetId, source: u32 },
    Io(String),
}

impl TaskFailure {
    /// Input-missing failures re-run the producer instead of burning one of
    /// the reporting task's attempts.
    pub fn counts_against_task(&self) -> bool {
        !matches!(self, TaskFailure::InputMissing { .. })
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::UserError(msg) => write!(f, "user function failed: {msg}"),
            TaskFailure::UnknownFunction(name) => write!(f, "unknown function name `{name}`"),
            TaskFailure::Serialization(msg) => write!(f, "serialization error: {msg}"),
            TaskFailure::InputMissing { dataset, source } => {
                write!(f, "input bucket from d{dataset} task {source} is missing")
            }
            TaskFailure::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::error::Error for TaskFailure {}

/// Returned from `wait` when the scheduler has aborted the job.
#[derive(Debug, Clone)]
pub struct JobAborted {
    pub reason: String,
}

impl fmt::Display for JobAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job aborted: {}", self.reason)
    }
}

impl std::error::Error for JobAborted {}
