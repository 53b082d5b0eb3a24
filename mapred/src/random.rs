//! Deterministic per-task randomness.
//!
//! Every task derives its generator from its identifying coordinates plus an
//! optional user-supplied path of integers, so re-running an attempt
//! reproduces the same stream. The Mersenne Twister's ~20k-bit state admits
//! the whole multi-word seed directly, so high-dimensional coordinates do
//! not collide the way they would when folded into a small seed.

use rand_mt::Mt19937GenRand64;
use std::cell::Cell;

use crate::task::TaskCoord;

pub fn task_rng(coord: TaskCoord, attempt: u32, path: &[u64]) -> Mt19937GenRand64 {
    let mut key = Vec::with_capacity(3 + path.len());
    key.push(coord.dataset.raw());
    key.push(coord.split as u64);
    key.push(attempt as u64);
    key.extend_from_slice(path);
    Mt19937GenRand64::new_with_key(key)
}

thread_local! {
    static CURRENT_TASK: Cell<Option<(TaskCoord, u32)>> = const { Cell::new(None) };
}

/// Scopes the executing task's coordinates to the thread running its user
/// functions.
pub(crate) struct TaskScope;

impl TaskScope {
    pub(crate) fn enter(coord: TaskCoord, attempt: u32) -> Self {
        CURRENT_TASK.with(|cell| cell.set(Some((coord, attempt))));
        TaskScope
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        CURRENT_TASK.with(|cell| cell.set(None));
    }
}

/// The generator for the task currently executing on this thread, extended
/// with a user-supplied integer path. `None` outside a task.
pub fn current_task_rng(path: &[u64]) -> Option<Mt19937GenRand64> {
    CURRENT_TASK.with(|cell| cell.get()).map(|(coord, attempt)| task_rng(coord, attempt, path))
}
