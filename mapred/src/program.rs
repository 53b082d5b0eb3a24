//! The user-program surface.
//!
//! A program is constructed once per process on both master and slaves with
//! identical arguments (the master ships its arguments in the slave
//! bootstrap), registers its functions, and drives the job from `run` on the
//! master.

use crate::error::MrResult;
use crate::job::Job;
use crate::registry::Registry;
use crate::serializer::{self, Serializer};

pub trait MapReduce: Send + Sync + 'static {
    /// Build the table of named callables. Called once per process at
    /// startup; must be identical on master and slaves.
    fn registry(&self) -> Registry;

    /// The job's driving method, invoked on the master. Submits datasets,
    /// waits on them, and reads results through `job`.
    fn run(&self, job: &mut Job) -> MrResult<()>;

    /// Resolve a named serializer. The built-ins `raw`, `str` and `int` are
    /// always available; programs may override to add their own.
    fn serializer(&self, name: &str) -> Option<Serializer> {
        serializer::builtin(name)
    }
}
