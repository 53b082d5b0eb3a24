//! A lightweight master/slave MapReduce runtime.
//!
//! A user program implements [`program::MapReduce`] and hands itself to
//! [`driver::run_main`]. The same binary runs as the master (hosting the
//! scheduler and the job driver) or as a slave (executing tasks and serving
//! buckets over HTTP), selected by `--mrs`.

mod codec;
mod random;

pub mod config;
pub mod datasets;
pub mod driver;
pub mod error;
pub mod http;
pub mod job;
pub mod master;
pub mod program;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod serializer;
pub mod slave;
pub mod store;
pub mod task;

pub use codec::{Record, RecordReader, RecordWriter};
pub use error::{JobAborted, MrError, MrResult, SubmitError, TaskFailure};
pub use job::{DataOpts, Job};
pub use program::MapReduce;
pub use random::{current_task_rng, task_rng};
pub use registry::Registry;
pub use task::{DatasetId, JobId, SlaveId, TaskCoord};

#[macro_use]
extern crate eyre;

#[macro_use]
extern crate tracing;

/// Serde-transparent u64 id wrapper, in the style of the scheduler's other
/// index newtypes.
#[macro_export]
macro_rules! newtype_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Copy,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}
