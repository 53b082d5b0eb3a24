//! Runs one task attempt: resolve names, fetch inputs, apply the user
//! functions, write and seal output buckets.
//!
//! Fetching is async; the user functions are opaque blocking code and run
//! on a blocking thread together with the bucket writes.

use std::fs;
use std::sync::Arc;

use crate::codec::Record;
use crate::error::TaskFailure;
use crate::http;
use crate::program::MapReduce;
use crate::registry::{Mapper, Partitioner, Reducer, Registry};
use crate::serializer::Serializer;
use crate::store::{BucketStore, TaskWriters};
use crate::task::{TaskDescriptor, TaskOp};

use super::SlaveNode;

enum ResolvedOp {
    Map(Arc<dyn Mapper>),
    Reduce(Arc<dyn Reducer>),
    ReduceMap(Arc<dyn Reducer>, Arc<dyn Mapper>),
}

struct Resolved {
    op: ResolvedOp,
    parter: Arc<dyn Partitioner>,
    combiner: Option<Arc<dyn Reducer>>,
    key_serializer: Option<Serializer>,
    value_serializer: Option<Serializer>,
    input_key_serializer: Option<Serializer>,
    input_value_serializer: Option<Serializer>,
}

#[instrument(skip_all, fields(task = %desc.coord, attempt = desc.attempt))]
pub(super) async fn execute(
    node: &SlaveNode,
    desc: &TaskDescriptor,
) -> Result<Vec<String>, TaskFailure> {
    let resolved = resolve(node.registry(), node.program(), desc)?;
    let mut inputs = http::fetch_records(
        node.fetcher(),
        &desc.inputs,
        resolved.input_key_serializer.as_ref(),
        resolved.input_value_serializer.as_ref(),
    )
    .await?;

    // Inputs spanning the parent's whole output: keep only the keys this
    // split owns.
    if let Some(name) = &desc.input_filter {
        let parter = node
            .registry()
            .partitioner(name)
            .ok_or_else(|| TaskFailure::UnknownFunction(name.clone()))?;
        let (split, splits) = (desc.coord.split, desc.output_splits);
        inputs.retain(|(key, _)| parter.partition(key, splits) == split);
    }

    let store = Arc::clone(node.store());
    let desc = desc.clone();
    match tokio::task::spawn_blocking(move || compute(&store, &desc, resolved, inputs)).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => {
            Err(TaskFailure::UserError("user function panicked".into()))
        }
        Err(_) => Err(TaskFailure::Io("task cancelled".into())),
    }
}

fn resolve(
    registry: &Registry,
    program: &dyn MapReduce,
    desc: &TaskDescriptor,
) -> Result<Resolved, TaskFailure> {
    let unknown = |name: &str| TaskFailure::UnknownFunction(name.to_string());

    let op = match &desc.op {
        TaskOp::Map { mapper } => {
            ResolvedOp::Map(registry.mapper(mapper).ok_or_else(|| unknown(mapper))?)
        }
        TaskOp::Reduce { reducer } => {
            ResolvedOp::Reduce(registry.reducer(reducer).ok_or_else(|| unknown(reducer))?)
        }
        TaskOp::ReduceMap { reducer, mapper } => ResolvedOp::ReduceMap(
            registry.reducer(reducer).ok_or_else(|| unknown(reducer))?,
            registry.mapper(mapper).ok_or_else(|| unknown(mapper))?,
        ),
    };
    let parter = registry.partitioner(&desc.parter).ok_or_else(|| unknown(&desc.parter))?;
    let combiner = match &desc.combiner {
        Some(name) => Some(registry.reducer(name).ok_or_else(|| unknown(name))?),
        None => None,
    };

    let serializer = |name: &Option<String>| -> Result<Option<Serializer>, TaskFailure> {
        match name {
            Some(name) => Ok(Some(program.serializer(name).ok_or_else(|| unknown(name))?)),
            None => Ok(None),
        }
    };

    Ok(Resolved {
        op,
        parter,
        combiner,
        key_serializer: serializer(&desc.key_serializer)?,
        value_serializer: serializer(&desc.value_serializer)?,
        input_key_serializer: serializer(&desc.input_key_serializer)?,
        input_value_serializer: serializer(&desc.input_value_serializer)?,
    })
}

/// Routes emitted pairs through the serializers and the partitioner into
/// the attempt's bucket writers. User functions emit through `FnMut`
/// callbacks, so failures are latched here and surfaced after the call.
struct Sink<'a> {
    writers: &'a mut TaskWriters,
    parter: &'a dyn Partitioner,
    key_serializer: Option<&'a Serializer>,
    value_serializer: Option<&'a Serializer>,
    error: Option<TaskFailure>,
}

impl Sink<'_> {
    fn emit(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if self.error.is_some() {
            return;
        }
        match encode(self.key_serializer, self.value_serializer, key, value) {
            Ok((key, value)) => {
                let split = self.parter.partition(&key, self.writers.splits());
                self.write_to(split, &key, &value);
            }
            Err(failure) => self.error = Some(failure),
        }
    }

    /// Write an already-encoded pair into a fixed split.
    fn write_to(&mut self, split: u32, key: &[u8], value: &[u8]) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.writers.write(split, key, value) {
            self.error = Some(TaskFailure::Io(err.to_string()));
        }
    }

    fn finish(self) -> Result<(), TaskFailure> {
        match self.error {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

fn encode(
    key_serializer: Option<&Serializer>,
    value_serializer: Option<&Serializer>,
    key: Vec<u8>,
    value: Vec<u8>,
) -> Result<Record, TaskFailure> {
    let key = match key_serializer {
        Some(s) => s
            .dumps(&key)
            .map_err(|err| TaskFailure::Serialization(format!("{err:#}")))?,
        None => key,
    };
    let value = match value_serializer {
        Some(s) => s
            .dumps(&value)
            .map_err(|err| TaskFailure::Serialization(format!("{err:#}")))?,
        None => value,
    };
    Ok((key, value))
}

fn user_error(err: crate::MrError) -> TaskFailure {
    TaskFailure::UserError(format!("{err:#}"))
}

fn compute(
    store: &Arc<BucketStore>,
    desc: &TaskDescriptor,
    resolved: Resolved,
    inputs: Vec<Record>,
) -> Result<Vec<String>, TaskFailure> {
    // User functions can draw task-deterministic randomness while we hold
    // this scope.
    let _rng_scope = crate::random::TaskScope::enter(desc.coord, desc.attempt);
    let mut writers = store
        .task_writers(
            desc.coord.dataset,
            desc.coord.split,
            desc.attempt,
            desc.output_splits,
        )
        .map_err(|err| TaskFailure::Io(format!("{err:#}")))?;

    let outcome = {
        let mut sink = Sink {
            writers: &mut writers,
            parter: resolved.parter.as_ref(),
            key_serializer: resolved.key_serializer.as_ref(),
            value_serializer: resolved.value_serializer.as_ref(),
            error: None,
        };
        let result = match &resolved.op {
            ResolvedOp::Map(mapper) => match &resolved.combiner {
                Some(combiner) => {
                    run_map_combined(mapper.as_ref(), combiner.as_ref(), inputs, &mut sink)
                }
                None => run_map(mapper.as_ref(), inputs, &mut sink),
            },
            ResolvedOp::Reduce(reducer) => run_reduce(reducer.as_ref(), inputs, &mut sink),
            ResolvedOp::ReduceMap(reducer, mapper) => {
                run_reducemap(reducer.as_ref(), mapper.as_ref(), inputs, &mut sink)
            }
        };
        result.and(sink.finish())
    };

    match outcome {
        Ok(()) => {
            let urls = writers.seal().map_err(|err| TaskFailure::Io(format!("{err:#}")))?;
            if let Some(outdir) = &desc.output_dir {
                persist(store, desc, outdir).map_err(|err| TaskFailure::Io(err.to_string()))?;
            }
            Ok(urls)
        }
        Err(failure) => {
            writers.discard();
            Err(failure)
        }
    }
}

fn run_map(mapper: &dyn Mapper, inputs: Vec<Record>, sink: &mut Sink<'_>) -> Result<(), TaskFailure> {
    for (key, value) in inputs {
        mapper
            .map(&key, &value, &mut |k, v| sink.emit(k, v))
            .map_err(user_error)?;
    }
    Ok(())
}

/// Map with a combiner: buffer per output bucket, then shrink each bucket
/// with the combiner before flushing. Combined pairs stay in their bucket.
fn run_map_combined(
    mapper: &dyn Mapper,
    combiner: &dyn Reducer,
    inputs: Vec<Record>,
    sink: &mut Sink<'_>,
) -> Result<(), TaskFailure> {
    let splits = sink.writers.splits();
    let mut buffers: Vec<Vec<Record>> = vec![Vec::new(); splits as usize];
    for (key, value) in inputs {
        let mut failure = None;
        mapper
            .map(&key, &value, &mut |k, v| {
                if failure.is_some() {
                    return;
                }
                match encode(sink.key_serializer, sink.value_serializer, k, v) {
                    Ok((k, v)) => {
                        let split = sink.parter.partition(&k, splits);
                        buffers[split as usize].push((k, v));
                    }
                    Err(err) => failure = Some(err),
                }
            })
            .map_err(user_error)?;
        if let Some(failure) = failure {
            return Err(failure);
        }
    }

    for (split, bucket) in buffers.into_iter().enumerate() {
        group_sorted(bucket, |key, values| {
            combiner
                .reduce(key, values, &mut |k, v| sink.write_to(split as u32, &k, &v))
                .map_err(user_error)
        })?;
    }
    Ok(())
}

fn run_reduce(
    reducer: &dyn Reducer,
    inputs: Vec<Record>,
    sink: &mut Sink<'_>,
) -> Result<(), TaskFailure> {
    group_sorted(inputs, |key, values| {
        reducer
            .reduce(key, values, &mut |k, v| sink.emit(k, v))
            .map_err(user_error)
    })
}

/// Fused reduce-then-map: each reduced pair goes through the mapper before
/// partitioning, skipping a round of disk and network.
fn run_reducemap(
    reducer: &dyn Reducer,
    mapper: &dyn Mapper,
    inputs: Vec<Record>,
    sink: &mut Sink<'_>,
) -> Result<(), TaskFailure> {
    group_sorted(inputs, |key, values| {
        let mut reduced = Vec::new();
        reducer
            .reduce(key, values, &mut |k, v| reduced.push((k, v)))
            .map_err(user_error)?;
        for (key, value) in reduced {
            mapper
                .map(&key, &value, &mut |k, v| sink.emit(k, v))
                .map_err(user_error)?;
        }
        Ok(())
    })
}

/// Sort-merge grouping: values for a key are delivered together, each key
/// seen exactly once. The sort is stable, so values keep emission order.
fn group_sorted(
    mut records: Vec<Record>,
    mut each: impl FnMut(&[u8], &mut dyn Iterator<Item = Vec<u8>>) -> Result<(), TaskFailure>,
) -> Result<(), TaskFailure> {
    records.sort_by(|a, b| a.0.cmp(&b.0));
    let mut iter = records.into_iter().peekable();
    while let Some((key, first)) = iter.next() {
        let mut values = vec![first];
        while iter.peek().map(|(k, _)| *k == key).unwrap_or(false) {
            values.push(iter.next().unwrap().1);
        }
        each(&key, &mut values.into_iter())?;
    }
    Ok(())
}

/// Copy sealed buckets into the dataset's permanent output directory.
fn persist(
    store: &Arc<BucketStore>,
    desc: &TaskDescriptor,
    outdir: &std::path::Path,
) -> std::io::Result<()> {
    fs::create_dir_all(outdir)?;
    for split in 0..desc.output_splits {
        if let Some(path) = store.bucket_path(desc.coord.dataset, desc.coord.split, split) {
            let target = outdir.join(format!(
                "source_{}_split_{}.bucket",
                desc.coord.split, split
            ));
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}
