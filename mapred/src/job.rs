//! The dataset-submission surface handed to the user program's `run`
//! method.
//!
//! `run` executes on a plain thread on the master; these methods bridge
//! onto the runtime and forward to the scheduler. Submission is
//! non-blocking; `wait` blocks until a dataset completes, the job aborts,
//! or the timeout elapses.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::codec::Record;
use crate::datasets::{DatasetKind, DatasetSpec};
use crate::http::{self, Fetcher};
use crate::program::MapReduce;
use crate::registry::{Registry, DEFAULT_PARTITIONER};
use crate::scheduler::{DatasetFetch, SchedulerClient};
use crate::serializer::Serializer;
use crate::store::BucketStore;
use crate::task::{DatasetId, InputSource};
use crate::MrResult;

/// Recognized dataset options.
#[derive(Debug, Clone)]
pub struct DataOpts {
    pub splits: u32,
    pub outdir: Option<PathBuf>,
    pub parter: Option<String>,
    pub combiner: Option<String>,
    pub key_serializer: Option<String>,
    pub value_serializer: Option<String>,
}

impl Default for DataOpts {
    fn default() -> Self {
        Self {
            splits: 1,
            outdir: None,
            parter: None,
            combiner: None,
            key_serializer: None,
            value_serializer: None,
        }
    }
}

impl DataOpts {
    pub fn splits(mut self, splits: u32) -> Self {
        self.splits = splits;
        self
    }

    pub fn outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = Some(outdir.into());
        self
    }

    pub fn parter(mut self, parter: impl Into<String>) -> Self {
        self.parter = Some(parter.into());
        self
    }

    pub fn combiner(mut self, combiner: impl Into<String>) -> Self {
        self.combiner = Some(combiner.into());
        self
    }

    pub fn key_serializer(mut self, name: impl Into<String>) -> Self {
        self.key_serializer = Some(name.into());
        self
    }

    pub fn value_serializer(mut self, name: impl Into<String>) -> Self {
        self.value_serializer = Some(name.into());
        self
    }
}

pub struct Job {
    handle: Handle,
    scheduler: SchedulerClient,
    store: Arc<BucketStore>,
    program: Arc<dyn MapReduce>,
    registry: Registry,
    fetcher: Fetcher,
}

impl Job {
    pub fn new(
        handle: Handle,
        scheduler: SchedulerClient,
        store: Arc<BucketStore>,
        program: Arc<dyn MapReduce>,
    ) -> Self {
        let registry = program.registry();
        Self { handle, scheduler, store, program, registry, fetcher: Fetcher::new() }
    }

    /// Define a dataset from a list of URLs, one split per URL.
    pub fn file_data(&mut self, urls: Vec<String>) -> MrResult<DatasetId> {
        let num_splits = urls.len().max(1) as u32;
        self.submit(DatasetSpec {
            kind: DatasetKind::FileUrls { urls },
            sources: vec![],
            num_splits,
            output_dir: None,
            parter: DEFAULT_PARTITIONER.into(),
            combiner: None,
            key_serializer: None,
            value_serializer: None,
        })
    }

    /// Define a dataset built from a local iterator: partitioned here on
    /// the master and served from its bucket store. An empty iterator
    /// yields a complete dataset with zero tasks.
    pub fn local_data<I>(&mut self, data: I, opts: DataOpts) -> MrResult<DatasetId>
    where
        I: IntoIterator<Item = Record>,
    {
        let parter_name = opts.parter.clone().unwrap_or_else(|| DEFAULT_PARTITIONER.into());
        let parter = self
            .registry
            .partitioner(&parter_name)
            .ok_or_else(|| eyre!("unknown partitioner `{parter_name}`"))?;

        let id = self.submit(DatasetSpec {
            kind: DatasetKind::Local { buckets: vec![], advertised: false },
            sources: vec![],
            num_splits: opts.splits,
            output_dir: opts.outdir.clone(),
            parter: parter_name,
            combiner: None,
            key_serializer: opts.key_serializer.clone(),
            value_serializer: opts.value_serializer.clone(),
        })?;

        let records: Vec<Record> = data.into_iter().collect();
        let urls = if records.is_empty() {
            Vec::new()
        } else {
            let mut writers = self.store.task_writers(id, 0, 1, opts.splits)?;
            for (key, value) in records {
                let split = parter.partition(&key, opts.splits);
                writers.write(split, &key, &value)?;
            }
            writers.seal()?
        };
        self.scheduler.advertise_local(id, urls)?;
        Ok(id)
    }

    /// Define a dataset computed by a map operation over `input`.
    pub fn map_data(
        &mut self,
        input: DatasetId,
        mapper: &str,
        opts: DataOpts,
    ) -> MrResult<DatasetId> {
        if self.registry.mapper(mapper).is_none() {
            bail!("unknown mapper `{mapper}`");
        }
        self.submit_computed(DatasetKind::Map { mapper: mapper.into() }, input, opts)
    }

    /// Define a dataset computed by a reduce operation over `input`.
    pub fn reduce_data(
        &mut self,
        input: DatasetId,
        reducer: &str,
        opts: DataOpts,
    ) -> MrResult<DatasetId> {
        if self.registry.reducer(reducer).is_none() {
            bail!("unknown reducer `{reducer}`");
        }
        self.submit_computed(DatasetKind::Reduce { reducer: reducer.into() }, input, opts)
    }

    /// Define a fused reduce-then-map dataset over `input`.
    pub fn reducemap_data(
        &mut self,
        input: DatasetId,
        reducer: &str,
        mapper: &str,
        opts: DataOpts,
    ) -> MrResult<DatasetId> {
        if self.registry.reducer(reducer).is_none() {
            bail!("unknown reducer `{reducer}`");
        }
        if self.registry.mapper(mapper).is_none() {
            bail!("unknown mapper `{mapper}`");
        }
        self.submit_computed(
            DatasetKind::ReduceMap { reducer: reducer.into(), mapper: mapper.into() },
            input,
            opts,
        )
    }

    fn submit_computed(
        &mut self,
        kind: DatasetKind,
        input: DatasetId,
        opts: DataOpts,
    ) -> MrResult<DatasetId> {
        let parter = opts.parter.unwrap_or_else(|| DEFAULT_PARTITIONER.into());
        if self.registry.partitioner(&parter).is_none() {
            bail!("unknown partitioner `{parter}`");
        }
        if let Some(combiner) = &opts.combiner {
            if self.registry.reducer(combiner).is_none() {
                bail!("unknown combiner `{combiner}`");
            }
        }
        self.submit(DatasetSpec {
            kind,
            sources: vec![input],
            num_splits: opts.splits,
            output_dir: opts.outdir,
            parter,
            combiner: opts.combiner,
            key_serializer: opts.key_serializer,
            value_serializer: opts.value_serializer,
        })
    }

    fn submit(&mut self, spec: DatasetSpec) -> MrResult<DatasetId> {
        self.handle.block_on(self.scheduler.submit(spec))
    }

    /// Block until at least one of `ids` completes or the timeout elapses;
    /// returns the complete subset. Errors with [`crate::JobAborted`] if
    /// the job aborted.
    pub fn wait(
        &mut self,
        ids: &[DatasetId],
        timeout: Option<Duration>,
    ) -> MrResult<Vec<DatasetId>> {
        self.handle.block_on(self.scheduler.wait(ids.to_vec(), timeout))
    }

    /// Fraction of `id`'s tasks that are complete.
    pub fn progress(&mut self, id: DatasetId) -> MrResult<f64> {
        self.handle.block_on(self.scheduler.progress(id))
    }

    /// Mark `id` closed; its buckets are collected once no open consumer
    /// remains. Closing an already-closed dataset is a no-op.
    pub fn close(&mut self, id: DatasetId) -> MrResult<()> {
        self.handle.block_on(self.scheduler.close(id))
    }

    /// Download the whole dataset: splits concatenated in order, records in
    /// natural emission order within a split.
    pub fn fetchall(&mut self, id: DatasetId) -> MrResult<Vec<Record>> {
        let meta = self.dataset_meta(id)?;
        let (key_s, value_s) = self.serializers(&meta)?;
        let mut records = Vec::new();
        for column in &meta.columns {
            let mut batch = self.fetch_column(column, key_s.as_ref(), value_s.as_ref())?;
            records.append(&mut batch);
        }
        Ok(records)
    }

    /// A lazy finite sequence over the dataset's records, fetching one
    /// split at a time.
    pub fn data(&mut self, id: DatasetId) -> MrResult<DataIter<'_>> {
        let meta = self.dataset_meta(id)?;
        let (key_s, value_s) = self.serializers(&meta)?;
        Ok(DataIter {
            job: self,
            columns: meta.columns.into(),
            current: Vec::new().into_iter(),
            key_serializer: key_s,
            value_serializer: value_s,
        })
    }

    fn dataset_meta(&mut self, id: DatasetId) -> MrResult<DatasetFetch> {
        self.handle
            .block_on(self.scheduler.fetch_meta(id))?
            .ok_or_else(|| eyre!("dataset d{id} is not complete (or already collected)"))
    }

    fn serializers(
        &self,
        meta: &DatasetFetch,
    ) -> MrResult<(Option<Serializer>, Option<Serializer>)> {
        let resolve = |name: &Option<String>| -> MrResult<Option<Serializer>> {
            match name {
                Some(name) => self
                    .program
                    .serializer(name)
                    .map(Some)
                    .ok_or_else(|| eyre!("unknown serializer `{name}`")),
                None => Ok(None),
            }
        };
        Ok((resolve(&meta.key_serializer)?, resolve(&meta.value_serializer)?))
    }

    fn fetch_column(
        &mut self,
        column: &[InputSource],
        key_serializer: Option<&Serializer>,
        value_serializer: Option<&Serializer>,
    ) -> MrResult<Vec<Record>> {
        self.handle
            .block_on(http::fetch_records(
                &self.fetcher,
                column,
                key_serializer,
                value_serializer,
            ))
            .map_err(|failure| eyre!("{failure}"))
    }
}

/// Iterator over a complete dataset's records, split by split.
pub struct DataIter<'a> {
    job: &'a mut Job,
    columns: VecDeque<Vec<InputSource>>,
    current: std::vec::IntoIter<Record>,
    key_serializer: Option<Serializer>,
    value_serializer: Option<Serializer>,
}

impl Iterator for DataIter<'_> {
    type Item = MrResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            let column = self.columns.pop_front()?;
            match self.job.fetch_column(
                &column,
                self.key_serializer.as_ref(),
                self.value_serializer.as_ref(),
            ) {
                Ok(records) => self.current = records.into_iter(),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
