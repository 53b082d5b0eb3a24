//! The dataset dependency graph.
//!
//! Datasets are immutable once submitted. A dataset is a two-dimensional
//! arrangement of buckets: one row per producing task, one column per output
//! split. A task for split `i` of a dataset consumes column `i` of each of
//! its parents and partitions what it emits into one bucket per consumer
//! split. The graph is owned exclusively by the scheduler; everything else
//! goes through scheduler operations.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::error::SubmitError;
use crate::task::{DatasetId, InputFormat, InputSource, TaskEntry, TaskOp, TaskState};

#[derive(Debug, Clone)]
pub enum DatasetKind {
    /// URL-addressable input files, one split per URL. Complete on
    /// submission.
    FileUrls { urls: Vec<String> },
    /// Data partitioned on the master and served from its bucket store.
    /// Complete as soon as the buckets are advertised; an empty iterable
    /// advertises zero buckets and therefore has zero tasks.
    Local { buckets: Vec<String>, advertised: bool },
    Map { mapper: String },
    Reduce { reducer: String },
    ReduceMap { reducer: String, mapper: String },
}

impl DatasetKind {
    pub fn is_source(&self) -> bool {
        matches!(self, DatasetKind::FileUrls { .. } | DatasetKind::Local { .. })
    }

    pub fn task_op(&self) -> Option<TaskOp> {
        match self {
            DatasetKind::FileUrls { .. } | DatasetKind::Local { .. } => None,
            DatasetKind::Map { mapper } => Some(TaskOp::Map { mapper: mapper.clone() }),
            DatasetKind::Reduce { reducer } => {
                Some(TaskOp::Reduce { reducer: reducer.clone() })
            }
            DatasetKind::ReduceMap { reducer, mapper } => Some(TaskOp::ReduceMap {
                reducer: reducer.clone(),
                mapper: mapper.clone(),
            }),
        }
    }
}

/// A dataset submission. Validated and frozen into a [`Dataset`] node.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub kind: DatasetKind,
    pub sources: Vec<DatasetId>,
    pub num_splits: u32,
    pub output_dir: Option<PathBuf>,
    pub parter: String,
    pub combiner: Option<String>,
    pub key_serializer: Option<String>,
    pub value_serializer: Option<String>,
}

#[derive(Debug)]
pub struct Dataset {
    pub id: DatasetId,
    pub kind: DatasetKind,
    pub sources: Vec<DatasetId>,
    pub num_splits: u32,
    pub output_dir: Option<PathBuf>,
    pub parter: String,
    pub combiner: Option<String>,
    pub key_serializer: Option<String>,
    pub value_serializer: Option<String>,
    pub closed: bool,
    pub complete: bool,
    pub tasks: Vec<TaskEntry>,
    pub tasks_made: bool,
}

impl Dataset {
    pub fn ntasks(&self) -> usize {
        match &self.kind {
            DatasetKind::FileUrls { urls } => urls.len(),
            DatasetKind::Local { buckets, .. } => buckets.len(),
            _ => self.num_splits as usize,
        }
    }

    pub fn complete_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.state == TaskState::Complete).count()
    }

    /// How many buckets wide this dataset's output is. Computed datasets
    /// partition every task's output into their own split count; a consumer
    /// with a different task count re-shards by partitioner instead of
    /// reading columns.
    pub fn bucket_columns(&self) -> u32 {
        match &self.kind {
            DatasetKind::FileUrls { urls } => urls.len() as u32,
            DatasetKind::Local { buckets, .. } => buckets.len() as u32,
            _ => self.num_splits,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.complete {
            return 1.0;
        }
        let total = self.ntasks();
        if total == 0 {
            if self.tasks_made { 1.0 } else { 0.0 }
        } else {
            self.complete_tasks() as f64 / total as f64
        }
    }

    /// The input buckets feeding split `split` of a consumer: every
    /// producing row's bucket in column `split`.
    pub fn column(&self, split: u32) -> Vec<InputSource> {
        match &self.kind {
            DatasetKind::FileUrls { urls } => urls
                .get(split as usize)
                .map(|url| InputSource {
                    dataset: self.id,
                    source: split,
                    url: url.clone(),
                    format: InputFormat::Lines,
                })
                .into_iter()
                .collect(),
            DatasetKind::Local { buckets, .. } => buckets
                .get(split as usize)
                .map(|url| InputSource {
                    dataset: self.id,
                    source: 0,
                    url: url.clone(),
                    format: InputFormat::Records,
                })
                .into_iter()
                .collect(),
            _ => self
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.state == TaskState::Complete)
                .filter_map(|(source, entry)| {
                    entry.outputs.get(split as usize).map(|url| InputSource {
                        dataset: self.id,
                        source: source as u32,
                        url: url.clone(),
                        format: InputFormat::Records,
                    })
                })
                .collect(),
        }
    }

    /// All columns in split order, for `fetchall`.
    pub fn columns(&self) -> Vec<Vec<InputSource>> {
        (0..self.bucket_columns()).map(|split| self.column(split)).collect()
    }

    /// Every bucket of the dataset, row by row (the re-sharding read path).
    pub fn all_buckets(&self) -> Vec<InputSource> {
        (0..self.bucket_columns()).flat_map(|split| self.column(split)).collect()
    }
}

#[derive(Default)]
pub struct DatasetGraph {
    pub datasets: BTreeMap<DatasetId, Dataset>,
    /// Consumer lists, keyed by parent.
    pub dependents: HashMap<DatasetId, Vec<DatasetId>>,
    next_id: u64,
}

impl DatasetGraph {
    pub fn submit(&mut self, spec: DatasetSpec) -> Result<DatasetId, SubmitError> {
        if spec.num_splits == 0 {
            return Err(SubmitError::InvalidSplits(spec.num_splits));
        }
        for parent in &spec.sources {
            let ds = self
                .datasets
                .get(parent)
                .ok_or(SubmitError::UnknownParent(*parent))?;
            if ds.closed {
                return Err(SubmitError::ClosedParent(*parent));
            }
        }

        let id = DatasetId::new(self.next_id);
        self.next_id += 1;

        let complete = matches!(&spec.kind, DatasetKind::FileUrls { .. });
        let tasks = match &spec.kind {
            DatasetKind::FileUrls { urls } => urls.iter().map(|_| TaskEntry::complete()).collect(),
            _ => Vec::new(),
        };
        let tasks_made = complete;

        for parent in &spec.sources {
            self.dependents.entry(*parent).or_default().push(id);
        }

        self.datasets.insert(
            id,
            Dataset {
                id,
                kind: spec.kind,
                sources: spec.sources,
                num_splits: spec.num_splits,
                output_dir: spec.output_dir,
                parter: spec.parter,
                combiner: spec.combiner,
                key_serializer: spec.key_serializer,
                value_serializer: spec.value_serializer,
                closed: false,
                complete,
                tasks,
                tasks_made,
            },
        );
        Ok(id)
    }

    /// Mark a local dataset's buckets as partitioned and advertised; the
    /// dataset is complete from here on.
    pub fn advertise_local(&mut self, id: DatasetId, bucket_urls: Vec<String>) {
        if let Some(ds) = self.datasets.get_mut(&id) {
            if let DatasetKind::Local { buckets, advertised } = &mut ds.kind {
                *buckets = bucket_urls;
                *advertised = true;
                ds.tasks = buckets.iter().map(|_| TaskEntry::complete()).collect();
                ds.tasks_made = true;
                ds.complete = true;
            }
        }
    }

    pub fn get(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.get(&id)
    }

    pub fn get_mut(&mut self, id: DatasetId) -> Option<&mut Dataset> {
        self.datasets.get_mut(&id)
    }

    pub fn dependents_of(&self, id: DatasetId) -> &[DatasetId] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parents_complete(&self, id: DatasetId) -> bool {
        let Some(ds) = self.datasets.get(&id) else { return false };
        ds.sources
            .iter()
            .all(|parent| self.datasets.get(parent).map(|p| p.complete).unwrap_or(false))
    }

    /// Materialize tasks for every newly-runnable computed dataset. Each
    /// task starts pending with a fresh FIFO age drawn from `seq`.
    pub fn materialize_ready(&mut self, seq: &mut u64) -> Vec<DatasetId> {
        let ready: Vec<DatasetId> = self
            .datasets
            .values()
            .filter(|ds| {
                !ds.kind.is_source() && !ds.tasks_made && !ds.closed && !ds.complete
            })
            .map(|ds| ds.id)
            .filter(|id| self.parents_complete(*id))
            .collect();

        for id in &ready {
            let ds = self.datasets.get_mut(id).unwrap();
            ds.tasks = (0..ds.num_splits)
                .map(|_| {
                    *seq += 1;
                    TaskEntry::pending(*seq)
                })
                .collect();
            ds.tasks_made = true;
        }
        ready
    }

    /// Drop a dataset node, unlinking it from its parents' consumer lists.
    pub fn remove(&mut self, id: DatasetId) -> Option<Dataset> {
        let ds = self.datasets.remove(&id)?;
        for parent in &ds.sources {
            if let Some(deps) = self.dependents.get_mut(parent) {
                deps.retain(|d| *d != id);
            }
        }
        self.dependents.remove(&id);
        Some(ds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DEFAULT_PARTITIONER;

    fn spec(kind: DatasetKind, sources: Vec<DatasetId>, num_splits: u32) -> DatasetSpec {
        DatasetSpec {
            kind,
            sources,
            num_splits,
            output_dir: None,
            parter: DEFAULT_PARTITIONER.into(),
            combiner: None,
            key_serializer: None,
            value_serializer: None,
        }
    }

    fn file_spec(urls: &[&str]) -> DatasetSpec {
        spec(
            DatasetKind::FileUrls { urls: urls.iter().map(|u| u.to_string()).collect() },
            vec![],
            urls.len() as u32,
        )
    }

    fn map_spec(input: DatasetId, splits: u32) -> DatasetSpec {
        spec(DatasetKind::Map { mapper: "m".into() }, vec![input], splits)
    }

    #[test]
    fn submission_validates_splits_and_parents() {
        let mut graph = DatasetGraph::default();
        assert_eq!(
            graph.submit(spec(DatasetKind::Map { mapper: "m".into() }, vec![], 0)),
            Err(SubmitError::InvalidSplits(0))
        );
        assert_eq!(
            graph.submit(map_spec(DatasetId::new(9), 1)),
            Err(SubmitError::UnknownParent(DatasetId::new(9)))
        );

        let files = graph.submit(file_spec(&["file:///a"])).unwrap();
        graph.get_mut(files).unwrap().closed = true;
        assert_eq!(graph.submit(map_spec(files, 1)), Err(SubmitError::ClosedParent(files)));
    }

    #[test]
    fn file_sources_are_complete_on_submission() {
        let mut graph = DatasetGraph::default();
        let files = graph.submit(file_spec(&["file:///a", "file:///b"])).unwrap();
        let ds = graph.get(files).unwrap();
        assert!(ds.complete);
        assert_eq!(ds.ntasks(), 2);
        assert_eq!(ds.progress(), 1.0);

        let column = ds.column(1);
        assert_eq!(column.len(), 1);
        assert_eq!(column[0].url, "file:///b");
        assert_eq!(column[0].format, InputFormat::Lines);
        assert!(ds.column(2).is_empty());
    }

    #[test]
    fn local_dataset_completes_when_advertised() {
        let mut graph = DatasetGraph::default();
        let local = graph
            .submit(spec(
                DatasetKind::Local { buckets: vec![], advertised: false },
                vec![],
                2,
            ))
            .unwrap();
        assert!(!graph.get(local).unwrap().complete);
        assert_eq!(graph.get(local).unwrap().progress(), 0.0);

        graph.advertise_local(local, vec!["http://x/bucket/0/0/0".into(), "http://x/bucket/0/0/1".into()]);
        let ds = graph.get(local).unwrap();
        assert!(ds.complete);
        assert_eq!(ds.ntasks(), 2);
        assert_eq!(ds.column(0)[0].source, 0);
    }

    #[test]
    fn empty_local_dataset_has_zero_tasks() {
        let mut graph = DatasetGraph::default();
        let local = graph
            .submit(spec(
                DatasetKind::Local { buckets: vec![], advertised: false },
                vec![],
                2,
            ))
            .unwrap();
        graph.advertise_local(local, vec![]);
        let ds = graph.get(local).unwrap();
        assert!(ds.complete);
        assert_eq!(ds.ntasks(), 0);
        assert_eq!(ds.progress(), 1.0);
        assert!(ds.column(0).is_empty());
    }

    #[test]
    fn materialization_waits_for_parents() {
        let mut graph = DatasetGraph::default();
        let local = graph
            .submit(spec(
                DatasetKind::Local { buckets: vec![], advertised: false },
                vec![],
                1,
            ))
            .unwrap();
        let map = graph.submit(map_spec(local, 2)).unwrap();

        let mut seq = 0;
        assert!(graph.materialize_ready(&mut seq).is_empty());

        graph.advertise_local(local, vec!["http://x/bucket/0/0/0".into()]);
        let ready = graph.materialize_ready(&mut seq);
        assert_eq!(ready, vec![map]);
        let ds = graph.get(map).unwrap();
        assert_eq!(ds.tasks.len(), 2);
        assert!(ds.tasks.iter().all(|t| t.state == TaskState::Pending && t.attempt == 1));
    }

    #[test]
    fn computed_datasets_are_their_own_split_count_wide() {
        let mut graph = DatasetGraph::default();
        let files = graph.submit(file_spec(&["file:///a"])).unwrap();
        let map = graph.submit(map_spec(files, 2)).unwrap();

        let mut seq = 0;
        graph.materialize_ready(&mut seq);
        let ds = graph.get_mut(map).unwrap();
        ds.tasks[0].state = TaskState::Complete;
        ds.tasks[0].outputs = vec!["http://x/bucket/1/0/0".into(), "http://x/bucket/1/0/1".into()];

        let ds = graph.get(map).unwrap();
        assert_eq!(ds.bucket_columns(), 2);
        // Only complete rows contribute buckets to a column.
        assert_eq!(ds.column(1).len(), 1);
        assert_eq!(ds.column(1)[0].source, 0);
        assert_eq!(ds.all_buckets().len(), 2);
    }

    #[test]
    fn remove_unlinks_dependents() {
        let mut graph = DatasetGraph::default();
        let files = graph.submit(file_spec(&["file:///a"])).unwrap();
        let map = graph.submit(map_spec(files, 1)).unwrap();
        assert_eq!(graph.dependents_of(files), &[map]);

        graph.remove(map);
        assert!(graph.dependents_of(files).is_empty());
        assert!(graph.get(map).is_none());
    }
}
