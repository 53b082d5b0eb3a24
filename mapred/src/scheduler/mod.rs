//! The master-side scheduler.
//!
//! One actor task owns the dataset graph, the task queues, and the slave
//! roster; it never performs I/O itself. Side effects (assignments,
//! cancellations, bucket drops) are emitted as [`MasterCmd`]s for the
//! master's dispatcher to execute, so a slow slave can never stall
//! scheduling decisions.

mod client;

pub use client::SchedulerClient;

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::datasets::{DatasetGraph, DatasetKind, DatasetSpec};
use crate::error::{SubmitError, TaskFailure};
use crate::rpc::ReportOutcome;
use crate::task::{DatasetId, InputSource, SlaveId, TaskCoord, TaskDescriptor, TaskOp, TaskState};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub job: crate::task::JobId,
    pub max_attempts: u32,
    pub timing_slaves: usize,
}

/// Side effects the scheduler asks the master to perform.
#[derive(Debug)]
pub enum MasterCmd {
    Assign { slave: SlaveId, desc: TaskDescriptor },
    Cancel { slave: SlaveId, coord: TaskCoord },
    DropTask { slave: SlaveId, dataset: DatasetId, source: u32 },
    /// Master-hosted local data buckets are dropped in-process.
    DropLocal { dataset: DatasetId },
}

/// Bucket columns and serializer names of a complete dataset, for
/// `fetchall` and `data`.
#[derive(Debug, Clone)]
pub struct DatasetFetch {
    pub columns: Vec<Vec<InputSource>>,
    pub key_serializer: Option<String>,
    pub value_serializer: Option<String>,
}

#[derive(Debug, Clone)]
pub enum WaitCheck {
    Ready(Vec<DatasetId>),
    Pending,
    Aborted(String),
}

pub enum SchedulerMsg {
    Submit {
        spec: DatasetSpec,
        reply: oneshot::Sender<Result<DatasetId, SubmitError>>,
    },
    AdvertiseLocal {
        id: DatasetId,
        buckets: Vec<String>,
    },
    CheckWait {
        ids: Vec<DatasetId>,
        reply: oneshot::Sender<WaitCheck>,
    },
    Progress {
        id: DatasetId,
        reply: oneshot::Sender<f64>,
    },
    Close {
        id: DatasetId,
        reply: oneshot::Sender<()>,
    },
    Fetch {
        id: DatasetId,
        reply: oneshot::Sender<Option<DatasetFetch>>,
    },
    SlaveRegistered {
        slave: SlaveId,
        capacity: u32,
        http_host: String,
    },
    SlaveLost {
        slave: SlaveId,
    },
    Heartbeat {
        slave: SlaveId,
        running: Vec<TaskCoord>,
        reply: oneshot::Sender<Vec<TaskCoord>>,
    },
    TaskDone {
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        outputs: Vec<String>,
        reply: oneshot::Sender<ReportOutcome>,
    },
    TaskFailed {
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        reason: TaskFailure,
    },
    AssignRejected {
        slave: SlaveId,
        coord: TaskCoord,
        busy: bool,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct SlaveState {
    capacity: u32,
    http_host: String,
    in_flight: HashSet<TaskCoord>,
    alive: bool,
    /// Set when the slave answered `busy`; cleared on its next heartbeat or
    /// completion so we stop hammering it.
    deferred: bool,
}

pub fn spawn(
    config: SchedulerConfig,
    cmds: mpsc::UnboundedSender<MasterCmd>,
) -> (SchedulerClient, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let client = SchedulerClient::new(tx, epoch_rx);
    let scheduler = Scheduler {
        config,
        graph: DatasetGraph::default(),
        slaves: HashMap::new(),
        close_requests: HashSet::new(),
        cmds,
        epoch: epoch_tx,
        rx,
        queue_seq: 0,
        aborted: None,
    };
    let handle = tokio::spawn(scheduler.run());
    (client, handle)
}

struct Scheduler {
    config: SchedulerConfig,
    graph: DatasetGraph,
    slaves: HashMap<SlaveId, SlaveState>,
    close_requests: HashSet<DatasetId>,
    cmds: mpsc::UnboundedSender<MasterCmd>,
    epoch: watch::Sender<u64>,
    rx: mpsc::UnboundedReceiver<SchedulerMsg>,
    queue_seq: u64,
    aborted: Option<String>,
}

impl Scheduler {
    #[instrument(skip_all, name = "scheduler")]
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            if let SchedulerMsg::Shutdown { reply } = msg {
                let _ = reply.send(());
                break;
            }
            self.handle(msg);
        }
        trace!("scheduler loop finished");
    }

    fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Submit { spec, reply } => {
                let _ = reply.send(self.on_submit(spec));
            }
            SchedulerMsg::AdvertiseLocal { id, buckets } => {
                self.graph.advertise_local(id, buckets);
                if self.graph.get(id).map(|ds| ds.complete).unwrap_or(false) {
                    info!(dataset = %id, "local dataset advertised");
                    self.bump_epoch();
                    self.pump();
                }
            }
            SchedulerMsg::CheckWait { ids, reply } => {
                let _ = reply.send(self.on_check_wait(&ids));
            }
            SchedulerMsg::Progress { id, reply } => {
                let progress = self.graph.get(id).map(|ds| ds.progress()).unwrap_or(1.0);
                let _ = reply.send(progress);
            }
            SchedulerMsg::Close { id, reply } => {
                self.on_close(id);
                let _ = reply.send(());
            }
            SchedulerMsg::Fetch { id, reply } => {
                let fetch = self.graph.get(id).filter(|ds| ds.complete).map(|ds| DatasetFetch {
                    columns: ds.columns(),
                    key_serializer: ds.key_serializer.clone(),
                    value_serializer: ds.value_serializer.clone(),
                });
                let _ = reply.send(fetch);
            }
            SchedulerMsg::SlaveRegistered { slave, capacity, http_host } => {
                info!(%slave, capacity, %http_host, "slave joined the roster");
                self.slaves.insert(
                    slave,
                    SlaveState {
                        capacity: capacity.max(1),
                        http_host,
                        in_flight: HashSet::new(),
                        alive: true,
                        deferred: false,
                    },
                );
                self.pump();
            }
            SchedulerMsg::SlaveLost { slave } => self.on_slave_lost(slave),
            SchedulerMsg::Heartbeat { slave, running, reply } => {
                let _ = reply.send(self.on_heartbeat(slave, running));
            }
            SchedulerMsg::TaskDone { slave, coord, attempt, outputs, reply } => {
                let _ = reply.send(self.on_task_done(slave, coord, attempt, outputs));
            }
            SchedulerMsg::TaskFailed { slave, coord, attempt, reason } => {
                self.on_task_failed(slave, coord, attempt, reason);
            }
            SchedulerMsg::AssignRejected { slave, coord, busy } => {
                self.on_assign_rejected(slave, coord, busy);
            }
            SchedulerMsg::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    fn on_submit(&mut self, spec: DatasetSpec) -> Result<DatasetId, SubmitError> {
        if self.aborted.is_some() {
            return Err(SubmitError::JobAborted);
        }
        let id = self.graph.submit(spec)?;
        let ds = self.graph.get(id).unwrap();
        info!(dataset = %id, splits = ds.num_splits, kind = kind_name(&ds.kind), "dataset submitted");
        if ds.complete {
            self.bump_epoch();
        }
        self.pump();
        Ok(id)
    }

    fn on_check_wait(&self, ids: &[DatasetId]) -> WaitCheck {
        if let Some(reason) = &self.aborted {
            return WaitCheck::Aborted(reason.clone());
        }
        // Datasets already garbage-collected were complete before removal.
        let subset: Vec<DatasetId> = ids
            .iter()
            .copied()
            .filter(|id| self.graph.get(*id).map(|ds| ds.complete).unwrap_or(true))
            .collect();
        if subset.is_empty() {
            WaitCheck::Pending
        } else {
            WaitCheck::Ready(subset)
        }
    }

    /// Materialize newly-runnable datasets and hand tasks to idle slaves.
    fn pump(&mut self) {
        if self.aborted.is_some() {
            return;
        }
        for id in self.graph.materialize_ready(&mut self.queue_seq) {
            debug!(dataset = %id, "tasks materialized");
        }
        let live = self.slaves.values().filter(|s| s.alive).count();
        if live < self.config.timing_slaves {
            trace!(live, wanted = self.config.timing_slaves, "holding dispatch for slaves");
            return;
        }
        loop {
            let Some(slave) = self.pick_idle_slave() else { break };
            let host = self.slaves[&slave].http_host.clone();
            let Some(coord) = self.pick_task(&host) else { break };
            self.dispatch(slave, coord);
        }
    }

    fn pick_idle_slave(&self) -> Option<SlaveId> {
        let mut ids: Vec<_> = self
            .slaves
            .iter()
            .filter(|(_, s)| {
                s.alive && !s.deferred && (s.in_flight.len() as u32) < s.capacity
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids.into_iter().next()
    }

    /// The oldest ready task whose inputs are most available on the
    /// candidate slave; ties broken by task id.
    fn pick_task(&self, http_host: &str) -> Option<TaskCoord> {
        let local_prefix = format!("http://{http_host}/");
        let mut best: Option<(usize, u64, TaskCoord)> = None;
        for (id, ds) in &self.graph.datasets {
            if ds.closed || ds.complete || !ds.tasks_made || ds.kind.is_source() {
                continue;
            }
            if !self.graph.parents_complete(*id) {
                continue;
            }
            for (split, entry) in ds.tasks.iter().enumerate() {
                if entry.state != TaskState::Pending {
                    continue;
                }
                let coord = TaskCoord::new(*id, split as u32);
                let score = self.locality_score(*id, split as u32, &local_prefix);
                let candidate = (score, entry.queue_seq, coord);
                let better = match &best {
                    None => true,
                    Some((s, seq, c)) => {
                        score > *s
                            || (score == *s && entry.queue_seq < *seq)
                            || (score == *s && entry.queue_seq == *seq && coord < *c)
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
        }
        best.map(|(_, _, coord)| coord)
    }

    fn locality_score(&self, dataset: DatasetId, split: u32, local_prefix: &str) -> usize {
        let Some(ds) = self.graph.get(dataset) else { return 0 };
        ds.sources
            .iter()
            .filter_map(|parent| self.graph.get(*parent))
            .flat_map(|parent| parent.column(split))
            .filter(|input| input.url.starts_with(local_prefix))
            .count()
    }

    fn dispatch(&mut self, slave: SlaveId, coord: TaskCoord) {
        let desc = self.descriptor(coord);
        let ds = self.graph.get_mut(coord.dataset).unwrap();
        let entry = &mut ds.tasks[coord.split as usize];
        entry.state = TaskState::Assigned;
        entry.assigned_to = Some(slave);
        info!(task = %coord, %slave, attempt = entry.attempt, "task assigned");
        self.slaves.get_mut(&slave).unwrap().in_flight.insert(coord);
        let _ = self.cmds.send(MasterCmd::Assign { slave, desc });
    }

    fn descriptor(&self, coord: TaskCoord) -> TaskDescriptor {
        let ds = self.graph.get(coord.dataset).unwrap();
        let entry = &ds.tasks[coord.split as usize];
        let op = ds.kind.task_op().expect("source datasets have no dispatchable tasks");

        // Key-grouped tasks whose split count matches the parent's bucket
        // width read their own column; otherwise they read everything and
        // re-shard by the parent's partitioner. Map tasks just slice the
        // input, so a column is always enough.
        let keyed = matches!(op, TaskOp::Reduce { .. } | TaskOp::ReduceMap { .. });
        let first_parent = ds.sources.first().and_then(|p| self.graph.get(*p));
        let resharded = keyed
            && first_parent
                .map(|parent| parent.bucket_columns() != ds.num_splits)
                .unwrap_or(false);
        let inputs: Vec<InputSource> = ds
            .sources
            .iter()
            .filter_map(|parent| self.graph.get(*parent))
            .flat_map(|parent| {
                if resharded {
                    parent.all_buckets()
                } else {
                    parent.column(coord.split)
                }
            })
            .collect();
        TaskDescriptor {
            job: self.config.job,
            coord,
            attempt: entry.attempt,
            generation: entry.generation,
            op,
            inputs,
            output_splits: ds.num_splits,
            input_filter: resharded.then(|| {
                first_parent.map(|p| p.parter.clone()).unwrap_or_else(|| ds.parter.clone())
            }),
            parter: ds.parter.clone(),
            combiner: ds.combiner.clone(),
            key_serializer: ds.key_serializer.clone(),
            value_serializer: ds.value_serializer.clone(),
            input_key_serializer: first_parent.and_then(|p| p.key_serializer.clone()),
            input_value_serializer: first_parent.and_then(|p| p.value_serializer.clone()),
            output_dir: ds.output_dir.clone(),
        }
    }

    fn on_task_done(
        &mut self,
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        outputs: Vec<String>,
    ) -> ReportOutcome {
        if let Some(state) = self.slaves.get_mut(&slave) {
            state.in_flight.remove(&coord);
            state.deferred = false;
        }
        if self.aborted.is_some() {
            return ReportOutcome::Discard;
        }
        let Some(ds) = self.graph.get_mut(coord.dataset) else {
            return ReportOutcome::Discard;
        };
        if ds.closed {
            return ReportOutcome::Discard;
        }
        let Some(entry) = ds.tasks.get_mut(coord.split as usize) else {
            return ReportOutcome::Discard;
        };
        let current = matches!(entry.state, TaskState::Assigned | TaskState::Running)
            && entry.assigned_to == Some(slave)
            && entry.attempt == attempt;
        if !current {
            debug!(task = %coord, %slave, attempt, "discarding stale completion");
            return ReportOutcome::Discard;
        }

        entry.state = TaskState::Complete;
        entry.outputs = outputs;
        info!(task = %coord, %slave, attempt, "task complete");

        if ds.tasks.iter().all(|t| t.state == TaskState::Complete) {
            ds.complete = true;
            info!(dataset = %coord.dataset, "dataset complete");
            self.bump_epoch();
            // A completed consumer may unblock a deferred close upstream.
            let parents = self.graph.get(coord.dataset).unwrap().sources.clone();
            for parent in parents {
                self.try_close(parent);
            }
            self.try_close(coord.dataset);
        }
        self.pump();
        ReportOutcome::Ack
    }

    fn on_task_failed(
        &mut self,
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        reason: TaskFailure,
    ) {
        if let Some(state) = self.slaves.get_mut(&slave) {
            state.in_flight.remove(&coord);
        }
        if self.aborted.is_some() {
            return;
        }
        let max_attempts = self.config.max_attempts;
        let Some(ds) = self.graph.get_mut(coord.dataset) else { return };
        let Some(entry) = ds.tasks.get_mut(coord.split as usize) else { return };
        let current = matches!(entry.state, TaskState::Assigned | TaskState::Running)
            && entry.assigned_to == Some(slave)
            && entry.attempt == attempt;
        if !current {
            debug!(task = %coord, attempt, "ignoring stale failure report");
            return;
        }

        if !reason.counts_against_task() {
            // Stale input: re-run the producer, then this task, at no cost
            // to its attempt budget.
            warn!(task = %coord, %reason, "task reported stale input");
            entry.state = TaskState::Pending;
            entry.assigned_to = None;
            self.queue_seq += 1;
            entry.queue_seq = self.queue_seq;
            if let TaskFailure::InputMissing { dataset, source } = reason {
                self.invalidate_completed(dataset, source);
            }
            self.pump();
            return;
        }

        if entry.attempt >= max_attempts {
            entry.state = TaskState::FailedFatal;
            error!(task = %coord, attempt, %reason, "task failed fatally");
            self.abort(format!(
                "task {coord} failed after {attempt} attempts: {reason}"
            ));
        } else {
            entry.attempt += 1;
            entry.state = TaskState::Pending;
            entry.assigned_to = None;
            self.queue_seq += 1;
            entry.queue_seq = self.queue_seq;
            warn!(task = %coord, next_attempt = entry.attempt, %reason, "task failed, retrying");
            self.pump();
        }
    }

    fn on_assign_rejected(&mut self, slave: SlaveId, coord: TaskCoord, busy: bool) {
        if let Some(state) = self.slaves.get_mut(&slave) {
            state.in_flight.remove(&coord);
            // Both a `busy` reply and a bounced transport take the slave out
            // of the candidate set until its next heartbeat, so the same
            // task cannot ping-pong back immediately.
            state.deferred = true;
        }
        if let Some(ds) = self.graph.get_mut(coord.dataset) {
            if let Some(entry) = ds.tasks.get_mut(coord.split as usize) {
                if entry.state == TaskState::Assigned && entry.assigned_to == Some(slave) {
                    debug!(task = %coord, %slave, busy, "assignment bounced, requeueing");
                    // Keep the original queue age; the task has not run.
                    entry.state = TaskState::Pending;
                    entry.assigned_to = None;
                }
            }
        }
        self.pump();
    }

    fn on_heartbeat(&mut self, slave: SlaveId, running: Vec<TaskCoord>) -> Vec<TaskCoord> {
        let Some(state) = self.slaves.get_mut(&slave) else {
            return running;
        };
        if !state.alive {
            // A lost slave that returned: whatever it is doing is already
            // reassigned.
            return running;
        }
        let was_deferred = state.deferred;
        state.deferred = false;
        let mut abandon = Vec::new();
        for coord in running {
            let ours = self
                .graph
                .get(coord.dataset)
                .and_then(|ds| ds.tasks.get(coord.split as usize))
                .map(|entry| {
                    entry.assigned_to == Some(slave)
                        && matches!(entry.state, TaskState::Assigned | TaskState::Running)
                })
                .unwrap_or(false);
            if ours {
                let entry = self
                    .graph
                    .get_mut(coord.dataset)
                    .unwrap()
                    .tasks
                    .get_mut(coord.split as usize)
                    .unwrap();
                if entry.state == TaskState::Assigned {
                    entry.state = TaskState::Running;
                    debug!(task = %coord, %slave, "task running");
                }
            } else {
                abandon.push(coord);
            }
        }
        if was_deferred || !abandon.is_empty() {
            self.pump();
        }
        abandon
    }

    fn on_slave_lost(&mut self, slave: SlaveId) {
        let Some(state) = self.slaves.get_mut(&slave) else { return };
        if !state.alive {
            return;
        }
        state.alive = false;
        let in_flight: Vec<TaskCoord> = state.in_flight.drain().collect();
        warn!(%slave, reassigning = in_flight.len(), "slave lost");

        // A lost slave is not the task's fault: back to pending, same
        // attempt.
        for coord in in_flight {
            if let Some(ds) = self.graph.get_mut(coord.dataset) {
                if let Some(entry) = ds.tasks.get_mut(coord.split as usize) {
                    if entry.assigned_to == Some(slave)
                        && matches!(entry.state, TaskState::Assigned | TaskState::Running)
                    {
                        entry.state = TaskState::Pending;
                        entry.assigned_to = None;
                        self.queue_seq += 1;
                        entry.queue_seq = self.queue_seq;
                        info!(task = %coord, "task returned to queue");
                    }
                }
            }
        }

        // Buckets it served have no other replica; invalidate the completed
        // tasks that produced them and roll their consumers back.
        let stale: Vec<(DatasetId, u32)> = self
            .graph
            .datasets
            .values()
            .filter(|ds| !ds.closed && !ds.kind.is_source())
            .flat_map(|ds| {
                ds.tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| {
                        e.state == TaskState::Complete && e.assigned_to == Some(slave)
                    })
                    .map(move |(source, _)| (ds.id, source as u32))
            })
            .collect();
        for (dataset, source) in stale {
            self.invalidate_completed(dataset, source);
        }
        self.pump();
    }

    /// Re-run a completed task whose buckets are gone, rolling consumers
    /// back transitively. Consumers' fetches are keyed by the producer's
    /// generation, which increments here.
    fn invalidate_completed(&mut self, dataset: DatasetId, source: u32) {
        let Some(ds) = self.graph.get_mut(dataset) else { return };
        if ds.closed || ds.kind.is_source() {
            return;
        }
        let Some(entry) = ds.tasks.get_mut(source as usize) else { return };
        if entry.state != TaskState::Complete {
            return;
        }
        entry.state = TaskState::Pending;
        entry.generation += 1;
        entry.outputs.clear();
        entry.assigned_to = None;
        self.queue_seq += 1;
        entry.queue_seq = self.queue_seq;
        ds.complete = false;
        info!(dataset = %dataset, source, "completed task invalidated, re-running");
        self.rollback_consumers(dataset);
    }

    fn rollback_consumers(&mut self, dataset: DatasetId) {
        let dependents = self.graph.dependents_of(dataset).to_vec();
        for dep in dependents {
            let Some(ds) = self.graph.get_mut(dep) else { continue };
            if ds.closed || !ds.tasks_made {
                continue;
            }
            let mut cancels = Vec::new();
            let mut reverted = false;
            for (split, entry) in ds.tasks.iter_mut().enumerate() {
                match entry.state {
                    TaskState::Assigned | TaskState::Running => {
                        if let Some(slave) = entry.assigned_to {
                            cancels.push((slave, TaskCoord::new(dep, split as u32)));
                        }
                        entry.state = TaskState::Pending;
                        entry.assigned_to = None;
                        entry.generation += 1;
                        self.queue_seq += 1;
                        entry.queue_seq = self.queue_seq;
                    }
                    TaskState::Complete => {
                        entry.state = TaskState::Pending;
                        entry.assigned_to = None;
                        entry.generation += 1;
                        entry.outputs.clear();
                        self.queue_seq += 1;
                        entry.queue_seq = self.queue_seq;
                        reverted = true;
                    }
                    _ => {}
                }
            }
            ds.complete = false;
            if !cancels.is_empty() || reverted {
                info!(dataset = %dep, "consumer rolled back to stale producer");
            }
            for (slave, coord) in cancels {
                if let Some(state) = self.slaves.get_mut(&slave) {
                    state.in_flight.remove(&coord);
                }
                let _ = self.cmds.send(MasterCmd::Cancel { slave, coord });
            }
            if reverted {
                self.rollback_consumers(dep);
            }
        }
    }

    fn on_close(&mut self, id: DatasetId) {
        if self.graph.get(id).map(|ds| ds.closed).unwrap_or(true) {
            // Closing an already-closed (or collected) dataset is a no-op.
            return;
        }
        self.close_requests.insert(id);
        self.try_close(id);
    }

    /// A close request takes effect once no open dependent still needs the
    /// data; buckets are collected once every dependent is closed too.
    fn try_close(&mut self, id: DatasetId) {
        if !self.close_requests.contains(&id) {
            self.try_gc(id);
            return;
        }
        let computing = self
            .graph
            .dependents_of(id)
            .iter()
            .filter_map(|dep| self.graph.get(*dep))
            .any(|dep| !dep.complete && !dep.closed);
        if computing {
            return;
        }
        let Some(ds) = self.graph.get_mut(id) else { return };
        let mut cancels = Vec::new();
        for (split, entry) in ds.tasks.iter_mut().enumerate() {
            if matches!(entry.state, TaskState::Assigned | TaskState::Running) {
                if let Some(slave) = entry.assigned_to {
                    cancels.push((slave, TaskCoord::new(id, split as u32)));
                }
                entry.state = TaskState::Pending;
                entry.assigned_to = None;
            }
        }
        ds.closed = true;
        self.close_requests.remove(&id);
        info!(dataset = %id, "dataset closed");
        for (slave, coord) in cancels {
            if let Some(state) = self.slaves.get_mut(&slave) {
                state.in_flight.remove(&coord);
            }
            let _ = self.cmds.send(MasterCmd::Cancel { slave, coord });
        }
        self.bump_epoch();
        self.try_gc(id);
    }

    /// Drop a closed dataset's buckets and remove the node once no open
    /// dependent remains; cascades to parents whose last consumer left.
    fn try_gc(&mut self, id: DatasetId) {
        let Some(ds) = self.graph.get(id) else { return };
        if !ds.closed {
            return;
        }
        let all_closed = self
            .graph
            .dependents_of(id)
            .iter()
            .all(|dep| self.graph.get(*dep).map(|d| d.closed).unwrap_or(true));
        if !all_closed {
            return;
        }

        match &ds.kind {
            DatasetKind::Local { .. } => {
                let _ = self.cmds.send(MasterCmd::DropLocal { dataset: id });
            }
            DatasetKind::FileUrls { .. } => {}
            _ => {
                for (source, entry) in ds.tasks.iter().enumerate() {
                    if entry.state == TaskState::Complete {
                        if let Some(slave) = entry.assigned_to {
                            let _ = self.cmds.send(MasterCmd::DropTask {
                                slave,
                                dataset: id,
                                source: source as u32,
                            });
                        }
                    }
                }
            }
        }
        let removed = self.graph.remove(id).unwrap();
        info!(dataset = %id, "dataset buckets dropped");
        for parent in removed.sources {
            self.try_close(parent);
            self.try_gc(parent);
        }
    }

    /// Fatal failure: cancel everything, close every dataset, and let every
    /// waiter observe the abort.
    fn abort(&mut self, reason: String) {
        if self.aborted.is_some() {
            return;
        }
        error!(%reason, "aborting job");
        self.aborted = Some(reason);
        for (slave, state) in self.slaves.iter_mut() {
            for coord in state.in_flight.drain() {
                let _ = self.cmds.send(MasterCmd::Cancel { slave: *slave, coord });
            }
        }
        let ids: Vec<DatasetId> = self.graph.datasets.keys().copied().collect();
        for id in ids {
            if let Some(ds) = self.graph.get_mut(id) {
                ds.closed = true;
            }
        }
        self.close_requests.clear();
        self.bump_epoch();
    }
}

fn kind_name(kind: &DatasetKind) -> &'static str {
    match kind {
        DatasetKind::FileUrls { .. } => "file",
        DatasetKind::Local { .. } => "local",
        DatasetKind::Map { .. } => "map",
        DatasetKind::Reduce { .. } => "reduce",
        DatasetKind::ReduceMap { .. } => "reducemap",
    }
}
