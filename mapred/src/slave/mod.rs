//! The slave node.
//!
//! Connects to the master, registers its endpoints and capacity, constructs
//! the user program from the shipped bootstrap, then serves assignments:
//! one tokio task per running attempt gated by a capacity semaphore, plus
//! the bucket server and the heartbeat loop.

mod executor;

use dashmap::DashMap;
use futures::{future, StreamExt};
use std::sync::{Arc, OnceLock};
use tarpc::server::incoming::Incoming;
use tarpc::server::{BaseChannel, Channel};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{SlaveConfig, MISSED_HEARTBEAT_LIMIT};
use crate::http::{self, Fetcher};
use crate::program::MapReduce;
use crate::registry::Registry;
use crate::rpc::{
    self, AssignReply, MasterRpcClient, Registration, ReportOutcome, SlaveRpc, SlaveStatus,
};
use crate::store::BucketStore;
use crate::task::{DatasetId, JobId, SlaveId, TaskCoord, TaskDescriptor};
use crate::MrResult;

pub struct SlaveNode {
    id: SlaveId,
    job: JobId,
    program: Arc<dyn MapReduce>,
    registry: Registry,
    store: Arc<BucketStore>,
    fetcher: Fetcher,
    master: MasterRpcClient,
    running: DashMap<TaskCoord, JoinHandle<()>>,
    capacity: Arc<Semaphore>,
    quit: watch::Sender<bool>,
}

impl SlaveNode {
    pub fn id(&self) -> SlaveId {
        self.id
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn program(&self) -> &dyn MapReduce {
        self.program.as_ref()
    }

    fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    fn store(&self) -> &Arc<BucketStore> {
        &self.store
    }

    fn running_tasks(&self) -> Vec<TaskCoord> {
        self.running
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| *entry.key())
            .collect()
    }

    fn accept(self: &Arc<Self>, desc: TaskDescriptor) -> AssignReply {
        if let Some(existing) = self.running.get(&desc.coord) {
            if !existing.value().is_finished() {
                return AssignReply::Busy;
            }
        }
        let Ok(permit) = Arc::clone(&self.capacity).try_acquire_owned() else {
            return AssignReply::Busy;
        };
        let node = Arc::clone(self);
        let coord = desc.coord;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            node.execute_and_report(desc).await;
        });
        self.running.insert(coord, handle);
        AssignReply::Accepted
    }

    async fn execute_and_report(self: Arc<Self>, desc: TaskDescriptor) {
        let coord = desc.coord;
        let attempt = desc.attempt;
        info!(task = %coord, attempt, "task accepted");

        match executor::execute(&self, &desc).await {
            Ok(urls) => {
                let report = rpc::with_backoff(|| {
                    self.master.report_done(
                        tarpc::context::current(),
                        self.id,
                        coord,
                        attempt,
                        urls.clone(),
                    )
                })
                .await;
                match report {
                    Ok(ReportOutcome::Ack) => info!(task = %coord, "outputs advertised"),
                    Ok(ReportOutcome::Discard) => {
                        info!(task = %coord, "completion discarded, dropping buckets");
                        self.store.drop_task(coord.dataset, coord.split);
                    }
                    Err(err) => warn!(task = %coord, %err, "could not report completion"),
                }
            }
            Err(failure) => {
                warn!(task = %coord, attempt, %failure, "task attempt failed");
                let _ = rpc::with_backoff(|| {
                    self.master.report_failed(
                        tarpc::context::current(),
                        self.id,
                        coord,
                        attempt,
                        failure.clone(),
                    )
                })
                .await;
            }
        }
    }

    /// Best-effort cancellation; staged output is discarded with the
    /// attempt directory on the next drop or purge.
    fn cancel(&self, coord: TaskCoord) {
        if let Some((_, handle)) = self.running.remove(&coord) {
            handle.abort();
            info!(task = %coord, "task cancelled");
        }
    }

    fn quit_now(&self) {
        info!("quit requested, purging scratch");
        for entry in self.running.iter() {
            entry.value().abort();
        }
        self.running.clear();
        self.store.purge();
        let _ = self.quit.send(true);
    }
}

#[derive(Clone)]
struct SlaveServer {
    node: Arc<OnceLock<Arc<SlaveNode>>>,
}

#[tarpc::server]
impl SlaveRpc for SlaveServer {
    async fn assign(self, _cx: tarpc::context::Context, desc: TaskDescriptor) -> AssignReply {
        match self.node.get() {
            Some(node) => node.accept(desc),
            // Still bootstrapping the program; the master retries elsewhere.
            None => AssignReply::Busy,
        }
    }

    async fn cancel(self, _cx: tarpc::context::Context, coord: TaskCoord) {
        if let Some(node) = self.node.get() {
            node.cancel(coord);
        }
    }

    async fn ping(self, _cx: tarpc::context::Context) -> SlaveStatus {
        match self.node.get() {
            Some(node) => SlaveStatus {
                running: node.running_tasks(),
                scratch_bytes: node.store.scratch_bytes(),
            },
            None => SlaveStatus { running: Vec::new(), scratch_bytes: 0 },
        }
    }

    async fn drop_bucket(self, _cx: tarpc::context::Context, dataset: DatasetId, source: u32) {
        if let Some(node) = self.node.get() {
            node.store.drop_task(dataset, source);
            debug!(%dataset, source, "buckets dropped on master command");
        }
    }

    async fn quit(self, _cx: tarpc::context::Context) {
        if let Some(node) = self.node.get() {
            node.quit_now();
        }
    }
}

pub struct SlaveHandle {
    pub id: SlaveId,
    node: Arc<SlaveNode>,
    heartbeat: JoinHandle<()>,
    rpc: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    quit: watch::Receiver<bool>,
}

impl SlaveHandle {
    /// Start a slave: bind servers, register, construct the user program
    /// from the bootstrap, and begin heartbeating.
    pub async fn start<F>(config: SlaveConfig, make_program: F) -> MrResult<Self>
    where
        F: FnOnce(&Registration) -> MrResult<Arc<dyn MapReduce>>,
    {
        let store = BucketStore::new(&config.tmpdir);
        let (http_addr, http_task) =
            http::serve_buckets(Arc::clone(&store), config.http_addr).await?;

        let cell: Arc<OnceLock<Arc<SlaveNode>>> = Arc::new(OnceLock::new());
        let server = SlaveServer { node: Arc::clone(&cell) };

        let mk_codec = tokio_serde::formats::Bincode::default;
        let mut listener = tarpc::serde_transport::tcp::listen(&config.rpc_addr, mk_codec).await?;
        let rpc_addr = listener.local_addr();
        listener.config_mut().max_frame_length(usize::MAX);

        let rpc_task = tokio::spawn(async move {
            listener
                .filter_map(|r| future::ready(r.ok()))
                .map(BaseChannel::with_defaults)
                .map(|channel| channel.execute(server.clone().serve()))
                .buffer_unordered(16)
                .for_each(|()| async {})
                .await;
        });

        let master = rpc::connect_master(config.master).await?;
        let info = rpc::SlaveInfo { rpc_addr, http_addr, capacity: config.capacity };
        let registration = rpc::with_backoff(|| {
            master.register(tarpc::context::current(), info.clone())
        })
        .await?;
        info!(slave = %registration.slave_id, job = %registration.job, "registered with master");

        store.set_job(registration.job)?;
        let program = make_program(&registration)?;
        let registry = program.registry();

        let (quit_tx, quit_rx) = watch::channel(false);
        let node = Arc::new(SlaveNode {
            id: registration.slave_id,
            job: registration.job,
            program,
            registry,
            store,
            fetcher: Fetcher::new(),
            master: master.clone(),
            running: DashMap::new(),
            capacity: Arc::new(Semaphore::new(config.capacity.max(1) as usize)),
            quit: quit_tx,
        });
        cell.set(Arc::clone(&node)).ok().expect("slave node initialized twice");

        let heartbeat = tokio::spawn(run_heartbeats(
            Arc::clone(&node),
            master,
            registration.heartbeat_interval,
        ));

        Ok(Self {
            id: registration.slave_id,
            node,
            heartbeat,
            rpc: rpc_task,
            tasks: vec![http_task],
            quit: quit_rx,
        })
    }

    /// Await the master's quit command (or loss of the master).
    pub async fn wait_quit(&mut self) {
        while !*self.quit.borrow_and_update() {
            if self.quit.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn scratch_root(&self) -> Option<std::path::PathBuf> {
        self.node.store.job_root().map(|p| p.to_path_buf())
    }

    /// Stop heartbeating without stopping work; the master will eventually
    /// declare this slave lost.
    pub fn stop_heartbeats(&self) {
        self.heartbeat.abort();
    }

    /// Stop serving this slave's RPC endpoint while heartbeats and the
    /// bucket server keep running (an asymmetric failure: the master can
    /// hear the slave but not reach it).
    pub fn stop_rpc(&self) {
        self.rpc.abort();
    }

    /// Simulate process death: everything stops at once, connections drop.
    pub fn kill(&self) {
        self.heartbeat.abort();
        self.rpc.abort();
        for task in &self.tasks {
            task.abort();
        }
        for entry in self.node.running.iter() {
            entry.value().abort();
        }
        self.node.running.clear();
    }

    /// Graceful local teardown (used by drivers after quit).
    pub fn shutdown(self) {
        self.kill();
        self.node.store.purge();
    }
}

async fn run_heartbeats(
    node: Arc<SlaveNode>,
    master: MasterRpcClient,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut misses = 0u32;
    loop {
        ticker.tick().await;
        node.running.retain(|_, handle| !handle.is_finished());
        let running = node.running_tasks();
        match master.heartbeat(tarpc::context::current(), node.id, running).await {
            Ok(reply) => {
                misses = 0;
                for coord in reply.abandon {
                    debug!(task = %coord, "abandoning reassigned task");
                    node.cancel(coord);
                }
            }
            Err(err) => {
                misses += 1;
                warn!(%err, misses, "heartbeat to master failed");
                if misses >= MISSED_HEARTBEAT_LIMIT {
                    error!("master unresponsive, shutting down");
                    node.quit_now();
                    return;
                }
            }
        }
    }
}
