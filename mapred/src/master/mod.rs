//! The master node.
//!
//! Hosts the scheduler actor, the `MasterRpc` server slaves talk to, the
//! per-slave RPC clients the scheduler's commands go out on, the heartbeat
//! monitor, and a bucket server for master-hosted local data.

mod monitor;

use dashmap::DashMap;
use futures::{future, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tarpc::server::incoming::Incoming;
use tarpc::server::{BaseChannel, Channel};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MasterConfig;
use crate::http;
use crate::rpc::{
    self, HeartbeatReply, MasterRpc, Registration, ReportOutcome, SlaveInfo, SlaveRpcClient,
};
use crate::scheduler::{self, MasterCmd, SchedulerClient, SchedulerConfig};
use crate::store::BucketStore;
use crate::task::{SlaveId, TaskCoord};
use crate::MrResult;

/// Connection-level bookkeeping for registered slaves. Scheduling state
/// lives in the scheduler; this tracks ids, RPC clients, and liveness
/// timestamps.
pub struct SlaveRegistry {
    next_id: AtomicU64,
    clients: DashMap<SlaveId, SlaveRpcClient>,
    last_seen: DashMap<SlaveId, Instant>,
}

impl SlaveRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            clients: DashMap::new(),
            last_seen: DashMap::new(),
        })
    }

    fn alloc_id(&self) -> SlaveId {
        SlaveId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert(&self, slave: SlaveId, client: SlaveRpcClient) {
        self.clients.insert(slave, client);
        self.mark_seen(slave);
    }

    pub fn client(&self, slave: SlaveId) -> Option<SlaveRpcClient> {
        self.clients.get(&slave).map(|c| c.clone())
    }

    pub fn mark_seen(&self, slave: SlaveId) {
        // A removed slave keeps heartbeating until it notices the quit;
        // don't let that resurrect its liveness entry.
        if self.clients.contains_key(&slave) {
            self.last_seen.insert(slave, Instant::now());
        }
    }

    fn silent_longer_than(&self, deadline: Duration) -> Vec<SlaveId> {
        self.last_seen
            .iter()
            .filter(|entry| entry.value().elapsed() > deadline)
            .map(|entry| *entry.key())
            .collect()
    }

    fn remove(&self, slave: SlaveId) {
        self.clients.remove(&slave);
        self.last_seen.remove(&slave);
    }

    fn all_clients(&self) -> Vec<SlaveRpcClient> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[derive(Clone)]
struct MasterServer {
    scheduler: SchedulerClient,
    registry: Arc<SlaveRegistry>,
    config: Arc<MasterConfig>,
}

#[tarpc::server]
impl MasterRpc for MasterServer {
    async fn register(self, _cx: tarpc::context::Context, info: SlaveInfo) -> Registration {
        let slave_id = self.registry.alloc_id();
        match rpc::connect_slave(info.rpc_addr).await {
            Ok(client) => {
                self.registry.insert(slave_id, client);
                self.scheduler.slave_registered(
                    slave_id,
                    info.capacity,
                    info.http_addr.to_string(),
                );
                info!(%slave_id, rpc = %info.rpc_addr, http = %info.http_addr, "slave registered");
            }
            Err(err) => {
                // Hand out the id but keep the slave off the roster: a slave
                // the master cannot reach gets no assignments, only abandon
                // lists on its heartbeats.
                warn!(%slave_id, %err, "could not connect back to slave");
            }
        }
        Registration {
            slave_id,
            job: self.config.job,
            heartbeat_interval: self.config.heartbeat_interval,
            program_args: self.config.program_args.clone(),
        }
    }

    async fn report_done(
        self,
        _cx: tarpc::context::Context,
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        outputs: Vec<String>,
    ) -> ReportOutcome {
        self.registry.mark_seen(slave);
        self.scheduler
            .report_done(slave, coord, attempt, outputs)
            .await
            .unwrap_or(ReportOutcome::Discard)
    }

    async fn report_failed(
        self,
        _cx: tarpc::context::Context,
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        reason: crate::error::TaskFailure,
    ) {
        self.registry.mark_seen(slave);
        self.scheduler.report_failed(slave, coord, attempt, reason);
    }

    async fn heartbeat(
        self,
        _cx: tarpc::context::Context,
        slave: SlaveId,
        running: Vec<TaskCoord>,
    ) -> HeartbeatReply {
        self.registry.mark_seen(slave);
        let abandon = self.scheduler.heartbeat(slave, running).await.unwrap_or_default();
        HeartbeatReply { abandon }
    }
}

pub struct MasterHandle {
    pub scheduler: SchedulerClient,
    pub rpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub store: Arc<BucketStore>,
    pub config: Arc<MasterConfig>,
    registry: Arc<SlaveRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl MasterHandle {
    pub async fn start(config: MasterConfig) -> MrResult<Self> {
        let config = Arc::new(config);
        let store = BucketStore::new(&config.tmpdir);
        store.set_job(config.job)?;
        let (http_addr, http_task) =
            http::serve_buckets(Arc::clone(&store), config.http_addr).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (scheduler, scheduler_task) = scheduler::spawn(
            SchedulerConfig {
                job: config.job,
                max_attempts: config.max_attempts,
                timing_slaves: config.timing_slaves,
            },
            cmd_tx,
        );

        let registry = SlaveRegistry::new();
        let dispatcher_task = tokio::spawn(run_dispatcher(
            cmd_rx,
            Arc::clone(&registry),
            scheduler.clone(),
            Arc::clone(&store),
        ));

        let server = MasterServer {
            scheduler: scheduler.clone(),
            registry: Arc::clone(&registry),
            config: Arc::clone(&config),
        };
        let mk_codec = tokio_serde::formats::Bincode::default;
        let mut listener = tarpc::serde_transport::tcp::listen(&config.rpc_addr, mk_codec).await?;
        let rpc_addr = listener.local_addr();
        listener.config_mut().max_frame_length(usize::MAX);
        info!(addr = %rpc_addr, "master rpc listening");

        let rpc_task = tokio::spawn(async move {
            listener
                // Ignore tcp accept errors
                .filter_map(|r| future::ready(r.ok()))
                .map(BaseChannel::with_defaults)
                .max_channels_per_key(8, |t| t.transport().peer_addr().unwrap().ip())
                .map(|channel| channel.execute(server.clone().serve()))
                .buffer_unordered(64)
                .for_each(|()| async {})
                .await;
        });

        let monitor_task = tokio::spawn(monitor::run(
            Arc::clone(&registry),
            scheduler.clone(),
            config.heartbeat_interval,
        ));

        Ok(Self {
            scheduler,
            rpc_addr,
            http_addr,
            store,
            config,
            registry,
            tasks: vec![http_task, scheduler_task, dispatcher_task, rpc_task, monitor_task],
        })
    }

    /// Tell every slave to quit, stop the scheduler, and clean up the
    /// master's scratch.
    pub async fn shutdown(self) {
        for client in self.registry.all_clients() {
            let _ = client.quit(tarpc::context::current()).await;
        }
        let _ = self.scheduler.shutdown().await;
        for task in &self.tasks {
            task.abort();
        }
        self.store.purge();
    }
}

/// Executes scheduler commands against slave connections. Each assignment
/// runs on its own task so one slow slave cannot delay the rest.
#[instrument(skip_all, name = "dispatcher")]
async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<MasterCmd>,
    registry: Arc<SlaveRegistry>,
    scheduler: SchedulerClient,
    store: Arc<BucketStore>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            MasterCmd::Assign { slave, desc } => {
                let registry = Arc::clone(&registry);
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    let coord = desc.coord;
                    let Some(client) = registry.client(slave) else {
                        scheduler.assign_rejected(slave, coord, false);
                        return;
                    };
                    let reply = rpc::with_backoff(|| {
                        client.assign(tarpc::context::current(), desc.clone())
                    })
                    .await;
                    match reply {
                        Ok(rpc::AssignReply::Accepted) => {}
                        Ok(rpc::AssignReply::Busy) => {
                            scheduler.assign_rejected(slave, coord, true)
                        }
                        Err(err) => {
                            // The backoff bound is the retry budget:
                            // persistent transport failure escalates to
                            // slave-lost, independent of heartbeat health.
                            warn!(%slave, task = %coord, %err, "assign rpc failed, dropping slave");
                            registry.remove(slave);
                            scheduler.slave_lost(slave);
                        }
                    }
                });
            }
            MasterCmd::Cancel { slave, coord } => {
                if let Some(client) = registry.client(slave) {
                    tokio::spawn(async move {
                        let _ = client.cancel(tarpc::context::current(), coord).await;
                    });
                }
            }
            MasterCmd::DropTask { slave, dataset, source } => {
                if let Some(client) = registry.client(slave) {
                    tokio::spawn(async move {
                        let _ =
                            client.drop_bucket(tarpc::context::current(), dataset, source).await;
                    });
                }
            }
            MasterCmd::DropLocal { dataset } => {
                store.drop_dataset(dataset);
            }
        }
    }
}
