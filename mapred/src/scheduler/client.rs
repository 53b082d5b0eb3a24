//! Handle for talking to the scheduler actor. Every external interaction
//! with the dataset graph and task queues funnels through here.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{DatasetFetch, SchedulerMsg, WaitCheck};
use crate::datasets::DatasetSpec;
use crate::error::{JobAborted, SubmitError, TaskFailure};
use crate::rpc::ReportOutcome;
use crate::task::{DatasetId, SlaveId, TaskCoord};
use crate::MrResult;

#[derive(Clone)]
pub struct SchedulerClient {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    epoch: watch::Receiver<u64>,
}

impl SchedulerClient {
    pub(super) fn new(
        tx: mpsc::UnboundedSender<SchedulerMsg>,
        epoch: watch::Receiver<u64>,
    ) -> Self {
        Self { tx, epoch }
    }

    fn send(&self, msg: SchedulerMsg) -> MrResult<()> {
        self.tx.send(msg).map_err(|_| eyre!("scheduler is gone"))
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerMsg,
    ) -> MrResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| eyre!("scheduler dropped the request"))
    }

    pub async fn submit(&self, spec: DatasetSpec) -> MrResult<DatasetId> {
        let result: Result<DatasetId, SubmitError> =
            self.call(|reply| SchedulerMsg::Submit { spec, reply }).await?;
        result.map_err(eyre::Report::new)
    }

    /// Advertise a local dataset's partitioned buckets; completes it.
    pub fn advertise_local(&self, id: DatasetId, buckets: Vec<String>) -> MrResult<()> {
        self.send(SchedulerMsg::AdvertiseLocal { id, buckets })
    }

    /// Block until at least one of `ids` is complete, the job aborts, or
    /// the timeout elapses. Returns the complete subset (empty only on
    /// timeout); a `JobAborted` error reports an abort.
    pub async fn wait(
        &self,
        ids: Vec<DatasetId>,
        timeout: Option<Duration>,
    ) -> MrResult<Vec<DatasetId>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut epoch = self.epoch.clone();
        loop {
            // Snapshot the epoch before checking so a completion between the
            // check and the sleep still wakes us.
            epoch.borrow_and_update();
            let check: WaitCheck =
                self.call(|reply| SchedulerMsg::CheckWait { ids: ids.clone(), reply }).await?;
            match check {
                WaitCheck::Ready(subset) => return Ok(subset),
                WaitCheck::Aborted(reason) => {
                    return Err(eyre::Report::new(JobAborted { reason }))
                }
                WaitCheck::Pending => match deadline {
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            return Ok(Vec::new());
                        }
                        if tokio::time::timeout_at(deadline, epoch.changed()).await.is_err() {
                            return Ok(Vec::new());
                        }
                    }
                    None => {
                        if epoch.changed().await.is_err() {
                            bail!("scheduler is gone");
                        }
                    }
                },
            }
        }
    }

    pub async fn progress(&self, id: DatasetId) -> MrResult<f64> {
        self.call(|reply| SchedulerMsg::Progress { id, reply }).await
    }

    pub async fn close(&self, id: DatasetId) -> MrResult<()> {
        self.call(|reply| SchedulerMsg::Close { id, reply }).await
    }

    /// Bucket columns and serializer names of a complete dataset.
    pub async fn fetch_meta(&self, id: DatasetId) -> MrResult<Option<DatasetFetch>> {
        self.call(|reply| SchedulerMsg::Fetch { id, reply }).await
    }

    pub async fn aborted(&self) -> MrResult<Option<String>> {
        match self.call(|reply| SchedulerMsg::CheckWait { ids: Vec::new(), reply }).await? {
            WaitCheck::Aborted(reason) => Ok(Some(reason)),
            _ => Ok(None),
        }
    }

    pub fn slave_registered(&self, slave: SlaveId, capacity: u32, http_host: String) {
        let _ = self.tx.send(SchedulerMsg::SlaveRegistered { slave, capacity, http_host });
    }

    pub fn slave_lost(&self, slave: SlaveId) {
        let _ = self.tx.send(SchedulerMsg::SlaveLost { slave });
    }

    pub async fn heartbeat(
        &self,
        slave: SlaveId,
        running: Vec<TaskCoord>,
    ) -> MrResult<Vec<TaskCoord>> {
        self.call(|reply| SchedulerMsg::Heartbeat { slave, running, reply }).await
    }

    pub async fn report_done(
        &self,
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        outputs: Vec<String>,
    ) -> MrResult<ReportOutcome> {
        self.call(|reply| SchedulerMsg::TaskDone { slave, coord, attempt, outputs, reply })
            .await
    }

    pub fn report_failed(
        &self,
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        reason: TaskFailure,
    ) {
        let _ = self.tx.send(SchedulerMsg::TaskFailed { slave, coord, attempt, reason });
    }

    pub fn assign_rejected(&self, slave: SlaveId, coord: TaskCoord, busy: bool) {
        let _ = self.tx.send(SchedulerMsg::AssignRejected { slave, coord, busy });
    }

    pub async fn shutdown(&self) -> MrResult<()> {
        self.call(|reply| SchedulerMsg::Shutdown { reply }).await
    }
}
