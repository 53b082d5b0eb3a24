//! The master↔slave RPC contract, over tarpc with bincode framing.
//!
//! Slaves call the master to register and to report task outcomes; the
//! master calls each slave to hand out work and manage its buckets. Both
//! directions are plain request/response; transport failures retry with
//! exponential backoff and then escalate.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::{RPC_RETRY_BASE_DELAY, RPC_RETRY_LIMIT};
use crate::error::TaskFailure;
use crate::task::{DatasetId, JobId, SlaveId, TaskCoord, TaskDescriptor};
use crate::MrResult;

/// Endpoints and capacity a slave presents at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveInfo {
    pub rpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub capacity: u32,
}

/// The master's answer to a registration: identity plus the bootstrap the
/// slave needs before accepting assignments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub slave_id: SlaveId,
    pub job: JobId,
    pub heartbeat_interval: Duration,
    /// Constructor arguments for the user program, identical to the
    /// master's own.
    pub program_args: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportOutcome {
    Ack,
    /// A later or stale completion: the slave should drop its buckets.
    Discard,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignReply {
    Accepted,
    Busy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatReply {
    /// Tasks the master has reassigned elsewhere; the slave abandons them.
    pub abandon: Vec<TaskCoord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveStatus {
    pub running: Vec<TaskCoord>,
    pub scratch_bytes: u64,
}

#[tarpc::service]
pub trait MasterRpc {
    async fn register(info: SlaveInfo) -> Registration;
    async fn report_done(
        slave: SlaveId,
        coord: TaskCoord,
        attempt: u32,
        outputs: Vec<String>,
    ) -> ReportOutcome;
    async fn report_failed(slave: SlaveId, coord: TaskCoord, attempt: u32, reason: TaskFailure);
    async fn heartbeat(slave: SlaveId, running: Vec<TaskCoord>) -> HeartbeatReply;
}

#[tarpc::service]
pub trait SlaveRpc {
    async fn assign(desc: TaskDescriptor) -> AssignReply;
    async fn cancel(coord: TaskCoord);
    async fn ping() -> SlaveStatus;
    async fn drop_bucket(dataset: DatasetId, source: u32);
    async fn quit();
}

pub async fn connect_master(addr: SocketAddr) -> MrResult<MasterRpcClient> {
    let mk_codec = tokio_serde::formats::Bincode::default;
    let connect = tarpc::serde_transport::tcp::connect(addr, mk_codec);
    let transport = tokio::time::timeout(Duration::from_secs(5), connect)
        .await
        .map_err(|_| eyre!("connection to master at `{addr}` timed out"))??;
    Ok(MasterRpcClient::new(tarpc::client::Config::default(), transport).spawn())
}

pub async fn connect_slave(addr: SocketAddr) -> MrResult<SlaveRpcClient> {
    let mk_codec = tokio_serde::formats::Bincode::default;
    let connect = tarpc::serde_transport::tcp::connect(addr, mk_codec);
    let transport = tokio::time::timeout(Duration::from_secs(5), connect)
        .await
        .map_err(|_| eyre!("connection to slave at `{addr}` timed out"))??;
    Ok(SlaveRpcClient::new(tarpc::client::Config::default(), transport).spawn())
}

/// Retry a transient operation with exponential backoff, up to the
/// configured bound. The last error is returned when the bound is hit.
pub async fn with_backoff<T, E, F, Fut>(mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = RPC_RETRY_BASE_DELAY;
    let mut attempts = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if attempts >= RPC_RETRY_LIMIT {
                    return Err(err);
                }
                trace!(%err, attempts, "rpc failed, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn backoff_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_gives_up_at_the_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_backoff(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RPC_RETRY_LIMIT);
    }
}
