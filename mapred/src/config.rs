//! Runtime configuration and the `--mrs*` command-line surface.

use clap::{Parser, ValueEnum};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::task::JobId;

pub const DEFAULT_MASTER_PORT: u16 = 8077;

/// Attempts per task before the job aborts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive missed heartbeats before a slave is declared lost.
pub const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// Transport-level RPC retries before the failure escalates.
pub const RPC_RETRY_LIMIT: u32 = 4;

pub const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Execution mode selected by `--mrs`. `serial` and `bypass` name the
/// single-process executor, which lives outside this runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Master,
    Slave,
    Serial,
    Bypass,
}

/// Command-line surface shared by every program linking the runtime.
/// Positional arguments belong to the user program and pass through.
#[derive(Debug, Clone, Parser)]
pub struct Opts {
    /// Execution mode.
    #[clap(long = "mrs", value_enum, default_value = "master")]
    pub mode: Mode,

    /// Master RPC address (slave mode).
    #[clap(long = "mrs-master")]
    pub master: Option<SocketAddr>,

    /// Port for the master RPC server; 0 picks an ephemeral port.
    #[clap(long = "mrs-port", default_value_t = 0)]
    pub port: u16,

    /// Scratch directory root.
    #[clap(long = "mrs-tmpdir")]
    pub tmpdir: Option<PathBuf>,

    /// Hold dispatch until this many slaves have registered.
    #[clap(long = "mrs-timing-slaves", default_value_t = 0)]
    pub timing_slaves: usize,

    /// Concurrent task capacity a slave advertises at registration.
    #[clap(long = "mrs-capacity", default_value_t = 1)]
    pub capacity: u32,

    /// User program arguments.
    pub args: Vec<String>,
}

impl Opts {
    pub fn tmpdir(&self) -> PathBuf {
        self.tmpdir.clone().unwrap_or_else(|| std::env::temp_dir().join("mapred"))
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub job: JobId,
    /// Bind address for the master RPC server.
    pub rpc_addr: SocketAddr,
    /// Bind address for the master's bucket server (serves local data).
    pub http_addr: SocketAddr,
    pub tmpdir: PathBuf,
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    pub timing_slaves: usize,
    /// User-program arguments, shipped to slaves in the bootstrap.
    pub program_args: Vec<String>,
}

impl MasterConfig {
    pub fn from_opts(opts: &Opts) -> Self {
        Self {
            job: fresh_job_id(),
            rpc_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, opts.port)),
            http_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            tmpdir: opts.tmpdir(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            timing_slaves: opts.timing_slaves,
            program_args: opts.args.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub master: SocketAddr,
    /// Bind address for the slave RPC server; an ephemeral port by default.
    pub rpc_addr: SocketAddr,
    /// Bind address for the slave's bucket server.
    pub http_addr: SocketAddr,
    pub tmpdir: PathBuf,
    pub capacity: u32,
}

impl SlaveConfig {
    pub fn from_opts(opts: &Opts) -> crate::MrResult<Self> {
        let master = opts
            .master
            .ok_or_else(|| eyre!("slave mode requires --mrs-master"))?;
        Ok(Self {
            master,
            rpc_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            http_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            tmpdir: opts.tmpdir(),
            capacity: opts.capacity.max(1),
        })
    }
}

/// Job ids only need to be unique per scratch root across runs.
fn fresh_job_id() -> JobId {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    JobId::new(micros)
}
