//! The job driver: binds a user program to a master (or slave) node and
//! turns the outcome into an exit code.
//!
//! Exit codes: 0 on success, 1 on a user-program error, 2 on a
//! scheduler-detected fatal failure.

use clap::Parser;
use std::sync::Arc;

use crate::config::{MasterConfig, Mode, Opts, SlaveConfig};
use crate::job::Job;
use crate::master::MasterHandle;
use crate::program::MapReduce;
use crate::rpc::Registration;
use crate::slave::SlaveHandle;
use crate::MrResult;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_USER_ERROR: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Parse the command line, construct the program, and run in the selected
/// mode. The factory receives the user-program arguments: the local ones in
/// master mode, the master's shipped ones in slave mode.
pub fn run_main<F>(make_program: F) -> i32
where
    F: Fn(&Opts) -> MrResult<Arc<dyn MapReduce>>,
{
    let opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let outcome = match opts.mode {
        Mode::Master => runtime.block_on(run_master_mode(&opts, &make_program)),
        Mode::Slave => runtime.block_on(run_slave_mode(&opts, &make_program)),
        Mode::Serial | Mode::Bypass => {
            eprintln!("the serial/bypass executor is a separate program; use --mrs master");
            Ok(EXIT_USER_ERROR)
        }
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            error!(?err, "driver failed");
            eprintln!("error: {err:#}");
            EXIT_USER_ERROR
        }
    }
}

async fn run_master_mode<F>(opts: &Opts, make_program: &F) -> MrResult<i32>
where
    F: Fn(&Opts) -> MrResult<Arc<dyn MapReduce>>,
{
    let program = make_program(opts)?;
    let config = MasterConfig::from_opts(opts);
    let master = MasterHandle::start(config).await?;
    info!(rpc = %master.rpc_addr, "master up");
    let code = run_job(&master, program).await?;
    master.shutdown().await;
    Ok(code)
}

/// Run the program's `run` method against a started master and wait for it
/// (or a signal). Exposed for in-process drivers and tests.
pub async fn run_job(master: &MasterHandle, program: Arc<dyn MapReduce>) -> MrResult<i32> {
    let handle = tokio::runtime::Handle::current();
    let scheduler = master.scheduler.clone();
    let store = Arc::clone(&master.store);

    let user = tokio::task::spawn_blocking(move || {
        let mut job = Job::new(handle, scheduler, store, Arc::clone(&program));
        program.run(&mut job)
    });

    let run_result = tokio::select! {
        result = user => match result {
            Ok(inner) => inner,
            Err(join) => Err(eyre!("run method panicked: {join}")),
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down");
            Err(eyre!("interrupted"))
        }
    };

    // A scheduler abort outranks whatever the run method returned.
    if let Some(reason) = master.scheduler.aborted().await? {
        error!(%reason, "job aborted");
        return Ok(EXIT_FATAL);
    }
    match run_result {
        Ok(()) => Ok(EXIT_SUCCESS),
        Err(err) => {
            error!(?err, "run method failed");
            Ok(EXIT_USER_ERROR)
        }
    }
}

async fn run_slave_mode<F>(opts: &Opts, make_program: &F) -> MrResult<i32>
where
    F: Fn(&Opts) -> MrResult<Arc<dyn MapReduce>>,
{
    let config = SlaveConfig::from_opts(opts)?;
    let outer = opts.clone();
    let mut slave = SlaveHandle::start(config, move |registration: &Registration| {
        // Construct with the master's arguments so every process sees the
        // same program state.
        let mut opts = outer;
        opts.args = registration.program_args.clone();
        make_program(&opts)
    })
    .await?;
    info!(slave = %slave.id, "slave up");
    slave.wait_quit().await;
    slave.shutdown();
    Ok(EXIT_SUCCESS)
}
