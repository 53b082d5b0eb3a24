//! End-to-end scenarios: master and slaves in one process, talking over
//! localhost TCP and HTTP.

mod fixtures;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mapred::config::{MasterConfig, SlaveConfig};
use mapred::datasets::{DatasetKind, DatasetSpec};
use mapred::driver::{self, EXIT_FATAL, EXIT_SUCCESS};
use mapred::master::MasterHandle;
use mapred::slave::SlaveHandle;
use mapred::{
    DataOpts, DatasetId, JobAborted, JobId, MapReduce, Record, SubmitError, TaskCoord,
};

use fixtures::{counts_of, program, write_input, TestProgram};

const HEARTBEAT: Duration = Duration::from_millis(100);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_master(tmp: &Path, max_attempts: u32) -> MasterHandle {
    let config = MasterConfig {
        job: fixtures::fresh_job_id(),
        rpc_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        tmpdir: tmp.join("master"),
        max_attempts,
        heartbeat_interval: HEARTBEAT,
        timing_slaves: 0,
        program_args: vec![],
    };
    MasterHandle::start(config).await.unwrap()
}

async fn start_slave(
    master: &MasterHandle,
    tmp: &Path,
    index: usize,
    program: Arc<TestProgram>,
) -> SlaveHandle {
    let config = SlaveConfig {
        master: master.rpc_addr,
        rpc_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        tmpdir: tmp.join(format!("slave{index}")),
        capacity: 1,
    };
    SlaveHandle::start(config, move |_| Ok(program as Arc<dyn MapReduce>))
        .await
        .unwrap()
}

fn bucket_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().map(|e| e == "bucket").unwrap_or(false) {
                found.push(path);
            }
        }
    }
    found
}

#[tokio::test]
async fn wordcount_single_slave() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "input.txt", "a a b");

    let results: Arc<Mutex<Vec<Record>>> = Arc::default();
    let collected = Arc::clone(&results);
    let prog = program(move |job| {
        let files = job.file_data(vec![input.clone()])?;
        let counts = job.map_data(files, "split_words", DataOpts::default().splits(1))?;
        let totals = job.reduce_data(counts, "sum_counts", DataOpts::default().splits(1))?;
        let done = job.wait(&[totals], None)?;
        assert_eq!(done, vec![totals]);
        assert_eq!(job.progress(totals)?, 1.0);
        *collected.lock().unwrap() = job.fetchall(totals)?;
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let _slave = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;

    let code = driver::run_job(&master, prog).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    let counts = counts_of(&results.lock().unwrap());
    assert_eq!(counts, BTreeMap::from([("a".into(), 2), ("b".into(), 1)]));
    master.shutdown().await;
}

#[tokio::test]
async fn wordcount_two_slaves_two_reduce_splits() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "input.txt", "a b a");

    let results: Arc<Mutex<Vec<Record>>> = Arc::default();
    let totals_id: Arc<Mutex<Option<DatasetId>>> = Arc::default();
    let collected = Arc::clone(&results);
    let totals_out = Arc::clone(&totals_id);
    let prog = program(move |job| {
        let files = job.file_data(vec![input.clone()])?;
        let counts = job.map_data(files, "split_words", DataOpts::default().splits(1))?;
        let totals = job.reduce_data(counts, "sum_counts", DataOpts::default().splits(2))?;
        job.wait(&[totals], None)?;
        *collected.lock().unwrap() = job.fetchall(totals)?;
        *totals_out.lock().unwrap() = Some(totals);
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let _s0 = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;
    let _s1 = start_slave(&master, tmp.path(), 1, Arc::clone(&prog)).await;

    let code = driver::run_job(&master, prog).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    let counts = counts_of(&results.lock().unwrap());
    assert_eq!(counts, BTreeMap::from([("a".into(), 2), ("b".into(), 1)]));

    // Each key lands in exactly one reduce split, with its values together.
    let totals = totals_id.lock().unwrap().unwrap();
    let meta = master.scheduler.fetch_meta(totals).await.unwrap().unwrap();
    assert_eq!(meta.columns.len(), 2);
    let fetcher = mapred::http::Fetcher::new();
    let mut owners: BTreeMap<String, usize> = BTreeMap::new();
    for (split, column) in meta.columns.iter().enumerate() {
        let records = mapred::http::fetch_records(&fetcher, column, None, None).await.unwrap();
        for (key, _) in records {
            let key = String::from_utf8(key).unwrap();
            assert!(
                owners.insert(key.clone(), split).is_none(),
                "key {key} appeared in more than one reduce split"
            );
        }
    }
    assert_eq!(owners.len(), 2);
    master.shutdown().await;
}

#[tokio::test]
async fn slave_lost_mid_map_is_reassigned() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let a = write_input(tmp.path(), "a.txt", "a a b");
    let b = write_input(tmp.path(), "b.txt", "b c");

    let results: Arc<Mutex<Vec<Record>>> = Arc::default();
    let collected = Arc::clone(&results);
    let prog = program(move |job| {
        let files = job.file_data(vec![a.clone(), b.clone()])?;
        let counts = job.map_data(files, "slow_split", DataOpts::default().splits(2))?;
        let totals = job.reduce_data(counts, "sum_counts", DataOpts::default().splits(1))?;
        job.wait(&[totals], None)?;
        *collected.lock().unwrap() = job.fetchall(totals)?;
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let _s0 = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;
    let s1 = start_slave(&master, tmp.path(), 1, Arc::clone(&prog)).await;

    let (code, _) = tokio::join!(driver::run_job(&master, prog), async {
        // Let the heartbeats and both map assignments land, then vanish.
        tokio::time::sleep(Duration::from_millis(400)).await;
        s1.kill();
    });
    assert_eq!(code.unwrap(), EXIT_SUCCESS);

    let counts = counts_of(&results.lock().unwrap());
    assert_eq!(
        counts,
        BTreeMap::from([("a".into(), 2), ("b".into(), 2), ("c".into(), 1)])
    );
    master.shutdown().await;
}

#[tokio::test]
async fn unreachable_slave_rpc_escalates_to_lost() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let a = write_input(tmp.path(), "a.txt", "a a b");
    let b = write_input(tmp.path(), "b.txt", "b c");

    let results: Arc<Mutex<Vec<Record>>> = Arc::default();
    let collected = Arc::clone(&results);
    let prog = program(move |job| {
        let files = job.file_data(vec![a.clone(), b.clone()])?;
        let counts = job.map_data(files, "split_words", DataOpts::default().splits(2))?;
        let totals = job.reduce_data(counts, "sum_counts", DataOpts::default().splits(1))?;
        job.wait(&[totals], None)?;
        *collected.lock().unwrap() = job.fetchall(totals)?;
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let _s0 = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;
    let s1 = start_slave(&master, tmp.path(), 1, Arc::clone(&prog)).await;

    // s1 keeps heartbeating but its RPC endpoint is gone: assignments to it
    // fail, and the assign-side backoff alone must escalate to slave-lost.
    s1.stop_rpc();

    let code = driver::run_job(&master, prog).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    let counts = counts_of(&results.lock().unwrap());
    assert_eq!(
        counts,
        BTreeMap::from([("a".into(), 2), ("b".into(), 2), ("c".into(), 1)])
    );
    master.shutdown().await;
}

#[tokio::test]
async fn retry_bound_exhausted_aborts_the_job() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "input.txt", "a a b");

    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let prog_attempts = Arc::clone(&attempts);
    let prog = fixtures::program_with_counter(prog_attempts, move |job| {
        let files = job.file_data(vec![input.clone()])?;
        let counts = job.map_data(files, "always_fails", DataOpts::default().splits(1))?;
        let err = job.wait(&[counts], None).unwrap_err();
        assert!(err.downcast_ref::<JobAborted>().is_some(), "wait should report the abort");
        // Submissions after the abort are refused.
        let submit_err = job.map_data(files, "split_words", DataOpts::default()).unwrap_err();
        assert_eq!(
            submit_err.downcast_ref::<SubmitError>(),
            Some(&SubmitError::JobAborted)
        );
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let _slave = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;

    let code = driver::run_job(&master, prog).await.unwrap();
    assert_eq!(code, EXIT_FATAL);
    assert_eq!(seen.load(Ordering::SeqCst), 3, "retry bound of 3 means 3 attempts");
    master.shutdown().await;
}

#[tokio::test]
async fn iterative_job_leaves_no_residual_buckets() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let results: Arc<Mutex<Vec<Record>>> = Arc::default();
    let collected = Arc::clone(&results);
    let prog = program(move |job| {
        let pairs: Vec<Record> = (0..20)
            .map(|i| (format!("k{i}").into_bytes(), b"1".to_vec()))
            .collect();
        let local = job.local_data(pairs, DataOpts::default().splits(2))?;
        let m1 = job.map_data(local, "annotate", DataOpts::default().splits(2))?;
        let r1 = job.reduce_data(m1, "sum_counts", DataOpts::default().splits(2))?;
        job.wait(&[r1], None)?;
        job.close(local)?;
        job.close(m1)?;

        let m2 = job.map_data(r1, "annotate", DataOpts::default().splits(2))?;
        let r2 = job.reduce_data(m2, "sum_counts", DataOpts::default().splits(2))?;
        job.wait(&[r2], None)?;
        *collected.lock().unwrap() = job.fetchall(r2)?;
        job.close(r1)?;
        job.close(m2)?;
        job.close(r2)?;
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let slave = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;
    let scratch = slave.scratch_root();

    let code = driver::run_job(&master, prog).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);
    assert_eq!(results.lock().unwrap().len(), 20);

    // Bucket GC is asynchronous; poll until the scratch trees drain.
    let mut roots = vec![master.store.job_root().unwrap().to_path_buf()];
    roots.extend(scratch);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let residual: usize = roots.iter().map(|root| bucket_files(root).len()).sum();
        if residual == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{residual} bucket files still present after close+GC"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    master.shutdown().await;
}

#[tokio::test]
async fn reducemap_matches_reduce_then_map_with_fewer_buckets() {
    init_tracing();

    async fn run_chain(fused: bool) -> (BTreeMap<String, u64>, usize) {
        let tmp = tempfile::tempdir().unwrap();
        let input = write_input(tmp.path(), "input.txt", "a a b c c c");

        let results: Arc<Mutex<Vec<Record>>> = Arc::default();
        let collected = Arc::clone(&results);
        let prog = program(move |job| {
            let files = job.file_data(vec![input.clone()])?;
            let counts = job.map_data(files, "split_words", DataOpts::default().splits(1))?;
            let terminal = if fused {
                job.reducemap_data(counts, "sum_counts", "annotate", DataOpts::default().splits(1))?
            } else {
                let reduced =
                    job.reduce_data(counts, "sum_counts", DataOpts::default().splits(1))?;
                job.map_data(reduced, "annotate", DataOpts::default().splits(1))?
            };
            job.wait(&[terminal], None)?;
            *collected.lock().unwrap() = job.fetchall(terminal)?;
            Ok(())
        });

        let master = start_master(tmp.path(), 3).await;
        let slave = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;

        let code = driver::run_job(&master, prog).await.unwrap();
        assert_eq!(code, EXIT_SUCCESS);

        let buckets = slave.scratch_root().map(|root| bucket_files(&root).len()).unwrap_or(0);
        let counts = counts_of(&results.lock().unwrap());
        master.shutdown().await;
        (counts, buckets)
    }

    let (plain, plain_buckets) = run_chain(false).await;
    let (fused, fused_buckets) = run_chain(true).await;

    assert_eq!(plain, fused);
    assert_eq!(plain, BTreeMap::from([("w:a".into(), 2), ("w:b".into(), 1), ("w:c".into(), 3)]));
    assert!(
        fused_buckets < plain_buckets,
        "fusion should write fewer buckets ({fused_buckets} vs {plain_buckets})"
    );
}

#[tokio::test]
async fn empty_local_data_completes_with_empty_consumers() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let results: Arc<Mutex<Vec<Record>>> = Arc::default();
    let collected = Arc::clone(&results);
    let prog = program(move |job| {
        let local = job.local_data(Vec::<Record>::new(), DataOpts::default().splits(2))?;
        assert_eq!(job.progress(local)?, 1.0);
        // Complete datasets surface from wait immediately, even with
        // timeout zero.
        assert_eq!(job.wait(&[local], Some(Duration::ZERO))?, vec![local]);

        let map = job.map_data(local, "annotate", DataOpts::default().splits(2))?;
        job.wait(&[map], None)?;
        *collected.lock().unwrap() = job.fetchall(map)?;

        // Closing twice is a no-op.
        job.close(local)?;
        job.close(local)?;
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let _slave = start_slave(&master, tmp.path(), 0, Arc::clone(&prog)).await;

    let code = driver::run_job(&master, prog).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);
    assert!(results.lock().unwrap().is_empty());
    master.shutdown().await;
}

#[tokio::test]
async fn wait_with_zero_timeout_returns_incomplete_subset() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let input = write_input(tmp.path(), "input.txt", "a");

    let prog = program(move |job| {
        let files = job.file_data(vec![input.clone()])?;
        // No slaves are registered, so the map cannot complete.
        let counts = job.map_data(files, "split_words", DataOpts::default().splits(1))?;
        assert_eq!(job.wait(&[files], Some(Duration::ZERO))?, vec![files]);
        assert_eq!(job.wait(&[counts], Some(Duration::ZERO))?, vec![]);
        assert_eq!(job.progress(counts)?, 0.0);
        Ok(())
    });

    let master = start_master(tmp.path(), 3).await;
    let code = driver::run_job(&master, prog).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);
    master.shutdown().await;
}

#[tokio::test]
async fn submission_errors_surface_synchronously() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let master = start_master(tmp.path(), 3).await;

    let bogus = DatasetSpec {
        kind: DatasetKind::Map { mapper: "m".into() },
        sources: vec![DatasetId::new(404)],
        num_splits: 1,
        output_dir: None,
        parter: "hash".into(),
        combiner: None,
        key_serializer: None,
        value_serializer: None,
    };
    let err = master.scheduler.submit(bogus).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<SubmitError>(),
        Some(&SubmitError::UnknownParent(DatasetId::new(404)))
    );

    let zero_splits = DatasetSpec {
        kind: DatasetKind::FileUrls { urls: vec!["file:///x".into()] },
        sources: vec![],
        num_splits: 0,
        output_dir: None,
        parter: "hash".into(),
        combiner: None,
        key_serializer: None,
        value_serializer: None,
    };
    let err = master.scheduler.submit(zero_splits).await.unwrap_err();
    assert_eq!(err.downcast_ref::<SubmitError>(), Some(&SubmitError::InvalidSplits(0)));

    master.shutdown().await;
}

#[tokio::test]
async fn stale_heartbeat_reply_tells_slave_to_abandon() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let master = start_master(tmp.path(), 3).await;

    // A heartbeat naming a task the scheduler never assigned to the slave
    // comes back in the abandon list.
    master.scheduler.slave_registered(mapred::SlaveId::new(77), 1, "127.0.0.1:1".into());
    let phantom = TaskCoord::new(DatasetId::new(5), 0);
    let abandon = master
        .scheduler
        .heartbeat(mapred::SlaveId::new(77), vec![phantom])
        .await
        .unwrap();
    assert_eq!(abandon, vec![phantom]);
    master.shutdown().await;
}

#[tokio::test]
async fn deterministic_task_rng_is_reproducible() {
    use rand::RngCore;
    let coord = TaskCoord::new(DatasetId::new(9), 3);
    let mut a = mapred::task_rng(coord, 1, &[7, 7, 7]);
    let mut b = mapred::task_rng(coord, 1, &[7, 7, 7]);
    assert_eq!(
        (0..8).map(|_| a.next_u64()).collect::<Vec<_>>(),
        (0..8).map(|_| b.next_u64()).collect::<Vec<_>>()
    );
}

// Keep JobId in the public surface exercised from the outside.
#[test]
fn job_ids_display_as_numbers() {
    assert_eq!(JobId::new(9).to_string(), "9");
}
