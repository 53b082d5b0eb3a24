//! Shared test program: a WordCount-shaped registry with a pluggable run
//! method, plus small helpers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mapred::registry::Emit;
use mapred::{Job, JobId, MapReduce, MrResult, Record, Registry};

/// How long the deliberately slow mapper stalls, comfortably past the
/// heartbeat deadline used by the tests.
const SLOW_MAPPER_DELAY: Duration = Duration::from_millis(1500);

type RunFn = Box<dyn Fn(&mut Job) -> MrResult<()> + Send + Sync>;

pub struct TestProgram {
    run_fn: RunFn,
    attempts: Arc<AtomicU32>,
}

impl MapReduce for TestProgram {
    fn registry(&self) -> Registry {
        let mut registry = Registry::new();
        registry.add_mapper("split_words", split_words);
        registry.add_mapper("annotate", annotate);

        let attempts = Arc::clone(&self.attempts);
        registry.add_mapper(
            "always_fails",
            move |_key: &[u8], _value: &[u8], _emit: Emit<'_>| -> MrResult<()> {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(eyre::eyre!("mapper exploded"))
            },
        );

        registry.add_mapper(
            "slow_split",
            |key: &[u8], value: &[u8], emit: Emit<'_>| -> MrResult<()> {
                std::thread::sleep(SLOW_MAPPER_DELAY);
                split_words(key, value, emit)
            },
        );

        registry.add_reducer("sum_counts", sum_counts);
        registry
    }

    fn run(&self, job: &mut Job) -> MrResult<()> {
        (self.run_fn)(job)
    }
}

/// Build a test program around a run closure.
pub fn program(
    run: impl Fn(&mut Job) -> MrResult<()> + Send + Sync + 'static,
) -> Arc<TestProgram> {
    Arc::new(TestProgram { run_fn: Box::new(run), attempts: Arc::new(AtomicU32::new(0)) })
}

/// Like [`program`], sharing the attempt counter incremented by the
/// `always_fails` mapper.
pub fn program_with_counter(
    attempts: Arc<AtomicU32>,
    run: impl Fn(&mut Job) -> MrResult<()> + Send + Sync + 'static,
) -> Arc<TestProgram> {
    Arc::new(TestProgram { run_fn: Box::new(run), attempts })
}

fn split_words(_key: &[u8], value: &[u8], emit: Emit<'_>) -> MrResult<()> {
    for word in value.split(|b| b.is_ascii_whitespace()) {
        if !word.is_empty() {
            emit(word.to_ascii_lowercase(), b"1".to_vec());
        }
    }
    Ok(())
}

/// Prefixes keys with `w:`, leaving values alone.
fn annotate(key: &[u8], value: &[u8], emit: Emit<'_>) -> MrResult<()> {
    let mut prefixed = b"w:".to_vec();
    prefixed.extend_from_slice(key);
    emit(prefixed, value.to_vec());
    Ok(())
}

fn sum_counts(
    key: &[u8],
    values: &mut dyn Iterator<Item = Vec<u8>>,
    emit: Emit<'_>,
) -> MrResult<()> {
    let mut total: u64 = 0;
    for value in values {
        total += std::str::from_utf8(&value)?.trim().parse::<u64>()?;
    }
    emit(key.to_vec(), total.to_string().into_bytes());
    Ok(())
}

pub fn write_input(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

/// Collapse records into word -> numeric count.
pub fn counts_of(records: &[Record]) -> BTreeMap<String, u64> {
    records
        .iter()
        .map(|(k, v)| {
            (
                String::from_utf8(k.clone()).unwrap(),
                String::from_utf8(v.clone()).unwrap().parse::<u64>().unwrap(),
            )
        })
        .collect()
}

/// Unique job ids for side-by-side masters in one test process.
pub fn fresh_job_id() -> JobId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    JobId::new(NEXT.fetch_add(1, Ordering::SeqCst))
}
