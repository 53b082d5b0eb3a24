//! WordCount: the canonical job, runnable standalone or distributed.
//!
//! ```text
//! mapred-wordcount input1.txt input2.txt                  # master
//! mapred-wordcount --mrs slave --mrs-master host:8077     # slave
//! ```

use std::sync::Arc;

use mapred::config::Opts;
use mapred::registry::Emit;
use mapred::{DataOpts, Job, MapReduce, MrResult, Registry};

struct WordCount {
    inputs: Vec<String>,
    splits: u32,
}

impl WordCount {
    fn from_opts(opts: &Opts) -> MrResult<Self> {
        if opts.args.is_empty() {
            eyre::bail!("usage: mapred-wordcount <input files...>");
        }
        Ok(Self { inputs: opts.args.clone(), splits: opts.args.len() as u32 })
    }
}

fn split_words(_key: &[u8], value: &[u8], emit: Emit<'_>) -> MrResult<()> {
    for word in value.split(|b| b.is_ascii_whitespace()) {
        if !word.is_empty() {
            emit(word.to_ascii_lowercase(), b"1".to_vec());
        }
    }
    Ok(())
}

fn sum_counts(
    key: &[u8],
    values: &mut dyn Iterator<Item = Vec<u8>>,
    emit: Emit<'_>,
) -> MrResult<()> {
    let mut total: u64 = 0;
    for value in values {
        let text = std::str::from_utf8(&value)?;
        total += text.parse::<u64>()?;
    }
    emit(key.to_vec(), total.to_string().into_bytes());
    Ok(())
}

impl MapReduce for WordCount {
    fn registry(&self) -> Registry {
        let mut registry = Registry::new();
        registry.add_mapper("split_words", split_words);
        registry.add_reducer("sum_counts", sum_counts);
        registry
    }

    fn run(&self, job: &mut Job) -> MrResult<()> {
        let files = job.file_data(self.inputs.clone())?;
        let counts = job.map_data(
            files,
            "split_words",
            DataOpts::default().splits(self.splits).combiner("sum_counts"),
        )?;
        let totals = job.reduce_data(counts, "sum_counts", DataOpts::default().splits(1))?;

        job.wait(&[totals], None)?;
        for (word, count) in job.fetchall(totals)? {
            println!("{}\t{}", String::from_utf8_lossy(&word), String::from_utf8_lossy(&count));
        }

        job.close(files)?;
        job.close(counts)?;
        job.close(totals)?;
        Ok(())
    }
}

fn main() {
    let code = mapred::driver::run_main(|opts| {
        Ok(Arc::new(WordCount::from_opts(opts)?) as Arc<dyn MapReduce>)
    });
    std::process::exit(code);
}
