//! On-disk bucket store.
//!
//! Buckets live at `{tmpdir}/{job_id}/{dataset_id}/{task_index}/{split}.bucket`.
//! A task attempt writes into an attempt-suffixed staging directory (so
//! concurrent attempts can never overlap on disk) and the whole directory is
//! moved into place when the attempt seals. Buckets are append-only during
//! an attempt and read-only after sealing. Dropped buckets leave a
//! tombstone so the HTTP server can answer 410 instead of 404.

use dashmap::DashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::codec::RecordWriter;
use crate::error::MrResult;
use crate::task::{DatasetId, JobId};

pub struct BucketStore {
    tmpdir: PathBuf,
    root: OnceLock<PathBuf>,
    base_url: OnceLock<String>,
    tombstones: DashSet<(DatasetId, u32)>,
    bytes_written: AtomicU64,
}

impl BucketStore {
    pub fn new(tmpdir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            tmpdir: tmpdir.into(),
            root: OnceLock::new(),
            base_url: OnceLock::new(),
            tombstones: DashSet::new(),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Scope the store to a job. Paths are unusable until this is called
    /// (slaves learn the job id at registration).
    pub fn set_job(&self, job: JobId) -> MrResult<()> {
        let root = self.tmpdir.join(job.to_string());
        fs::create_dir_all(&root)?;
        let _ = self.root.set(root);
        Ok(())
    }

    /// Record the address the bucket server actually bound to.
    pub fn set_base_url(&self, addr: SocketAddr) {
        let _ = self.base_url.set(format!("http://{addr}"));
    }

    pub fn url_for(&self, dataset: DatasetId, source: u32, split: u32) -> String {
        let base = self.base_url.get().map(String::as_str).unwrap_or("http://unbound");
        format!("{base}/bucket/{dataset}/{source}/{split}")
    }

    fn root(&self) -> MrResult<&Path> {
        self.root
            .get()
            .map(PathBuf::as_path)
            .ok_or_else(|| eyre!("bucket store has no job scope yet"))
    }

    pub fn job_root(&self) -> Option<&Path> {
        self.root.get().map(PathBuf::as_path)
    }

    fn task_dir(&self, dataset: DatasetId, source: u32) -> MrResult<PathBuf> {
        Ok(self.root()?.join(dataset.to_string()).join(source.to_string()))
    }

    fn staging_dir(&self, dataset: DatasetId, source: u32, attempt: u32) -> MrResult<PathBuf> {
        Ok(self
            .root()?
            .join(dataset.to_string())
            .join(format!("{source}.attempt{attempt}")))
    }

    pub fn bucket_path(&self, dataset: DatasetId, source: u32, split: u32) -> Option<PathBuf> {
        Some(
            self.root
                .get()?
                .join(dataset.to_string())
                .join(source.to_string())
                .join(format!("{split}.bucket")),
        )
    }

    pub fn is_dropped(&self, dataset: DatasetId, source: u32) -> bool {
        self.tombstones.contains(&(dataset, source))
    }

    /// Open writers for one task attempt's output buckets.
    pub fn task_writers(
        self: &Arc<Self>,
        dataset: DatasetId,
        source: u32,
        attempt: u32,
        splits: u32,
    ) -> MrResult<TaskWriters> {
        let dir = self.staging_dir(dataset, source, attempt)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let mut writers = Vec::with_capacity(splits as usize);
        for split in 0..splits {
            let file = File::create(dir.join(format!("{split}.bucket")))?;
            writers.push(RecordWriter::new(BufWriter::new(file)));
        }
        Ok(TaskWriters { store: Arc::clone(self), dataset, source, dir, writers })
    }

    /// Remove a task's sealed buckets; later reads answer 410. Returns the
    /// bytes freed.
    pub fn drop_task(&self, dataset: DatasetId, source: u32) -> u64 {
        let Ok(dir) = self.task_dir(dataset, source) else { return 0 };
        let freed = dir_size(&dir);
        let _ = fs::remove_dir_all(&dir);
        self.tombstones.insert((dataset, source));
        self.bytes_written.fetch_sub(freed.min(self.scratch_bytes()), Ordering::Relaxed);
        freed
    }

    /// Remove every bucket of a dataset (used for master-hosted local data
    /// and for final cleanup).
    pub fn drop_dataset(&self, dataset: DatasetId) {
        let Ok(root) = self.root() else { return };
        let dir = root.join(dataset.to_string());
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if let Some(source) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
                {
                    self.tombstones.insert((dataset, source));
                }
            }
        }
        let freed = dir_size(&dir);
        let _ = fs::remove_dir_all(&dir);
        self.bytes_written.fetch_sub(freed.min(self.scratch_bytes()), Ordering::Relaxed);
    }

    /// Delete the whole job scratch tree.
    pub fn purge(&self) {
        if let Some(root) = self.root.get() {
            let _ = fs::remove_dir_all(root);
        }
        self.bytes_written.store(0, Ordering::Relaxed);
    }

    pub fn scratch_bytes(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn record_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else { return 0 };
    entries
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

/// Writers for one task attempt, staged until sealed.
pub struct TaskWriters {
    store: Arc<BucketStore>,
    dataset: DatasetId,
    source: u32,
    dir: PathBuf,
    writers: Vec<RecordWriter<BufWriter<File>>>,
}

impl TaskWriters {
    pub fn splits(&self) -> u32 {
        self.writers.len() as u32
    }

    pub fn write(&mut self, split: u32, key: &[u8], value: &[u8]) -> io::Result<()> {
        self.writers[split as usize].write(key, value)
    }

    /// Flush everything, move the staging directory into place, and return
    /// the advertised URL for each split bucket.
    pub fn seal(self) -> MrResult<Vec<String>> {
        let TaskWriters { store, dataset, source, dir, writers } = self;

        let splits = writers.len() as u32;
        let mut bytes = 0;
        for writer in writers {
            bytes += writer.written();
            writer.finish()?;
        }

        let final_dir = store.task_dir(dataset, source)?;
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&dir, &final_dir)?;

        // A re-produced task resurrects its address.
        store.tombstones.remove(&(dataset, source));
        store.record_written(bytes);

        Ok((0..splits).map(|split| store.url_for(dataset, source, split)).collect())
    }

    /// Throw away this attempt's staged output.
    pub fn discard(self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordReader;
    use std::io::Cursor;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn store() -> (tempfile::TempDir, Arc<BucketStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = BucketStore::new(tmp.path());
        store.set_job(JobId::new(42)).unwrap();
        store.set_base_url(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4500)));
        (tmp, store)
    }

    fn dataset(n: u64) -> DatasetId {
        DatasetId::new(n)
    }

    #[test]
    fn urls_follow_the_bucket_route() {
        let (_tmp, store) = store();
        assert_eq!(store.url_for(dataset(3), 1, 2), "http://127.0.0.1:4500/bucket/3/1/2");
    }

    #[test]
    fn seal_moves_staging_into_place() {
        let (_tmp, store) = store();
        let mut writers = store.task_writers(dataset(1), 0, 1, 2).unwrap();
        writers.write(0, b"a", b"1").unwrap();
        writers.write(1, b"b", b"2").unwrap();

        let urls = writers.seal().unwrap();
        assert_eq!(urls.len(), 2);

        let path = store.bucket_path(dataset(1), 0, 1).unwrap();
        let bytes = fs::read(path).unwrap();
        let records: Vec<_> =
            RecordReader::new(Cursor::new(bytes)).collect::<io::Result<_>>().unwrap();
        assert_eq!(records, vec![(b"b".to_vec(), b"2".to_vec())]);
        assert!(store.scratch_bytes() > 0);
    }

    #[test]
    fn attempts_stage_disjoint_paths() {
        let (_tmp, store) = store();
        let w1 = store.task_writers(dataset(1), 0, 1, 1).unwrap();
        let w2 = store.task_writers(dataset(1), 0, 2, 1).unwrap();
        assert_ne!(w1.dir, w2.dir);
        w1.discard();
        w2.discard();
    }

    #[test]
    fn dropped_tasks_leave_tombstones() {
        let (_tmp, store) = store();
        let mut writers = store.task_writers(dataset(2), 3, 1, 1).unwrap();
        writers.write(0, b"k", b"v").unwrap();
        writers.seal().unwrap();

        assert!(!store.is_dropped(dataset(2), 3));
        store.drop_task(dataset(2), 3);
        assert!(store.is_dropped(dataset(2), 3));
        assert!(store.bucket_path(dataset(2), 3, 0).map(|p| !p.exists()).unwrap_or(true));
    }

    #[test]
    fn resealing_clears_the_tombstone() {
        let (_tmp, store) = store();
        let writers = store.task_writers(dataset(2), 0, 1, 1).unwrap();
        writers.seal().unwrap();
        store.drop_task(dataset(2), 0);
        assert!(store.is_dropped(dataset(2), 0));

        let writers = store.task_writers(dataset(2), 0, 2, 1).unwrap();
        writers.seal().unwrap();
        assert!(!store.is_dropped(dataset(2), 0));
    }

    #[test]
    fn purge_removes_the_job_tree() {
        let (tmp, store) = store();
        let writers = store.task_writers(dataset(5), 0, 1, 1).unwrap();
        writers.seal().unwrap();
        store.purge();
        assert!(!tmp.path().join("42").exists());
    }
}
