//! Job bookkeeping for the on-target agent (spec §4.10).
//!
//! Each invocation the coordinator dispatches gets a job id and a log
//! file under `jobs_dir`, so a caller that loses its connection mid-call
//! can reattach and read the result instead of re-running the operation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assigns monotonically increasing job ids and the log path for each.
pub struct JobRegistry {
    jobs_dir: PathBuf,
    next_id: AtomicU64,
}

impl JobRegistry {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_job_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn log_path(&self, job: JobId) -> PathBuf {
        self.jobs_dir.join(format!("{job}.log"))
    }

    /// Append a line to the job's log, creating it if necessary.
    pub async fn append_log(&self, job: JobId, line: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.jobs_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn read_log(&self, job: JobId) -> std::io::Result<String> {
        tokio::fs::read_to_string(self.log_path(job)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_monotonic() {
        let registry = JobRegistry::new("/tmp/does-not-matter");
        let a = registry.next_job_id();
        let b = registry.next_job_id();
        assert!(b.0 > a.0);
    }

    #[tokio::test]
    async fn append_log_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        let job = registry.next_job_id();
        registry.append_log(job, "starting activation").await.unwrap();
        registry.append_log(job, "activation complete").await.unwrap();
        let log = registry.read_log(job).await.unwrap();
        assert_eq!(log, "starting activation\nactivation complete\n");
    }
}
