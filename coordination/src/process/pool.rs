//! Bounded worker pool over an ordered list of jobs.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};

use super::ProcessError;

/// How many jobs may run at once. `Limited` models a target's available
/// cores (spec §4.2); `Unbounded` is used for jobs with no target affinity
/// (manifest validation, local queries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Unbounded,
    Limited(usize),
}

impl Concurrency {
    fn as_limit(self, job_count: usize) -> usize {
        match self {
            Concurrency::Unbounded => job_count.max(1),
            Concurrency::Limited(n) => n.max(1),
        }
    }
}

/// Drives a set of jobs to completion, honoring a shared interrupt flag
/// (set from a `ctrl_c` handler) checked before each job starts. A job
/// already running when the interrupt fires is allowed to finish; no new
/// job is dispatched afterward.
pub struct JobQueue<T> {
    results: Vec<Option<Result<T, ProcessError>>>,
}

impl<T> JobQueue<T> {
    pub fn into_results(self) -> Vec<Result<T, ProcessError>> {
        self.results
            .into_iter()
            .map(|r| r.unwrap_or(Err(ProcessError::Interrupted)))
            .collect()
    }
}

/// Run `jobs` with at most `concurrency` in flight at once, preserving
/// the original submission order in the returned `Vec`.
pub async fn spawn_bounded<F, T>(
    jobs: Vec<F>,
    concurrency: Concurrency,
    interrupt: Arc<AtomicBool>,
) -> Vec<Result<T, ProcessError>>
where
    F: Future<Output = Result<T, ProcessError>> + Send + 'static,
    T: Send + 'static,
{
    let limit = concurrency.as_limit(jobs.len());
    let mut queue = JobQueue {
        results: (0..jobs.len()).map(|_| None).collect(),
    };

    let mut pending: std::collections::VecDeque<(usize, F)> = jobs.into_iter().enumerate().collect();
    let mut in_flight: FuturesUnordered<tokio::task::JoinHandle<(usize, Result<T, ProcessError>)>> =
        FuturesUnordered::new();

    loop {
        while in_flight.len() < limit {
            if interrupt.load(Ordering::SeqCst) {
                break;
            }
            let Some((index, job)) = pending.pop_front() else {
                break;
            };
            in_flight.push(tokio::spawn(async move { (index, job.await) }));
        }

        if in_flight.is_empty() {
            break;
        }

        match in_flight.next().await {
            Some(Ok((index, result))) => queue.results[index] = Some(result),
            Some(Err(join_err)) => {
                tracing::warn!(error = %join_err, "process job task panicked");
            }
            None => break,
        }
    }

    queue.into_results()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_all_jobs_respecting_order() {
        let jobs: Vec<_> = (0..5)
            .map(|i| async move { Ok::<_, ProcessError>(i * 2) })
            .collect();
        let results = spawn_bounded(jobs, Concurrency::Limited(2), Arc::new(AtomicBool::new(false))).await;
        let values: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<_> = (0..6)
            .map(|_| {
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ProcessError>(())
                }
            })
            .collect();
        spawn_bounded(jobs, Concurrency::Limited(2), Arc::new(AtomicBool::new(false))).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn interrupt_stops_dispatch_of_new_jobs() {
        let interrupt = Arc::new(AtomicBool::new(true));
        let jobs: Vec<_> = (0..3).map(|i| async move { Ok::<_, ProcessError>(i) }).collect();
        let results = spawn_bounded(jobs, Concurrency::Limited(2), interrupt).await;
        assert!(results.iter().all(|r| matches!(r, Err(ProcessError::Interrupted))));
    }
}
