//! Bounded worker pool for independent trials.
//!
//! Up to `concurrency` jobs run at once, each on its own tokio task. A
//! failing job never stops the others: its error is pushed onto a shared,
//! lock-guarded list that is returned once every job has finished.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A job that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// The job's label.
    pub job: String,
    pub error: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.job, self.error)
    }
}

/// Everything a pool run produced.
#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// Results of successful jobs, in completion order of their handles.
    pub results: Vec<T>,
    /// Every failure, in no particular order.
    pub failures: Vec<JobFailure>,
}

impl<T> PoolOutcome<T> {
    /// Total jobs accounted for.
    pub fn total(&self) -> usize {
        self.results.len() + self.failures.len()
    }
}

/// Runs jobs with bounded parallelism.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    /// Creates a pool; a concurrency of zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs every job to completion and returns all results and failures.
    ///
    /// Jobs not yet started when `cancel` fires are reported as failures;
    /// jobs already running observe the token themselves.
    pub async fn run<J, T, E, F, Fut>(
        &self,
        jobs: Vec<J>,
        cancel: &CancellationToken,
        work: F,
    ) -> PoolOutcome<T>
    where
        J: fmt::Display + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let total = jobs.len();
        info!(jobs = total, concurrency = self.concurrency, "Starting worker pool");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let failures: Arc<Mutex<Vec<JobFailure>>> = Arc::new(Mutex::new(Vec::new()));
        let work = Arc::new(work);
        let mut handles = Vec::with_capacity(total);

        for job in jobs {
            let label = job.to_string();
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                failures.lock().await.push(JobFailure {
                    job: label,
                    error: "cancelled before start".to_string(),
                });
                continue;
            };

            let work = Arc::clone(&work);
            let failures = Arc::clone(&failures);
            let job_label = label.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                debug!(job = %job_label, "Job started");
                match work(job).await {
                    Ok(result) => Some(result),
                    Err(e) => {
                        error!(job = %job_label, error = %e, "Job failed");
                        failures.lock().await.push(JobFailure {
                            job: job_label,
                            error: e.to_string(),
                        });
                        None
                    }
                }
            });
            handles.push((label, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (label, handle) in handles {
            match handle.await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => failures.lock().await.push(JobFailure {
                    job: label,
                    error: format!("worker panicked: {e}"),
                }),
            }
        }

        let failures = std::mem::take(&mut *failures.lock().await);
        info!(
            succeeded = results.len(),
            failed = failures.len(),
            "Worker pool finished"
        );
        PoolOutcome { results, failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_and_collects_errors() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(3);

        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let outcome = pool
            .run((0..10).collect(), &CancellationToken::new(), move |n: u32| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if n == 4 {
                        Err(format!("job {n} broke"))
                    } else {
                        Ok(n * 2)
                    }
                }
            })
            .await;

        assert_eq!(outcome.total(), 10);
        assert_eq!(outcome.results.len(), 9);
        assert_eq!(
            outcome.failures,
            vec![JobFailure {
                job: "4".to_string(),
                error: "job 4 broke".to_string()
            }]
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let outcome = WorkerPool::new(2)
            .run(vec![1u32, 2, 3], &CancellationToken::new(), |n: u32| async move {
                if n == 2 {
                    panic!("boom");
                }
                Ok::<_, String>(n)
            })
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].job, "2");
        assert!(outcome.failures[0].error.contains("panicked"));
    }

    #[tokio::test]
    async fn test_cancelled_jobs_are_reported() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = WorkerPool::new(1)
            .run(vec!["a", "b"], &cancel, |_job: &'static str| async move {
                Ok::<_, String>(())
            })
            .await;

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures.iter().all(|f| f.error.contains("cancelled")));
    }

    #[test]
    fn test_zero_concurrency_is_one() {
        assert_eq!(WorkerPool::new(0).concurrency(), 1);
    }
}
