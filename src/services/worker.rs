//! Fixed-size pool of queue consumers.
//!
//! Each executor loops dequeue → classify → persist → publish → ack. The
//! ack/nack decision is a `match` on [`ClassifyOutcome`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::orchestrator::{ClassifyOutcome, Orchestrator, ResultSource, RetryReason};
use super::publisher::CompletionPublisher;
use super::queue::{AckHandle, Delivery, JobQueue, NackOutcome, QueueError};
use crate::db::ResultStore;
use crate::models::classification::ClassificationResult;
use crate::models::event::CompletionEvent;
use crate::models::job::Job;

pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(100);

/// Cumulative pool counters, read by the metrics reporter.
#[derive(Debug)]
pub struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub uptime: Duration,
}

impl StatsSnapshot {
    /// Completed jobs per minute of uptime.
    pub fn throughput_per_minute(&self) -> f64 {
        let minutes = self.uptime.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.processed as f64 / minutes
        } else {
            0.0
        }
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// Pause between polls of an empty queue.
    pub idle_delay: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            idle_delay: DEFAULT_IDLE_DELAY,
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ResultStore>,
    publisher: Arc<dyn CompletionPublisher>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn ResultStore>,
        publisher: Arc<dyn CompletionPublisher>,
    ) -> Self {
        Self {
            config,
            queue,
            orchestrator,
            store,
            publisher,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Run `concurrency` executors until `shutdown` fires or the queue fails.
    ///
    /// Cancellation stops new dequeues; jobs already dequeued run to
    /// completion. A queue failure in any executor cancels the rest and is
    /// returned once all have stopped.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let concurrency = self.config.concurrency.max(1);
        info!(concurrency, "Starting worker pool");

        let mut executors = JoinSet::new();
        for worker_id in 0..concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            executors.spawn(async move { pool.executor_loop(worker_id, shutdown).await });
        }

        let mut first_error = None;
        while let Some(joined) = executors.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_err) => WorkerError::Panicked(join_err.to_string()),
            };
            error!(error = %err, "Worker executor stopped, shutting down pool");
            shutdown.cancel();
            first_error.get_or_insert(err);
        }

        info!("Worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }

    async fn executor_loop(&self, worker_id: usize, shutdown: CancellationToken) -> Result<(), WorkerError> {
        debug!(worker_id, "Executor started");
        while !shutdown.is_cancelled() {
            if self.process_next().await? {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.idle_delay) => {}
            }
        }
        debug!(worker_id, "Executor stopped");
        Ok(())
    }

    /// Handle at most one job. Returns `Ok(false)` when the queue was empty.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        let Some(Delivery { job, handle }) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        info!(
            job_id = %job.id,
            subject_id = %job.subject_id,
            attempts = job.attempts,
            "Processing classification job"
        );

        let started = Instant::now();
        let outcome = self.orchestrator.classify(&job).await;
        metrics::histogram!("triage_classify_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            ClassifyOutcome::Classified { result, source } => {
                self.complete(&job, &handle, result, source).await?
            }
            ClassifyOutcome::Retry(reason) => self.retry(&job, &handle, &reason).await?,
        }
        Ok(true)
    }

    async fn complete(
        &self,
        job: &Job,
        handle: &AckHandle,
        result: ClassificationResult,
        source: ResultSource,
    ) -> Result<(), QueueError> {
        // Classification succeeded; a failed write-back does not hold up the ack.
        if let Err(e) = self.store.save_result(&job.subject_id, &result).await {
            metrics::counter!("triage_persistence_errors_total").increment(1);
            error!(job_id = %job.id, subject_id = %job.subject_id, error = %e, "Failed to persist classification");
        }

        let method = result.method;
        let event = CompletionEvent::new(job.subject_id.clone(), result);
        if let Err(e) = self.publisher.publish(&event).await {
            metrics::counter!("triage_publish_errors_total").increment(1);
            warn!(job_id = %job.id, subject_id = %job.subject_id, error = %e, "Failed to publish completion event");
        }

        if !self.queue.ack(handle).await? {
            warn!(job_id = %job.id, "Lease expired before ack, job may be redelivered");
        }

        self.stats.record_processed();
        metrics::counter!("triage_jobs_processed_total").increment(1);
        info!(
            job_id = %job.id,
            subject_id = %job.subject_id,
            method = %method,
            source = ?source,
            "Job completed"
        );
        Ok(())
    }

    async fn retry(&self, job: &Job, handle: &AckHandle, reason: &RetryReason) -> Result<(), QueueError> {
        match self.queue.nack(handle, true).await? {
            NackOutcome::Requeued { attempts } => {
                self.stats.record_retried();
                metrics::counter!("triage_jobs_retried_total").increment(1);
                info!(
                    job_id = %job.id,
                    attempts,
                    max_attempts = job.max_attempts,
                    reason = %reason,
                    "Classification failed, job requeued"
                );
            }
            NackOutcome::Failed => {
                self.stats.record_failed();
                metrics::counter!("triage_jobs_failed_total").increment(1);
                error!(job_id = %job.id, reason = %reason, "Job failed with retry budget exhausted");
            }
            NackOutcome::LeaseLost => {
                warn!(job_id = %job.id, reason = %reason, "Lease expired before nack, job already reclaimed");
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Job queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker task panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_per_minute() {
        let snapshot = StatsSnapshot {
            processed: 90,
            failed: 0,
            retried: 3,
            uptime: Duration::from_secs(180),
        };
        assert!((snapshot.throughput_per_minute() - 30.0).abs() < f64::EPSILON);

        let fresh = StatsSnapshot {
            uptime: Duration::ZERO,
            ..snapshot
        };
        assert_eq!(fresh.throughput_per_minute(), 0.0);
    }

    #[test]
    fn test_stats_counters() {
        let stats = WorkerStats::new();
        stats.record_processed();
        stats.record_processed();
        stats.record_retried();
        stats.record_failed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.failed, 1);
    }
}
