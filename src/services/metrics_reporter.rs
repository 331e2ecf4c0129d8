use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::circuit_breaker::BreakerRegistry;
use super::queue::JobQueue;
use super::worker::{StatsSnapshot, WorkerStats};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// One periodic report. `queue_depth` is `None` while the queue is unreachable.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub stats: StatsSnapshot,
    pub queue_depth: Option<u64>,
    pub throughput_per_minute: f64,
}

/// Periodically logs pool counters and queue depth, and refreshes gauges.
///
/// Reads atomics and issues one queue query per tick; never touches the
/// executors.
pub struct MetricsReporter {
    queue: Arc<dyn JobQueue>,
    stats: Arc<WorkerStats>,
    breakers: Arc<BreakerRegistry>,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        stats: Arc<WorkerStats>,
        breakers: Arc<BreakerRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            stats,
            breakers,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.report().await;
                }
            }
        }
        info!("Metrics reporter stopped");
    }

    pub async fn report(&self) -> MetricsReport {
        let stats = self.stats.snapshot();
        let queue_depth = match self.queue.depth().await {
            Ok(depth) => {
                metrics::gauge!("triage_queue_up").set(1.0);
                metrics::gauge!("triage_queue_depth").set(depth as f64);
                Some(depth)
            }
            Err(e) => {
                metrics::gauge!("triage_queue_up").set(0.0);
                error!(error = %e, "Job queue unreachable while collecting metrics");
                None
            }
        };
        self.breakers.export_gauges();

        let report = MetricsReport {
            stats,
            queue_depth,
            throughput_per_minute: stats.throughput_per_minute(),
        };

        info!(
            target: "inbox_triage::metrics",
            processed = report.stats.processed,
            failed = report.stats.failed,
            retried = report.stats.retried,
            queue_depth = ?report.queue_depth,
            throughput_per_minute = report.throughput_per_minute,
            uptime_secs = report.stats.uptime.as_secs(),
            "Worker metrics"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{Job, MessageSummary};
    use crate::services::memory_queue::MemoryJobQueue;

    #[tokio::test]
    async fn test_report_reads_counters_and_depth() {
        let queue = Arc::new(MemoryJobQueue::default());
        for i in 0..3 {
            let job = Job::new(
                i.to_string(),
                MessageSummary {
                    sender: "a@b.com".to_string(),
                    subject: "hi".to_string(),
                    body_excerpt: String::new(),
                    priority_hint: None,
                },
            );
            queue.enqueue(&job).await.unwrap();
        }

        let stats = Arc::new(WorkerStats::new());
        stats.record_processed();
        stats.record_retried();

        let reporter = MetricsReporter::new(
            queue,
            stats,
            Arc::new(BreakerRegistry::default()),
            DEFAULT_REPORT_INTERVAL,
        );
        let report = reporter.report().await;

        assert_eq!(report.queue_depth, Some(3));
        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.stats.retried, 1);
        assert!(report.throughput_per_minute > 0.0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let reporter = MetricsReporter::new(
            Arc::new(MemoryJobQueue::default()),
            Arc::new(WorkerStats::new()),
            Arc::new(BreakerRegistry::default()),
            Duration::from_millis(10),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reporter.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
