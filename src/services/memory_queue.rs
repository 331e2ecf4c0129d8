//! In-memory job queue for tests and local runs.
//!
//! Mirrors the Redis queue's lease, retry and stall semantics within a
//! single process. Nothing survives a restart.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::queue::{AckHandle, Delivery, JobQueue, NackOutcome, QueueError, ReclaimReport};
use crate::models::job::{Job, JobStatus};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    jobs: HashMap<Uuid, Job>,
    /// job id -> (lease id, deadline)
    leases: HashMap<Uuid, (Uuid, Instant)>,
    failed: HashSet<Uuid>,
    completed: HashSet<Uuid>,
}

impl QueueState {
    /// Consume one attempt and requeue, or park as failed once the budget is spent.
    fn retry_or_fail(&mut self, id: Uuid) -> Option<u32> {
        let job = self.jobs.get_mut(&id)?;
        job.attempts += 1;
        if job.attempts < job.max_attempts {
            let attempts = job.attempts;
            self.pending.push_back(id);
            Some(attempts)
        } else {
            self.failed.insert(id);
            None
        }
    }
}

pub struct MemoryJobQueue {
    lease: Duration,
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Number of jobs currently leased to a consumer.
    pub fn in_flight(&self) -> usize {
        self.lock().leases.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the lease if `handle` still owns it.
    fn release(state: &mut QueueState, handle: &AckHandle) -> bool {
        let owned = matches!(
            state.leases.get(&handle.job_id),
            Some((lease_id, _)) if *lease_id == handle.lease_id
        );
        if owned {
            state.leases.remove(&handle.job_id);
        }
        owned
    }

    /// Requeue expired leases. A job that stalls on its final delivery is
    /// delivered again as the final attempt.
    fn reclaim(state: &mut QueueState, now: Instant) -> ReclaimReport {
        let expired: Vec<Uuid> = state
            .leases
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut report = ReclaimReport::default();
        for id in expired {
            state.leases.remove(&id);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            let last = job.max_attempts.saturating_sub(1);
            if job.attempts < last {
                job.attempts += 1;
                report.requeued += 1;
            } else {
                job.attempts = last;
                report.exhausted += 1;
            }
            state.pending.push_back(id);
        }
        report
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.jobs.insert(job.id, job.clone());
        state.pending.push_back(job.id);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        Self::reclaim(&mut state, now);

        while let Some(id) = state.pending.pop_front() {
            let Some(job) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let lease_id = Uuid::new_v4();
            state.leases.insert(id, (lease_id, now + self.lease));
            let handle = AckHandle {
                job_id: id,
                lease_id,
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            };
            return Ok(Some(Delivery { job, handle }));
        }
        Ok(None)
    }

    async fn ack(&self, handle: &AckHandle) -> Result<bool, QueueError> {
        let mut state = self.lock();
        if !Self::release(&mut state, handle) {
            return Ok(false);
        }
        state.jobs.remove(&handle.job_id);
        state.completed.insert(handle.job_id);
        Ok(true)
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<NackOutcome, QueueError> {
        let mut state = self.lock();
        if !Self::release(&mut state, handle) {
            return Ok(NackOutcome::LeaseLost);
        }
        if !requeue {
            state.failed.insert(handle.job_id);
            return Ok(NackOutcome::Failed);
        }
        Ok(match state.retry_or_fail(handle.job_id) {
            Some(attempts) => NackOutcome::Requeued { attempts },
            None => NackOutcome::Failed,
        })
    }

    async fn reclaim_stalled(&self) -> Result<ReclaimReport, QueueError> {
        let mut state = self.lock();
        Ok(Self::reclaim(&mut state, Instant::now()))
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lock().pending.len() as u64)
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>, QueueError> {
        let state = self.lock();
        let status = if state.failed.contains(&job_id) {
            Some(JobStatus::Failed)
        } else if state.leases.contains_key(&job_id) {
            Some(JobStatus::Active)
        } else if state.jobs.contains_key(&job_id) {
            Some(JobStatus::Pending)
        } else if state.completed.contains(&job_id) {
            Some(JobStatus::Completed)
        } else {
            None
        };
        Ok(status)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::MessageSummary;
    use futures::future::join_all;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn job(subject_id: &str) -> Job {
        Job::new(
            subject_id,
            MessageSummary {
                sender: "a@b.com".to_string(),
                subject: "hello".to_string(),
                body_excerpt: String::new(),
                priority_hint: None,
            },
        )
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = MemoryJobQueue::default();
        let first = job("1");
        let second = job("2");
        assert_ok!(queue.enqueue(&first).await);
        assert_ok!(queue.enqueue(&second).await);
        assert_eq!(queue.depth().await.unwrap(), 2);

        let delivery = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.job.id, first.id);
        assert_eq!(queue.status(first.id).await.unwrap(), Some(JobStatus::Active));

        assert!(queue.ack(&delivery.handle).await.unwrap());
        assert_eq!(queue.status(first.id).await.unwrap(), Some(JobStatus::Completed));
        assert_eq!(queue.status(second.id).await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_concurrent_consumers_never_share_a_job() {
        let queue = Arc::new(MemoryJobQueue::default());
        for i in 0..20 {
            queue.enqueue(&job(&i.to_string())).await.unwrap();
        }

        let consumers = (0..8).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(delivery) = queue.dequeue().await.unwrap() {
                    seen.push(delivery.job.id);
                }
                seen
            })
        });
        let mut all: Vec<Uuid> = join_all(consumers)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .collect();

        assert_eq!(all.len(), 20);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn test_nack_requeues_until_budget_spent() {
        let queue = MemoryJobQueue::default();
        let j = job("42");
        queue.enqueue(&j).await.unwrap();

        let d1 = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(d1.job.attempts, 0);
        assert_eq!(
            queue.nack(&d1.handle, true).await.unwrap(),
            NackOutcome::Requeued { attempts: 1 }
        );

        let d2 = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(d2.job.attempts, 1);
        assert_eq!(
            queue.nack(&d2.handle, true).await.unwrap(),
            NackOutcome::Requeued { attempts: 2 }
        );

        let d3 = queue.dequeue().await.unwrap().unwrap();
        assert!(d3.job.is_final_attempt());
        assert_eq!(queue.nack(&d3.handle, true).await.unwrap(), NackOutcome::Failed);
        assert_eq!(queue.status(j.id).await.unwrap(), Some(JobStatus::Failed));
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_lease_is_redelivered() {
        let queue = MemoryJobQueue::new(Duration::from_millis(20));
        let j = job("7");
        queue.enqueue(&j).await.unwrap();

        let stalled = queue.dequeue().await.unwrap().unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let redelivered = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(redelivered.job.id, j.id);
        assert_eq!(redelivered.job.attempts, 1);

        // The first consumer's lease is gone.
        assert!(!queue.ack(&stalled.handle).await.unwrap());
        assert_eq!(
            queue.nack(&stalled.handle, true).await.unwrap(),
            NackOutcome::LeaseLost
        );
        assert!(queue.ack(&redelivered.handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_final_delivery_stays_on_final_attempt() {
        let queue = MemoryJobQueue::new(Duration::from_millis(10));
        let j = job("9");
        queue.enqueue(&j).await.unwrap();

        for expected in 0..2 {
            let delivery = queue.dequeue().await.unwrap().unwrap();
            assert_eq!(delivery.job.attempts, expected);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let final_delivery = queue.dequeue().await.unwrap().unwrap();
        assert!(final_delivery.job.is_final_attempt());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            queue.reclaim_stalled().await.unwrap(),
            ReclaimReport {
                requeued: 0,
                exhausted: 1
            }
        );
        assert_eq!(queue.status(j.id).await.unwrap(), Some(JobStatus::Pending));

        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.job.attempts, 2);
        assert!(again.job.is_final_attempt());
        assert!(queue.ack(&again.handle).await.unwrap());
        assert_eq!(queue.status(j.id).await.unwrap(), Some(JobStatus::Completed));
    }
}
