//! Scripted collaborators for driving the pipeline without Redis, PostgreSQL
//! or a live model endpoint.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inbox_triage::db::{ResultStore, StoreError};
use inbox_triage::models::classification::{
    ClassificationMethod, ClassificationResult, Priority, Sentiment,
};
use inbox_triage::models::event::CompletionEvent;
use inbox_triage::models::job::MessageSummary;
use inbox_triage::services::cache::MemoryResultCache;
use inbox_triage::services::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig};
use inbox_triage::services::memory_queue::MemoryJobQueue;
use inbox_triage::services::orchestrator::{Orchestrator, ProviderRoute};
use inbox_triage::services::provider::{ClassificationProvider, ProviderError};
use inbox_triage::services::publisher::{CompletionPublisher, PublishError};
use inbox_triage::services::worker::{WorkerPool, WorkerPoolConfig};

/// How a scripted provider answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    TimeOut,
    Garbage,
}

pub struct ScriptedProvider {
    name: &'static str,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Calls that reached the provider (breaker rejections are not counted).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassificationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn classify(
        &self,
        message: &MessageSummary,
        method: ClassificationMethod,
    ) -> Result<ClassificationResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Succeed => Ok(ClassificationResult {
                category: "support".to_string(),
                priority: Priority::High,
                sentiment: Sentiment::Negative,
                summary: format!("{} (via {})", message.subject, self.name),
                topics: vec!["outage".to_string()],
                action_required: true,
                method,
                produced_at: Utc::now(),
            }),
            Behavior::TimeOut => Err(ProviderError::Timeout(Duration::from_secs(5))),
            Behavior::Garbage => Err(ProviderError::MissingJson),
        }
    }
}

#[derive(Default)]
pub struct RecordingStore {
    saved: Mutex<Vec<(String, ClassificationResult)>>,
    failing: AtomicBool,
}

impl RecordingStore {
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<(String, ClassificationResult)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultStore for RecordingStore {
    async fn save_result(&self, subject_id: &str, result: &ClassificationResult) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.saved
            .lock()
            .unwrap()
            .push((subject_id.to_string(), result.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<CompletionEvent>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn fail_publishes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<CompletionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionPublisher for RecordingPublisher {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
            return Err(PublishError::Serialize(err));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// A full pipeline over in-memory backends.
pub struct Pipeline {
    pub queue: Arc<MemoryJobQueue>,
    pub cache: Arc<MemoryResultCache>,
    pub primary: Arc<ScriptedProvider>,
    pub fallback: Arc<ScriptedProvider>,
    pub breakers: Arc<BreakerRegistry>,
    pub store: Arc<RecordingStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub pool: Arc<WorkerPool>,
}

impl Pipeline {
    pub fn new(primary: Behavior, fallback: Behavior) -> Self {
        Self::build(primary, fallback, 5, 4)
    }

    pub fn build(primary: Behavior, fallback: Behavior, failure_threshold: u32, concurrency: usize) -> Self {
        Self::assemble(primary, fallback, failure_threshold, concurrency, Duration::from_secs(30))
    }

    /// A single-executor pipeline whose queue leases expire after `lease`.
    pub fn with_lease(primary: Behavior, fallback: Behavior, lease: Duration) -> Self {
        Self::assemble(primary, fallback, 5, 1, lease)
    }

    fn assemble(
        primary: Behavior,
        fallback: Behavior,
        failure_threshold: u32,
        concurrency: usize,
        lease: Duration,
    ) -> Self {
        let queue = Arc::new(MemoryJobQueue::new(lease));
        let cache = Arc::new(MemoryResultCache::new(Duration::from_secs(3600)));
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold,
            open_timeout: Duration::from_secs(60),
        }));
        let primary = ScriptedProvider::new("primary", primary);
        let fallback = ScriptedProvider::new("fallback", fallback);
        let store = Arc::new(RecordingStore::default());
        let publisher = Arc::new(RecordingPublisher::default());

        let orchestrator = Arc::new(Orchestrator::new(
            cache.clone(),
            ProviderRoute::new(
                primary.clone(),
                breakers.get_or_create("primary"),
                ClassificationMethod::Primary,
            ),
            ProviderRoute::new(
                fallback.clone(),
                breakers.get_or_create("fallback"),
                ClassificationMethod::Fallback,
            ),
        ));

        let pool = Arc::new(WorkerPool::new(
            WorkerPoolConfig {
                concurrency,
                idle_delay: Duration::from_millis(5),
            },
            queue.clone(),
            orchestrator,
            store.clone(),
            publisher.clone(),
        ));

        Self {
            queue,
            cache,
            primary,
            fallback,
            breakers,
            store,
            publisher,
            pool,
        }
    }

    /// Total calls that reached either provider.
    pub fn provider_calls(&self) -> usize {
        self.primary.calls() + self.fallback.calls()
    }
}
