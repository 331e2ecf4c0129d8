//! Cache-first classification with primary/fallback failover.
//!
//! Order of resolution for one delivery: cache, primary provider, fallback
//! provider, and on the final delivery only, the heuristic classifier.
//! Anything else is reported back as [`ClassifyOutcome::Retry`] so the queue
//! can redeliver once breakers have cooled down.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::ResultCache;
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use super::heuristic;
use super::provider::{ClassificationProvider, ProviderError};
use crate::models::classification::{ClassificationMethod, ClassificationResult};
use crate::models::job::Job;

/// A provider paired with the breaker that guards it.
#[derive(Clone)]
pub struct ProviderRoute {
    pub provider: Arc<dyn ClassificationProvider>,
    pub breaker: Arc<CircuitBreaker>,
    pub method: ClassificationMethod,
}

impl ProviderRoute {
    pub fn new(
        provider: Arc<dyn ClassificationProvider>,
        breaker: Arc<CircuitBreaker>,
        method: ClassificationMethod,
    ) -> Self {
        Self {
            provider,
            breaker,
            method,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Cache,
    Provider,
    Heuristic,
}

#[derive(Debug)]
pub enum ClassifyOutcome {
    /// Terminal: persist, publish and ack.
    Classified {
        result: ClassificationResult,
        source: ResultSource,
    },
    /// Every provider failed or was skipped and attempts remain: nack and requeue.
    Retry(RetryReason),
}

#[derive(Debug)]
pub enum AttemptFailure {
    /// Skipped without a network call.
    BreakerOpen,
    Provider(ProviderError),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::BreakerOpen => f.write_str("circuit open"),
            AttemptFailure::Provider(e) => write!(f, "{e}"),
        }
    }
}

/// Why a delivery could not be classified, per provider.
#[derive(Debug, Default)]
pub struct RetryReason {
    pub failures: Vec<(String, AttemptFailure)>,
}

impl RetryReason {
    /// True when no provider was actually called.
    pub fn all_breakers_open(&self) -> bool {
        self.failures
            .iter()
            .all(|(_, f)| matches!(f, AttemptFailure::BreakerOpen))
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (provider, failure)) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{provider}: {failure}")?;
        }
        Ok(())
    }
}

pub struct Orchestrator {
    cache: Arc<dyn ResultCache>,
    routes: Vec<ProviderRoute>,
}

impl Orchestrator {
    pub fn new(cache: Arc<dyn ResultCache>, primary: ProviderRoute, fallback: ProviderRoute) -> Self {
        Self {
            cache,
            routes: vec![primary, fallback],
        }
    }

    pub async fn classify(&self, job: &Job) -> ClassifyOutcome {
        if let Some(result) = self.cached(&job.subject_id).await {
            debug!(job_id = %job.id, subject_id = %job.subject_id, "Cache hit");
            return ClassifyOutcome::Classified {
                result,
                source: ResultSource::Cache,
            };
        }

        let mut reason = RetryReason::default();
        for route in &self.routes {
            match self.attempt(route, job).await {
                Ok(result) => {
                    self.remember(&job.subject_id, &result).await;
                    return ClassifyOutcome::Classified {
                        result,
                        source: ResultSource::Provider,
                    };
                }
                Err(failure) => reason
                    .failures
                    .push((route.provider.name().to_string(), failure)),
            }
        }

        if !job.is_final_attempt() {
            return ClassifyOutcome::Retry(reason);
        }

        // Breaker-open and real provider errors degrade the same way here.
        info!(
            job_id = %job.id,
            subject_id = %job.subject_id,
            attempts = job.attempts,
            all_breakers_open = reason.all_breakers_open(),
            reason = %reason,
            "Providers exhausted on final attempt, using heuristic classification"
        );
        let result = heuristic::classify(&job.payload);
        self.remember(&job.subject_id, &result).await;
        ClassifyOutcome::Classified {
            result,
            source: ResultSource::Heuristic,
        }
    }

    async fn attempt(&self, route: &ProviderRoute, job: &Job) -> Result<ClassificationResult, AttemptFailure> {
        let outcome = route
            .breaker
            .call(|| route.provider.classify(&job.payload, route.method))
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(CircuitBreakerError::Open { provider }) => {
                debug!(job_id = %job.id, provider = %provider, "Breaker open, skipping provider");
                Err(AttemptFailure::BreakerOpen)
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                warn!(
                    job_id = %job.id,
                    provider = %route.provider.name(),
                    error = %e,
                    "Provider call failed"
                );
                Err(AttemptFailure::Provider(e))
            }
        }
    }

    /// Cache read; an unreachable cache counts as a miss.
    async fn cached(&self, subject_id: &str) -> Option<ClassificationResult> {
        match self.cache.get(subject_id).await {
            Ok(hit) => hit,
            Err(e) => {
                metrics::counter!("triage_cache_errors_total").increment(1);
                tracing::error!(subject_id = %subject_id, error = %e, "Result cache read failed");
                None
            }
        }
    }

    async fn remember(&self, subject_id: &str, result: &ClassificationResult) {
        metrics::counter!("triage_results_total", "method" => result.method.as_ref().to_string())
            .increment(1);
        if let Err(e) = self.cache.set(subject_id, result).await {
            metrics::counter!("triage_cache_errors_total").increment(1);
            tracing::error!(subject_id = %subject_id, error = %e, "Result cache write failed");
        }
    }
}
