use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{cache::ResultCache, circuit_breaker::BreakerRegistry, queue::JobQueue};

/// Shared state for the ops route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<dyn JobQueue>,
    pub cache: Arc<dyn ResultCache>,
    pub breakers: Arc<BreakerRegistry>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: Arc<dyn JobQueue>,
        cache: Arc<dyn ResultCache>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            db,
            queue,
            cache,
            breakers,
        }
    }
}
