use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::classification::ClassificationResult;

pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Long-term record of classification results, keyed by subject id.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_result(&self, subject_id: &str, result: &ClassificationResult) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get_result(&self, subject_id: &str) -> Result<Option<ClassificationResult>, StoreError> {
        Ok(queries::get_result(&self.pool, subject_id).await?)
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn save_result(&self, subject_id: &str, result: &ClassificationResult) -> Result<(), StoreError> {
        queries::upsert_result(&self.pool, subject_id, result).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
