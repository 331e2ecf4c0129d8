use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::classification::ClassificationResult;

const CACHE_PREFIX: &str = "inbox_triage:classification";

/// Classification results keyed by subject id, with a fixed TTL.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, subject_id: &str) -> Result<Option<ClassificationResult>, CacheError>;

    /// Store `result`, replacing any earlier entry (last write wins).
    async fn set(&self, subject_id: &str, result: &ClassificationResult) -> Result<(), CacheError>;

    async fn health_check(&self) -> Result<(), CacheError>;
}

/// Redis-backed result cache.
pub struct RedisResultCache {
    conn: MultiplexedConnection,
    ttl: Duration,
}

impl RedisResultCache {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, ttl })
    }

    fn key(subject_id: &str) -> String {
        format!("{CACHE_PREFIX}:{subject_id}")
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, subject_id: &str) -> Result<Option<ClassificationResult>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::key(subject_id)).await?;
        raw.map(|payload| serde_json::from_str(&payload).map_err(CacheError::Serialize))
            .transpose()
    }

    async fn set(&self, subject_id: &str, result: &ClassificationResult) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(result)?;
        conn.set_ex::<_, _, ()>(Self::key(subject_id), payload, self.ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Process-local cache with the same TTL semantics, for tests and local runs.
pub struct MemoryResultCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|(_, expires)| *expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, subject_id: &str) -> Result<Option<ClassificationResult>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let live = entries
            .get(subject_id)
            .filter(|(_, expires)| *expires > now)
            .map(|(payload, _)| payload.clone());
        match live {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => {
                entries.remove(subject_id);
                Ok(None)
            }
        }
    }

    async fn set(&self, subject_id: &str, result: &ClassificationResult) -> Result<(), CacheError> {
        let payload = serde_json::to_string(result)?;
        self.lock()
            .insert(subject_id.to_string(), (payload, Instant::now() + self.ttl));
        Ok(())
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
