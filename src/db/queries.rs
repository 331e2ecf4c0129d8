use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::classification::{ClassificationMethod, ClassificationResult, Sentiment};

/// Insert or replace the classification for a message
pub async fn upsert_result(
    pool: &PgPool,
    subject_id: &str,
    result: &ClassificationResult,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO message_classifications
            (subject_id, category, priority, sentiment, summary, topics,
             action_required, method, produced_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (subject_id) DO UPDATE SET
            category = EXCLUDED.category,
            priority = EXCLUDED.priority,
            sentiment = EXCLUDED.sentiment,
            summary = EXCLUDED.summary,
            topics = EXCLUDED.topics,
            action_required = EXCLUDED.action_required,
            method = EXCLUDED.method,
            produced_at = EXCLUDED.produced_at,
            updated_at = NOW()
        "#,
    )
    .bind(subject_id)
    .bind(&result.category)
    .bind(result.priority.as_ref())
    .bind(result.sentiment.as_ref())
    .bind(&result.summary)
    .bind(sqlx::types::Json(result.topics.clone()))
    .bind(result.action_required)
    .bind(result.method.as_ref())
    .bind(result.produced_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get the stored classification for a message
pub async fn get_result(
    pool: &PgPool,
    subject_id: &str,
) -> Result<Option<ClassificationResult>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT category, priority, sentiment, summary, topics,
               action_required, method, produced_at
        FROM message_classifications
        WHERE subject_id = $1
        "#,
    )
    .bind(subject_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let priority: String = r.try_get("priority")?;
    let sentiment: String = r.try_get("sentiment")?;
    let method: String = r.try_get("method")?;
    let topics: sqlx::types::Json<Vec<String>> = r.try_get("topics")?;
    let produced_at: DateTime<Utc> = r.try_get("produced_at")?;

    Ok(Some(ClassificationResult {
        category: r.try_get("category")?,
        priority: parse_column(&priority)?,
        sentiment: parse_column::<Sentiment>(&sentiment)?,
        summary: r.try_get("summary")?,
        topics: topics.0,
        action_required: r.try_get("action_required")?,
        method: parse_column::<ClassificationMethod>(&method)?,
        produced_at,
    }))
}

fn parse_column<T>(value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = strum::ParseError>,
{
    T::from_str(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
