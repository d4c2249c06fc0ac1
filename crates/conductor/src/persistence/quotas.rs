use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct QuotaRecord {
    pub id: i64,
    pub project_id: String,
    pub resource: String,
    pub hard_limit: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn get_hard_limit(pool: &Db, project_id: &str, resource: &str) -> Result<Option<i64>> {
    let limit: Option<i64> = sqlx::query_scalar(
        "SELECT hard_limit FROM quotas WHERE project_id = ?1 AND resource = ?2",
    )
    .bind(project_id)
    .bind(resource)
    .fetch_optional(pool)
    .await?;

    Ok(limit)
}

pub async fn set_quota(pool: &Db, project_id: &str, resource: &str, hard_limit: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO quotas (project_id, resource, hard_limit)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (project_id, resource) DO UPDATE SET
            hard_limit = excluded.hard_limit,
            updated_at = datetime('now')
        "#,
    )
    .bind(project_id)
    .bind(resource)
    .bind(hard_limit)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_quotas(pool: &Db, project_id: &str) -> Result<Vec<QuotaRecord>> {
    let records = sqlx::query_as::<_, QuotaRecord>(
        r#"
        SELECT id, project_id, resource, hard_limit, created_at, updated_at
        FROM quotas
        WHERE project_id = ?1
        ORDER BY resource ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}
