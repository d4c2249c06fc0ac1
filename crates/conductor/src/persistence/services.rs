use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;
use crate::Result;

/// Liveness record for one conductor process.
#[derive(Debug, Clone, FromRow)]
pub struct ServiceRecord {
    pub id: i64,
    pub host: String,
    pub binary: String,
    pub endpoint: String,
    pub report_count: i64,
    pub disabled: bool,
    pub forced_down: bool,
    pub last_seen_up: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SERVICE_COLUMNS: &str = r#"
    id,
    host,
    binary,
    endpoint,
    report_count,
    disabled,
    forced_down,
    last_seen_up,
    created_at,
    updated_at
"#;

/// Register or refresh this conductor's liveness row.
///
/// First write creates the row; every later write bumps `report_count` and
/// `last_seen_up`. The (host, binary) unique key makes this a clean upsert.
pub async fn upsert_heartbeat(pool: &Db, host: &str, binary: &str, endpoint: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO conductor_services (host, binary, endpoint, report_count, last_seen_up)
        VALUES (?1, ?2, ?3, 1, datetime('now'))
        ON CONFLICT (host, binary) DO UPDATE SET
            endpoint = excluded.endpoint,
            report_count = report_count + 1,
            last_seen_up = datetime('now'),
            updated_at = datetime('now')
        "#,
    )
    .bind(host)
    .bind(binary)
    .bind(endpoint)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_service(pool: &Db, host: &str, binary: &str) -> Result<Option<ServiceRecord>> {
    let record = sqlx::query_as::<_, ServiceRecord>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM conductor_services WHERE host = ?1 AND binary = ?2"
    ))
    .bind(host)
    .bind(binary)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_services(pool: &Db) -> Result<Vec<ServiceRecord>> {
    let records = sqlx::query_as::<_, ServiceRecord>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM conductor_services ORDER BY id ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn set_forced_down(
    pool: &Db,
    host: &str,
    binary: &str,
    forced_down: bool,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE conductor_services
        SET forced_down = ?3, updated_at = datetime('now')
        WHERE host = ?1 AND binary = ?2
        "#,
    )
    .bind(host)
    .bind(binary)
    .bind(forced_down)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
