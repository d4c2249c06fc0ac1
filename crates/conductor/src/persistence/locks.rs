use uuid::Uuid;

use super::Db;
use crate::Result;

/// Result of a compare-and-swap steal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StealOutcome {
    /// The row now names the new owner.
    Stolen,
    /// The row vanished before the swap; the lease is free again.
    Released,
    /// Somebody else swapped first; the row names this owner now.
    Held(String),
}

/// Insert `(cluster_id, me)` if no lease exists.
///
/// Returns `None` on success and the current holder on conflict. The
/// primary key on `cluster_id` makes concurrent inserters lose cleanly; the
/// short re-read loop covers the window where the holder releases between
/// our failed insert and the owner read.
pub async fn lock_create(pool: &Db, cluster_id: Uuid, me: &str) -> Result<Option<String>> {
    for _ in 0..2 {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO cluster_locks (cluster_id, conductor_id) VALUES (?1, ?2)",
        )
        .bind(cluster_id)
        .bind(me)
        .execute(pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(None);
        }

        let holder: Option<String> =
            sqlx::query_scalar("SELECT conductor_id FROM cluster_locks WHERE cluster_id = ?1")
                .bind(cluster_id)
                .fetch_optional(pool)
                .await?;

        match holder {
            Some(holder) => return Ok(Some(holder)),
            // Row released in the window between insert and read; retry.
            None => continue,
        }
    }

    anyhow::bail!("cluster lock {cluster_id} flapping between create attempts")
}

/// Compare-and-swap the lease from `expected_owner` to `me`.
pub async fn lock_steal(
    pool: &Db,
    cluster_id: Uuid,
    expected_owner: &str,
    me: &str,
) -> Result<StealOutcome> {
    let swapped = sqlx::query(
        r#"
        UPDATE cluster_locks
        SET conductor_id = ?3, created_at = datetime('now')
        WHERE cluster_id = ?1 AND conductor_id = ?2
        "#,
    )
    .bind(cluster_id)
    .bind(expected_owner)
    .bind(me)
    .execute(pool)
    .await?
    .rows_affected();

    if swapped == 1 {
        return Ok(StealOutcome::Stolen);
    }

    let holder: Option<String> =
        sqlx::query_scalar("SELECT conductor_id FROM cluster_locks WHERE cluster_id = ?1")
            .bind(cluster_id)
            .fetch_optional(pool)
            .await?;

    match holder {
        None => Ok(StealOutcome::Released),
        Some(holder) => Ok(StealOutcome::Held(holder)),
    }
}

/// Delete the lease only while owned by `me`.
///
/// Returns true when a row was deleted, false when the lease was already
/// released (or held by someone else, which callers log).
pub async fn lock_release(pool: &Db, cluster_id: Uuid, me: &str) -> Result<bool> {
    let deleted =
        sqlx::query("DELETE FROM cluster_locks WHERE cluster_id = ?1 AND conductor_id = ?2")
            .bind(cluster_id)
            .bind(me)
            .execute(pool)
            .await?
            .rows_affected();

    Ok(deleted == 1)
}

pub async fn lock_owner(pool: &Db, cluster_id: Uuid) -> Result<Option<String>> {
    let holder: Option<String> =
        sqlx::query_scalar("SELECT conductor_id FROM cluster_locks WHERE cluster_id = ?1")
            .bind(cluster_id)
            .fetch_optional(pool)
            .await?;

    Ok(holder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    async fn test_db() -> Db {
        let db = migrations::init_pool("sqlite::memory:").await.expect("db init");
        migrations::run_migrations(&db).await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn create_is_first_writer_wins() {
        let db = test_db().await;
        let cluster = Uuid::new_v4();

        assert_eq!(lock_create(&db, cluster, "a").await.expect("create"), None);
        assert_eq!(
            lock_create(&db, cluster, "b").await.expect("create"),
            Some("a".to_string())
        );
        assert_eq!(
            lock_owner(&db, cluster).await.expect("owner"),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn steal_swaps_only_from_expected_owner() {
        let db = test_db().await;
        let cluster = Uuid::new_v4();
        lock_create(&db, cluster, "a").await.expect("create");

        assert_eq!(
            lock_steal(&db, cluster, "a", "b").await.expect("steal"),
            StealOutcome::Stolen
        );
        assert_eq!(
            lock_owner(&db, cluster).await.expect("owner"),
            Some("b".to_string())
        );

        // A second steal naming the stale owner observes the new one.
        assert_eq!(
            lock_steal(&db, cluster, "a", "c").await.expect("steal"),
            StealOutcome::Held("b".to_string())
        );
    }

    #[tokio::test]
    async fn steal_of_released_lock_reports_released() {
        let db = test_db().await;
        let cluster = Uuid::new_v4();

        assert_eq!(
            lock_steal(&db, cluster, "a", "b").await.expect("steal"),
            StealOutcome::Released
        );
    }

    #[tokio::test]
    async fn release_is_idempotent_and_owner_scoped() {
        let db = test_db().await;
        let cluster = Uuid::new_v4();
        lock_create(&db, cluster, "a").await.expect("create");

        // Wrong owner deletes nothing.
        assert!(!lock_release(&db, cluster, "b").await.expect("release"));
        assert!(lock_release(&db, cluster, "a").await.expect("release"));
        // Second release of the same lease is a no-op.
        assert!(!lock_release(&db, cluster, "a").await.expect("release"));
        assert_eq!(lock_owner(&db, cluster).await.expect("owner"), None);
    }
}
