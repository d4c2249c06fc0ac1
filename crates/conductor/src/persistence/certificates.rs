use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};
use uuid::Uuid;

use super::Db;
use crate::Result;

/// Stored CA keypair for a cluster. Exactly one row per cluster is active;
/// rotation deactivates the old row and inserts a fresh one.
#[derive(Debug, Clone, FromRow)]
pub struct KeyPairRecord {
    pub uuid: Uuid,
    pub cluster_id: Uuid,
    pub certificate: String,
    pub private_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewKeyPair {
    pub uuid: Uuid,
    pub cluster_id: Uuid,
    pub certificate: String,
    pub private_key: String,
}

pub async fn insert_keypair_tx(tx: &mut Transaction<'_, Sqlite>, keypair: &NewKeyPair) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO x509keypairs (uuid, cluster_id, certificate, private_key, active)
        VALUES (?1, ?2, ?3, ?4, 1)
        "#,
    )
    .bind(keypair.uuid)
    .bind(keypair.cluster_id)
    .bind(&keypair.certificate)
    .bind(&keypair.private_key)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Deactivate the current CA and install a new one atomically.
pub async fn rotate_keypair(pool: &Db, keypair: &NewKeyPair) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE x509keypairs SET active = 0 WHERE cluster_id = ?1 AND active = 1")
        .bind(keypair.cluster_id)
        .execute(&mut *tx)
        .await?;
    insert_keypair_tx(&mut tx, keypair).await?;

    tx.commit().await?;
    Ok(())
}

pub async fn active_keypair(pool: &Db, cluster_id: Uuid) -> Result<Option<KeyPairRecord>> {
    let record = sqlx::query_as::<_, KeyPairRecord>(
        r#"
        SELECT uuid, cluster_id, certificate, private_key, active, created_at
        FROM x509keypairs
        WHERE cluster_id = ?1 AND active = 1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(cluster_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn count_keypairs(pool: &Db, cluster_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM x509keypairs WHERE cluster_id = ?1")
        .bind(cluster_id)
        .fetch_one(pool)
        .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    #[tokio::test]
    async fn rotation_keeps_one_active_keypair() {
        let db = migrations::init_pool("sqlite::memory:").await.expect("db init");
        migrations::run_migrations(&db).await.expect("migrations");
        let cluster_id = Uuid::new_v4();

        let mut tx = db.begin().await.expect("tx");
        insert_keypair_tx(
            &mut tx,
            &NewKeyPair {
                uuid: Uuid::new_v4(),
                cluster_id,
                certificate: "cert-1".into(),
                private_key: "key-1".into(),
            },
        )
        .await
        .expect("insert");
        tx.commit().await.expect("commit");

        rotate_keypair(
            &db,
            &NewKeyPair {
                uuid: Uuid::new_v4(),
                cluster_id,
                certificate: "cert-2".into(),
                private_key: "key-2".into(),
            },
        )
        .await
        .expect("rotate");

        let active = active_keypair(&db, cluster_id)
            .await
            .expect("get")
            .expect("active row");
        assert_eq!(active.certificate, "cert-2");
        assert_eq!(count_keypairs(&db, cluster_id).await.expect("count"), 2);
    }
}
