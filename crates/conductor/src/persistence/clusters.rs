use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{certificates, nodegroups, Db, NewKeyPair, NewNodeGroup};
use crate::error::OpError;
use crate::Result;

/// Stored cluster lifecycle status. The wire twin lives in `corral-common`;
/// `to_wire`/`from_wire` are the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
pub enum ClusterStatus {
    #[sqlx(rename = "CREATE_IN_PROGRESS")]
    CreateInProgress,
    #[sqlx(rename = "CREATE_COMPLETE")]
    CreateComplete,
    #[sqlx(rename = "CREATE_FAILED")]
    CreateFailed,
    #[sqlx(rename = "UPDATE_IN_PROGRESS")]
    UpdateInProgress,
    #[sqlx(rename = "UPDATE_COMPLETE")]
    UpdateComplete,
    #[sqlx(rename = "UPDATE_FAILED")]
    UpdateFailed,
    #[sqlx(rename = "DELETE_IN_PROGRESS")]
    DeleteInProgress,
    #[sqlx(rename = "DELETE_COMPLETE")]
    DeleteComplete,
    #[sqlx(rename = "DELETE_FAILED")]
    DeleteFailed,
    #[sqlx(rename = "ROLLBACK_IN_PROGRESS")]
    RollbackInProgress,
    #[sqlx(rename = "ROLLBACK_COMPLETE")]
    RollbackComplete,
    #[sqlx(rename = "ROLLBACK_FAILED")]
    RollbackFailed,
}

impl ClusterStatus {
    pub fn to_wire(self) -> common::api::ClusterStatus {
        use common::api::ClusterStatus as Wire;
        match self {
            ClusterStatus::CreateInProgress => Wire::CreateInProgress,
            ClusterStatus::CreateComplete => Wire::CreateComplete,
            ClusterStatus::CreateFailed => Wire::CreateFailed,
            ClusterStatus::UpdateInProgress => Wire::UpdateInProgress,
            ClusterStatus::UpdateComplete => Wire::UpdateComplete,
            ClusterStatus::UpdateFailed => Wire::UpdateFailed,
            ClusterStatus::DeleteInProgress => Wire::DeleteInProgress,
            ClusterStatus::DeleteComplete => Wire::DeleteComplete,
            ClusterStatus::DeleteFailed => Wire::DeleteFailed,
            ClusterStatus::RollbackInProgress => Wire::RollbackInProgress,
            ClusterStatus::RollbackComplete => Wire::RollbackComplete,
            ClusterStatus::RollbackFailed => Wire::RollbackFailed,
        }
    }

    pub fn from_wire(status: common::api::ClusterStatus) -> Self {
        use common::api::ClusterStatus as Wire;
        match status {
            Wire::CreateInProgress => ClusterStatus::CreateInProgress,
            Wire::CreateComplete => ClusterStatus::CreateComplete,
            Wire::CreateFailed => ClusterStatus::CreateFailed,
            Wire::UpdateInProgress => ClusterStatus::UpdateInProgress,
            Wire::UpdateComplete => ClusterStatus::UpdateComplete,
            Wire::UpdateFailed => ClusterStatus::UpdateFailed,
            Wire::DeleteInProgress => ClusterStatus::DeleteInProgress,
            Wire::DeleteComplete => ClusterStatus::DeleteComplete,
            Wire::DeleteFailed => ClusterStatus::DeleteFailed,
            Wire::RollbackInProgress => ClusterStatus::RollbackInProgress,
            Wire::RollbackComplete => ClusterStatus::RollbackComplete,
            Wire::RollbackFailed => ClusterStatus::RollbackFailed,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.to_wire().in_progress()
    }

    pub fn complete(&self) -> bool {
        self.to_wire().complete()
    }

    pub fn failed(&self) -> ClusterStatus {
        ClusterStatus::from_wire(self.to_wire().failed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
pub enum HealthStatus {
    #[sqlx(rename = "HEALTHY")]
    Healthy,
    #[sqlx(rename = "UNHEALTHY")]
    Unhealthy,
    #[sqlx(rename = "UNKNOWN")]
    Unknown,
}

impl HealthStatus {
    pub fn to_wire(self) -> common::api::HealthStatus {
        match self {
            HealthStatus::Healthy => common::api::HealthStatus::Healthy,
            HealthStatus::Unhealthy => common::api::HealthStatus::Unhealthy,
            HealthStatus::Unknown => common::api::HealthStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ClusterRecord {
    pub uuid: Uuid,
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub template_id: Uuid,
    pub keypair: Option<String>,
    pub docker_volume_size: Option<i64>,
    #[sqlx(rename = "labels_json")]
    pub labels: Option<Json<HashMap<String, String>>>,
    #[sqlx(rename = "labels_overridden_json")]
    pub labels_overridden: Option<Json<HashMap<String, String>>>,
    #[sqlx(rename = "labels_added_json")]
    pub labels_added: Option<Json<HashMap<String, String>>>,
    #[sqlx(rename = "labels_skipped_json")]
    pub labels_skipped: Option<Json<HashMap<String, String>>>,
    pub flavor_id: Option<String>,
    pub master_flavor_id: Option<String>,
    pub stack_id: Option<String>,
    pub api_address: Option<String>,
    #[sqlx(rename = "master_addresses_json")]
    pub master_addresses: Option<Json<Vec<String>>>,
    #[sqlx(rename = "node_addresses_json")]
    pub node_addresses: Option<Json<Vec<String>>>,
    pub status: ClusterStatus,
    pub status_reason: Option<String>,
    pub health_status: HealthStatus,
    #[sqlx(rename = "health_status_reason_json")]
    pub health_status_reason: Option<Json<HashMap<String, String>>>,
    pub create_timeout: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterRecord {
    pub fn labels(&self) -> HashMap<String, String> {
        self.labels.as_ref().map(|j| j.0.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewCluster {
    pub uuid: Uuid,
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub template_id: Uuid,
    pub keypair: Option<String>,
    pub docker_volume_size: Option<i64>,
    pub labels: HashMap<String, String>,
    pub labels_overridden: HashMap<String, String>,
    pub labels_added: HashMap<String, String>,
    pub labels_skipped: HashMap<String, String>,
    pub flavor_id: Option<String>,
    pub master_flavor_id: Option<String>,
    pub status: ClusterStatus,
    pub status_reason: Option<String>,
    pub create_timeout: i64,
}

/// Outputs parsed from a completed stack, written together with the
/// terminal status.
#[derive(Debug, Clone, Default)]
pub struct StackOutputsUpdate {
    pub api_address: Option<String>,
    pub master_addresses: Vec<String>,
    pub node_addresses: Vec<String>,
}

const CLUSTER_COLUMNS: &str = r#"
    uuid,
    name,
    project_id,
    user_id,
    template_id,
    keypair,
    docker_volume_size,
    labels_json,
    labels_overridden_json,
    labels_added_json,
    labels_skipped_json,
    flavor_id,
    master_flavor_id,
    stack_id,
    api_address,
    master_addresses_json,
    node_addresses_json,
    status,
    status_reason,
    health_status,
    health_status_reason_json,
    create_timeout,
    created_at,
    updated_at
"#;

/// Insert a cluster together with its default node groups and initial CA
/// keypair, all in one transaction.
///
/// Returns false when a row with the same uuid already existed; dependents
/// are not touched in that case so a duplicate RPC stays idempotent.
pub async fn create_cluster_with_dependents(
    pool: &Db,
    new_cluster: NewCluster,
    nodegroups: Vec<NewNodeGroup>,
    keypair: NewKeyPair,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO clusters (
            uuid,
            name,
            project_id,
            user_id,
            template_id,
            keypair,
            docker_volume_size,
            labels_json,
            labels_overridden_json,
            labels_added_json,
            labels_skipped_json,
            flavor_id,
            master_flavor_id,
            status,
            status_reason,
            health_status,
            create_timeout
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
    )
    .bind(new_cluster.uuid)
    .bind(&new_cluster.name)
    .bind(&new_cluster.project_id)
    .bind(&new_cluster.user_id)
    .bind(new_cluster.template_id)
    .bind(&new_cluster.keypair)
    .bind(new_cluster.docker_volume_size)
    .bind(Json(&new_cluster.labels))
    .bind(Json(&new_cluster.labels_overridden))
    .bind(Json(&new_cluster.labels_added))
    .bind(Json(&new_cluster.labels_skipped))
    .bind(&new_cluster.flavor_id)
    .bind(&new_cluster.master_flavor_id)
    .bind(new_cluster.status)
    .bind(&new_cluster.status_reason)
    .bind(HealthStatus::Unknown)
    .bind(new_cluster.create_timeout)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    for group in &nodegroups {
        nodegroups::insert_nodegroup_tx(&mut tx, group).await?;
    }
    certificates::insert_keypair_tx(&mut tx, &keypair).await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn get_cluster(pool: &Db, uuid: Uuid) -> Result<Option<ClusterRecord>> {
    let record = sqlx::query_as::<_, ClusterRecord>(&format!(
        "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE uuid = ?1"
    ))
    .bind(uuid)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Resolve a cluster by uuid or by name within a project.
///
/// A name matching more than one row fails with Conflict instead of
/// returning an arbitrary row.
pub async fn resolve_cluster(
    pool: &Db,
    project_id: &str,
    reference: &str,
) -> Result<Option<ClusterRecord>> {
    if let Ok(uuid) = Uuid::parse_str(reference) {
        return get_cluster(pool, uuid).await;
    }

    let matches = sqlx::query_as::<_, ClusterRecord>(&format!(
        "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE project_id = ?1 AND name = ?2 LIMIT 2"
    ))
    .bind(project_id)
    .bind(reference)
    .fetch_all(pool)
    .await?;

    if matches.len() > 1 {
        return Err(anyhow::Error::new(OpError::conflict(format!(
            "multiple clusters named {reference}; use the uuid"
        ))));
    }

    Ok(matches.into_iter().next())
}

pub async fn list_clusters(pool: &Db, project_id: &str) -> Result<Vec<ClusterRecord>> {
    let records = sqlx::query_as::<_, ClusterRecord>(&format!(
        "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE project_id = ?1 ORDER BY created_at ASC"
    ))
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Live clusters counted for quota admission. Rows are hard-deleted once a
/// delete completes, so every present row counts.
pub async fn count_clusters(pool: &Db, project_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clusters WHERE project_id = ?1")
        .bind(project_id)
        .fetch_one(pool)
        .await?;

    Ok(count)
}

pub async fn set_stack_id(pool: &Db, uuid: Uuid, stack_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE clusters
        SET stack_id = ?2, updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(stack_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn set_status(
    pool: &Db,
    uuid: Uuid,
    status: ClusterStatus,
    reason: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE clusters
        SET status = ?2, status_reason = ?3, updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(status)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn update_labels(
    pool: &Db,
    uuid: Uuid,
    labels: &HashMap<String, String>,
    overridden: &HashMap<String, String>,
    added: &HashMap<String, String>,
    skipped: &HashMap<String, String>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE clusters
        SET labels_json = ?2,
            labels_overridden_json = ?3,
            labels_added_json = ?4,
            labels_skipped_json = ?5,
            updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(Json(labels))
    .bind(Json(overridden))
    .bind(Json(added))
    .bind(Json(skipped))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Write a status transition only while this conductor still owns the
/// cluster lock. The ownership read and the update share one transaction so
/// a steal between them cannot produce a write by the old owner.
///
/// Returns false (and writes nothing) when the lock is gone or owned by a
/// different conductor.
pub async fn set_status_if_lock_held(
    pool: &Db,
    uuid: Uuid,
    conductor_id: &str,
    status: ClusterStatus,
    reason: Option<&str>,
    outputs: Option<&StackOutputsUpdate>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let owner: Option<String> =
        sqlx::query_scalar("SELECT conductor_id FROM cluster_locks WHERE cluster_id = ?1")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?;

    if owner.as_deref() != Some(conductor_id) {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE clusters
        SET status = ?2, status_reason = ?3, updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(status)
    .bind(reason)
    .execute(&mut *tx)
    .await?;

    if let Some(outputs) = outputs {
        sqlx::query(
            r#"
            UPDATE clusters
            SET api_address = ?2,
                master_addresses_json = ?3,
                node_addresses_json = ?4,
                updated_at = datetime('now')
            WHERE uuid = ?1
            "#,
        )
        .bind(uuid)
        .bind(&outputs.api_address)
        .bind(Json(&outputs.master_addresses))
        .bind(Json(&outputs.node_addresses))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        UPDATE nodegroups
        SET status = ?2, updated_at = datetime('now')
        WHERE cluster_id = ?1
        "#,
    )
    .bind(uuid)
    .bind(status)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Remove a cluster and its dependents after the stack is gone, and drop
/// the lock row in the same transaction.
///
/// Returns false when this conductor no longer owns the lock.
pub async fn delete_cluster_if_lock_held(
    pool: &Db,
    uuid: Uuid,
    conductor_id: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let owner: Option<String> =
        sqlx::query_scalar("SELECT conductor_id FROM cluster_locks WHERE cluster_id = ?1")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?;

    if owner.as_deref() != Some(conductor_id) {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query("DELETE FROM nodegroups WHERE cluster_id = ?1")
        .bind(uuid)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM x509keypairs WHERE cluster_id = ?1")
        .bind(uuid)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM clusters WHERE uuid = ?1")
        .bind(uuid)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM cluster_locks WHERE cluster_id = ?1 AND conductor_id = ?2")
        .bind(uuid)
        .bind(conductor_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Fetch a cluster that must exist, for handlers that already resolved it.
pub async fn require_cluster(pool: &Db, uuid: Uuid) -> Result<ClusterRecord> {
    get_cluster(pool, uuid)
        .await?
        .with_context(|| format!("cluster {uuid} disappeared"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{locks, migrations};
    use common::api::ErrorKind;

    async fn test_db() -> Db {
        let db = migrations::init_pool("sqlite::memory:").await.expect("db init");
        migrations::run_migrations(&db).await.expect("migrations");
        db
    }

    fn new_cluster(name: &str, project: &str) -> NewCluster {
        NewCluster {
            uuid: Uuid::new_v4(),
            name: name.into(),
            project_id: project.into(),
            user_id: "u1".into(),
            template_id: Uuid::new_v4(),
            keypair: None,
            docker_volume_size: None,
            labels: HashMap::new(),
            labels_overridden: HashMap::new(),
            labels_added: HashMap::new(),
            labels_skipped: HashMap::new(),
            flavor_id: None,
            master_flavor_id: None,
            status: ClusterStatus::CreateInProgress,
            status_reason: None,
            create_timeout: 60,
        }
    }

    fn test_keypair(cluster_id: Uuid) -> NewKeyPair {
        NewKeyPair {
            uuid: Uuid::new_v4(),
            cluster_id,
            certificate: "cert".into(),
            private_key: "key".into(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_on_uuid() {
        let db = test_db().await;
        let cluster = new_cluster("c1", "p1");
        let uuid = cluster.uuid;

        let first =
            create_cluster_with_dependents(&db, cluster.clone(), vec![], test_keypair(uuid))
                .await
                .expect("create");
        assert!(first);

        let second = create_cluster_with_dependents(&db, cluster, vec![], test_keypair(uuid))
            .await
            .expect("retry");
        assert!(!second, "duplicate uuid should not insert");

        assert_eq!(count_clusters(&db, "p1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn resolve_by_ambiguous_name_conflicts() {
        let db = test_db().await;
        for _ in 0..2 {
            let cluster = new_cluster("dup", "p1");
            let uuid = cluster.uuid;
            create_cluster_with_dependents(&db, cluster, vec![], test_keypair(uuid))
                .await
                .expect("create");
        }

        let err = resolve_cluster(&db, "p1", "dup").await.unwrap_err();
        let op_err = crate::error::OpError::from(err);
        assert_eq!(op_err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn status_write_requires_lock_ownership() {
        let db = test_db().await;
        let cluster = new_cluster("c1", "p1");
        let uuid = cluster.uuid;
        create_cluster_with_dependents(&db, cluster, vec![], test_keypair(uuid))
            .await
            .expect("create");

        // No lock at all: the write must be refused.
        let wrote = set_status_if_lock_held(
            &db,
            uuid,
            "me",
            ClusterStatus::CreateComplete,
            None,
            None,
        )
        .await
        .expect("guarded write");
        assert!(!wrote);

        locks::lock_create(&db, uuid, "me").await.expect("lock");
        let wrote = set_status_if_lock_held(
            &db,
            uuid,
            "me",
            ClusterStatus::CreateComplete,
            Some("done"),
            Some(&StackOutputsUpdate {
                api_address: Some("10.0.0.1".into()),
                master_addresses: vec!["10.0.0.2".into()],
                node_addresses: vec!["10.0.0.3".into()],
            }),
        )
        .await
        .expect("guarded write");
        assert!(wrote);

        let record = get_cluster(&db, uuid).await.expect("get").expect("row");
        assert_eq!(record.status, ClusterStatus::CreateComplete);
        assert_eq!(record.api_address.as_deref(), Some("10.0.0.1"));

        // A different owner must not be able to write.
        let wrote = set_status_if_lock_held(
            &db,
            uuid,
            "other",
            ClusterStatus::CreateFailed,
            None,
            None,
        )
        .await
        .expect("guarded write");
        assert!(!wrote);
    }

    #[tokio::test]
    async fn delete_removes_dependents_and_lock() {
        let db = test_db().await;
        let mut cluster = new_cluster("c1", "p1");
        cluster.status = ClusterStatus::DeleteInProgress;
        let uuid = cluster.uuid;
        let group = NewNodeGroup::default_worker(uuid, None, None, HashMap::new(), 3);
        create_cluster_with_dependents(&db, cluster, vec![group], test_keypair(uuid))
            .await
            .expect("create");
        locks::lock_create(&db, uuid, "me").await.expect("lock");

        let deleted = delete_cluster_if_lock_held(&db, uuid, "me")
            .await
            .expect("delete");
        assert!(deleted);

        assert!(get_cluster(&db, uuid).await.expect("get").is_none());
        assert!(locks::lock_owner(&db, uuid).await.expect("owner").is_none());
        let groups = nodegroups::list_nodegroups(&db, uuid).await.expect("groups");
        assert!(groups.is_empty());
    }
}
