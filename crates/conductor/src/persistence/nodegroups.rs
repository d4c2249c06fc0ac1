use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, Sqlite, Transaction};
use uuid::Uuid;

use super::{ClusterStatus, Db};
use crate::error::OpError;
use crate::Result;

pub const ROLE_MASTER: &str = "master";
pub const ROLE_WORKER: &str = "worker";
pub const DEFAULT_MASTER_NAME: &str = "default-master";
pub const DEFAULT_WORKER_NAME: &str = "default-worker";

#[derive(Debug, Clone, FromRow)]
pub struct NodeGroupRecord {
    pub uuid: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub role: String,
    pub flavor_id: Option<String>,
    pub image_id: Option<String>,
    #[sqlx(rename = "labels_json")]
    pub labels: Option<Json<HashMap<String, String>>>,
    pub node_count: i64,
    pub min_node_count: Option<i64>,
    pub max_node_count: Option<i64>,
    pub is_default: bool,
    pub status: ClusterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNodeGroup {
    pub uuid: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub role: String,
    pub flavor_id: Option<String>,
    pub image_id: Option<String>,
    pub labels: HashMap<String, String>,
    pub node_count: i64,
    pub min_node_count: Option<i64>,
    pub max_node_count: Option<i64>,
    pub is_default: bool,
    pub status: ClusterStatus,
}

impl NewNodeGroup {
    pub fn default_master(
        cluster_id: Uuid,
        flavor_id: Option<String>,
        image_id: Option<String>,
        labels: HashMap<String, String>,
        node_count: i64,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            cluster_id,
            name: DEFAULT_MASTER_NAME.into(),
            role: ROLE_MASTER.into(),
            flavor_id,
            image_id,
            labels,
            node_count,
            min_node_count: Some(1),
            max_node_count: None,
            is_default: true,
            status: ClusterStatus::CreateInProgress,
        }
    }

    pub fn default_worker(
        cluster_id: Uuid,
        flavor_id: Option<String>,
        image_id: Option<String>,
        labels: HashMap<String, String>,
        node_count: i64,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            cluster_id,
            name: DEFAULT_WORKER_NAME.into(),
            role: ROLE_WORKER.into(),
            flavor_id,
            image_id,
            labels,
            node_count,
            min_node_count: Some(0),
            max_node_count: None,
            is_default: true,
            status: ClusterStatus::CreateInProgress,
        }
    }
}

pub async fn insert_nodegroup_tx(
    tx: &mut Transaction<'_, Sqlite>,
    group: &NewNodeGroup,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO nodegroups (
            uuid,
            cluster_id,
            name,
            role,
            flavor_id,
            image_id,
            labels_json,
            node_count,
            min_node_count,
            max_node_count,
            is_default,
            status
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(group.uuid)
    .bind(group.cluster_id)
    .bind(&group.name)
    .bind(&group.role)
    .bind(&group.flavor_id)
    .bind(&group.image_id)
    .bind(Json(&group.labels))
    .bind(group.node_count)
    .bind(group.min_node_count)
    .bind(group.max_node_count)
    .bind(group.is_default)
    .bind(group.status)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

const NODEGROUP_COLUMNS: &str = r#"
    uuid,
    cluster_id,
    name,
    role,
    flavor_id,
    image_id,
    labels_json,
    node_count,
    min_node_count,
    max_node_count,
    is_default,
    status,
    created_at,
    updated_at
"#;

pub async fn list_nodegroups(pool: &Db, cluster_id: Uuid) -> Result<Vec<NodeGroupRecord>> {
    let records = sqlx::query_as::<_, NodeGroupRecord>(&format!(
        "SELECT {NODEGROUP_COLUMNS} FROM nodegroups WHERE cluster_id = ?1 ORDER BY created_at ASC"
    ))
    .bind(cluster_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Resolve a node group by uuid or by name within a cluster. Group names
/// are unique per cluster by schema, so name lookups cannot be ambiguous.
pub async fn resolve_nodegroup(
    pool: &Db,
    cluster_id: Uuid,
    reference: &str,
) -> Result<Option<NodeGroupRecord>> {
    if let Ok(uuid) = Uuid::parse_str(reference) {
        let record = sqlx::query_as::<_, NodeGroupRecord>(&format!(
            "SELECT {NODEGROUP_COLUMNS} FROM nodegroups WHERE cluster_id = ?1 AND uuid = ?2"
        ))
        .bind(cluster_id)
        .bind(uuid)
        .fetch_optional(pool)
        .await?;
        return Ok(record);
    }

    let record = sqlx::query_as::<_, NodeGroupRecord>(&format!(
        "SELECT {NODEGROUP_COLUMNS} FROM nodegroups WHERE cluster_id = ?1 AND name = ?2"
    ))
    .bind(cluster_id)
    .bind(reference)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// The default worker group, the target of an unqualified resize.
pub async fn default_worker(pool: &Db, cluster_id: Uuid) -> Result<NodeGroupRecord> {
    let record = sqlx::query_as::<_, NodeGroupRecord>(&format!(
        r#"SELECT {NODEGROUP_COLUMNS} FROM nodegroups
           WHERE cluster_id = ?1 AND is_default = 1 AND role = ?2"#
    ))
    .bind(cluster_id)
    .bind(ROLE_WORKER)
    .fetch_optional(pool)
    .await?;

    record.ok_or_else(|| {
        anyhow::Error::new(OpError::not_found(format!(
            "cluster {cluster_id} has no default worker group"
        )))
    })
}

pub async fn set_node_count(pool: &Db, uuid: Uuid, node_count: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE nodegroups
        SET node_count = ?2, updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(node_count)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
