use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{ClusterStatus, Db};
use crate::error::OpError;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct FederationRecord {
    pub uuid: Uuid,
    pub name: String,
    pub project_id: String,
    pub hostcluster_id: Uuid,
    #[sqlx(rename = "member_ids_json")]
    pub member_ids: Option<Json<Vec<Uuid>>>,
    pub status: ClusterStatus,
    #[sqlx(rename = "properties_json")]
    pub properties: Option<Json<HashMap<String, String>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FederationRecord {
    pub fn members(&self) -> Vec<Uuid> {
        self.member_ids
            .as_ref()
            .map(|j| j.0.clone())
            .unwrap_or_default()
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.properties
            .as_ref()
            .map(|j| j.0.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewFederation {
    pub uuid: Uuid,
    pub name: String,
    pub project_id: String,
    pub hostcluster_id: Uuid,
    pub member_ids: Vec<Uuid>,
    pub status: ClusterStatus,
    pub properties: HashMap<String, String>,
}

pub async fn create_federation(pool: &Db, federation: NewFederation) -> Result<FederationRecord> {
    sqlx::query(
        r#"
        INSERT INTO federations (
            uuid,
            name,
            project_id,
            hostcluster_id,
            member_ids_json,
            status,
            properties_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(federation.uuid)
    .bind(&federation.name)
    .bind(&federation.project_id)
    .bind(federation.hostcluster_id)
    .bind(Json(&federation.member_ids))
    .bind(federation.status)
    .bind(Json(&federation.properties))
    .execute(pool)
    .await?;

    get_federation(pool, federation.uuid)
        .await?
        .ok_or_else(|| anyhow::anyhow!("federation insert did not return row"))
}

const FEDERATION_COLUMNS: &str = r#"
    uuid,
    name,
    project_id,
    hostcluster_id,
    member_ids_json,
    status,
    properties_json,
    created_at,
    updated_at
"#;

pub async fn get_federation(pool: &Db, uuid: Uuid) -> Result<Option<FederationRecord>> {
    let record = sqlx::query_as::<_, FederationRecord>(&format!(
        "SELECT {FEDERATION_COLUMNS} FROM federations WHERE uuid = ?1"
    ))
    .bind(uuid)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Resolve by uuid or by (globally unique) name.
pub async fn resolve_federation(pool: &Db, reference: &str) -> Result<Option<FederationRecord>> {
    if let Ok(uuid) = Uuid::parse_str(reference) {
        return get_federation(pool, uuid).await;
    }

    let record = sqlx::query_as::<_, FederationRecord>(&format!(
        "SELECT {FEDERATION_COLUMNS} FROM federations WHERE name = ?1"
    ))
    .bind(reference)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_federations(pool: &Db, project_id: &str) -> Result<Vec<FederationRecord>> {
    let records = sqlx::query_as::<_, FederationRecord>(&format!(
        "SELECT {FEDERATION_COLUMNS} FROM federations WHERE project_id = ?1 ORDER BY created_at ASC"
    ))
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn replace_members(pool: &Db, uuid: Uuid, member_ids: &[Uuid]) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE federations
        SET member_ids_json = ?2, updated_at = datetime('now')
        WHERE uuid = ?1
        "#,
    )
    .bind(uuid)
    .bind(Json(member_ids))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_federation(pool: &Db, uuid: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM federations WHERE uuid = ?1")
        .bind(uuid)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// The federation a cluster belongs to, if any. Used as a delete guard:
/// member clusters must leave their federation first.
pub async fn federation_of_member(pool: &Db, cluster_id: Uuid) -> Result<Option<FederationRecord>> {
    let federations = sqlx::query_as::<_, FederationRecord>(&format!(
        "SELECT {FEDERATION_COLUMNS} FROM federations"
    ))
    .fetch_all(pool)
    .await?;

    Ok(federations
        .into_iter()
        .find(|f| f.members().contains(&cluster_id) || f.hostcluster_id == cluster_id))
}

pub async fn require_federation(pool: &Db, reference: &str) -> Result<FederationRecord> {
    resolve_federation(pool, reference).await?.ok_or_else(|| {
        anyhow::Error::new(OpError::not_found(format!(
            "federation {reference} not found"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    fn new_federation(name: &str) -> NewFederation {
        NewFederation {
            uuid: Uuid::new_v4(),
            name: name.into(),
            project_id: "p1".into(),
            hostcluster_id: Uuid::new_v4(),
            member_ids: Vec::new(),
            status: ClusterStatus::CreateComplete,
            properties: HashMap::from([("dns_zone_name".into(), "fed.example.".into())]),
        }
    }

    #[tokio::test]
    async fn create_resolve_and_membership() {
        let db = migrations::init_pool("sqlite::memory:").await.expect("db init");
        migrations::run_migrations(&db).await.expect("migrations");

        let created = create_federation(&db, new_federation("f1")).await.expect("create");
        let member = Uuid::new_v4();
        replace_members(&db, created.uuid, &[member]).await.expect("members");

        let by_name = resolve_federation(&db, "f1")
            .await
            .expect("resolve")
            .expect("row");
        assert_eq!(by_name.members(), vec![member]);
        assert_eq!(
            by_name.properties().get("dns_zone_name").map(String::as_str),
            Some("fed.example.")
        );

        let found = federation_of_member(&db, member).await.expect("lookup");
        assert_eq!(found.map(|f| f.uuid), Some(created.uuid));

        let host_found = federation_of_member(&db, created.hostcluster_id)
            .await
            .expect("lookup");
        assert!(host_found.is_some());

        assert!(federation_of_member(&db, Uuid::new_v4())
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected_by_schema() {
        let db = migrations::init_pool("sqlite::memory:").await.expect("db init");
        migrations::run_migrations(&db).await.expect("migrations");

        create_federation(&db, new_federation("dup")).await.expect("create");
        let err = create_federation(&db, new_federation("dup")).await.unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }
}
