use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::error::OpError;
use crate::Result;

/// Immutable cluster template; its fields are the defaults merged into a
/// cluster at create time.
#[derive(Debug, Clone, FromRow)]
pub struct TemplateRecord {
    pub uuid: Uuid,
    pub name: String,
    pub project_id: String,
    pub coe: String,
    pub image_id: Option<String>,
    pub flavor_id: Option<String>,
    pub master_flavor_id: Option<String>,
    pub keypair_id: Option<String>,
    pub docker_volume_size: Option<i64>,
    pub docker_storage_driver: Option<String>,
    #[sqlx(rename = "labels_json")]
    pub labels: Option<Json<HashMap<String, String>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TemplateRecord {
    pub fn labels(&self) -> HashMap<String, String> {
        self.labels.as_ref().map(|j| j.0.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub uuid: Uuid,
    pub name: String,
    pub project_id: String,
    pub coe: String,
    pub image_id: Option<String>,
    pub flavor_id: Option<String>,
    pub master_flavor_id: Option<String>,
    pub keypair_id: Option<String>,
    pub docker_volume_size: Option<i64>,
    pub docker_storage_driver: Option<String>,
    pub labels: HashMap<String, String>,
}

pub async fn create_template(pool: &Db, template: NewTemplate) -> Result<TemplateRecord> {
    sqlx::query(
        r#"
        INSERT INTO cluster_templates (
            uuid,
            name,
            project_id,
            coe,
            image_id,
            flavor_id,
            master_flavor_id,
            keypair_id,
            docker_volume_size,
            docker_storage_driver,
            labels_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(template.uuid)
    .bind(&template.name)
    .bind(&template.project_id)
    .bind(&template.coe)
    .bind(&template.image_id)
    .bind(&template.flavor_id)
    .bind(&template.master_flavor_id)
    .bind(&template.keypair_id)
    .bind(template.docker_volume_size)
    .bind(template.docker_storage_driver)
    .bind(Json(&template.labels))
    .execute(pool)
    .await?;

    get_template(pool, template.uuid)
        .await?
        .ok_or_else(|| anyhow::anyhow!("template insert did not return row"))
}

const TEMPLATE_COLUMNS: &str = r#"
    uuid,
    name,
    project_id,
    coe,
    image_id,
    flavor_id,
    master_flavor_id,
    keypair_id,
    docker_volume_size,
    docker_storage_driver,
    labels_json,
    created_at,
    updated_at
"#;

pub async fn get_template(pool: &Db, uuid: Uuid) -> Result<Option<TemplateRecord>> {
    let record = sqlx::query_as::<_, TemplateRecord>(&format!(
        "SELECT {TEMPLATE_COLUMNS} FROM cluster_templates WHERE uuid = ?1"
    ))
    .bind(uuid)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Resolve a template by uuid or by name within a project; ambiguous names
/// fail with Conflict.
pub async fn resolve_template(
    pool: &Db,
    project_id: &str,
    reference: &str,
) -> Result<Option<TemplateRecord>> {
    if let Ok(uuid) = Uuid::parse_str(reference) {
        return get_template(pool, uuid).await;
    }

    let matches = sqlx::query_as::<_, TemplateRecord>(&format!(
        r#"SELECT {TEMPLATE_COLUMNS} FROM cluster_templates
           WHERE project_id = ?1 AND name = ?2 LIMIT 2"#
    ))
    .bind(project_id)
    .bind(reference)
    .fetch_all(pool)
    .await?;

    if matches.len() > 1 {
        return Err(anyhow::Error::new(OpError::conflict(format!(
            "multiple templates named {reference}; use the uuid"
        ))));
    }

    Ok(matches.into_iter().next())
}
