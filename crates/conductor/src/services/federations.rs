use common::api::{FederationSpec, FederationView, RequestContext};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{OpError, OpResult};
use crate::persistence::{clusters, federations, ClusterStatus, NewFederation};
use crate::services::views;

/// Properties every federation must carry.
const DNS_ZONE_PROPERTY: &str = "dns_zone_name";

pub async fn federation_create(
    state: &AppState,
    ctx: &RequestContext,
    uuid: Uuid,
    spec: FederationSpec,
) -> OpResult<FederationView> {
    if spec.name.trim().is_empty() {
        return Err(OpError::invalid_parameter("federation name cannot be empty"));
    }
    if !spec.properties.contains_key(DNS_ZONE_PROPERTY) {
        return Err(OpError::invalid_parameter(format!(
            "federation properties must include {DNS_ZONE_PROPERTY}"
        )));
    }

    let host = clusters::resolve_cluster(&state.db, &ctx.project_id, &spec.hostcluster)
        .await?
        .ok_or_else(|| {
            OpError::not_found(format!("host cluster {} not found", spec.hostcluster))
        })?;

    let record = federations::create_federation(
        &state.db,
        NewFederation {
            uuid,
            name: spec.name.clone(),
            project_id: ctx.project_id.clone(),
            hostcluster_id: host.uuid,
            member_ids: Vec::new(),
            status: ClusterStatus::CreateComplete,
            properties: spec.properties.clone(),
        },
    )
    .await?;

    info!(federation = %uuid, name = %spec.name, "federation created");
    Ok(views::federation_view(&record))
}

/// Add and remove members. Additions must reference existing clusters and
/// not already be members; removals must reference current members.
pub async fn federation_update_members(
    state: &AppState,
    ctx: &RequestContext,
    federation_ref: &str,
    add: Vec<Uuid>,
    remove: Vec<Uuid>,
) -> OpResult<FederationView> {
    let federation = federations::require_federation(&state.db, federation_ref).await?;
    if federation.project_id != ctx.project_id {
        return Err(OpError::not_found(format!(
            "federation {federation_ref} not found"
        )));
    }

    let mut members = federation.members();

    for uuid in &add {
        if members.contains(uuid) {
            return Err(OpError::conflict(format!(
                "cluster {uuid} is already a member of federation {}",
                federation.name
            )));
        }
        let exists = clusters::get_cluster(&state.db, *uuid).await?.is_some();
        if !exists {
            return Err(OpError::not_found(format!("cluster {uuid} not found")));
        }
        members.push(*uuid);
    }

    for uuid in &remove {
        let Some(position) = members.iter().position(|m| m == uuid) else {
            return Err(OpError::not_found(format!(
                "cluster {uuid} is not a member of federation {}",
                federation.name
            )));
        };
        members.remove(position);
    }

    federations::replace_members(&state.db, federation.uuid, &members).await?;

    let record = federations::require_federation(&state.db, &federation.uuid.to_string()).await?;
    Ok(views::federation_view(&record))
}

pub async fn federation_show(
    state: &AppState,
    ctx: &RequestContext,
    federation_ref: &str,
) -> OpResult<FederationView> {
    let federation = federations::require_federation(&state.db, federation_ref).await?;
    if federation.project_id != ctx.project_id {
        return Err(OpError::not_found(format!(
            "federation {federation_ref} not found"
        )));
    }
    Ok(views::federation_view(&federation))
}

pub async fn federation_list(
    state: &AppState,
    ctx: &RequestContext,
) -> OpResult<Vec<FederationView>> {
    let records = federations::list_federations(&state.db, &ctx.project_id).await?;
    Ok(records.iter().map(views::federation_view).collect())
}

pub async fn federation_delete(
    state: &AppState,
    ctx: &RequestContext,
    federation_ref: &str,
) -> OpResult<()> {
    let federation = federations::require_federation(&state.db, federation_ref).await?;
    if federation.project_id != ctx.project_id {
        return Err(OpError::not_found(format!(
            "federation {federation_ref} not found"
        )));
    }

    federations::delete_federation(&state.db, federation.uuid).await?;
    info!(federation = %federation.uuid, "federation deleted");
    Ok(())
}
