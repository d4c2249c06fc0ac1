use common::api::{ClusterPatch, ClusterSpec, ClusterView, NodeGroupView, RequestContext};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::driver::{Coe, Driver};
use crate::error::{OpError, OpResult};
use crate::persistence::{
    self as db, certificates, clusters, federations, nodegroups, templates, ClusterRecord,
    ClusterStatus, NewCluster, NewKeyPair, NewNodeGroup, TemplateRecord,
};
use crate::poller::{LifecyclePoller, PollPhase};
use crate::quota::RESOURCE_CLUSTER;
use crate::services::views;
use crate::stack::StackRequest;
use crate::validation;

/// Result of an accepted cluster mutation: the cluster as admitted, before
/// the poller has advanced it.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub cluster: ClusterView,
}

pub async fn cluster_create(
    state: &AppState,
    ctx: &RequestContext,
    uuid: Uuid,
    spec: ClusterSpec,
) -> OpResult<Accepted> {
    let template = templates::resolve_template(&state.db, &ctx.project_id, &spec.template)
        .await?
        .ok_or_else(|| OpError::not_found(format!("cluster template {} not found", spec.template)))?;
    let driver = Driver::for_template(&template)?;
    validation::validate_cluster_spec(&spec, &template, &driver, &state.limits)?;

    let merged = validation::merge_labels(&template.labels(), spec.labels.as_ref());
    let master_count = spec.master_count.unwrap_or(1);
    let node_count = spec.node_count.unwrap_or(1);

    let new_cluster = NewCluster {
        uuid,
        name: spec.name.clone(),
        project_id: ctx.project_id.clone(),
        user_id: ctx.user_id.clone(),
        template_id: template.uuid,
        keypair: spec.keypair.clone().or_else(|| template.keypair_id.clone()),
        docker_volume_size: spec.docker_volume_size.or(template.docker_volume_size),
        labels: merged.labels.clone(),
        labels_overridden: merged.overridden,
        labels_added: merged.added,
        labels_skipped: merged.skipped,
        flavor_id: spec.flavor_id.clone().or_else(|| template.flavor_id.clone()),
        master_flavor_id: spec
            .master_flavor_id
            .clone()
            .or_else(|| template.master_flavor_id.clone()),
        status: ClusterStatus::CreateInProgress,
        status_reason: Some("cluster creation accepted".to_string()),
        create_timeout: spec.create_timeout.unwrap_or(60),
    };
    let groups = vec![
        NewNodeGroup::default_master(
            uuid,
            new_cluster.master_flavor_id.clone(),
            template.image_id.clone(),
            merged.labels.clone(),
            master_count,
        ),
        NewNodeGroup::default_worker(
            uuid,
            new_cluster.flavor_id.clone(),
            template.image_id.clone(),
            merged.labels.clone(),
            node_count,
        ),
    ];

    let ca = state
        .ca
        .generate_ca(&spec.name)
        .await
        .map_err(OpError::from)?;
    let keypair = NewKeyPair {
        uuid: Uuid::new_v4(),
        cluster_id: uuid,
        certificate: ca.certificate,
        private_key: ca.private_key,
    };

    // Quota admission and the insert are serialized per (project, Cluster).
    let db_pool = state.db.clone();
    let inserted = state
        .quotas
        .admit_and(&ctx.project_id, RESOURCE_CLUSTER, 1, || async move {
            clusters::create_cluster_with_dependents(&db_pool, new_cluster, groups, keypair).await
        })
        .await?;

    let cluster = clusters::require_cluster(&state.db, uuid).await?;
    if !inserted {
        // A conductor already owns this uuid. Tolerate the idempotent
        // retry shape, reject anything else as a duplicate create.
        if cluster.project_id != ctx.project_id
            || cluster.status != ClusterStatus::CreateInProgress
        {
            return Err(OpError::conflict(format!(
                "cluster {uuid} already exists"
            )));
        }
    }

    // Lock before any engine call; the loser of a concurrent create gets
    // OperationInProgress here and no stack is issued for it.
    state.lock.acquire(&cluster).await?;

    let request = driver.stack_request(&cluster, &template, &nodegroup_records(state, uuid).await?);
    if let Err(err) = validation::validate_manifest_size(&request, &state.limits) {
        fail_before_poll(state, &cluster, ClusterStatus::CreateFailed, &err).await;
        return Err(err);
    }

    match state.stack.create_stack(request).await {
        Ok(stack_id) => {
            clusters::set_stack_id(&state.db, uuid, &stack_id).await?;
            clusters::set_status(
                &state.db,
                uuid,
                ClusterStatus::CreateInProgress,
                Some("stack creation initiated"),
            )
            .await?;
            info!(cluster = %uuid, %stack_id, "cluster create accepted");
            spawn_poller(state, &cluster, driver.coe, PollPhase::Create, false);

            let cluster = clusters::require_cluster(&state.db, uuid).await?;
            Ok(Accepted {
                cluster: views::cluster_view(&cluster),
            })
        }
        Err(err) => {
            let op_err = OpError::from(err);
            fail_before_poll(state, &cluster, ClusterStatus::CreateFailed, &op_err).await;
            Err(op_err)
        }
    }
}

pub async fn cluster_update(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
    patch: ClusterPatch,
    rollback: bool,
) -> OpResult<Accepted> {
    if patch.template_id.is_some() || patch.project_id.is_some() || patch.name.is_some() {
        return Err(OpError::invalid_parameter(
            "template_id, project_id, and name are immutable",
        ));
    }
    if patch.node_count.is_none() && patch.labels.is_none() {
        return Err(OpError::invalid_parameter("no fields to update"));
    }

    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;
    ensure_complete(&cluster)?;
    let (driver, template) = driver_for(state, &cluster).await?;

    let worker = nodegroups::default_worker(&state.db, cluster.uuid).await?;
    let node_count = patch.node_count.unwrap_or(worker.node_count);
    validation::validate_node_count(node_count)?;
    ensure_within_bounds(&worker, node_count)?;

    let merged = patch
        .labels
        .as_ref()
        .map(|labels| {
            validation::validate_labels(labels, &state.limits)?;
            Ok::<_, OpError>(validation::merge_labels(&template.labels(), Some(labels)))
        })
        .transpose()?;

    state
        .lock
        .scoped(&cluster, || async {
            if let Some(merged) = &merged {
                clusters::update_labels(
                    &state.db,
                    cluster.uuid,
                    &merged.labels,
                    &merged.overridden,
                    &merged.added,
                    &merged.skipped,
                )
                .await?;
            }
            nodegroups::set_node_count(&state.db, worker.uuid, node_count).await?;

            let fresh = clusters::require_cluster(&state.db, cluster.uuid).await?;
            let mut request =
                driver.stack_request(&fresh, &template, &nodegroup_records(state, cluster.uuid).await?);
            if rollback {
                request
                    .parameters
                    .insert("rollback_on_failure".to_string(), "true".to_string());
            }
            validation::validate_manifest_size(&request, &state.limits)?;
            issue_update(state, &fresh, request).await
        })
        .await?;

    spawn_poller(state, &cluster, driver.coe, PollPhase::Update, rollback);
    accepted(state, cluster.uuid).await
}

pub async fn cluster_resize(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
    node_count: i64,
    nodes_to_remove: Vec<String>,
    nodegroup: Option<&str>,
) -> OpResult<Accepted> {
    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;
    ensure_complete(&cluster)?;
    let (driver, template) = driver_for(state, &cluster).await?;

    let group = match nodegroup {
        Some(reference) => nodegroups::resolve_nodegroup(&state.db, cluster.uuid, reference)
            .await?
            .ok_or_else(|| {
                OpError::not_found(format!(
                    "node group {reference} not found in cluster {}",
                    cluster.name
                ))
            })?,
        None => nodegroups::default_worker(&state.db, cluster.uuid).await?,
    };

    if group.role == nodegroups::ROLE_MASTER {
        return Err(OpError::not_supported(
            "resizing the master node group is not supported",
        ));
    }
    validation::validate_node_count(node_count)?;
    if node_count == 0 && !ctx.api_version.at_least(1, 10) {
        return Err(OpError::invalid_parameter(
            "resizing to zero nodes requires API version 1.10",
        ));
    }
    ensure_within_bounds(&group, node_count)?;
    if nodes_to_remove.len() as i64 > group.node_count {
        return Err(OpError::invalid_parameter(
            "nodes_to_remove exceeds the current node count",
        ));
    }

    state
        .lock
        .scoped(&cluster, || async {
            nodegroups::set_node_count(&state.db, group.uuid, node_count).await?;

            let fresh = clusters::require_cluster(&state.db, cluster.uuid).await?;
            let mut request =
                driver.stack_request(&fresh, &template, &nodegroup_records(state, cluster.uuid).await?);
            if !nodes_to_remove.is_empty() {
                request
                    .parameters
                    .insert("nodes_to_remove".to_string(), nodes_to_remove.join(","));
            }
            validation::validate_manifest_size(&request, &state.limits)?;
            issue_update(state, &fresh, request).await
        })
        .await?;

    spawn_poller(state, &cluster, driver.coe, PollPhase::Update, false);
    accepted(state, cluster.uuid).await
}

pub async fn cluster_upgrade(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
    template_ref: &str,
) -> OpResult<Accepted> {
    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;
    let (driver, _current_template) = driver_for(state, &cluster).await?;

    let new_template = templates::resolve_template(&state.db, &ctx.project_id, template_ref)
        .await?
        .ok_or_else(|| {
            OpError::not_found(format!("cluster template {template_ref} not found"))
        })?;
    let new_driver = Driver::for_template(&new_template)?;
    if new_driver.coe != driver.coe {
        return Err(OpError::invalid_parameter(format!(
            "cannot upgrade a {} cluster with a {} template",
            driver.coe.as_str(),
            new_driver.coe.as_str()
        )));
    }

    // Version check happens before the status check so a downgrade request
    // is refused for what it is, not for when it arrives.
    driver.check_upgrade(&cluster.labels(), &new_template.labels())?;
    ensure_complete(&cluster)?;

    // The upgrade rebases the cluster on the new template's labels; label
    // keys the user added at create time survive, overrides do not (they
    // would pin the version the upgrade is meant to move).
    let user_added = cluster
        .labels_added
        .as_ref()
        .map(|j| j.0.clone())
        .unwrap_or_default();
    let merged = validation::merge_labels(&new_template.labels(), Some(&user_added));

    state
        .lock
        .scoped(&cluster, || async {
            clusters::update_labels(
                &state.db,
                cluster.uuid,
                &merged.labels,
                &merged.overridden,
                &merged.added,
                &merged.skipped,
            )
            .await?;

            let fresh = clusters::require_cluster(&state.db, cluster.uuid).await?;
            let request = driver.stack_request(
                &fresh,
                &new_template,
                &nodegroup_records(state, cluster.uuid).await?,
            );
            validation::validate_manifest_size(&request, &state.limits)?;
            issue_update(state, &fresh, request).await
        })
        .await?;

    spawn_poller(state, &cluster, driver.coe, PollPhase::Update, false);
    accepted(state, cluster.uuid).await
}

pub async fn cluster_delete(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
) -> OpResult<()> {
    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;

    if let Some(federation) = federations::federation_of_member(&state.db, cluster.uuid).await? {
        return Err(OpError::conflict(format!(
            "cluster {} is a member of federation {}; remove it first",
            cluster.name, federation.name
        )));
    }

    let (driver, _template) = driver_for(state, &cluster).await?;

    // Reentrant: a delete may cancel this conductor's own in-flight
    // create; the superseded poller notices the phase change and exits.
    state.lock.acquire_reentrant(&cluster).await?;

    if let Some(stack_id) = &cluster.stack_id {
        if let Err(err) = state.stack.delete_stack(stack_id).await {
            let op_err = OpError::from(err);
            fail_before_poll(state, &cluster, ClusterStatus::DeleteFailed, &op_err).await;
            return Err(op_err);
        }
    }

    clusters::set_status(
        &state.db,
        cluster.uuid,
        ClusterStatus::DeleteInProgress,
        Some("stack deletion initiated"),
    )
    .await?;
    info!(cluster = %cluster.uuid, "cluster delete accepted");
    spawn_poller(state, &cluster, driver.coe, PollPhase::Delete, false);

    Ok(())
}

pub async fn rotate_ca(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
) -> OpResult<Accepted> {
    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;
    let (driver, template) = driver_for(state, &cluster).await?;

    if !driver.supports_ca_rotation() {
        return Err(OpError::not_supported(format!(
            "{} clusters do not support CA rotation",
            driver.coe.as_str()
        )));
    }
    ensure_complete(&cluster)?;

    let ca = state
        .ca
        .generate_ca(&cluster.name)
        .await
        .map_err(OpError::from)?;

    state
        .lock
        .scoped(&cluster, || async {
            certificates::rotate_keypair(
                &state.db,
                &NewKeyPair {
                    uuid: Uuid::new_v4(),
                    cluster_id: cluster.uuid,
                    certificate: ca.certificate.clone(),
                    private_key: ca.private_key.clone(),
                },
            )
            .await?;

            let fresh = clusters::require_cluster(&state.db, cluster.uuid).await?;
            let request =
                driver.stack_request(&fresh, &template, &nodegroup_records(state, cluster.uuid).await?);
            validation::validate_manifest_size(&request, &state.limits)?;
            issue_update(state, &fresh, request).await
        })
        .await?;

    spawn_poller(state, &cluster, driver.coe, PollPhase::Update, false);
    accepted(state, cluster.uuid).await
}

pub async fn cluster_show(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
) -> OpResult<ClusterView> {
    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;
    Ok(views::cluster_view(&cluster))
}

pub async fn cluster_list(state: &AppState, ctx: &RequestContext) -> OpResult<Vec<ClusterView>> {
    let records = clusters::list_clusters(&state.db, &ctx.project_id).await?;
    Ok(records.iter().map(views::cluster_view).collect())
}

pub async fn nodegroup_list(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
) -> OpResult<Vec<NodeGroupView>> {
    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;
    let groups = nodegroups::list_nodegroups(&state.db, cluster.uuid).await?;
    Ok(groups.iter().map(views::nodegroup_view).collect())
}

pub async fn nodegroup_show(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
    nodegroup_ref: &str,
) -> OpResult<NodeGroupView> {
    let cluster = resolve_cluster(state, ctx, cluster_ref).await?;
    let group = nodegroups::resolve_nodegroup(&state.db, cluster.uuid, nodegroup_ref)
        .await?
        .ok_or_else(|| {
            OpError::not_found(format!(
                "node group {nodegroup_ref} not found in cluster {}",
                cluster.name
            ))
        })?;
    Ok(views::nodegroup_view(&group))
}

async fn resolve_cluster(
    state: &AppState,
    ctx: &RequestContext,
    cluster_ref: &str,
) -> OpResult<ClusterRecord> {
    let cluster = clusters::resolve_cluster(&state.db, &ctx.project_id, cluster_ref)
        .await?
        .ok_or_else(|| OpError::not_found(format!("cluster {cluster_ref} not found")))?;

    // Uuid lookups are global; a foreign tenant's cluster must look
    // exactly like a missing one.
    let is_admin = ctx.roles.iter().any(|role| role == "admin");
    if cluster.project_id != ctx.project_id && !is_admin {
        return Err(OpError::not_found(format!("cluster {cluster_ref} not found")));
    }
    Ok(cluster)
}

async fn driver_for(
    state: &AppState,
    cluster: &ClusterRecord,
) -> OpResult<(Driver, TemplateRecord)> {
    let template = templates::get_template(&state.db, cluster.template_id)
        .await?
        .ok_or_else(|| {
            OpError::not_found(format!(
                "template {} of cluster {} not found",
                cluster.template_id, cluster.name
            ))
        })?;
    let driver = Driver::for_template(&template)?;
    Ok((driver, template))
}

fn ensure_complete(cluster: &ClusterRecord) -> OpResult<()> {
    if cluster.status.in_progress() {
        return Err(OpError::operation_in_progress(&cluster.name));
    }
    if !cluster.status.complete() {
        return Err(OpError::conflict(format!(
            "cluster {} cannot be mutated in status {}",
            cluster.name,
            cluster.status.to_wire()
        )));
    }
    Ok(())
}

fn ensure_within_bounds(group: &db::NodeGroupRecord, node_count: i64) -> OpResult<()> {
    if let Some(min) = group.min_node_count {
        if node_count < min {
            return Err(OpError::invalid_parameter(format!(
                "node_count {node_count} is below the group minimum {min}"
            )));
        }
    }
    if let Some(max) = group.max_node_count {
        if node_count > max {
            return Err(OpError::invalid_parameter(format!(
                "node_count {node_count} is above the group maximum {max}"
            )));
        }
    }
    Ok(())
}

async fn nodegroup_records(
    state: &AppState,
    cluster_id: Uuid,
) -> Result<Vec<db::NodeGroupRecord>, OpError> {
    nodegroups::list_nodegroups(&state.db, cluster_id)
        .await
        .map_err(OpError::from)
}

/// Issue the stack update and flip the cluster into the update phase.
async fn issue_update(
    state: &AppState,
    cluster: &ClusterRecord,
    request: StackRequest,
) -> OpResult<()> {
    let stack_id = cluster.stack_id.clone().ok_or_else(|| {
        OpError::conflict(format!("cluster {} has no stack to update", cluster.name))
    })?;

    state
        .stack
        .update_stack(&stack_id, request)
        .await
        .map_err(OpError::from)?;
    clusters::set_status(
        &state.db,
        cluster.uuid,
        ClusterStatus::UpdateInProgress,
        Some("stack update initiated"),
    )
    .await?;
    info!(cluster = %cluster.uuid, %stack_id, "cluster update accepted");
    Ok(())
}

/// Record a failure that happened after the lock was taken but before a
/// poller existed to own the terminal transition.
async fn fail_before_poll(
    state: &AppState,
    cluster: &ClusterRecord,
    status: ClusterStatus,
    err: &OpError,
) {
    if let Err(store_err) =
        clusters::set_status(&state.db, cluster.uuid, status, Some(&err.message)).await
    {
        warn!(cluster = %cluster.uuid, ?store_err, "failed to record failure status");
    }
    state.lock.release(cluster.uuid).await;
}

fn spawn_poller(
    state: &AppState,
    cluster: &ClusterRecord,
    coe: Coe,
    phase: PollPhase,
    rollback: bool,
) {
    let driver = Driver { coe };
    let poller = LifecyclePoller::new(
        state.db.clone(),
        state.stack.clone(),
        state.quotas.clone(),
        state.lock.clone(),
        cluster.uuid,
        cluster.project_id.clone(),
        phase,
        rollback,
        driver.output_keys(),
        state.pacing.for_coe(coe),
        state.shutdown_rx.clone(),
    );
    tokio::spawn(poller.run());
}

async fn accepted(state: &AppState, uuid: Uuid) -> OpResult<Accepted> {
    let cluster = clusters::require_cluster(&state.db, uuid).await?;
    Ok(Accepted {
        cluster: views::cluster_view(&cluster),
    })
}
