pub mod client;
pub mod server;

use axum::http::StatusCode;
use common::rpc::{ConductorRequest, RpcEnvelope, RpcReply};
use serde_json::Value;
use tracing::debug;

use crate::app_state::AppState;
use crate::error::{OpError, OpResult};
use crate::services::{clusters, conductors, federations};
use crate::telemetry;

/// Route one envelope to its handler and shape the reply.
///
/// Mutations answer `202 Accepted`: the poller finishes the work after the
/// reply is on the wire. Reads answer `200`.
pub async fn dispatch(state: &AppState, envelope: RpcEnvelope) -> (StatusCode, RpcReply) {
    let op = envelope.request.op_name();
    let accepted_status = if envelope.request.is_mutation() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };

    debug!(
        op,
        project_id = %envelope.context.project_id,
        request_id = %envelope.context.request_id,
        "conductor rpc received"
    );

    match route(state, envelope).await {
        Ok(value) => {
            telemetry::record_rpc(op, "ok");
            (accepted_status, RpcReply::ok(value))
        }
        Err(err) => {
            telemetry::record_rpc(op, err.kind.as_str());
            (err.http_status(), RpcReply::err(err.kind, err.message))
        }
    }
}

async fn route(state: &AppState, envelope: RpcEnvelope) -> OpResult<Value> {
    let ctx = envelope.context;

    match envelope.request {
        ConductorRequest::ClusterCreate { uuid, spec } => {
            let accepted = clusters::cluster_create(state, &ctx, uuid, spec).await?;
            to_value(accepted.cluster)
        }
        ConductorRequest::ClusterUpdate {
            cluster,
            patch,
            rollback,
        } => {
            let accepted = clusters::cluster_update(state, &ctx, &cluster, patch, rollback).await?;
            to_value(accepted.cluster)
        }
        ConductorRequest::ClusterResize {
            cluster,
            node_count,
            nodes_to_remove,
            nodegroup,
        } => {
            let accepted = clusters::cluster_resize(
                state,
                &ctx,
                &cluster,
                node_count,
                nodes_to_remove,
                nodegroup.as_deref(),
            )
            .await?;
            to_value(accepted.cluster)
        }
        ConductorRequest::ClusterUpgrade { cluster, template } => {
            let accepted = clusters::cluster_upgrade(state, &ctx, &cluster, &template).await?;
            to_value(accepted.cluster)
        }
        ConductorRequest::ClusterDelete { cluster } => {
            clusters::cluster_delete(state, &ctx, &cluster).await?;
            Ok(Value::Null)
        }
        ConductorRequest::RotateCa { cluster } => {
            let accepted = clusters::rotate_ca(state, &ctx, &cluster).await?;
            to_value(accepted.cluster)
        }
        ConductorRequest::ClusterShow { cluster } => {
            to_value(clusters::cluster_show(state, &ctx, &cluster).await?)
        }
        ConductorRequest::ClusterList => to_value(clusters::cluster_list(state, &ctx).await?),
        ConductorRequest::NodeGroupList { cluster } => {
            to_value(clusters::nodegroup_list(state, &ctx, &cluster).await?)
        }
        ConductorRequest::NodeGroupShow { cluster, nodegroup } => {
            to_value(clusters::nodegroup_show(state, &ctx, &cluster, &nodegroup).await?)
        }
        ConductorRequest::FederationCreate { uuid, spec } => {
            to_value(federations::federation_create(state, &ctx, uuid, spec).await?)
        }
        ConductorRequest::FederationUpdateMembers {
            federation,
            add,
            remove,
        } => to_value(
            federations::federation_update_members(state, &ctx, &federation, add, remove).await?,
        ),
        ConductorRequest::FederationShow { federation } => {
            to_value(federations::federation_show(state, &ctx, &federation).await?)
        }
        ConductorRequest::FederationList => {
            to_value(federations::federation_list(state, &ctx).await?)
        }
        ConductorRequest::FederationDelete { federation } => {
            federations::federation_delete(state, &ctx, &federation).await?;
            Ok(Value::Null)
        }
        ConductorRequest::ServiceList => to_value(conductors::service_list(state).await?),
        ConductorRequest::ServiceForceDown { host, binary } => {
            conductors::service_force_down(state, &host, &binary).await?;
            Ok(Value::Null)
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> OpResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| OpError::fatal(format!("reply serialization failed: {err}")))
}
