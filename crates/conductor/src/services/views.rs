//! Pure mappings from stored records to wire shapes.

use common::api::{ClusterView, ConductorServiceView, FederationView, NodeGroupView};

use crate::persistence::{ClusterRecord, FederationRecord, NodeGroupRecord, ServiceRecord};

fn json_map(
    value: &Option<sqlx::types::Json<std::collections::HashMap<String, String>>>,
) -> std::collections::HashMap<String, String> {
    value.as_ref().map(|j| j.0.clone()).unwrap_or_default()
}

fn json_list(value: &Option<sqlx::types::Json<Vec<String>>>) -> Vec<String> {
    value.as_ref().map(|j| j.0.clone()).unwrap_or_default()
}

pub fn cluster_view(record: &ClusterRecord) -> ClusterView {
    ClusterView {
        uuid: record.uuid,
        name: record.name.clone(),
        project_id: record.project_id.clone(),
        user_id: record.user_id.clone(),
        template_id: record.template_id,
        keypair: record.keypair.clone(),
        docker_volume_size: record.docker_volume_size,
        labels: json_map(&record.labels),
        labels_overridden: json_map(&record.labels_overridden),
        labels_added: json_map(&record.labels_added),
        labels_skipped: json_map(&record.labels_skipped),
        flavor_id: record.flavor_id.clone(),
        master_flavor_id: record.master_flavor_id.clone(),
        stack_id: record.stack_id.clone(),
        api_address: record.api_address.clone(),
        master_addresses: json_list(&record.master_addresses),
        node_addresses: json_list(&record.node_addresses),
        status: record.status.to_wire(),
        status_reason: record.status_reason.clone(),
        health_status: record.health_status.to_wire(),
        health_status_reason: json_map(&record.health_status_reason),
        create_timeout: record.create_timeout,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

pub fn nodegroup_view(record: &NodeGroupRecord) -> NodeGroupView {
    NodeGroupView {
        uuid: record.uuid,
        cluster_id: record.cluster_id,
        name: record.name.clone(),
        role: record.role.clone(),
        flavor_id: record.flavor_id.clone(),
        image_id: record.image_id.clone(),
        labels: json_map(&record.labels),
        node_count: record.node_count,
        min_node_count: record.min_node_count,
        max_node_count: record.max_node_count,
        is_default: record.is_default,
        status: record.status.to_wire(),
    }
}

pub fn federation_view(record: &FederationRecord) -> FederationView {
    FederationView {
        uuid: record.uuid,
        name: record.name.clone(),
        project_id: record.project_id.clone(),
        hostcluster_id: record.hostcluster_id,
        member_ids: record.members(),
        status: record.status.to_wire(),
        properties: record.properties(),
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

pub fn service_view(record: &ServiceRecord, state: &str) -> ConductorServiceView {
    ConductorServiceView {
        id: record.id,
        host: record.host.clone(),
        binary: record.binary.clone(),
        report_count: record.report_count,
        disabled: record.disabled,
        forced_down: record.forced_down,
        last_seen_up: record.last_seen_up,
        state: state.to_string(),
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}
