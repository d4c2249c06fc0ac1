//! RPC envelope shared by the conductor server and its clients.
//!
//! The transport is deliberately simple: one envelope type tagged by
//! operation name, one reply type carrying either a JSON result or a typed
//! error. The message-bus flavor of the deployment (HTTP, AMQP, in-process)
//! is a conductor concern; the wire shapes here stay stable across them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::{ClusterPatch, ClusterSpec, ErrorKind, FederationSpec, RequestContext};

/// A conductor operation, tagged by its wire name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConductorRequest {
    /// Create a cluster and start driving it to `CREATE_COMPLETE`.
    ClusterCreate {
        /// Cluster uuid chosen by the caller so retries stay idempotent.
        uuid: Uuid,
        /// Declarative cluster spec.
        spec: ClusterSpec,
    },
    /// Patch a cluster and drive it through an update.
    ClusterUpdate {
        /// Cluster reference (uuid or name).
        cluster: String,
        /// Fields to change.
        patch: ClusterPatch,
        /// Roll the stack back on update failure.
        #[serde(default)]
        rollback: bool,
    },
    /// Change the node count of one node group.
    ClusterResize {
        /// Cluster reference (uuid or name).
        cluster: String,
        /// Desired node count.
        node_count: i64,
        /// Specific nodes to remove first, if any.
        #[serde(default)]
        nodes_to_remove: Vec<String>,
        /// Target node group; the default worker group when absent.
        #[serde(default)]
        nodegroup: Option<String>,
    },
    /// Upgrade a cluster to a newer template.
    ClusterUpgrade {
        /// Cluster reference (uuid or name).
        cluster: String,
        /// Replacement template reference (uuid or name).
        template: String,
    },
    /// Delete a cluster and its dependent records.
    ClusterDelete {
        /// Cluster reference (uuid or name).
        cluster: String,
    },
    /// Install a freshly generated CA on the cluster.
    RotateCa {
        /// Cluster reference (uuid or name).
        cluster: String,
    },
    /// Fetch one cluster.
    ClusterShow {
        /// Cluster reference (uuid or name).
        cluster: String,
    },
    /// List the project's clusters.
    ClusterList,
    /// List node groups of a cluster.
    NodeGroupList {
        /// Cluster reference (uuid or name).
        cluster: String,
    },
    /// Fetch one node group.
    NodeGroupShow {
        /// Cluster reference (uuid or name).
        cluster: String,
        /// Node group name or uuid.
        nodegroup: String,
    },
    /// Create a federation.
    FederationCreate {
        /// Federation uuid chosen by the caller.
        uuid: Uuid,
        /// Declarative federation spec.
        spec: FederationSpec,
    },
    /// Add and remove federation members.
    FederationUpdateMembers {
        /// Federation reference (uuid or name).
        federation: String,
        /// Cluster uuids to add.
        #[serde(default)]
        add: Vec<Uuid>,
        /// Cluster uuids to remove.
        #[serde(default)]
        remove: Vec<Uuid>,
    },
    /// Fetch one federation.
    FederationShow {
        /// Federation reference (uuid or name).
        federation: String,
    },
    /// List the project's federations.
    FederationList,
    /// Delete a federation (not its member clusters).
    FederationDelete {
        /// Federation reference (uuid or name).
        federation: String,
    },
    /// List conductor services with their liveness state.
    ServiceList,
    /// Force a conductor down so its locks become stealable.
    ServiceForceDown {
        /// Conductor host.
        host: String,
        /// Binary name.
        binary: String,
    },
}

impl ConductorRequest {
    /// Wire name of the operation, for logs and metrics.
    pub fn op_name(&self) -> &'static str {
        match self {
            ConductorRequest::ClusterCreate { .. } => "cluster_create",
            ConductorRequest::ClusterUpdate { .. } => "cluster_update",
            ConductorRequest::ClusterResize { .. } => "cluster_resize",
            ConductorRequest::ClusterUpgrade { .. } => "cluster_upgrade",
            ConductorRequest::ClusterDelete { .. } => "cluster_delete",
            ConductorRequest::RotateCa { .. } => "rotate_ca",
            ConductorRequest::ClusterShow { .. } => "cluster_show",
            ConductorRequest::ClusterList => "cluster_list",
            ConductorRequest::NodeGroupList { .. } => "nodegroup_list",
            ConductorRequest::NodeGroupShow { .. } => "nodegroup_show",
            ConductorRequest::FederationCreate { .. } => "federation_create",
            ConductorRequest::FederationUpdateMembers { .. } => "federation_update_members",
            ConductorRequest::FederationShow { .. } => "federation_show",
            ConductorRequest::FederationList => "federation_list",
            ConductorRequest::FederationDelete { .. } => "federation_delete",
            ConductorRequest::ServiceList => "service_list",
            ConductorRequest::ServiceForceDown { .. } => "service_force_down",
        }
    }

    /// True for operations that mutate state and reply `202 Accepted`.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ConductorRequest::ClusterShow { .. }
                | ConductorRequest::ClusterList
                | ConductorRequest::NodeGroupList { .. }
                | ConductorRequest::NodeGroupShow { .. }
                | ConductorRequest::FederationShow { .. }
                | ConductorRequest::FederationList
                | ConductorRequest::ServiceList
        )
    }
}

/// One RPC call: identity plus operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Caller identity and routing metadata.
    pub context: RequestContext,
    /// The operation to perform.
    #[serde(flatten)]
    pub request: ConductorRequest,
}

/// Typed error carried on a failed reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Error taxonomy kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

/// RPC reply: exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    /// Operation result, JSON-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl RpcReply {
    /// Successful reply wrapping a JSON value.
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// Failed reply.
    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(WireError {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// Reply to a liveness probe on a conductor's listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReply {
    /// The probed conductor.
    pub conductor_id: String,
    /// Always true when the listener answered; presence is the signal.
    pub alive: bool,
    /// Extra fields for operator tooling (version, uptime).
    #[serde(default)]
    pub details: HashMap<String, String>,
}
