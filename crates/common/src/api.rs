//! Shared API DTOs used across the conductor daemon and API front-ends.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cluster lifecycle status (wire format uses the SCREAMING form).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    /// Stack creation has been issued and is being polled.
    CreateInProgress,
    /// Cluster creation finished and outputs are populated.
    CreateComplete,
    /// Cluster creation failed.
    CreateFailed,
    /// Stack update has been issued and is being polled.
    UpdateInProgress,
    /// Cluster update finished.
    UpdateComplete,
    /// Cluster update failed.
    UpdateFailed,
    /// Stack deletion has been issued and is being polled.
    DeleteInProgress,
    /// Terminal tombstone; the rows are removed once this is observed.
    DeleteComplete,
    /// Cluster deletion failed.
    DeleteFailed,
    /// The stack is rolling back a failed update.
    RollbackInProgress,
    /// Rollback finished; the cluster runs the pre-update revision.
    RollbackComplete,
    /// Rollback failed.
    RollbackFailed,
}

impl ClusterStatus {
    /// Returns the canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            ClusterStatus::CreateComplete => "CREATE_COMPLETE",
            ClusterStatus::CreateFailed => "CREATE_FAILED",
            ClusterStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            ClusterStatus::UpdateComplete => "UPDATE_COMPLETE",
            ClusterStatus::UpdateFailed => "UPDATE_FAILED",
            ClusterStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            ClusterStatus::DeleteComplete => "DELETE_COMPLETE",
            ClusterStatus::DeleteFailed => "DELETE_FAILED",
            ClusterStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            ClusterStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            ClusterStatus::RollbackFailed => "ROLLBACK_FAILED",
        }
    }

    /// True while a poller owns the cluster and drives it forward.
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            ClusterStatus::CreateInProgress
                | ClusterStatus::UpdateInProgress
                | ClusterStatus::DeleteInProgress
                | ClusterStatus::RollbackInProgress
        )
    }

    /// True for the `_COMPLETE` statuses that admit new mutations.
    pub fn complete(&self) -> bool {
        matches!(
            self,
            ClusterStatus::CreateComplete
                | ClusterStatus::UpdateComplete
                | ClusterStatus::RollbackComplete
        )
    }

    /// The failed status for the phase this in-progress status belongs to.
    ///
    /// Returns `self` unchanged for statuses that are already terminal.
    pub fn failed(&self) -> ClusterStatus {
        match self {
            ClusterStatus::CreateInProgress => ClusterStatus::CreateFailed,
            ClusterStatus::UpdateInProgress => ClusterStatus::UpdateFailed,
            ClusterStatus::DeleteInProgress => ClusterStatus::DeleteFailed,
            ClusterStatus::RollbackInProgress => ClusterStatus::RollbackFailed,
            other => *other,
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster health as reported by the (external) health monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// All monitored components respond.
    Healthy,
    /// At least one monitored component is failing.
    Unhealthy,
    /// No health data yet.
    Unknown,
}

impl HealthStatus {
    /// Returns the canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Error taxonomy carried on every RPC reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input violates a documented constraint; the client must fix it.
    InvalidParameter,
    /// Referenced entity does not exist.
    NotFound,
    /// Ambiguous name, duplicate create, or non-lock contention.
    Conflict,
    /// Another mutation holds the cluster lock on a live conductor.
    OperationInProgress,
    /// Quota would be violated.
    ResourceLimitExceeded,
    /// Driver or template does not support the requested transition.
    NotSupported,
    /// Store or stack adapter returned a retryable fault.
    Transient,
    /// Store or adapter violated its contract; the conductor exits.
    Fatal,
}

impl ErrorKind {
    /// Returns the canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::OperationInProgress => "operation_in_progress",
            ErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// API microversion negotiated by the front-end and forwarded on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApiVersion {
    /// Major version.
    pub major: u32,
    /// Minor version (microversion).
    pub minor: u32,
}

impl ApiVersion {
    /// Builds a version from its parts.
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// True when this request speaks at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl From<ApiVersion> for String {
    fn from(value: ApiVersion) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ApiVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (major, minor) = value
            .split_once('.')
            .ok_or_else(|| format!("invalid api version: {value}"))?;
        let major = major
            .parse()
            .map_err(|_| format!("invalid api version: {value}"))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("invalid api version: {value}"))?;
        Ok(Self { major, minor })
    }
}

/// Per-request identity and routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Tenant the request acts on behalf of.
    pub project_id: String,
    /// Calling user.
    pub user_id: String,
    /// Roles granted to the caller; policy evaluation happens upstream.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Correlation id propagated through logs and audit records.
    pub request_id: String,
    /// Negotiated API microversion.
    #[serde(default)]
    pub api_version: ApiVersion,
}

impl RequestContext {
    /// Context for internal work not attributable to a user request.
    pub fn internal(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: "conductor".to_string(),
            roles: Vec::new(),
            request_id: Uuid::new_v4().to_string(),
            api_version: ApiVersion::default(),
        }
    }
}

/// Declarative request to create a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name; unique per project for unambiguous name lookups.
    pub name: String,
    /// Template reference (uuid or name).
    pub template: String,
    /// SSH keypair pushed to the cluster nodes.
    #[serde(default)]
    pub keypair: Option<String>,
    /// Size of the docker volume in GB.
    #[serde(default)]
    pub docker_volume_size: Option<i64>,
    /// Labels merged over the template labels.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    /// Worker flavor override.
    #[serde(default)]
    pub flavor_id: Option<String>,
    /// Master flavor override.
    #[serde(default)]
    pub master_flavor_id: Option<String>,
    /// Number of master nodes; must be odd on quorum drivers.
    #[serde(default)]
    pub master_count: Option<i64>,
    /// Number of worker nodes.
    #[serde(default)]
    pub node_count: Option<i64>,
    /// Stack creation timeout in minutes; 0 means the driver default.
    #[serde(default)]
    pub create_timeout: Option<i64>,
}

/// Patch applied by `cluster_update`. Fields absent from the patch keep
/// their current value; immutable fields present in the patch are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterPatch {
    /// New worker count for the default worker node group.
    #[serde(default)]
    pub node_count: Option<i64>,
    /// Replacement labels for the cluster.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    /// Immutable; rejected when present.
    #[serde(default)]
    pub template_id: Option<String>,
    /// Immutable; rejected when present.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Immutable; rejected when present.
    #[serde(default)]
    pub name: Option<String>,
}

/// Wire shape of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    /// Stable identifier.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Owning tenant.
    pub project_id: String,
    /// Creating user.
    pub user_id: String,
    /// Source template uuid; immutable after create.
    pub template_id: Uuid,
    /// SSH keypair name, if any.
    pub keypair: Option<String>,
    /// Docker volume size in GB, if set.
    pub docker_volume_size: Option<i64>,
    /// Materialized labels (template merged with the spec).
    pub labels: HashMap<String, String>,
    /// Labels the spec overrode with a different value.
    pub labels_overridden: HashMap<String, String>,
    /// Labels the spec added beyond the template.
    pub labels_added: HashMap<String, String>,
    /// Labels the spec repeated with the template's value.
    pub labels_skipped: HashMap<String, String>,
    /// Worker flavor.
    pub flavor_id: Option<String>,
    /// Master flavor.
    pub master_flavor_id: Option<String>,
    /// Opaque handle into the IaaS orchestration engine.
    pub stack_id: Option<String>,
    /// Cluster API endpoint once the stack completes.
    pub api_address: Option<String>,
    /// Master node addresses.
    pub master_addresses: Vec<String>,
    /// Worker node addresses.
    pub node_addresses: Vec<String>,
    /// Lifecycle status.
    pub status: ClusterStatus,
    /// Human-readable reason for the current status.
    pub status_reason: Option<String>,
    /// Health as reported by the health monitor.
    pub health_status: HealthStatus,
    /// Per-component health detail.
    pub health_status_reason: HashMap<String, String>,
    /// Stack creation timeout in minutes.
    pub create_timeout: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Wire shape of a node group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroupView {
    /// Stable identifier.
    pub uuid: Uuid,
    /// Owning cluster.
    pub cluster_id: Uuid,
    /// Group name, unique within the cluster.
    pub name: String,
    /// `master`, `worker`, or a user-defined role.
    pub role: String,
    /// Flavor for nodes in this group.
    pub flavor_id: Option<String>,
    /// Image for nodes in this group.
    pub image_id: Option<String>,
    /// Group labels.
    pub labels: HashMap<String, String>,
    /// Current node count.
    pub node_count: i64,
    /// Lower bound for resize, if set.
    pub min_node_count: Option<i64>,
    /// Upper bound for resize, if set.
    pub max_node_count: Option<i64>,
    /// Default groups are created with the cluster and cannot be deleted.
    pub is_default: bool,
    /// Group status; mirrors the cluster transitions for its stack fragment.
    pub status: ClusterStatus,
}

/// Declarative request to create a federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationSpec {
    /// Federation name; globally unique.
    pub name: String,
    /// Cluster hosting the federation control plane (uuid or name).
    pub hostcluster: String,
    /// Free-form properties; must include `dns_zone_name`.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Wire shape of a federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationView {
    /// Stable identifier.
    pub uuid: Uuid,
    /// Federation name.
    pub name: String,
    /// Owning tenant.
    pub project_id: String,
    /// Host cluster uuid.
    pub hostcluster_id: Uuid,
    /// Member cluster uuids.
    pub member_ids: Vec<Uuid>,
    /// Federation status.
    pub status: ClusterStatus,
    /// Free-form properties, including `dns_zone_name`.
    pub properties: HashMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Liveness listing entry for one conductor process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorServiceView {
    /// Row id.
    pub id: i64,
    /// Conductor host; doubles as the lock owner id.
    pub host: String,
    /// Binary name.
    pub binary: String,
    /// Number of heartbeats written since registration.
    pub report_count: i64,
    /// Administratively disabled.
    pub disabled: bool,
    /// Administratively forced down; overrides timestamps.
    pub forced_down: bool,
    /// Last heartbeat timestamp.
    pub last_seen_up: Option<DateTime<Utc>>,
    /// `up` or `down` per the service group policy.
    pub state: String,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last heartbeat write.
    pub updated_at: DateTime<Utc>,
}
