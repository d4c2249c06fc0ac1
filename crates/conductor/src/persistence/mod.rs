use sqlx::SqlitePool;

pub mod certificates;
pub mod clusters;
pub mod federations;
pub mod locks;
pub mod migrations;
pub mod nodegroups;
pub mod quotas;
pub mod services;
pub mod templates;

pub type Db = SqlitePool;

pub use certificates::{KeyPairRecord, NewKeyPair};
pub use clusters::{ClusterRecord, ClusterStatus, HealthStatus, NewCluster, StackOutputsUpdate};
pub use federations::{FederationRecord, NewFederation};
pub use locks::StealOutcome;
pub use nodegroups::{NewNodeGroup, NodeGroupRecord};
pub use quotas::QuotaRecord;
pub use services::ServiceRecord;
pub use templates::{NewTemplate, TemplateRecord};
