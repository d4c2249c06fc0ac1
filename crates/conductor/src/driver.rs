use std::collections::HashMap;

use semver::Version;

use crate::error::{OpError, OpResult};
use crate::persistence::{ClusterRecord, NodeGroupRecord, TemplateRecord};
use crate::stack::StackRequest;

/// Container orchestration engines this conductor can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coe {
    Kubernetes,
    Swarm,
    Mesos,
}

impl Coe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coe::Kubernetes => "kubernetes",
            Coe::Swarm => "swarm",
            Coe::Mesos => "mesos",
        }
    }

    pub fn parse(value: &str) -> OpResult<Coe> {
        match value {
            "kubernetes" => Ok(Coe::Kubernetes),
            "swarm" => Ok(Coe::Swarm),
            "mesos" => Ok(Coe::Mesos),
            other => Err(OpError::invalid_parameter(format!(
                "unknown container orchestration engine: {other}"
            ))),
        }
    }
}

/// Stack output keys the poller recognizes for one COE.
#[derive(Debug, Clone, Copy)]
pub struct OutputKeys {
    pub api_address: &'static str,
    pub masters: &'static str,
    pub nodes: &'static str,
}

/// COE-specific behavior: output keys, quorum rules, version labels, and
/// stack parameter assembly. Template rendering proper is delegated to the
/// engine; the driver only shapes the request.
#[derive(Debug, Clone, Copy)]
pub struct Driver {
    pub coe: Coe,
}

impl Driver {
    pub fn for_template(template: &TemplateRecord) -> OpResult<Driver> {
        Ok(Driver {
            coe: Coe::parse(&template.coe)?,
        })
    }

    /// Masters form a consensus ring on these engines, so their count must
    /// be odd.
    pub fn requires_quorum(&self) -> bool {
        matches!(self.coe, Coe::Kubernetes | Coe::Mesos)
    }

    pub fn supports_ca_rotation(&self) -> bool {
        matches!(self.coe, Coe::Kubernetes)
    }

    pub fn output_keys(&self) -> OutputKeys {
        match self.coe {
            Coe::Kubernetes => OutputKeys {
                api_address: "api_address",
                masters: "kube_master",
                nodes: "kube_minions_external",
            },
            Coe::Swarm => OutputKeys {
                api_address: "api_address",
                masters: "swarm_master",
                nodes: "swarm_nodes",
            },
            Coe::Mesos => OutputKeys {
                api_address: "api_address",
                masters: "mesos_master",
                nodes: "mesos_nodes",
            },
        }
    }

    /// Label carrying the COE version in templates and clusters.
    pub fn version_label(&self) -> &'static str {
        match self.coe {
            Coe::Kubernetes => "kube_tag",
            Coe::Swarm => "swarm_version",
            Coe::Mesos => "mesos_version",
        }
    }

    /// Check that `new_labels` carries a strictly newer COE version than
    /// `current_labels`. Downgrades and sidegrades are refused.
    pub fn check_upgrade(
        &self,
        current_labels: &HashMap<String, String>,
        new_labels: &HashMap<String, String>,
    ) -> OpResult<()> {
        let label = self.version_label();
        let current = parse_version(current_labels.get(label), label)?;
        let new = parse_version(new_labels.get(label), label)?;

        if new <= current {
            return Err(OpError::not_supported(format!(
                "downgrade is not supported: {label} {new} does not upgrade {current}"
            )));
        }

        Ok(())
    }

    /// Assemble the stack request for a cluster. The engine renders the
    /// actual resources from the template text; the conductor only carries
    /// the declarative inputs across.
    pub fn stack_request(
        &self,
        cluster: &ClusterRecord,
        template: &TemplateRecord,
        nodegroups: &[NodeGroupRecord],
    ) -> StackRequest {
        let mut parameters = HashMap::from([
            ("cluster_uuid".to_string(), cluster.uuid.to_string()),
            ("coe".to_string(), self.coe.as_str().to_string()),
            (
                "create_timeout".to_string(),
                cluster.create_timeout.to_string(),
            ),
        ]);

        if let Some(keypair) = &cluster.keypair {
            parameters.insert("ssh_key_name".to_string(), keypair.clone());
        }
        if let Some(size) = cluster.docker_volume_size {
            parameters.insert("docker_volume_size".to_string(), size.to_string());
        }
        if let Some(image) = &template.image_id {
            parameters.insert("image_id".to_string(), image.clone());
        }
        for group in nodegroups {
            let prefix = match group.role.as_str() {
                "master" => "master",
                _ => "node",
            };
            parameters.insert(format!("{prefix}_count"), group.node_count.to_string());
            if let Some(flavor) = &group.flavor_id {
                parameters.insert(format!("{prefix}_flavor"), flavor.clone());
            }
        }
        for (key, value) in cluster.labels() {
            parameters.insert(format!("label_{key}"), value);
        }

        StackRequest {
            name: format!("{}-{}", cluster.name, &cluster.uuid.to_string()[..8]),
            parameters,
            template_text: format!("# {} cluster stack\n", self.coe.as_str()),
            files: HashMap::new(),
        }
    }
}

fn parse_version(raw: Option<&String>, label: &str) -> OpResult<Version> {
    let raw = raw.ok_or_else(|| {
        OpError::not_supported(format!("template does not carry a {label} label"))
    })?;
    Version::parse(raw.trim_start_matches('v'))
        .map_err(|_| OpError::invalid_parameter(format!("invalid {label} value: {raw}")))
}
