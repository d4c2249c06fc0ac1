use std::collections::HashMap;

use common::api::ClusterSpec;

use crate::config::LimitsConfig;
use crate::driver::Driver;
use crate::error::{OpError, OpResult};
use crate::persistence::TemplateRecord;
use crate::stack::StackRequest;

pub const MAX_CLUSTER_NAME_LEN: usize = 242;

/// Cluster names: start with a letter, then letters, digits, `.`, `_`,
/// `-`; at most 242 characters.
pub fn validate_cluster_name(name: &str) -> OpResult<()> {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return Err(OpError::invalid_parameter("cluster name cannot be empty"));
    };
    if !first.is_ascii_alphabetic() {
        return Err(OpError::invalid_parameter(
            "cluster name must start with a letter",
        ));
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(OpError::invalid_parameter(format!(
            "cluster name exceeds {MAX_CLUSTER_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = chars.find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-')) {
        return Err(OpError::invalid_parameter(format!(
            "cluster name contains invalid character {bad:?}"
        )));
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err(OpError::invalid_parameter(
            "cluster name cannot be purely numeric",
        ));
    }

    Ok(())
}

pub fn validate_node_count(node_count: i64) -> OpResult<()> {
    if node_count < 0 {
        return Err(OpError::invalid_parameter("node_count cannot be negative"));
    }
    Ok(())
}

/// Masters on quorum drivers form a consensus ring; even counts cannot
/// elect a stable leader and are rejected.
pub fn validate_master_count(master_count: i64, driver: &Driver) -> OpResult<()> {
    if master_count < 1 {
        return Err(OpError::invalid_parameter("master_count must be at least 1"));
    }
    if driver.requires_quorum() && master_count % 2 == 0 {
        return Err(OpError::invalid_parameter(format!(
            "master_count must be odd on {} clusters",
            driver.coe.as_str()
        )));
    }
    Ok(())
}

pub fn validate_docker_volume_size(size: i64, storage_driver: Option<&str>) -> OpResult<()> {
    if size < 1 {
        return Err(OpError::invalid_parameter(
            "docker_volume_size must be a positive integer",
        ));
    }
    if storage_driver == Some("devicemapper") && size < 3 {
        return Err(OpError::invalid_parameter(
            "docker_volume_size must be at least 3 GB with the devicemapper storage driver",
        ));
    }
    Ok(())
}

pub fn validate_create_timeout(timeout: i64) -> OpResult<()> {
    if timeout < 0 {
        return Err(OpError::invalid_parameter("create_timeout cannot be negative"));
    }
    Ok(())
}

pub fn validate_labels(
    labels: &HashMap<String, String>,
    limits: &LimitsConfig,
) -> OpResult<()> {
    for (key, value) in labels {
        if key.trim().is_empty() {
            return Err(OpError::invalid_parameter("label keys cannot be empty"));
        }
        if key.len() > limits.max_field_len || value.len() > limits.max_field_len {
            return Err(OpError::invalid_parameter(format!(
                "label {key} exceeds {} characters",
                limits.max_field_len
            )));
        }
    }
    Ok(())
}

/// Validate the full create spec against the resolved template.
pub fn validate_cluster_spec(
    spec: &ClusterSpec,
    template: &TemplateRecord,
    driver: &Driver,
    limits: &LimitsConfig,
) -> OpResult<()> {
    validate_cluster_name(&spec.name)?;
    validate_node_count(spec.node_count.unwrap_or(1))?;
    validate_master_count(spec.master_count.unwrap_or(1), driver)?;
    validate_create_timeout(spec.create_timeout.unwrap_or(0))?;

    let volume_size = spec.docker_volume_size.or(template.docker_volume_size);
    if let Some(size) = volume_size {
        validate_docker_volume_size(size, template.docker_storage_driver.as_deref())?;
    }
    if let Some(labels) = &spec.labels {
        validate_labels(labels, limits)?;
    }

    Ok(())
}

/// Bound the rendered stack payload before it leaves the conductor.
pub fn validate_manifest_size(request: &StackRequest, limits: &LimitsConfig) -> OpResult<()> {
    let total = request.template_text.len()
        + request
            .files
            .values()
            .map(String::len)
            .sum::<usize>();

    if total as u64 > limits.max_manifest_size_bytes {
        return Err(OpError::invalid_parameter(format!(
            "rendered stack manifest of {total} bytes exceeds the {} byte limit",
            limits.max_manifest_size_bytes
        )));
    }
    Ok(())
}

/// Materialized label merge: template labels as the base, spec labels on
/// top, with the diffing triple the API uses to answer "what changed".
#[derive(Debug, Clone, Default)]
pub struct MergedLabels {
    pub labels: HashMap<String, String>,
    pub overridden: HashMap<String, String>,
    pub added: HashMap<String, String>,
    pub skipped: HashMap<String, String>,
}

pub fn merge_labels(
    template_labels: &HashMap<String, String>,
    spec_labels: Option<&HashMap<String, String>>,
) -> MergedLabels {
    let mut merged = MergedLabels {
        labels: template_labels.clone(),
        ..Default::default()
    };

    let Some(spec_labels) = spec_labels else {
        return merged;
    };

    for (key, value) in spec_labels {
        match template_labels.get(key) {
            Some(existing) if existing == value => {
                merged.skipped.insert(key.clone(), value.clone());
            }
            Some(_) => {
                merged.overridden.insert(key.clone(), value.clone());
            }
            None => {
                merged.added.insert(key.clone(), value.clone());
            }
        }
        merged.labels.insert(key.clone(), value.clone());
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Coe;
    use common::api::ErrorKind;

    #[test]
    fn names_follow_the_documented_pattern() {
        assert!(validate_cluster_name("c-ok.1_a").is_ok());
        assert!(validate_cluster_name("C").is_ok());

        for bad in ["", "1abc", "-abc", "a b", "a/b", &"a".repeat(243)] {
            let err = validate_cluster_name(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidParameter, "name {bad:?}");
        }
    }

    #[test]
    fn master_count_must_be_odd_on_quorum_drivers() {
        let kube = Driver { coe: Coe::Kubernetes };
        let swarm = Driver { coe: Coe::Swarm };

        assert!(validate_master_count(1, &kube).is_ok());
        assert!(validate_master_count(3, &kube).is_ok());
        assert!(validate_master_count(2, &kube).is_err());
        assert!(validate_master_count(0, &kube).is_err());
        // Swarm has no consensus ring; even counts pass.
        assert!(validate_master_count(2, &swarm).is_ok());
    }

    #[test]
    fn devicemapper_needs_three_gigabytes() {
        assert!(validate_docker_volume_size(1, None).is_ok());
        assert!(validate_docker_volume_size(0, None).is_err());
        assert!(validate_docker_volume_size(2, Some("devicemapper")).is_err());
        assert!(validate_docker_volume_size(3, Some("devicemapper")).is_ok());
        assert!(validate_docker_volume_size(2, Some("overlay2")).is_ok());
    }

    #[test]
    fn merge_labels_materializes_the_diff_triple() {
        let template = HashMap::from([
            ("kube_tag".to_string(), "v1.14.7".to_string()),
            ("flannel_tag".to_string(), "v0.11".to_string()),
        ]);
        let spec = HashMap::from([
            ("kube_tag".to_string(), "v1.15.0".to_string()),
            ("flannel_tag".to_string(), "v0.11".to_string()),
            ("extra".to_string(), "yes".to_string()),
        ]);

        let merged = merge_labels(&template, Some(&spec));
        assert_eq!(merged.labels.len(), 3);
        assert_eq!(
            merged.labels.get("kube_tag").map(String::as_str),
            Some("v1.15.0")
        );
        assert_eq!(merged.overridden.len(), 1);
        assert!(merged.overridden.contains_key("kube_tag"));
        assert_eq!(merged.skipped.len(), 1);
        assert!(merged.skipped.contains_key("flannel_tag"));
        assert_eq!(merged.added.len(), 1);
        assert!(merged.added.contains_key("extra"));
    }

    #[test]
    fn manifest_size_is_bounded() {
        let limits = LimitsConfig {
            max_manifest_size_bytes: 16,
            max_field_len: 255,
        };
        let mut request = StackRequest {
            name: "c1".into(),
            parameters: HashMap::new(),
            template_text: "tiny".into(),
            files: HashMap::new(),
        };
        assert!(validate_manifest_size(&request, &limits).is_ok());

        request.files.insert("big".into(), "x".repeat(32));
        let err = validate_manifest_size(&request, &limits).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }
}
