//! Shared fixtures for the conductor integration suite.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::api::{ApiVersion, ClusterSpec, RequestContext};
use tokio::sync::watch;
use uuid::Uuid;

use conductor::app_state::{AppState, PacingSet, BINARY_NAME};
use conductor::ca::InsecureDevCa;
use conductor::config::LimitsConfig;
use conductor::lock::ClusterLock;
use conductor::persistence::{self as db, clusters, migrations, services, templates};
use conductor::quota::QuotaGuard;
use conductor::service_group::ServiceGroup;
use conductor::stack::InMemoryStackEngine;

/// One simulated conductor process. The shutdown sender must outlive the
/// harness or every spawned poller exits immediately.
pub struct Conductor {
    pub state: AppState,
    pub engine: Arc<InMemoryStackEngine>,
    _shutdown_tx: watch::Sender<bool>,
}

pub async fn fresh_db() -> db::Db {
    let pool = migrations::init_pool("sqlite::memory:")
        .await
        .expect("db init");
    migrations::run_migrations(&pool).await.expect("migrations");
    pool
}

pub async fn conductor_on(pool: &db::Db, engine: &Arc<InMemoryStackEngine>, id: &str) -> Conductor {
    conductor_with_pacing(pool, engine, id, PacingSet::uniform(Duration::from_millis(10), 300)).await
}

pub async fn conductor_with_pacing(
    pool: &db::Db,
    engine: &Arc<InMemoryStackEngine>,
    id: &str,
    pacing: PacingSet,
) -> Conductor {
    let service_group = Arc::new(ServiceGroup::new(
        pool.clone(),
        BINARY_NAME,
        Duration::from_secs(180),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState {
        db: pool.clone(),
        conductor_id: id.to_string(),
        endpoint: format!("http://{id}:9512"),
        topic: "conductor".to_string(),
        lock: ClusterLock::new(pool.clone(), service_group.clone(), id),
        quotas: QuotaGuard::new(pool.clone(), 20),
        stack: engine.clone(),
        ca: Arc::new(InsecureDevCa),
        service_group,
        pacing,
        limits: LimitsConfig {
            max_manifest_size_bytes: 512 * 1024,
            max_field_len: 255,
        },
        shutdown_rx,
        metrics_handle: None,
    };

    Conductor {
        state,
        engine: engine.clone(),
        _shutdown_tx: shutdown_tx,
    }
}

pub async fn heartbeat(pool: &db::Db, id: &str) {
    services::upsert_heartbeat(pool, id, BINARY_NAME, &format!("http://{id}:9512"))
        .await
        .expect("heartbeat");
}

pub fn ctx(project: &str) -> RequestContext {
    ctx_with_version(project, 1, 10)
}

pub fn ctx_with_version(project: &str, major: u32, minor: u32) -> RequestContext {
    RequestContext {
        project_id: project.to_string(),
        user_id: "u1".to_string(),
        roles: vec!["member".to_string()],
        request_id: Uuid::new_v4().to_string(),
        api_version: ApiVersion::new(major, minor),
    }
}

pub async fn seed_template(
    pool: &db::Db,
    project: &str,
    name: &str,
    coe: &str,
    version: &str,
) -> db::TemplateRecord {
    let version_label = match coe {
        "kubernetes" => "kube_tag",
        "swarm" => "swarm_version",
        _ => "mesos_version",
    };
    templates::create_template(
        pool,
        db::NewTemplate {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            project_id: project.to_string(),
            coe: coe.to_string(),
            image_id: Some("fedora-coreos-35".to_string()),
            flavor_id: Some("m1.small".to_string()),
            master_flavor_id: Some("m1.medium".to_string()),
            keypair_id: None,
            docker_volume_size: Some(10),
            docker_storage_driver: None,
            labels: HashMap::from([(version_label.to_string(), version.to_string())]),
        },
    )
    .await
    .expect("seed template")
}

pub fn cluster_spec(name: &str, template: &str) -> ClusterSpec {
    ClusterSpec {
        name: name.to_string(),
        template: template.to_string(),
        keypair: Some("default".to_string()),
        docker_volume_size: None,
        labels: None,
        flavor_id: None,
        master_flavor_id: None,
        master_count: Some(1),
        node_count: Some(3),
        create_timeout: Some(60),
    }
}

pub fn kube_outputs() -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("api_address".to_string(), serde_json::json!("10.0.0.1")),
        ("kube_master".to_string(), serde_json::json!("10.0.0.2")),
        (
            "kube_minions_external".to_string(),
            serde_json::json!(["10.0.0.3", "10.0.0.4", "10.0.0.5"]),
        ),
    ])
}

/// Poll until the cluster reaches `expected` or the deadline passes.
pub async fn wait_for_status(
    pool: &db::Db,
    uuid: Uuid,
    expected: common::api::ClusterStatus,
    deadline: Duration,
) -> db::ClusterRecord {
    let start = std::time::Instant::now();
    loop {
        if let Some(record) = clusters::get_cluster(pool, uuid).await.expect("get cluster") {
            if record.status.to_wire() == expected {
                return record;
            }
            if start.elapsed() > deadline {
                panic!(
                    "cluster {uuid} stuck in {} waiting for {expected}",
                    record.status.to_wire()
                );
            }
        } else if start.elapsed() > deadline {
            panic!("cluster {uuid} disappeared waiting for {expected}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the cluster row is hard-deleted.
pub async fn wait_for_gone(pool: &db::Db, uuid: Uuid, deadline: Duration) {
    let start = std::time::Instant::now();
    loop {
        if clusters::get_cluster(pool, uuid)
            .await
            .expect("get cluster")
            .is_none()
        {
            return;
        }
        if start.elapsed() > deadline {
            panic!("cluster {uuid} still present past the deadline");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
