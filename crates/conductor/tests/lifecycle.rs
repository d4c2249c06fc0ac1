//! End-to-end lifecycle scenarios driven through the conductor services,
//! with the in-memory engine standing in for the IaaS.

mod support;

use std::sync::Arc;
use std::time::Duration;

use common::api::{ClusterStatus, ErrorKind};
use uuid::Uuid;

use conductor::persistence::{clusters, locks, nodegroups, quotas};
use conductor::services::clusters as cluster_svc;
use conductor::stack::InMemoryStackEngine;

use support::*;

#[tokio::test]
async fn happy_path_create_populates_outputs_and_drops_lock() {
    let pool = fresh_db().await;
    let engine = Arc::new(InMemoryStackEngine::new());
    engine.set_default_outputs(kube_outputs()).await;
    let conductor = conductor_on(&pool, &engine, "c-a").await;
    heartbeat(&pool, "c-a").await;

    seed_template(&pool, "p1", "t1", "kubernetes", "v1.14.7").await;
    let uuid = Uuid::new_v4();
    let accepted = cluster_svc::cluster_create(
        &conductor.state,
        &ctx("p1"),
        uuid,
        cluster_spec("c_ok", "t1"),
    )
    .await
    .expect("create accepted");

    assert_eq!(accepted.cluster.status, ClusterStatus::CreateInProgress);
    assert_eq!(engine.create_calls().await, 1);
    assert_eq!(
        locks::lock_owner(&pool, uuid).await.expect("owner"),
        Some("c-a".to_string())
    );

    let record = wait_for_status(&pool, uuid, ClusterStatus::CreateComplete, Duration::from_secs(5))
        .await;
    assert_eq!(record.api_address.as_deref(), Some("10.0.0.1"));
    assert_eq!(
        record.master_addresses.as_ref().map(|j| j.0.clone()),
        Some(vec!["10.0.0.2".to_string()])
    );
    assert_eq!(
        record.node_addresses.as_ref().map(|j| j.0.len()),
        Some(3)
    );
    assert_eq!(locks::lock_owner(&pool, uuid).await.expect("owner"), None);

    // Default master and worker groups came up with the cluster.
    let groups = nodegroups::list_nodegroups(&pool, uuid).await.expect("groups");
    assert_eq!(groups.len(), 2);
    let worker = nodegroups::default_worker(&pool, uuid).await.expect("worker");
    assert_eq!(worker.node_count, 3);
}

#[tokio::test]
async fn quota_breach_rejects_before_any_stack_call() {
    let pool = fresh_db().await;
    let engine = Arc::new(InMemoryStackEngine::new());
    engine.set_default_outputs(kube_outputs()).await;
    let conductor = conductor_on(&pool, &engine, "c-a").await;
    heartbeat(&pool, "c-a").await;

    seed_template(&pool, "p1", "t1", "kubernetes", "v1.14.7").await;
    quotas::set_quota(&pool, "p1", "Cluster", 1).await.expect("quota");

    let first = Uuid::new_v4();
    cluster_svc::cluster_create(&conductor.state, &ctx("p1"), first, cluster_spec("c1", "t1"))
        .await
        .expect("first create");
    wait_for_status(&pool, first, ClusterStatus::CreateComplete, Duration::from_secs(5)).await;

    let second = Uuid::new_v4();
    let err = cluster_svc::cluster_create(
        &conductor.state,
        &ctx("p1"),
        second,
        cluster_spec("c2", "t1"),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ResourceLimitExceeded);
    assert_eq!(engine.create_calls().await, 1, "no stack call for the rejected create");
    assert!(clusters::get_cluster(&pool, second).await.expect("get").is_none());
    assert_eq!(locks::lock_owner(&pool, second).await.expect("owner"), None);
}

#[tokio::test]
async fn concurrent_creates_for_one_cluster_produce_one_winner() {
    let pool = fresh_db().await;
    let engine = Arc::new(InMemoryStackEngine::new());
    // Keep the stack in progress so the winner holds the lock throughout.
    engine.set_auto_settle(false).await;

    let a = conductor_on(&pool, &engine, "c-a").await;
    let b = conductor_on(&pool, &engine, "c-b").await;
    heartbeat(&pool, "c-a").await;
    heartbeat(&pool, "c-b").await;

    seed_template(&pool, "p1", "t1", "kubernetes", "v1.14.7").await;
    let uuid = Uuid::new_v4();

    let ctx_a = ctx("p1");
    let ctx_b = ctx("p1");
    let (from_a, from_b) = tokio::join!(
        cluster_svc::cluster_create(&a.state, &ctx_a, uuid, cluster_spec("c_race", "t1")),
        cluster_svc::cluster_create(&b.state, &ctx_b, uuid, cluster_spec("c_race", "t1")),
    );

    let winners = [from_a.is_ok(), from_b.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(winners, 1, "exactly one create must win");

    let loser_err = match (from_a, from_b) {
        (Err(err), Ok(_)) | (Ok(_), Err(err)) => err,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(loser_err.kind, ErrorKind::OperationInProgress);
    assert_eq!(engine.create_calls().await, 1, "exactly one create_stack");

    let owner = locks::lock_owner(&pool, uuid).await.expect("owner");
    assert!(
        owner.as_deref() == Some("c-a") || owner.as_deref() == Some("c-b"),
        "winner holds the lock"
    );
}

#[tokio::test]
async fn delete_steals_the_lock_from_a_dead_conductor() {
    let pool = fresh_db().await;
    let engine = Arc::new(InMemoryStackEngine::new());
    engine.set_auto_settle(false).await;

    // Conductor A never heartbeats: to the service group it is dead.
    let a = conductor_on(&pool, &engine, "c-a").await;
    let b = conductor_on(&pool, &engine, "c-b").await;
    heartbeat(&pool, "c-b").await;

    seed_template(&pool, "p1", "t1", "kubernetes", "v1.14.7").await;
    let uuid = Uuid::new_v4();
    cluster_svc::cluster_create(&a.state, &ctx("p1"), uuid, cluster_spec("c_dead", "t1"))
        .await
        .expect("create on dying conductor");
    assert_eq!(
        locks::lock_owner(&pool, uuid).await.expect("owner"),
        Some("c-a".to_string())
    );

    cluster_svc::cluster_delete(&b.state, &ctx("p1"), &uuid.to_string())
        .await
        .expect("delete steals the lock");
    assert_eq!(
        locks::lock_owner(&pool, uuid).await.expect("owner"),
        Some("c-b".to_string())
    );
    assert_eq!(engine.delete_calls().await, 1);

    // Let the engine finish the delete; B's poller removes everything.
    engine.set_auto_settle(true).await;
    wait_for_gone(&pool, uuid, Duration::from_secs(5)).await;
    assert_eq!(locks::lock_owner(&pool, uuid).await.expect("owner"), None);
}

#[tokio::test]
async fn delete_cancels_this_conductors_own_create() {
    let pool = fresh_db().await;
    let engine = Arc::new(InMemoryStackEngine::new());
    engine.set_auto_settle(false).await;
    let conductor = conductor_on(&pool, &engine, "c-a").await;
    heartbeat(&pool, "c-a").await;

    seed_template(&pool, "p1", "t1", "kubernetes", "v1.14.7").await;
    let uuid = Uuid::new_v4();
    cluster_svc::cluster_create(&conductor.state, &ctx("p1"), uuid, cluster_spec("c_cancel", "t1"))
        .await
        .expect("create");

    // The same conductor reuses its own lease to cancel the create.
    cluster_svc::cluster_delete(&conductor.state, &ctx("p1"), &uuid.to_string())
        .await
        .expect("delete while create in progress");

    engine.set_auto_settle(true).await;
    wait_for_gone(&pool, uuid, Duration::from_secs(5)).await;
    assert_eq!(locks::lock_owner(&pool, uuid).await.expect("owner"), None);
}

#[tokio::test]
async fn resize_to_zero_is_gated_on_api_version() {
    let pool = fresh_db().await;
    let engine = Arc::new(InMemoryStackEngine::new());
    engine.set_default_outputs(kube_outputs()).await;
    let conductor = conductor_on(&pool, &engine, "c-a").await;
    heartbeat(&pool, "c-a").await;

    seed_template(&pool, "p1", "t1", "kubernetes", "v1.14.7").await;
    let uuid = Uuid::new_v4();
    cluster_svc::cluster_create(&conductor.state, &ctx("p1"), uuid, cluster_spec("c_rsz", "t1"))
        .await
        .expect("create");
    wait_for_status(&pool, uuid, ClusterStatus::CreateComplete, Duration::from_secs(5)).await;

    let err = cluster_svc::cluster_resize(
        &conductor.state,
        &ctx_with_version("p1", 1, 9),
        &uuid.to_string(),
        0,
        Vec::new(),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParameter);

    cluster_svc::cluster_resize(
        &conductor.state,
        &ctx_with_version("p1", 1, 10),
        &uuid.to_string(),
        0,
        Vec::new(),
        None,
    )
    .await
    .expect("resize to zero on 1.10");

    wait_for_status(&pool, uuid, ClusterStatus::UpdateComplete, Duration::from_secs(5)).await;
    let worker = nodegroups::default_worker(&pool, uuid).await.expect("worker");
    assert_eq!(worker.node_count, 0);
}

#[tokio::test]
async fn downgrade_is_refused_without_touching_the_stack() {
    let pool = fresh_db().await;
    let engine = Arc::new(InMemoryStackEngine::new());
    engine.set_default_outputs(kube_outputs()).await;
    let conductor = conductor_on(&pool, &engine, "c-a").await;
    heartbeat(&pool, "c-a").await;

    seed_template(&pool, "p1", "t1", "kubernetes", "v1.14.7").await;
    seed_template(&pool, "p1", "t-old", "kubernetes", "v1.14.3").await;

    let uuid = Uuid::new_v4();
    cluster_svc::cluster_create(&conductor.state, &ctx("p1"), uuid, cluster_spec("c_up", "t1"))
        .await
        .expect("create");
    wait_for_status(&pool, uuid, ClusterStatus::CreateComplete, Duration::from_secs(5)).await;

    let err = cluster_svc::cluster_upgrade(&conductor.state, &ctx("p1"), &uuid.to_string(), "t-old")
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotSupported);
    assert_eq!(engine.update_calls().await, 0, "no stack call for a refused upgrade");

    let record = clusters::get_cluster(&pool, uuid).await.expect("get").expect("row");
    assert_eq!(record.status.to_wire(), ClusterStatus::CreateComplete);
}
