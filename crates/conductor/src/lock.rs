use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OpError, OpResult};
use crate::persistence::{self as db, locks, ClusterRecord, StealOutcome};
use crate::service_group::ServiceGroup;
use crate::telemetry;

/// Per-cluster advisory lease arbitrating mutation initiation across the
/// conductor fleet.
///
/// The lease has no TTL: the long-running work happens in the IaaS stack,
/// so the lock only needs to serialize who starts it. Stale leases are
/// stolen from owners the service group reports dead; the thief re-reads
/// stack state before issuing new mutations.
#[derive(Clone)]
pub struct ClusterLock {
    db: db::Db,
    service_group: Arc<ServiceGroup>,
    conductor_id: String,
}

impl ClusterLock {
    pub fn new(db: db::Db, service_group: Arc<ServiceGroup>, conductor_id: impl Into<String>) -> Self {
        Self {
            db,
            service_group,
            conductor_id: conductor_id.into(),
        }
    }

    pub fn conductor_id(&self) -> &str {
        &self.conductor_id
    }

    /// Acquire the lease for a mutating operation.
    ///
    /// Fails with `OperationInProgress` when a live conductor holds it,
    /// including this one: a handler that finds its own id in the row
    /// without asking for reentrancy is racing a previous operation that
    /// has not finished.
    pub async fn acquire(&self, cluster: &ClusterRecord) -> OpResult<()> {
        self.acquire_inner(cluster, false).await
    }

    /// Acquire for operations allowed to take over the conductor's own
    /// in-flight work, such as a delete canceling a running create.
    pub async fn acquire_reentrant(&self, cluster: &ClusterRecord) -> OpResult<()> {
        self.acquire_inner(cluster, true).await
    }

    async fn acquire_inner(&self, cluster: &ClusterRecord, reentrant: bool) -> OpResult<()> {
        // One retry: a steal observing *released* means the owner let go
        // between our create and swap, so the fresh create gets one more
        // attempt before we give up and report contention.
        let mut retry = true;

        loop {
            let holder = locks::lock_create(&self.db, cluster.uuid, &self.conductor_id)
                .await
                .map_err(OpError::from)?;

            let holder = match holder {
                None => {
                    telemetry::record_lock_event("acquire");
                    debug!(cluster = %cluster.uuid, "cluster lock acquired");
                    return Ok(());
                }
                Some(holder) => holder,
            };

            if holder == self.conductor_id {
                if reentrant {
                    debug!(cluster = %cluster.uuid, "reusing own cluster lock");
                    return Ok(());
                }
                return Err(OpError::operation_in_progress(&cluster.name));
            }

            if self
                .service_group
                .is_alive(&holder)
                .await
                .map_err(OpError::from)?
            {
                telemetry::record_lock_event("contended");
                return Err(OpError::operation_in_progress(&cluster.name));
            }

            match locks::lock_steal(&self.db, cluster.uuid, &holder, &self.conductor_id)
                .await
                .map_err(OpError::from)?
            {
                StealOutcome::Stolen => {
                    telemetry::record_lock_event("stolen");
                    info!(
                        cluster = %cluster.uuid,
                        previous_owner = %holder,
                        "stole cluster lock from dead conductor"
                    );
                    return Ok(());
                }
                StealOutcome::Released if retry => {
                    retry = false;
                    continue;
                }
                StealOutcome::Released | StealOutcome::Held(_) => {
                    telemetry::record_lock_event("contended");
                    return Err(OpError::operation_in_progress(&cluster.name));
                }
            }
        }
    }

    /// Release the lease. Logs instead of failing: double releases are
    /// expected when a steal and a terminal transition race.
    pub async fn release(&self, cluster_id: Uuid) {
        match locks::lock_release(&self.db, cluster_id, &self.conductor_id).await {
            Ok(true) => {
                telemetry::record_lock_event("release");
                debug!(cluster = %cluster_id, "cluster lock released");
            }
            Ok(false) => {
                warn!(cluster = %cluster_id, "cluster lock was already released");
            }
            Err(err) => {
                warn!(cluster = %cluster_id, ?err, "failed to release cluster lock");
            }
        }
    }

    /// Run `op` holding the lease.
    ///
    /// The lease is released only when `op` fails; on success it stays
    /// held for the poller that finishes the asynchronous work.
    pub async fn scoped<T, F, Fut>(&self, cluster: &ClusterRecord, op: F) -> OpResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OpResult<T>>,
    {
        self.acquire(cluster).await?;
        match op().await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.release(cluster.uuid).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{clusters, migrations, services, NewCluster, NewKeyPair};
    use common::api::ErrorKind;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn test_db() -> db::Db {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("db init");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    async fn seeded_cluster(pool: &db::Db) -> ClusterRecord {
        let uuid = Uuid::new_v4();
        clusters::create_cluster_with_dependents(
            pool,
            NewCluster {
                uuid,
                name: "c1".into(),
                project_id: "p1".into(),
                user_id: "u1".into(),
                template_id: Uuid::new_v4(),
                keypair: None,
                docker_volume_size: None,
                labels: HashMap::new(),
                labels_overridden: HashMap::new(),
                labels_added: HashMap::new(),
                labels_skipped: HashMap::new(),
                flavor_id: None,
                master_flavor_id: None,
                status: db::ClusterStatus::CreateInProgress,
                status_reason: None,
                create_timeout: 60,
            },
            vec![],
            NewKeyPair {
                uuid: Uuid::new_v4(),
                cluster_id: uuid,
                certificate: "cert".into(),
                private_key: "key".into(),
            },
        )
        .await
        .expect("create");

        clusters::get_cluster(pool, uuid)
            .await
            .expect("get")
            .expect("row")
    }

    fn lock_for(pool: &db::Db, me: &str) -> ClusterLock {
        let group = Arc::new(ServiceGroup::new(
            pool.clone(),
            "corral-conductor",
            Duration::from_secs(180),
        ));
        ClusterLock::new(pool.clone(), group, me)
    }

    async fn heartbeat(pool: &db::Db, host: &str) {
        services::upsert_heartbeat(pool, host, "corral-conductor", "http://example:9512")
            .await
            .expect("heartbeat");
    }

    #[tokio::test]
    async fn acquire_succeeds_on_fresh_cluster() {
        let pool = test_db().await;
        let cluster = seeded_cluster(&pool).await;
        let lock = lock_for(&pool, "a");

        lock.acquire(&cluster).await.expect("acquire");
        assert_eq!(
            locks::lock_owner(&pool, cluster.uuid).await.expect("owner"),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn acquire_against_live_holder_reports_in_progress() {
        let pool = test_db().await;
        let cluster = seeded_cluster(&pool).await;
        heartbeat(&pool, "a").await;

        lock_for(&pool, "a").acquire(&cluster).await.expect("acquire");

        let err = lock_for(&pool, "b").acquire(&cluster).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OperationInProgress);
        assert_eq!(
            locks::lock_owner(&pool, cluster.uuid).await.expect("owner"),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn acquire_steals_from_dead_holder() {
        let pool = test_db().await;
        let cluster = seeded_cluster(&pool).await;

        // Holder "a" never heartbeats, so it has no service row and counts
        // as dead.
        lock_for(&pool, "a").acquire(&cluster).await.expect("acquire");
        heartbeat(&pool, "b").await;

        lock_for(&pool, "b").acquire(&cluster).await.expect("steal");
        assert_eq!(
            locks::lock_owner(&pool, cluster.uuid).await.expect("owner"),
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn own_holder_is_contention_unless_reentrant() {
        let pool = test_db().await;
        let cluster = seeded_cluster(&pool).await;
        heartbeat(&pool, "a").await;
        let lock = lock_for(&pool, "a");

        lock.acquire(&cluster).await.expect("acquire");

        let err = lock.acquire(&cluster).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OperationInProgress);

        lock.acquire_reentrant(&cluster).await.expect("reentrant");
        assert_eq!(
            locks::lock_owner(&pool, cluster.uuid).await.expect("owner"),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn release_is_idempotent_and_quiet() {
        let pool = test_db().await;
        let cluster = seeded_cluster(&pool).await;
        let lock = lock_for(&pool, "a");

        lock.acquire(&cluster).await.expect("acquire");
        lock.release(cluster.uuid).await;
        // Second release only logs.
        lock.release(cluster.uuid).await;
        assert_eq!(
            locks::lock_owner(&pool, cluster.uuid).await.expect("owner"),
            None
        );
    }

    #[tokio::test]
    async fn scoped_releases_only_on_error() {
        let pool = test_db().await;
        let cluster = seeded_cluster(&pool).await;
        let lock = lock_for(&pool, "a");

        let err = lock
            .scoped(&cluster, || async { Err::<(), _>(OpError::transient("boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(
            locks::lock_owner(&pool, cluster.uuid).await.expect("owner"),
            None
        );

        lock.scoped(&cluster, || async { Ok(()) })
            .await
            .expect("scoped");
        // Success leaves the lock held for the poller.
        assert_eq!(
            locks::lock_owner(&pool, cluster.uuid).await.expect("owner"),
            Some("a".to_string())
        );
    }
}
