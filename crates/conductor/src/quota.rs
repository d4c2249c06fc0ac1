use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{OpError, OpResult};
use crate::persistence::{self as db, clusters, quotas};
use crate::telemetry;

/// Resource name counted against the per-project cluster quota.
pub const RESOURCE_CLUSTER: &str = "Cluster";

/// Per-(project, resource) admission guard.
///
/// Usage is derived by counting live rows, so the guard has no counters to
/// corrupt: it only has to serialize the count with the insert (or delete)
/// it admits. Serialization is a process-local async mutex per pair; cross
/// conductor races are acceptable for quotas the same way they are in the
/// source system, because admission happens on whichever conductor fields
/// the create.
#[derive(Clone)]
pub struct QuotaGuard {
    db: db::Db,
    default_max_clusters: i64,
    keys: Arc<Mutex<HashMap<(String, String), Arc<Mutex<()>>>>>,
}

impl QuotaGuard {
    pub fn new(db: db::Db, default_max_clusters: i64) -> Self {
        Self {
            db,
            default_max_clusters,
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn pair_lock(&self, project_id: &str, resource: &str) -> Arc<Mutex<()>> {
        let mut keys = self.keys.lock().await;
        keys.entry((project_id.to_string(), resource.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn hard_limit(&self, project_id: &str, resource: &str) -> OpResult<i64> {
        let configured = quotas::get_hard_limit(&self.db, project_id, resource)
            .await
            .map_err(OpError::from)?;
        Ok(configured.unwrap_or(self.default_max_clusters))
    }

    async fn live_count(&self, project_id: &str, resource: &str) -> OpResult<i64> {
        match resource {
            RESOURCE_CLUSTER => clusters::count_clusters(&self.db, project_id)
                .await
                .map_err(OpError::from),
            other => Err(OpError::invalid_parameter(format!(
                "unknown quota resource {other}"
            ))),
        }
    }

    /// Admit `delta` new entities and run the insert while the pair is
    /// serialized. The insert never runs when admission fails, and the
    /// count can never go stale under the insert because both happen under
    /// the same pair mutex.
    pub async fn admit_and<T, F, Fut>(
        &self,
        project_id: &str,
        resource: &str,
        delta: i64,
        insert: F,
    ) -> OpResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let pair = self.pair_lock(project_id, resource).await;
        let _guard = pair.lock().await;

        let hard_limit = self.hard_limit(project_id, resource).await?;
        let count = self.live_count(project_id, resource).await?;

        if count + delta > hard_limit {
            telemetry::record_quota_rejection(resource);
            return Err(OpError::resource_limit_exceeded(format!(
                "{resource} quota exceeded for project {project_id}: \
                 {count} used of {hard_limit} allowed"
            )));
        }

        debug!(
            project_id,
            resource, count, hard_limit, delta, "quota admission granted"
        );
        insert().await.map_err(OpError::from)
    }

    /// Run a deleting operation under the same pair serialization, so a
    /// concurrent admission cannot count a row that is mid-delete.
    pub async fn release_with<T, F, Fut>(
        &self,
        project_id: &str,
        resource: &str,
        delete: F,
    ) -> OpResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let pair = self.pair_lock(project_id, resource).await;
        let _guard = pair.lock().await;
        delete().await.map_err(OpError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{migrations, ClusterStatus, NewCluster, NewKeyPair};
    use common::api::ErrorKind;
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    async fn test_db() -> db::Db {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("db init");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    async fn insert_cluster(pool: &db::Db, project: &str, name: &str) -> anyhow::Result<bool> {
        let uuid = Uuid::new_v4();
        clusters::create_cluster_with_dependents(
            pool,
            NewCluster {
                uuid,
                name: name.into(),
                project_id: project.into(),
                user_id: "u1".into(),
                template_id: Uuid::new_v4(),
                keypair: None,
                docker_volume_size: None,
                labels: StdHashMap::new(),
                labels_overridden: StdHashMap::new(),
                labels_added: StdHashMap::new(),
                labels_skipped: StdHashMap::new(),
                flavor_id: None,
                master_flavor_id: None,
                status: ClusterStatus::CreateInProgress,
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
    }

    #[tokio::test]
    async fn admission_enforces_the_default_limit() {
        let pool = test_db().await;
        let guard = QuotaGuard::new(pool.clone(), 1);

        guard
            .admit_and("p1", RESOURCE_CLUSTER, 1, || insert_cluster(&pool, "p1", "c1"))
            .await
            .expect("first create");

        let err = guard
            .admit_and("p1", RESOURCE_CLUSTER, 1, || insert_cluster(&pool, "p1", "c2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceLimitExceeded);
        assert_eq!(clusters::count_clusters(&pool, "p1").await.expect("count"), 1);

        // Another project is unaffected.
        guard
            .admit_and("p2", RESOURCE_CLUSTER, 1, || insert_cluster(&pool, "p2", "c1"))
            .await
            .expect("other project");
    }

    #[tokio::test]
    async fn quota_row_overrides_the_default() {
        let pool = test_db().await;
        quotas::set_quota(&pool, "p1", RESOURCE_CLUSTER, 3)
            .await
            .expect("set quota");
        let guard = QuotaGuard::new(pool.clone(), 1);

        for i in 0..3 {
            let name = format!("c{i}");
            guard
                .admit_and("p1", RESOURCE_CLUSTER, 1, || {
                    insert_cluster(&pool, "p1", &name)
                })
                .await
                .expect("create under raised quota");
        }

        let err = guard
            .admit_and("p1", RESOURCE_CLUSTER, 1, || insert_cluster(&pool, "p1", "c4"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceLimitExceeded);
    }

    #[tokio::test]
    async fn failed_insert_does_not_consume_quota() {
        let pool = test_db().await;
        let guard = QuotaGuard::new(pool.clone(), 1);

        let err = guard
            .admit_and::<bool, _, _>("p1", RESOURCE_CLUSTER, 1, || async {
                anyhow::bail!("insert blew up")
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);

        // The slot is still free.
        guard
            .admit_and("p1", RESOURCE_CLUSTER, 1, || insert_cluster(&pool, "p1", "c1"))
            .await
            .expect("create after failed insert");
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected() {
        let pool = test_db().await;
        let guard = QuotaGuard::new(pool.clone(), 1);

        let err = guard
            .admit_and("p1", "Widget", 1, || async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }
}
