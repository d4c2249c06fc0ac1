use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;

use crate::ca::CertAuthority;
use crate::config::{AppConfig, DriversConfig, LimitsConfig};
use crate::driver::Coe;
use crate::lock::ClusterLock;
use crate::persistence;
use crate::quota::QuotaGuard;
use crate::service_group::ServiceGroup;
use crate::stack::StackAdapter;

/// Binary name written into the service registry; part of the liveness key.
pub const BINARY_NAME: &str = "corral-conductor";

/// Poller pacing resolved to concrete durations.
#[derive(Debug, Clone, Copy)]
pub struct PollerPacing {
    pub wait_interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PacingSet {
    pub kubernetes: PollerPacing,
    pub swarm: PollerPacing,
    pub mesos: PollerPacing,
}

impl PacingSet {
    pub fn from_config(drivers: &DriversConfig) -> Self {
        let convert = |p: crate::config::DriverPacing| PollerPacing {
            wait_interval: p.wait_interval(),
            max_attempts: p.max_attempts,
        };
        Self {
            kubernetes: convert(drivers.kubernetes),
            swarm: convert(drivers.swarm),
            mesos: convert(drivers.mesos),
        }
    }

    /// Uniform pacing, used by tests that want millisecond ticks.
    pub fn uniform(wait_interval: Duration, max_attempts: u32) -> Self {
        let pacing = PollerPacing {
            wait_interval,
            max_attempts,
        };
        Self {
            kubernetes: pacing,
            swarm: pacing,
            mesos: pacing,
        }
    }

    pub fn for_coe(&self, coe: Coe) -> PollerPacing {
        match coe {
            Coe::Kubernetes => self.kubernetes,
            Coe::Swarm => self.swarm,
            Coe::Mesos => self.mesos,
        }
    }
}

/// Explicit dependencies threaded through the conductor; no module-level
/// state beyond logging and metrics.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub conductor_id: String,
    pub endpoint: String,
    pub topic: String,
    pub lock: ClusterLock,
    pub quotas: QuotaGuard,
    pub stack: Arc<dyn StackAdapter>,
    pub ca: Arc<dyn CertAuthority>,
    pub service_group: Arc<ServiceGroup>,
    pub pacing: PacingSet,
    pub limits: LimitsConfig,
    pub shutdown_rx: watch::Receiver<bool>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        db: persistence::Db,
        config: &AppConfig,
        stack: Arc<dyn StackAdapter>,
        ca: Arc<dyn CertAuthority>,
        service_group: Arc<ServiceGroup>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let conductor_id = config.conductor.host.clone();
        Self {
            lock: ClusterLock::new(db.clone(), service_group.clone(), conductor_id.clone()),
            quotas: QuotaGuard::new(db.clone(), config.quotas.max_clusters_per_project),
            db,
            conductor_id,
            endpoint: config.endpoint(),
            topic: config.conductor.topic.clone(),
            stack,
            ca,
            service_group,
            pacing: PacingSet::from_config(&config.drivers),
            limits: config.limits.clone(),
            shutdown_rx,
            metrics_handle: None,
        }
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
