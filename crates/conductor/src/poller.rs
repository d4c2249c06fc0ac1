use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::PollerPacing;
use crate::driver::OutputKeys;
use crate::lock::ClusterLock;
use crate::persistence::{self as db, clusters, ClusterStatus, StackOutputsUpdate};
use crate::quota::{QuotaGuard, RESOURCE_CLUSTER};
use crate::stack::{Stack, StackAdapter, StackStatus};
use crate::telemetry;

/// Which lifecycle phase this poller drives. A poller exits silently when
/// the cluster moves to a different phase underneath it (a delete
/// canceling a create spawns its own poller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Create,
    Update,
    Delete,
}

impl PollPhase {
    fn accepts(&self, status: ClusterStatus) -> bool {
        match self {
            PollPhase::Create => status == ClusterStatus::CreateInProgress,
            PollPhase::Update => matches!(
                status,
                ClusterStatus::UpdateInProgress | ClusterStatus::RollbackInProgress
            ),
            PollPhase::Delete => status == ClusterStatus::DeleteInProgress,
        }
    }
}

enum Flow {
    Continue,
    Done,
}

/// Fixed-interval reconciler for one in-flight cluster.
///
/// Each tick reads the stack through the adapter and advances the cluster
/// state machine. Every write re-verifies lock ownership in the same
/// transaction; when the lock has been stolen the poller stops without
/// writing anything.
pub struct LifecyclePoller {
    db: db::Db,
    stack: Arc<dyn StackAdapter>,
    quotas: QuotaGuard,
    lock: ClusterLock,
    cluster_id: Uuid,
    project_id: String,
    phase: PollPhase,
    rollback: bool,
    keys: OutputKeys,
    pacing: PollerPacing,
    shutdown: watch::Receiver<bool>,
}

impl LifecyclePoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: db::Db,
        stack: Arc<dyn StackAdapter>,
        quotas: QuotaGuard,
        lock: ClusterLock,
        cluster_id: Uuid,
        project_id: String,
        phase: PollPhase,
        rollback: bool,
        keys: OutputKeys,
        pacing: PollerPacing,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            stack,
            quotas,
            lock,
            cluster_id,
            project_id,
            phase,
            rollback,
            keys,
            pacing,
            shutdown,
        }
    }

    /// Drive the cluster until a terminal state, phase hand-off, lock
    /// steal, shutdown, or tick-budget exhaustion.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.pacing.wait_interval);
        // The first tick of a tokio interval fires immediately; the stack
        // was issued just before spawn, so skip straight to waiting.
        interval.tick().await;

        for _attempt in 0..self.pacing.max_attempts {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!(cluster = %self.cluster_id, "poller stopping for shutdown");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return,
                Err(err) => {
                    // Transient store or engine faults burn a tick and are
                    // retried; the budget bounds the total wait.
                    warn!(cluster = %self.cluster_id, ?err, "poll tick failed");
                }
            }
        }

        self.fail_timed_out().await;
    }

    async fn tick(&self) -> crate::Result<Flow> {
        let Some(cluster) = clusters::get_cluster(&self.db, self.cluster_id).await? else {
            debug!(cluster = %self.cluster_id, "cluster row gone; poller exiting");
            return Ok(Flow::Done);
        };

        if !self.phase.accepts(cluster.status) {
            debug!(
                cluster = %self.cluster_id,
                status = ?cluster.status,
                phase = ?self.phase,
                "cluster left this phase; poller superseded"
            );
            return Ok(Flow::Done);
        }

        let Some(stack_id) = cluster.stack_id.clone() else {
            // A delete can be issued before the stack ever existed.
            return match self.phase {
                PollPhase::Delete => self.finish_delete().await,
                _ => {
                    self.fail_with_reason(cluster.status.failed(), "stack disappeared")
                        .await
                }
            };
        };

        let observed = self.stack.get_stack(&stack_id).await?;

        match observed {
            None => match self.phase {
                // External deletion of the stack completes our delete.
                PollPhase::Delete => self.finish_delete().await,
                _ => {
                    self.fail_with_reason(cluster.status.failed(), "stack disappeared")
                        .await
                }
            },
            Some(stack) => self.apply(cluster.status, stack).await,
        }
    }

    async fn apply(&self, cluster_status: ClusterStatus, stack: Stack) -> crate::Result<Flow> {
        let reason = stack.status_reason.clone();

        match (self.phase, stack.status) {
            (PollPhase::Create, StackStatus::CreateInProgress) => {
                self.copy_reason(ClusterStatus::CreateInProgress, &reason).await
            }
            (PollPhase::Create, StackStatus::CreateComplete) => {
                self.finish_with_outputs(ClusterStatus::CreateComplete, &reason, &stack)
                    .await
            }
            (PollPhase::Create, StackStatus::CreateFailed) => {
                self.fail_with_reason(ClusterStatus::CreateFailed, &reason).await
            }

            (PollPhase::Update, StackStatus::UpdateInProgress) => {
                self.copy_reason(ClusterStatus::UpdateInProgress, &reason).await
            }
            (PollPhase::Update, StackStatus::UpdateComplete) => {
                self.finish_with_outputs(ClusterStatus::UpdateComplete, &reason, &stack)
                    .await
            }
            (PollPhase::Update, StackStatus::UpdateFailed) => {
                if self.rollback {
                    // The engine is about to flip to ROLLBACK_IN_PROGRESS.
                    Ok(Flow::Continue)
                } else {
                    self.fail_with_reason(ClusterStatus::UpdateFailed, &reason).await
                }
            }
            (PollPhase::Update, StackStatus::RollbackInProgress) => {
                self.copy_reason(ClusterStatus::RollbackInProgress, &reason).await
            }
            (PollPhase::Update, StackStatus::RollbackComplete) => {
                self.finish_with_outputs(ClusterStatus::RollbackComplete, &reason, &stack)
                    .await
            }
            (PollPhase::Update, StackStatus::RollbackFailed) => {
                self.fail_with_reason(ClusterStatus::RollbackFailed, &reason).await
            }

            (PollPhase::Delete, StackStatus::DeleteInProgress) => {
                self.copy_reason(ClusterStatus::DeleteInProgress, &reason).await
            }
            (PollPhase::Delete, StackStatus::DeleteComplete) => self.finish_delete().await,
            (PollPhase::Delete, StackStatus::DeleteFailed) => {
                self.fail_with_reason(ClusterStatus::DeleteFailed, &reason).await
            }

            (phase, status) => {
                // The engine reports a phase we did not initiate (for
                // example an operator touched the stack directly). Keep
                // polling; the budget bounds how long.
                debug!(
                    cluster = %self.cluster_id,
                    cluster_status = ?cluster_status,
                    stack_status = status.as_str(),
                    phase = ?phase,
                    "unexpected stack status for phase"
                );
                Ok(Flow::Continue)
            }
        }
    }

    /// Non-terminal write: mirror the engine's status reason.
    async fn copy_reason(&self, status: ClusterStatus, reason: &str) -> crate::Result<Flow> {
        let held = clusters::set_status_if_lock_held(
            &self.db,
            self.cluster_id,
            self.lock.conductor_id(),
            status,
            Some(reason),
            None,
        )
        .await?;

        if held {
            Ok(Flow::Continue)
        } else {
            debug!(cluster = %self.cluster_id, "lock stolen; poller exiting");
            Ok(Flow::Done)
        }
    }

    /// Terminal success: parse outputs, persist, release the lease.
    async fn finish_with_outputs(
        &self,
        status: ClusterStatus,
        reason: &str,
        stack: &Stack,
    ) -> crate::Result<Flow> {
        let outputs = parse_outputs(&stack.outputs, &self.keys);
        let held = clusters::set_status_if_lock_held(
            &self.db,
            self.cluster_id,
            self.lock.conductor_id(),
            status,
            Some(reason),
            Some(&outputs),
        )
        .await?;

        if held {
            telemetry::record_transition(status.to_wire().as_str());
            self.lock.release(self.cluster_id).await;
        }
        Ok(Flow::Done)
    }

    /// Terminal failure: persist the failed status, release the lease.
    async fn fail_with_reason(&self, status: ClusterStatus, reason: &str) -> crate::Result<Flow> {
        let held = clusters::set_status_if_lock_held(
            &self.db,
            self.cluster_id,
            self.lock.conductor_id(),
            status,
            Some(reason),
            None,
        )
        .await?;

        if held {
            telemetry::record_transition(status.to_wire().as_str());
            warn!(
                cluster = %self.cluster_id,
                status = status.to_wire().as_str(),
                reason,
                "cluster reached failed state"
            );
            self.lock.release(self.cluster_id).await;
        }
        Ok(Flow::Done)
    }

    /// Terminal delete: remove the cluster and its dependents together
    /// with the lock row, under the quota pair serialization so a racing
    /// admission cannot count the dying cluster.
    async fn finish_delete(&self) -> crate::Result<Flow> {
        let db = self.db.clone();
        let cluster_id = self.cluster_id;
        let conductor_id = self.lock.conductor_id().to_string();

        let deleted = self
            .quotas
            .release_with(&self.project_id, RESOURCE_CLUSTER, || async move {
                clusters::delete_cluster_if_lock_held(&db, cluster_id, &conductor_id).await
            })
            .await
            .map_err(anyhow::Error::new)?;

        if deleted {
            telemetry::record_transition("DELETE_COMPLETE");
            debug!(cluster = %self.cluster_id, "cluster deleted");
        } else {
            debug!(cluster = %self.cluster_id, "lock stolen before delete completed");
        }
        Ok(Flow::Done)
    }

    /// Tick budget exhausted while still in progress.
    async fn fail_timed_out(&self) {
        let Ok(Some(cluster)) = clusters::get_cluster(&self.db, self.cluster_id).await else {
            return;
        };
        if !self.phase.accepts(cluster.status) {
            return;
        }

        let reason = format!(
            "timeout: stack did not reach a terminal state within {} polls",
            self.pacing.max_attempts
        );
        if let Err(err) = self
            .fail_with_reason(cluster.status.failed(), &reason)
            .await
        {
            warn!(cluster = %self.cluster_id, ?err, "failed to record poll timeout");
        }
    }
}

/// Extract the recognized output keys into address fields. Masters and
/// nodes accept both a single string and a list of strings; engines differ.
pub fn parse_outputs(
    outputs: &std::collections::HashMap<String, Value>,
    keys: &OutputKeys,
) -> StackOutputsUpdate {
    StackOutputsUpdate {
        api_address: outputs
            .get(keys.api_address)
            .and_then(Value::as_str)
            .map(str::to_string),
        master_addresses: string_list(outputs.get(keys.masters)),
        node_addresses: string_list(outputs.get(keys.nodes)),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
