use metrics::counter;
use sqlx::Error as SqlxError;

/// Lock lifecycle events: acquire, release, stolen, contended.
pub fn record_lock_event(event: &'static str) {
    counter!("conductor_lock_events_total", "event" => event).increment(1);
}

/// Terminal poller transitions, labeled by the status they land on.
pub fn record_transition(status: &'static str) {
    counter!("conductor_lifecycle_transitions_total", "status" => status).increment(1);
}

pub fn record_quota_rejection(resource: &str) {
    counter!("conductor_quota_rejections_total", "resource" => resource.to_string()).increment(1);
}

/// RPC request outcomes, labeled by operation and result kind.
pub fn record_rpc(op: &'static str, outcome: &'static str) {
    counter!("conductor_rpc_requests_total", "op" => op, "outcome" => outcome).increment(1);
}

pub(crate) fn record_internal_error(err: &anyhow::Error) {
    counter!("conductor_internal_errors_total").increment(1);
    record_store_error(err);
}

pub(crate) fn record_store_error(err: &anyhow::Error) {
    if let Some(db_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())
    {
        let kind = match db_err {
            SqlxError::RowNotFound => "row_not_found",
            SqlxError::Database(_) => "database",
            SqlxError::PoolTimedOut | SqlxError::PoolClosed => "pool",
            SqlxError::Io(_) => "io",
            SqlxError::Tls(_) => "tls",
            _ => "other",
        };
        counter!("conductor_store_errors_total", "kind" => kind).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        // The metrics crate swallows events when no recorder is installed;
        // these must not panic in library consumers or tests.
        record_lock_event("acquire");
        record_transition("CREATE_COMPLETE");
        record_quota_rejection("Cluster");
        record_rpc("cluster_create", "ok");
        record_internal_error(&anyhow::anyhow!("boom"));
    }
}
