use common::api::ConductorServiceView;
use tracing::warn;

use crate::app_state::AppState;
use crate::error::{OpError, OpResult};
use crate::persistence::services;
use crate::services::views;

/// Conductor liveness listing for operator tooling; the up/down state is
/// the service group's verdict, not raw timestamps.
pub async fn service_list(state: &AppState) -> OpResult<Vec<ConductorServiceView>> {
    let records = services::list_services(&state.db).await?;
    Ok(records
        .iter()
        .map(|record| views::service_view(record, state.service_group.state_of(record)))
        .collect())
}

/// Mark a conductor as administratively down so its locks become
/// stealable without waiting for the heartbeat window to expire.
pub async fn service_force_down(state: &AppState, host: &str, binary: &str) -> OpResult<()> {
    let updated = services::set_forced_down(&state.db, host, binary, true).await?;
    if updated == 0 {
        return Err(OpError::not_found(format!(
            "conductor service {host}/{binary} not found"
        )));
    }
    warn!(host, binary, "conductor service forced down");
    Ok(())
}
