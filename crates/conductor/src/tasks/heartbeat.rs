use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::app_state::BINARY_NAME;
use crate::error::OpError;
use crate::persistence::{self as db, services};

/// Consecutive heartbeat write failures tolerated before the conductor
/// gives up. A conductor that cannot write its liveness row will have its
/// locks stolen anyway; exiting lets the supervisor restart it cleanly.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Periodically refresh this conductor's liveness row.
///
/// Returns `Ok(())` on shutdown; returns a `Fatal` error when the store
/// stays unreachable, which the daemon turns into exit code 2.
pub async fn heartbeat_loop(
    pool: db::Db,
    conductor_id: String,
    endpoint: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(period);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("heartbeat loop stopping for shutdown");
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        match services::upsert_heartbeat(&pool, &conductor_id, BINARY_NAME, &endpoint).await {
            Ok(_) => {
                failures = 0;
            }
            Err(err) => {
                failures += 1;
                warn!(?err, failures, "heartbeat write failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(anyhow::Error::new(OpError::fatal(format!(
                        "store unreachable for {failures} consecutive heartbeats"
                    ))));
                }
            }
        }
    }
}
