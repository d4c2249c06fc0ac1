use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::persistence::{self as db, services, ServiceRecord};
use crate::Result;

/// Probes a peer conductor's listener synchronously. The HTTP client in
/// `rpc::client` is the production implementation; tests substitute fakes.
#[async_trait]
pub trait PeerPinger: Send + Sync {
    /// True only when the peer answered within the configured timeout.
    async fn ping(&self, endpoint: &str, conductor_id: &str) -> bool;
}

/// The single authority for conductor liveness.
///
/// Lock stealing and the API's service listing both ask here; nothing else
/// interprets the heartbeat timestamps.
pub struct ServiceGroup {
    db: db::Db,
    binary: String,
    service_down_time: Duration,
    pinger: Option<Arc<dyn PeerPinger>>,
}

/// Pure liveness rule: `forced_down` wins, otherwise the freshest of the
/// row's timestamps must fall within `service_down_time` of `now`.
pub fn service_is_up(record: &ServiceRecord, service_down_time: Duration, now: DateTime<Utc>) -> bool {
    if record.forced_down {
        return false;
    }

    let freshest = [
        record.last_seen_up,
        Some(record.updated_at),
        Some(record.created_at),
    ]
    .into_iter()
    .flatten()
    .max();

    match freshest {
        // A slightly-future timestamp (writer clock ahead of ours) still
        // counts as fresh; only a stale one marks the conductor down.
        Some(seen) => {
            now.signed_duration_since(seen).num_seconds() <= service_down_time.as_secs() as i64
        }
        None => false,
    }
}

impl ServiceGroup {
    pub fn new(db: db::Db, binary: impl Into<String>, service_down_time: Duration) -> Self {
        Self {
            db,
            binary: binary.into(),
            service_down_time,
            pinger: None,
        }
    }

    /// Enable synchronous peer probing; liveness then comes from the ping
    /// rather than from heartbeat timestamps.
    pub fn with_pinger(mut self, pinger: Arc<dyn PeerPinger>) -> Self {
        self.pinger = Some(pinger);
        self
    }

    pub fn service_down_time(&self) -> Duration {
        self.service_down_time
    }

    /// Liveness of a peer conductor by id.
    ///
    /// A missing registration row counts as dead. Store failures propagate:
    /// the caller must not treat "could not determine" as "dead", or a
    /// flaky store would let locks be stolen from live conductors.
    pub async fn is_alive(&self, conductor_id: &str) -> Result<bool> {
        let Some(record) = services::get_service(&self.db, conductor_id, &self.binary).await? else {
            return Ok(false);
        };

        if record.forced_down {
            return Ok(false);
        }

        if let Some(pinger) = &self.pinger {
            return Ok(pinger.ping(&record.endpoint, conductor_id).await);
        }

        Ok(service_is_up(&record, self.service_down_time, Utc::now()))
    }

    /// Liveness string for the service listing (`up` / `down`).
    pub fn state_of(&self, record: &ServiceRecord) -> &'static str {
        if service_is_up(record, self.service_down_time, Utc::now()) {
            "up"
        } else {
            "down"
        }
    }
}
