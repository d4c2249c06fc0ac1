use std::time::Duration;

use async_trait::async_trait;
use common::api::{ClusterSpec, ClusterView, ConductorServiceView, RequestContext};
use common::rpc::{ConductorRequest, PingReply, RpcEnvelope, RpcReply};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{OpError, OpResult};
use crate::service_group::PeerPinger;

/// Client side of the conductor RPC; this is what an API front-end embeds.
#[derive(Clone)]
pub struct ConductorClient {
    base_url: String,
    http: reqwest::Client,
}

impl ConductorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Send one envelope and unwrap the reply into the error taxonomy.
    pub async fn call(
        &self,
        context: RequestContext,
        request: ConductorRequest,
    ) -> OpResult<Value> {
        let envelope = RpcEnvelope { context, request };
        let response = self
            .http
            .post(format!("{}/v1/rpc", self.base_url))
            .json(&envelope)
            .send()
            .await
            .map_err(|err| OpError::transient(format!("conductor unreachable: {err}")))?;

        let reply: RpcReply = response
            .json()
            .await
            .map_err(|err| OpError::transient(format!("malformed conductor reply: {err}")))?;

        match reply {
            RpcReply {
                error: Some(error), ..
            } => Err(OpError {
                kind: error.kind,
                message: error.message,
            }),
            RpcReply { result, .. } => Ok(result.unwrap_or(Value::Null)),
        }
    }

    pub async fn cluster_create(
        &self,
        context: RequestContext,
        uuid: Uuid,
        spec: ClusterSpec,
    ) -> OpResult<ClusterView> {
        let value = self
            .call(context, ConductorRequest::ClusterCreate { uuid, spec })
            .await?;
        from_value(value)
    }

    pub async fn cluster_show(
        &self,
        context: RequestContext,
        cluster: impl Into<String>,
    ) -> OpResult<ClusterView> {
        let value = self
            .call(
                context,
                ConductorRequest::ClusterShow {
                    cluster: cluster.into(),
                },
            )
            .await?;
        from_value(value)
    }

    pub async fn cluster_list(&self, context: RequestContext) -> OpResult<Vec<ClusterView>> {
        let value = self.call(context, ConductorRequest::ClusterList).await?;
        from_value(value)
    }

    pub async fn cluster_delete(
        &self,
        context: RequestContext,
        cluster: impl Into<String>,
    ) -> OpResult<()> {
        self.call(
            context,
            ConductorRequest::ClusterDelete {
                cluster: cluster.into(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn service_list(
        &self,
        context: RequestContext,
    ) -> OpResult<Vec<ConductorServiceView>> {
        let value = self.call(context, ConductorRequest::ServiceList).await?;
        from_value(value)
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> OpResult<T> {
    serde_json::from_value(value)
        .map_err(|err| OpError::transient(format!("malformed conductor reply: {err}")))
}

/// HTTP liveness probe against a peer's listener queue. Any failure —
/// connect error, timeout, wrong id — counts as not alive.
pub struct HttpPeerPinger {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpPeerPinger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl PeerPinger for HttpPeerPinger {
    async fn ping(&self, endpoint: &str, conductor_id: &str) -> bool {
        let url = format!(
            "{}/v1/ping/{conductor_id}",
            endpoint.trim_end_matches('/')
        );

        let response = match self.http.get(&url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(%url, ?err, "peer ping failed");
                return false;
            }
        };
        if !response.status().is_success() {
            return false;
        }

        match response.json::<PingReply>().await {
            Ok(reply) => reply.alive && reply.conductor_id == conductor_id,
            Err(_) => false,
        }
    }
}
