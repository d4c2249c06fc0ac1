use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::rpc::{PingReply, RpcEnvelope, RpcReply};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;

use crate::app_state::AppState;

/// The conductor's listener: the RPC endpoint, the per-conductor ping
/// queue, and the operational endpoints.
pub fn build_router(metrics_handle: Option<PrometheusHandle>) -> Router<AppState> {
    let mut router = Router::new()
        .route("/v1/rpc", post(handle_rpc))
        .route("/v1/ping/:conductor_id", get(handle_ping))
        .route("/healthz", get(handle_healthz));

    if let Some(handle) = metrics_handle {
        router = router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router
}

async fn handle_rpc(
    State(state): State<AppState>,
    Json(envelope): Json<RpcEnvelope>,
) -> impl IntoResponse {
    let (status, reply) = super::dispatch(&state, envelope).await;
    (status, Json(reply))
}

/// Liveness probe addressed to one specific conductor. Answering for a
/// different id would defeat stale-lock detection, so a mismatched id is
/// NotFound even though the process is clearly alive.
async fn handle_ping(
    State(state): State<AppState>,
    Path(conductor_id): Path<String>,
) -> impl IntoResponse {
    if conductor_id != state.conductor_id {
        return (
            StatusCode::NOT_FOUND,
            Json(RpcReply::err(
                common::api::ErrorKind::NotFound,
                format!("conductor {conductor_id} does not listen here"),
            )),
        )
            .into_response();
    }

    let reply = PingReply {
        conductor_id,
        alive: true,
        details: HashMap::from([("topic".to_string(), state.topic.clone())]),
    };
    (StatusCode::OK, Json(reply)).into_response()
}

async fn handle_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
