use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::registry::LocalRegistry;
use crate::telemetry::Metrics;

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<LocalRegistry>,
    pub metrics: Arc<Metrics>,
}

/// Read-only health-check HTTP surface: `/health`, `/health/detailed`,
/// `/health/service`. Permissive CORS, since this is a diagnostics
/// endpoint meant to be polled from any dashboard, not an authenticated
/// API surface.
pub fn router(state: HealthState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/health/service", get(health_service))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(cors))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "UP" })))
}

async fn health_detailed(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    let node_id = state.registry.node_id().to_string();
    let entries = state.registry.snapshot_all().await;

    let live = entries.iter().filter(|e| !e.tombstone).count();
    let tombstoned = entries.len() - live;

    (
        StatusCode::OK,
        Json(json!({
            "status": "UP",
            "nodeId": node_id,
            "registry": {
                "liveEntries": live,
                "tombstonedEntries": tombstoned,
            },
            "metrics": snapshot,
        })),
    )
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    name: Option<String>,
}

async fn health_service(
    State(state): State<HealthState>,
    Query(query): Query<ServiceQuery>,
) -> Response {
    let Some(name) = query.name else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing required query parameter 'name'" })),
        )
            .into_response();
    };

    let instances = state.registry.find(&name).await;
    if instances.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no instances known for service '{}'", name) })),
        )
            .into_response();
    }

    (StatusCode::OK, Json(json!({ "service": name, "instances": instances }))).into_response()
}
