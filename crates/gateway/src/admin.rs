use crate::proxy::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub name: String,
    pub entries: usize,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub state: crate::lifecycle::LifecycleState,
    pub backend: &'static str,
    pub general: Option<String>,
    pub image: Option<String>,
    pub pending_refreshes: usize,
    pub partitions: Vec<PartitionStats>,
}

/// Admin router (separate port): Prometheus scrape, stats, manual activation.
pub fn router(state: Arc<AppState>, prom_handle: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/activate", post(activate_handler));

    let router = match prom_handle {
        Some(handle) => router.route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        ),
        None => router,
    };

    router.with_state(state)
}

/// GET /api/stats: one-shot view of generations and stored partitions.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.lifecycle.store();
    let active = state.lifecycle.active();

    let names = match store.partition_names().await {
        Ok(names) => names,
        Err(e) => {
            tracing::error!(error = %e, "failed to list partitions");
            return internal_error(e);
        }
    };

    let mut partitions = Vec::with_capacity(names.len());
    for name in names {
        let entries = match store.partition(&name) {
            Ok(p) => p.len().await.unwrap_or_else(|e| {
                tracing::warn!(partition = %name, error = %e, "failed to count entries");
                0
            }),
            Err(_) => 0,
        };
        let current = active.as_ref().is_some_and(|g| g.contains(&name));
        partitions.push(PartitionStats {
            name,
            entries,
            current,
        });
    }

    let snapshot = StatsSnapshot {
        state: state.lifecycle.state(),
        backend: store.backend_name(),
        general: active.as_ref().map(|g| g.general().name().to_string()),
        image: active.as_ref().map(|g| g.image().name().to_string()),
        pending_refreshes: state.gateway.pending_refreshes(),
        partitions,
    };

    Json(snapshot).into_response()
}

/// POST /api/activate: re-run stale partition cleanup for the active generation.
pub async fn activate_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.lifecycle.activate().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "manual activation failed");
            internal_error(e)
        }
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}
