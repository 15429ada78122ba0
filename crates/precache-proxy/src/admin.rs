use crate::proxy::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use precache_core::registration::UpdateOutcome;
use precache_core::{Route, Source};
use std::sync::Arc;

pub fn record_served(route: Route, source: Source) {
    metrics::counter!(
        "precache_fetch_total",
        "route" => route.as_str(),
        "source" => source.as_str()
    )
    .increment(1);
}

pub fn record_failure(route: Route) {
    metrics::counter!(
        "precache_fetch_total",
        "route" => route.as_str(),
        "source" => "error"
    )
    .increment(1);
}

pub fn record_install(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    metrics::counter!("precache_install_total", "outcome" => outcome).increment(1);
}

pub fn record_activate() {
    metrics::counter!("precache_activate_total").increment(1);
}

/// GET /api/stats: one-shot view of the registration and the store.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registration = &state.registration;
    let generations = match registration.storage().keys().await {
        Ok(names) => names,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            );
        }
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "registration": registration.status(),
            "generations": generations,
            "store": registration.storage().stats(),
            "pending_tasks": registration.lifetime().pending(),
        })),
    )
}

/// POST /api/skip-waiting: activate a waiting worker without waiting for
/// its predecessor's pages to close.
pub async fn skip_waiting_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.registration.activate_waiting().await {
        Ok(UpdateOutcome::Activated { generation, report }) => {
            record_activate();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "activated": generation,
                    "deleted": report.deleted,
                    "failed": report.failed,
                    "claimed": report.claimed,
                })),
            )
        }
        Ok(_) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "no worker is waiting"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "skip-waiting activation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}
