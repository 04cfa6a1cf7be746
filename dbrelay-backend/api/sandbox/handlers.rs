use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::executor::SANDBOX_RUNTIME;

/// GET /api/sandbox/info: provider info.
pub(crate) async fn sandbox_info(State(state): State<AppState>) -> Json<Value> {
    let info = state.pool.provider().info();
    Json(json!({
        "provider": info.kind,
        "runtime": info.runtime,
        "network_isolated": info.network_isolated,
        "command_runtime": SANDBOX_RUNTIME,
    }))
}

/// GET /api/sandbox/pool: `{total, in_use, available}` plus each member.
pub(crate) async fn pool_stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.pool.stats().await;
    Json(json!({
        "total": stats.total,
        "in_use": stats.in_use,
        "available": stats.available,
        "sandboxes": state.pool.sandboxes().await,
    }))
}
