pub mod handlers;

use axum::routing::get;
use axum::Router;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sandbox/info", get(handlers::sandbox_info))
        .route("/sandbox/pool", get(handlers::pool_stats))
}
