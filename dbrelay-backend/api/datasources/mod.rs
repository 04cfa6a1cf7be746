pub mod handlers;

use axum::routing::{get, post};
use axum::Router;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/datasources",
            get(handlers::list_datasources).post(handlers::create_datasource),
        )
        .route(
            "/datasources/{id}",
            get(handlers::get_datasource).delete(handlers::delete_datasource),
        )
        .route("/datasources/{id}/test", post(handlers::test_datasource))
        .route("/datasources/{id}/query", post(handlers::query_datasource))
}
