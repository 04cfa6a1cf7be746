use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use hyper::StatusCode;

use crate::api::AppState;
use crate::api::identity::CallerId;
use crate::errors::ErrorKind;
use crate::executor::{ExecuteRequest, ExecutionOutcome};

pub fn router() -> Router<AppState> {
    Router::new().route("/execute", post(execute_command))
}

/// POST /api/execute: run a command against one of the caller's databases.
///
/// The body is always an `ExecutionOutcome`; the status code only separates
/// "no such database" and "platform rate limit" from everything else.
pub(crate) async fn execute_command(
    State(state): State<AppState>,
    caller: CallerId,
    Json(body): Json<ExecuteRequest>,
) -> (StatusCode, Json<ExecutionOutcome>) {
    let outcome = state.executor.execute(&caller.0, body).await;
    let status = match outcome.error_kind {
        Some(ErrorKind::DataSourceNotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    };
    (status, Json(outcome))
}
