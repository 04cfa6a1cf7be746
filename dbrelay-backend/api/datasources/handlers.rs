use axum::extract::{Path, State};
use axum::Json;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::api::identity::CallerId;
use crate::datasources::{DataSource, DataSourceConfig};
use crate::service::NewDataSource;

type ApiError = (StatusCode, Json<Value>);

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "datasource not found" })),
    )
}

fn to_json(datasource: &DataSource) -> Result<Json<Value>, ApiError> {
    serde_json::to_value(datasource.redacted())
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("failed to serialize datasource: {e}") })),
            )
        })
}

async fn lookup(state: &AppState, owner: &CallerId, id: &str) -> Result<DataSource, ApiError> {
    state
        .datasources
        .repository()
        .get_for_owner(&owner.0, id)
        .await
        .ok_or_else(not_found)
}

pub(crate) async fn list_datasources(State(state): State<AppState>, caller: CallerId) -> Json<Value> {
    let datasources = state.datasources.repository().list_for_owner(&caller.0).await;

    let summaries: Vec<Value> = datasources
        .iter()
        .map(|ds| {
            json!({
                "id": ds.id,
                "name": ds.name,
                "engine_type": ds.connection.engine_name(),
                "documentation_count": ds.documentation.len(),
                "last_test": ds.last_test,
                "created_at": ds.created_at,
                "updated_at": ds.updated_at,
            })
        })
        .collect();

    Json(json!({ "datasources": summaries }))
}

pub(crate) async fn get_datasource(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let datasource = lookup(&state, &caller, &id).await?;
    to_json(&datasource)
}

#[tracing::instrument(skip_all, fields(owner_id = %caller.0))]
pub(crate) async fn create_datasource(
    State(state): State<AppState>,
    caller: CallerId,
    Json(body): Json<NewDataSource>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name must not be empty" })),
        ));
    }
    if matches!(body.connection, DataSourceConfig::Unsupported(_)) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unsupported engine_type" })),
        ));
    }

    let datasource = state
        .datasources
        .create(&caller.0, body)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to create datasource");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("failed to save datasource: {e}") })),
            )
        })?;

    Ok((StatusCode::CREATED, to_json(&datasource)?))
}

pub(crate) async fn delete_datasource(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.datasources.repository().delete_for_owner(&caller.0, &id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(not_found()),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("failed to delete datasource: {e}") })),
        )),
    }
}

/// POST /api/datasources/{id}/test: connect, record `last_test`, return it.
pub(crate) async fn test_datasource(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let datasource = lookup(&state, &caller, &id).await?;
    let result = state.datasources.test_connection(&datasource).await;
    Ok(Json(json!(result)))
}

#[derive(Deserialize)]
pub(crate) struct QueryBody {
    query: String,
}

/// POST /api/datasources/{id}/query: failures come back as `success: false`.
pub(crate) async fn query_datasource(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Value>, ApiError> {
    let datasource = lookup(&state, &caller, &id).await?;
    let result = state.datasources.query(&datasource, &body.query).await;
    Ok(Json(json!(result)))
}
