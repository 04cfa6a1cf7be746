//! Caller identity. Authentication happens upstream; by the time a request
//! reaches this service the caller's id is carried in `x-user-id`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::Json;
use hyper::StatusCode;
use serde_json::{json, Value};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated owner making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| CallerId(v.to_string()))
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "missing x-user-id header" })),
                )
            })
    }
}
