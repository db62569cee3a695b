//! Bearer-token guard for gateway-owned endpoints

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

use super::ApiState;
use crate::config::Access;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Reject requests whose token does not match `api.api_key`
///
/// Plugin routes are not behind this layer; the hot-reload builtin runs the
/// same check itself.
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let access = state
        .gateway
        .config()
        .api
        .check_token(bearer(req.headers()));

    match access {
        Access::Open | Access::Granted => Ok(next.run(req).await),
        Access::Invalid => {
            tracing::warn!(path = %req.uri().path(), "rpc call with wrong api key");
            Err(StatusCode::UNAUTHORIZED)
        }
        Access::Missing => {
            tracing::debug!(path = %req.uri().path(), "rpc call without api key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
