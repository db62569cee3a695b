//! Plugin listing and RPC endpoints

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiState, auth};
use crate::Error;
use crate::plugins::{MethodContext, PluginFootprint, PluginSource};

/// Loaded plugin as returned by the API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResponse {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: PluginSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub reloadable: bool,
    pub registrations: PluginFootprint,
}

/// Body of `POST /api/rpc`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub session_key: Option<String>,
}

/// Build plugin routes
pub fn router(state: Arc<ApiState>) -> Router {
    let rpc = Router::new()
        .route("/api/rpc", post(call_method))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    Router::new()
        .route("/api/plugins", get(list_plugins))
        .merge(rpc)
        .with_state(state)
}

/// List loaded plugins in load order
async fn list_plugins(State(state): State<Arc<ApiState>>) -> Json<Vec<PluginResponse>> {
    let registry = state.gateway.registry();
    let plugins = state
        .gateway
        .loader()
        .loaded_plugins()
        .into_iter()
        .map(|info| PluginResponse {
            registrations: registry.footprint(&info.manifest.id),
            reloadable: info.source.is_external(),
            id: info.manifest.id,
            name: info.manifest.name,
            version: info.manifest.version,
            description: info.manifest.description,
            source: info.source,
            path: info.path,
        })
        .collect();
    Json(plugins)
}

/// Invoke a plugin-registered gateway method
async fn call_method(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RpcRequest>,
) -> (StatusCode, Json<Value>) {
    let ctx = MethodContext {
        client_id: format!("http-{}", uuid::Uuid::new_v4()),
        session_key: req.session_key,
    };

    match state.gateway.call_method(&req.method, req.params, ctx).await {
        Ok(result) => (StatusCode::OK, Json(json!({ "result": result }))),
        Err(e @ Error::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown method: {}", req.method), "detail": e.to_string() })),
        ),
        Err(e) => {
            tracing::warn!(method = %req.method, error = %e, "gateway method failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
