//! HTTP API server for the Plexus gateway
//!
//! Gateway-owned endpoints are mounted directly; every other request falls
//! through to the routes plugins registered in the registry.

mod auth;
pub mod health;
pub mod plugins;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::gateway::Gateway;
use crate::plugins::{HttpRequest, HttpResponse};

/// Shared state for API handlers
#[derive(Debug)]
pub struct ApiState {
    pub gateway: Arc<Gateway>,
}

/// API server
#[derive(Debug)]
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Server using the gateway's configured port and API key
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let port = gateway.config().api.port;
        Self {
            state: Arc::new(ApiState { gateway }),
            port,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .fallback(plugin_route)
            .with_state(Arc::clone(&self.state))
            .merge(health::router())
            .merge(plugins::router(Arc::clone(&self.state)))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}

/// Dispatch anything unmatched to a plugin route
async fn plugin_route(
    State(state): State<Arc<ApiState>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = HttpRequest {
        method: method.as_str().to_ascii_uppercase(),
        path: uri.path().to_string(),
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect(),
        body: body.to_vec(),
    };

    match state.gateway.handle_http(req).await {
        Some(response) => into_response(response),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn into_response(plugin: HttpResponse) -> Response {
    let status = StatusCode::from_u16(plugin.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Body::from(plugin.body)).into_response();

    let headers = response.headers_mut();
    for (name, value) in plugin.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::debug!(header = %name, "dropping invalid plugin response header"),
        }
    }
    response
}
