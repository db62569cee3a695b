//! Hot reload builtin
//!
//! Exposes the reloader and watcher through the plugin surfaces:
//! - `POST /api/plugins/reload`
//! - `POST|DELETE|GET /api/plugins/watch`
//! - gateway method `plugins.reload`
//! - command `/reload-plugin <id>`
//!
//! The reloader and watcher are created after plugins load, so they are
//! bound late through [`HotReloadHandle`]. Until then every surface answers
//! "not initialized".

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::ApiConfig;
use crate::plugins::api::PluginApi;
use crate::plugins::factory::{BuiltinPlugin, PluginFactory};
use crate::plugins::reloader::{PluginReloader, Reload, ReloadResult};
use crate::plugins::types::{CommandContext, HttpRequest, HttpResponse, MethodContext};
use crate::plugins::watcher::ReloadWatcher;

pub const PLUGIN_ID: &str = "hot-reload";

pub const RELOAD_PATH: &str = "/api/plugins/reload";
pub const WATCH_PATH: &str = "/api/plugins/watch";
pub const RELOAD_METHOD: &str = "plugins.reload";
pub const RELOAD_COMMAND: &str = "reload-plugin";

const NOT_INITIALIZED: &str = "Hot reload not initialized";

/// Late-bound access to the reloader and watcher
#[derive(Debug, Clone, Default)]
pub struct HotReloadHandle {
    reloader: Arc<OnceLock<Arc<PluginReloader>>>,
    watcher: Arc<OnceLock<Arc<ReloadWatcher>>>,
}

impl HotReloadHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the reloader; later calls are ignored
    pub fn set_reloader(&self, reloader: Arc<PluginReloader>) {
        if self.reloader.set(reloader).is_ok() {
            tracing::info!("hot reload initialized");
        }
    }

    /// Bind the watcher; later calls are ignored
    pub fn set_watcher(&self, watcher: Arc<ReloadWatcher>) {
        let _ = self.watcher.set(watcher);
    }

    #[must_use]
    pub fn reloader(&self) -> Option<Arc<PluginReloader>> {
        self.reloader.get().cloned()
    }

    #[must_use]
    pub fn watcher(&self) -> Option<Arc<ReloadWatcher>> {
        self.watcher.get().cloned()
    }
}

/// The `hot-reload` builtin bound to `handle`
#[must_use]
pub fn plugin(handle: &HotReloadHandle) -> BuiltinPlugin {
    let handle = handle.clone();
    BuiltinPlugin::new(
        PLUGIN_ID,
        "Hot Reload",
        PluginFactory::function(move |api| {
            let handle = handle.clone();
            async move {
                register(&api, &handle);
                Ok(())
            }
        }),
    )
}

fn register(api: &PluginApi, handle: &HotReloadHandle) {
    let auth = Arc::new(api.config().api.clone());

    {
        let handle = handle.clone();
        let auth = Arc::clone(&auth);
        api.register_http_route("POST", RELOAD_PATH, move |req| {
            let handle = handle.clone();
            let auth = Arc::clone(&auth);
            async move { Ok(reload_route(&handle, &auth, &req).await) }
        });
    }

    for method in ["POST", "DELETE", "GET"] {
        let handle = handle.clone();
        let auth = Arc::clone(&auth);
        api.register_http_route(method, WATCH_PATH, move |req| {
            let handle = handle.clone();
            let auth = Arc::clone(&auth);
            async move { Ok(watch_route(&handle, &auth, &req)) }
        });
    }

    {
        let handle = handle.clone();
        api.register_gateway_method(RELOAD_METHOD, move |params, _ctx: MethodContext| {
            let handle = handle.clone();
            async move { Ok(reload_method(&handle, &params).await) }
        });
    }

    {
        let handle = handle.clone();
        api.register_command(RELOAD_COMMAND, move |ctx| {
            let handle = handle.clone();
            async move {
                reload_command(&handle, &ctx).await;
                Ok(())
            }
        });
    }

    tracing::debug!("hot reload plugin registered");
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReloadBody {
    plugin_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchBody {
    plugin_id: Option<String>,
    path: Option<PathBuf>,
}

fn error_response(status: u16, message: &str) -> HttpResponse {
    HttpResponse::json(status, &json!({ "error": message }))
}

/// 401 unless the request carries the configured bearer token
fn check_auth(auth: &ApiConfig, req: &HttpRequest) -> Option<HttpResponse> {
    if auth.check_token(req.bearer_token()).is_allowed() {
        None
    } else {
        tracing::warn!(path = %req.path, "unauthorized hot reload request");
        Some(error_response(401, "Unauthorized"))
    }
}

fn result_body(result: &ReloadResult) -> Value {
    json!({
        "success": result.success,
        "pluginId": result.plugin_id,
        "message": result.message(),
        "durationMs": result.duration_ms,
    })
}

async fn reload_route(handle: &HotReloadHandle, auth: &ApiConfig, req: &HttpRequest) -> HttpResponse {
    if let Some(denied) = check_auth(auth, req) {
        return denied;
    }

    let Ok(body) = req.json::<ReloadBody>() else {
        return error_response(400, "Invalid JSON");
    };
    let Some(plugin_id) = body.plugin_id.filter(|id| !id.is_empty()) else {
        return error_response(400, "pluginId required");
    };
    let Some(reloader) = handle.reloader() else {
        return error_response(503, NOT_INITIALIZED);
    };

    tracing::info!(plugin_id = %plugin_id, source = "http", "reload requested");
    let result = reloader.reload(&plugin_id).await;
    let status = if result.success { 200 } else { 500 };
    HttpResponse::json(status, &result_body(&result))
}

fn watch_route(handle: &HotReloadHandle, auth: &ApiConfig, req: &HttpRequest) -> HttpResponse {
    if let Some(denied) = check_auth(auth, req) {
        return denied;
    }
    let Some(watcher) = handle.watcher() else {
        return error_response(503, NOT_INITIALIZED);
    };

    match req.method.as_str() {
        "GET" => HttpResponse::json(200, &json!({ "watched": watcher.watched() })),
        "DELETE" => {
            let Some(plugin_id) = req.query.get("pluginId").filter(|id| !id.is_empty()) else {
                return error_response(400, "pluginId required");
            };
            let removed = watcher.unwatch(plugin_id);
            HttpResponse::json(200, &json!({ "success": removed, "pluginId": plugin_id }))
        }
        _ => {
            let Ok(body) = req.json::<WatchBody>() else {
                return error_response(400, "Invalid JSON");
            };
            let Some(plugin_id) = body.plugin_id.filter(|id| !id.is_empty()) else {
                return error_response(400, "pluginId required");
            };
            let path = body
                .path
                .or_else(|| handle.reloader().and_then(|r| r.plugin_dir(&plugin_id)));
            let Some(path) = path else {
                return error_response(404, &format!("no directory known for plugin {plugin_id}"));
            };

            match watcher.watch(&plugin_id, &path) {
                Ok(()) => HttpResponse::json(
                    200,
                    &json!({ "success": true, "pluginId": plugin_id, "path": path }),
                ),
                Err(e) => error_response(400, &e.to_string()),
            }
        }
    }
}

async fn reload_method(handle: &HotReloadHandle, params: &Value) -> Value {
    let Some(plugin_id) = params
        .get("pluginId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
    else {
        return json!({ "error": "pluginId required" });
    };
    let Some(reloader) = handle.reloader() else {
        return json!({ "error": NOT_INITIALIZED });
    };

    tracing::info!(plugin_id = %plugin_id, source = "rpc", "reload requested");
    result_body(&reloader.reload(plugin_id).await)
}

async fn reload_command(handle: &HotReloadHandle, ctx: &CommandContext) {
    let plugin_id = ctx.args.trim();
    if plugin_id.is_empty() {
        ctx.respond(format!("Usage: /{RELOAD_COMMAND} <plugin-id>"));
        return;
    }
    let Some(reloader) = handle.reloader() else {
        ctx.respond(NOT_INITIALIZED);
        return;
    };

    tracing::info!(plugin_id = %plugin_id, source = "command", "reload requested");
    ctx.respond(format!("Reloading plugin: {plugin_id}..."));

    let result = reloader.reload(plugin_id).await;
    match result.error {
        None => ctx.respond(format!("Plugin {plugin_id} reloaded successfully")),
        Some(error) => ctx.respond(format!("Failed to reload {plugin_id}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::Config;
    use crate::plugins::loader::PluginLoader;
    use crate::plugins::registry::PluginRegistry;
    use crate::plugins::watcher::WatcherOptions;

    async fn setup(api_key: Option<&str>) -> (Arc<PluginLoader>, HotReloadHandle) {
        let mut config = Config::default();
        config.api.api_key = api_key.map(String::from);
        let handle = HotReloadHandle::new();
        let loader = Arc::new(
            PluginLoader::new(Arc::new(config), PluginRegistry::new())
                .with_builtins(vec![plugin(&handle)]),
        );
        let report = loader.load_builtins().await;
        assert_eq!(report.loaded, vec![PLUGIN_ID]);
        (loader, handle)
    }

    fn post(path: &str, body: &Value, token: Option<&str>) -> HttpRequest {
        let mut headers = HashMap::new();
        if let Some(token) = token {
            headers.insert("authorization".to_string(), format!("Bearer {token}"));
        }
        HttpRequest {
            method: "POST".to_string(),
            path: path.to_string(),
            headers,
            body: body.to_string().into_bytes(),
            ..HttpRequest::default()
        }
    }

    async fn call(loader: &PluginLoader, req: HttpRequest) -> (u16, Value) {
        let handler = loader
            .registry()
            .find_route(&req.method, &req.path)
            .expect("route registered");
        let resp = handler(req).await.unwrap();
        (resp.status, serde_json::from_slice(&resp.body).unwrap())
    }

    #[tokio::test]
    async fn registers_every_surface() {
        let (loader, _) = setup(None).await;
        let footprint = loader.registry().footprint(PLUGIN_ID);

        assert_eq!(footprint.http_routes.len(), 4);
        assert_eq!(footprint.gateway_methods, vec![RELOAD_METHOD]);
        assert_eq!(footprint.commands, vec![RELOAD_COMMAND]);
    }

    #[tokio::test]
    async fn uninitialized_returns_503() {
        let (loader, _) = setup(None).await;
        let (status, body) = call(&loader, post(RELOAD_PATH, &json!({"pluginId": "x"}), None)).await;

        assert_eq!(status, 503);
        assert_eq!(body["error"], NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn rejects_missing_token() {
        let (loader, _) = setup(Some("secret")).await;

        let (status, _) = call(&loader, post(RELOAD_PATH, &json!({"pluginId": "x"}), None)).await;
        assert_eq!(status, 401);

        let (status, _) = call(&loader, post(RELOAD_PATH, &json!({"pluginId": "x"}), Some("wrong"))).await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn bad_body_returns_400() {
        let (loader, _) = setup(None).await;

        let mut req = post(RELOAD_PATH, &json!({}), None);
        req.body = b"not json".to_vec();
        let (status, body) = call(&loader, req).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Invalid JSON");

        let (status, body) = call(&loader, post(RELOAD_PATH, &json!({}), None)).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "pluginId required");
    }

    #[tokio::test]
    async fn reload_failure_returns_500() {
        let (loader, handle) = setup(Some("secret")).await;
        handle.set_reloader(Arc::new(PluginReloader::new(Arc::clone(&loader))));

        let (status, body) = call(&loader, post(RELOAD_PATH, &json!({"pluginId": "ghost"}), Some("secret"))).await;
        assert_eq!(status, 500);
        assert_eq!(body["success"], false);
        assert_eq!(body["pluginId"], "ghost");
        assert_eq!(body["message"], "Reload failed: plugin ghost is not loaded");
    }

    #[tokio::test]
    async fn builtin_cannot_reload_itself() {
        let (loader, handle) = setup(None).await;
        handle.set_reloader(Arc::new(PluginReloader::new(Arc::clone(&loader))));

        let method = loader.registry().gateway_method(RELOAD_METHOD).unwrap();
        let value = method(json!({"pluginId": PLUGIN_ID}), MethodContext::default())
            .await
            .unwrap();
        assert_eq!(value["success"], false);
        assert!(value["message"].as_str().unwrap().contains("builtin"));

        let value = method(json!({}), MethodContext::default()).await.unwrap();
        assert_eq!(value["error"], "pluginId required");
    }

    #[tokio::test]
    async fn command_replies() {
        let (loader, handle) = setup(None).await;
        let command = loader.registry().command("/reload-plugin").unwrap();

        let (ctx, mut rx) = CommandContext::new("s", "u", "test", "");
        command(ctx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "Usage: /reload-plugin <plugin-id>");

        let (ctx, mut rx) = CommandContext::new("s", "u", "test", "ghost");
        command(ctx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), NOT_INITIALIZED);

        handle.set_reloader(Arc::new(PluginReloader::new(Arc::clone(&loader))));
        let (ctx, mut rx) = CommandContext::new("s", "u", "test", "ghost");
        command(ctx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "Reloading plugin: ghost...");
        assert_eq!(
            rx.recv().await.unwrap(),
            "Failed to reload ghost: plugin ghost is not loaded"
        );
    }

    #[tokio::test]
    async fn watch_endpoints() {
        let (loader, handle) = setup(None).await;
        let reloader = Arc::new(PluginReloader::new(Arc::clone(&loader)));
        handle.set_reloader(Arc::clone(&reloader));
        handle.set_watcher(Arc::new(ReloadWatcher::new(reloader, WatcherOptions::default())));

        let dir = tempfile::tempdir().unwrap();
        let body = json!({"pluginId": "echo", "path": dir.path()});
        let (status, value) = call(&loader, post(WATCH_PATH, &body, None)).await;
        assert_eq!(status, 200);
        assert_eq!(value["success"], true);

        let (status, _) = call(&loader, post(WATCH_PATH, &body, None)).await;
        assert_eq!(status, 400);

        let (status, _) = call(&loader, post(WATCH_PATH, &json!({"pluginId": "ghost"}), None)).await;
        assert_eq!(status, 404);

        let get = HttpRequest {
            method: "GET".to_string(),
            path: WATCH_PATH.to_string(),
            ..HttpRequest::default()
        };
        let (_, value) = call(&loader, get).await;
        assert_eq!(value["watched"], json!(["echo"]));

        let delete = HttpRequest {
            method: "DELETE".to_string(),
            path: WATCH_PATH.to_string(),
            query: HashMap::from([("pluginId".to_string(), "echo".to_string())]),
            ..HttpRequest::default()
        };
        let (status, value) = call(&loader, delete).await;
        assert_eq!(status, 200);
        assert_eq!(value["success"], true);
    }
}
