//! Gateway runtime
//!
//! Owns the plugin registry and the loader, reloader and watcher that act on
//! it, and drives the plugin lifecycle: load, start channels and services,
//! serve commands, methods and routes, stop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;

use crate::config::Config;
use crate::plugins::{
    BuiltinPlugin, CliProgram, CommandContext, GatewayContext, HookPayload, HotReloadHandle,
    HttpRequest, HttpResponse, LoadReport, MethodContext, PluginImporter, PluginLoader,
    PluginRegistry, PluginReloader, Reload, ReloadWatcher, WatcherOptions, default_builtins,
};
use crate::{Error, Result};

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    config: Config,
    context: Option<Arc<dyn GatewayContext>>,
    importer: Option<Arc<dyn PluginImporter>>,
    builtins: Vec<BuiltinPlugin>,
}

impl GatewayBuilder {
    /// Attach the collaborator that backs session and dispatch operations
    #[must_use]
    pub fn context(mut self, ctx: Arc<dyn GatewayContext>) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Replace the subprocess importer
    #[must_use]
    pub fn importer(mut self, importer: Arc<dyn PluginImporter>) -> Self {
        self.importer = Some(importer);
        self
    }

    /// Add a builtin, loaded after the default builtins
    #[must_use]
    pub fn builtin(mut self, builtin: BuiltinPlugin) -> Self {
        self.builtins.push(builtin);
        self
    }

    #[must_use]
    pub fn build(self) -> Gateway {
        let config = Arc::new(self.config);
        let registry = PluginRegistry::new();
        let hot_reload = HotReloadHandle::new();

        let mut builtins = default_builtins(&hot_reload);
        builtins.extend(self.builtins);

        let mut loader =
            PluginLoader::new(Arc::clone(&config), registry.clone()).with_builtins(builtins);
        if let Some(ctx) = self.context {
            loader = loader.with_context(ctx);
        }
        if let Some(importer) = self.importer {
            loader = loader.with_importer(importer);
        }
        let loader = Arc::new(loader);

        let reloader = Arc::new(PluginReloader::new(Arc::clone(&loader)));
        let trigger: Arc<dyn Reload> = reloader.clone();
        let watcher = Arc::new(ReloadWatcher::new(
            trigger,
            WatcherOptions::from(&config.plugins.watch),
        ));

        Gateway {
            config,
            registry,
            loader,
            reloader,
            watcher,
            hot_reload,
        }
    }
}

/// The plugin-hosting gateway
pub struct Gateway {
    config: Arc<Config>,
    registry: PluginRegistry,
    loader: Arc<PluginLoader>,
    reloader: Arc<PluginReloader>,
    watcher: Arc<ReloadWatcher>,
    hot_reload: HotReloadHandle,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("registry", &self.registry)
            .field("loader", &self.loader)
            .field("watcher", &self.watcher)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Gateway with the default importer, builtins and a detached context
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder {
            config,
            context: None,
            importer: None,
            builtins: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    #[must_use]
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    #[must_use]
    pub fn reloader(&self) -> &Arc<PluginReloader> {
        &self.reloader
    }

    #[must_use]
    pub fn watcher(&self) -> &Arc<ReloadWatcher> {
        &self.watcher
    }

    /// Load plugins without starting anything
    ///
    /// External plugins load first, then builtins. The hot reload surfaces
    /// become usable once this returns.
    pub async fn load_plugins(&self) -> LoadReport {
        let mut report = self.loader.load_all().await;
        let builtins = self.loader.load_builtins().await;
        report.loaded.extend(builtins.loaded);
        report.errors.extend(builtins.errors);

        self.hot_reload.set_reloader(Arc::clone(&self.reloader));
        self.hot_reload.set_watcher(Arc::clone(&self.watcher));

        for conflict in self.registry.conflicts() {
            tracing::warn!(
                facet = ?conflict.facet,
                key = %conflict.key,
                plugin_id = %conflict.plugin_id,
                existing = %conflict.existing_plugin_id,
                resolution = ?conflict.resolution,
                "plugin registration conflict"
            );
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.errors.len(),
            "plugins loaded"
        );
        report
    }

    /// Load plugins, then start the gateway lifecycle
    ///
    /// Dispatches `gateway_start`, starts every channel and service, and
    /// watches external plugins when watching is enabled. Start failures are
    /// logged per channel or service.
    pub async fn start(&self) -> LoadReport {
        if self.registry.is_running() {
            tracing::warn!("gateway already running");
            return LoadReport::default();
        }

        let report = self.load_plugins().await;

        self.registry.dispatch_hook(&HookPayload::GatewayStart).await;

        for channel in self.registry.channels() {
            if let Err(e) = channel.start().await {
                tracing::error!(channel = %channel.id(), error = %e, "failed to start channel");
            }
        }
        for service in self.registry.services() {
            if let Err(e) = service.start().await {
                tracing::error!(service = %service.name(), error = %e, "failed to start service");
            }
        }

        self.registry.set_running(true);

        if self.config.plugins.watch.enabled {
            for info in self.loader.loaded_plugins() {
                let Some(dir) = info.path else { continue };
                if let Err(e) = self.watcher.watch(&info.manifest.id, &dir) {
                    tracing::warn!(plugin_id = %info.manifest.id, error = %e, "failed to watch plugin");
                }
            }
        }

        tracing::info!("gateway started");
        report
    }

    /// Stop the gateway lifecycle and unload every plugin
    ///
    /// Plugins are torn down and forgotten; a later [`start`](Self::start)
    /// loads them afresh.
    pub async fn stop(&self) {
        self.watcher.stop_all();

        self.registry.dispatch_hook(&HookPayload::GatewayStop).await;

        if self.registry.is_running() {
            for service in self.registry.services() {
                if let Err(e) = service.stop().await {
                    tracing::warn!(service = %service.name(), error = %e, "failed to stop service");
                }
            }
            for channel in self.registry.channels() {
                if let Err(e) = channel.stop().await {
                    tracing::warn!(channel = %channel.id(), error = %e, "failed to stop channel");
                }
            }
        }
        self.registry.set_running(false);

        self.loader.unload_all().await;
        tracing::info!("gateway stopped");
    }

    /// Run a slash command if `text` names a registered one
    ///
    /// Returns `Ok(None)` when `text` is not a command or no plugin handles
    /// it, so the caller can route it elsewhere. Otherwise returns the
    /// replies the command produced.
    ///
    /// # Errors
    ///
    /// Returns error if the command handler fails or panics
    pub async fn execute_command(
        &self,
        text: &str,
        session_key: &str,
        sender_id: &str,
        channel: &str,
    ) -> Result<Option<Vec<String>>> {
        let Some((name, args)) = parse_command(text) else {
            return Ok(None);
        };
        let Some(handler) = self.registry.command(name) else {
            return Ok(None);
        };

        tracing::debug!(command = %name, session_key = %session_key, "executing command");
        let (ctx, mut replies) = CommandContext::new(session_key, sender_id, channel, args);

        let outcome = AssertUnwindSafe(async { handler(ctx).await }).catch_unwind().await;
        let result = flatten(name, outcome);

        let mut collected = Vec::new();
        while let Ok(reply) = replies.try_recv() {
            collected.push(reply);
        }

        result.map(|()| Some(collected))
    }

    /// Call a registered gateway method
    ///
    /// # Errors
    ///
    /// Returns error if no plugin registered the method, or the handler
    /// fails or panics
    pub async fn call_method(&self, name: &str, params: Value, ctx: MethodContext) -> Result<Value> {
        let handler = self
            .registry
            .gateway_method(name)
            .ok_or_else(|| Error::NotFound(format!("gateway method {name}")))?;

        let outcome = AssertUnwindSafe(async { handler(params, ctx).await }).catch_unwind().await;
        flatten(name, outcome)
    }

    /// Dispatch an HTTP request to a plugin route
    ///
    /// Returns `None` when no route matches. Handler failures become a 500.
    pub async fn handle_http(&self, req: HttpRequest) -> Option<HttpResponse> {
        let handler = self.registry.find_route(&req.method, &req.path)?;
        let route = format!("{} {}", req.method, req.path);

        let outcome = AssertUnwindSafe(async { handler(req).await }).catch_unwind().await;
        match flatten(&route, outcome) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!(route = %route, error = %e, "plugin route failed");
                Some(HttpResponse::text(500, "Internal Server Error"))
            }
        }
    }

    /// Commands contributed by plugins for the `run` subcommand
    #[must_use]
    pub fn cli_program(&self) -> CliProgram {
        self.registry.cli_program()
    }

    /// Run a plugin-contributed CLI command
    ///
    /// # Errors
    ///
    /// Returns error if no plugin contributed the command, or it fails
    pub async fn run_cli(&self, name: &str, args: Vec<String>) -> Result<()> {
        let program = self.cli_program();
        let command = program
            .find(name)
            .ok_or_else(|| Error::NotFound(format!("cli command {name}")))?;

        let outcome = AssertUnwindSafe(async { (command.handler)(args).await }).catch_unwind().await;
        flatten(name, outcome)
    }
}

/// Split `/name args` into a normalized-ready name and trimmed args
fn parse_command(text: &str) -> Option<(&str, &str)> {
    let rest = text.trim().strip_prefix('/')?;
    let (name, args) = rest
        .split_once(char::is_whitespace)
        .unwrap_or((rest, ""));
    if name.is_empty() {
        return None;
    }
    Some((name, args.trim()))
}

/// Collapse a caught handler outcome into a crate result
fn flatten<T>(
    name: &str,
    outcome: std::thread::Result<anyhow::Result<T>>,
) -> Result<T> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Handler {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::Handler {
            name: name.to_string(),
            reason: "handler panicked".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::future::Ready;

    use super::*;
    use crate::plugins::{PluginApi, PluginFactory};

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("/reload-plugin echo"), Some(("reload-plugin", "echo")));
        assert_eq!(parse_command("  /status  "), Some(("status", "")));
        assert_eq!(parse_command("/say  hello  world "), Some(("say", "hello  world")));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
    }

    #[test]
    fn flatten_maps_errors_and_panics() {
        let ok: std::thread::Result<anyhow::Result<u8>> = Ok(Ok(1));
        assert_eq!(flatten("x", ok).unwrap(), 1);

        let err: std::thread::Result<anyhow::Result<u8>> = Ok(Err(anyhow::anyhow!("boom")));
        assert_eq!(flatten("x", err).unwrap_err().to_string(), "handler x failed: boom");

        let panicked: std::thread::Result<anyhow::Result<u8>> = Err(Box::new("panic"));
        assert!(flatten("x", panicked).unwrap_err().to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn start_and_stop_with_only_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.plugins.global_dir = dir.path().to_path_buf();
        let gateway = Gateway::new(config);

        let report = gateway.start().await;
        assert_eq!(report.loaded, vec!["hot-reload"]);
        assert!(gateway.registry().is_running());

        let replies = gateway
            .execute_command("/reload-plugin", "s", "u", "test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replies, vec!["Usage: /reload-plugin <plugin-id>"]);

        assert!(gateway
            .execute_command("/unknown", "s", "u", "test")
            .await
            .unwrap()
            .is_none());

        gateway.stop().await;
        assert!(!gateway.registry().is_running());
        assert!(gateway.registry().command_names().is_empty());
        assert!(gateway.loader().loaded_plugins().is_empty());
    }

    #[tokio::test]
    async fn restart_after_stop_loads_plugins_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.plugins.global_dir = dir.path().to_path_buf();
        let gateway = Gateway::new(config);

        gateway.start().await;
        gateway.stop().await;

        let report = gateway.start().await;
        assert_eq!(report.loaded, vec!["hot-reload"]);
        let replies = gateway
            .execute_command("/reload-plugin", "s", "u", "test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replies, vec!["Usage: /reload-plugin <plugin-id>"]);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn handler_that_panics_before_returning_a_future_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.plugins.global_dir = dir.path().to_path_buf();
        let gateway = Gateway::builder(config)
            .builtin(BuiltinPlugin::new(
                "eager",
                "Eager",
                PluginFactory::function(|api: PluginApi| async move {
                    api.register_command("eager", |_| -> Ready<anyhow::Result<()>> {
                        panic!("eager command")
                    });
                    api.register_gateway_method(
                        "eager.call",
                        |_, _| -> Ready<anyhow::Result<Value>> { panic!("eager method") },
                    );
                    Ok(())
                }),
            ))
            .build();
        gateway.start().await;

        let err = gateway
            .execute_command("/eager", "s", "u", "test")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));

        let err = gateway
            .call_method("eager.call", Value::Null, MethodContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
        gateway.stop().await;
    }
}
