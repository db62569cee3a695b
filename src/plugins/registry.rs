//! Plugin registry - every contribution made by every loaded plugin
//!
//! The registry is a cheap clonable handle over shared state. Every mutation
//! takes the write lock once, completes without yielding and releases it, so
//! readers never observe a half-registered or half-removed plugin. Reads are
//! public; writes are reachable only through [`PluginApi`](super::PluginApi)
//! and plugin teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use serde::Serialize;

use super::hooks::{HookRegistry, run_handlers};
use super::types::{
    BackgroundService, ChannelPlugin, CliProgram, CliRegistrar, CommandHandler,
    GatewayMethodHandler, HookEvent, HookHandler, HookPayload, HttpHandler, ToolPlugin,
    normalize_command,
};

/// Registry facet a contribution lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Channel,
    Tool,
    HttpRoute,
    GatewayMethod,
    Command,
}

/// How a duplicate registration was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The existing entry was kept, the new one dropped
    Skipped,
    /// The new entry replaced the existing one
    Overwritten,
    /// Both entries were kept; the earlier one matches first
    Duplicate,
}

/// A duplicate registration observed while loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConflict {
    pub facet: Facet,
    pub key: String,
    pub plugin_id: String,
    pub existing_plugin_id: String,
    pub resolution: Resolution,
}

/// Summary of what a plugin currently has registered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginFootprint {
    pub channels: Vec<String>,
    pub tools: Vec<String>,
    pub hooks: Vec<HookEvent>,
    pub http_routes: Vec<String>,
    pub gateway_methods: Vec<String>,
    pub commands: Vec<String>,
    pub services: Vec<String>,
    pub cli_registrars: usize,
}

impl PluginFootprint {
    /// Nothing is registered under this plugin
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
            && self.tools.is_empty()
            && self.hooks.is_empty()
            && self.http_routes.is_empty()
            && self.gateway_methods.is_empty()
            && self.commands.is_empty()
            && self.services.is_empty()
            && self.cli_registrars == 0
    }
}

/// Registered HTTP route, without its handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub method: String,
    pub path: String,
    pub plugin_id: String,
}

/// Live objects removed by a teardown that may need stopping
#[derive(Default)]
pub(crate) struct Removed {
    pub channels: Vec<Arc<dyn ChannelPlugin>>,
    pub services: Vec<Arc<dyn BackgroundService>>,
}

struct Owned<T> {
    plugin_id: String,
    value: T,
}

fn owned_keys<T>(map: &IndexMap<String, Owned<T>>, plugin_id: &str) -> Vec<String> {
    map.iter()
        .filter(|(_, o)| o.plugin_id == plugin_id)
        .map(|(k, _)| k.clone())
        .collect()
}

struct Route {
    method: String,
    path: String,
    plugin_id: String,
    handler: HttpHandler,
}

#[derive(Default)]
struct RegistryState {
    channels: IndexMap<String, Owned<Arc<dyn ChannelPlugin>>>,
    tools: IndexMap<String, Owned<Arc<dyn ToolPlugin>>>,
    hooks: HookRegistry,
    http_routes: Vec<Route>,
    gateway_methods: IndexMap<String, Owned<GatewayMethodHandler>>,
    commands: IndexMap<String, Owned<CommandHandler>>,
    services: Vec<Owned<Arc<dyn BackgroundService>>>,
    cli_registrars: Vec<Owned<CliRegistrar>>,
    conflicts: Vec<RegistrationConflict>,
}

impl RegistryState {
    fn conflict(
        &mut self,
        facet: Facet,
        key: &str,
        plugin_id: &str,
        existing: &str,
        resolution: Resolution,
    ) {
        tracing::warn!(
            facet = ?facet,
            key = %key,
            plugin_id = %plugin_id,
            existing_plugin_id = %existing,
            resolution = ?resolution,
            "duplicate plugin registration"
        );
        self.conflicts.push(RegistrationConflict {
            facet,
            key: key.to_string(),
            plugin_id: plugin_id.to_string(),
            existing_plugin_id: existing.to_string(),
            resolution,
        });
    }
}

/// Shared registry of plugin contributions
#[derive(Clone, Default)]
pub struct PluginRegistry {
    state: Arc<RwLock<RegistryState>>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("PluginRegistry")
            .field("channels", &state.channels.len())
            .field("tools", &state.tools.len())
            .field("http_routes", &state.http_routes.len())
            .field("gateway_methods", &state.gateway_methods.len())
            .field("commands", &state.commands.len())
            .field("services", &state.services.len())
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Whether channels and services have been started by the gateway
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn channel(&self, id: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.read().channels.get(id).map(|c| Arc::clone(&c.value))
    }

    /// Plugin that owns channel `id`
    #[must_use]
    pub fn channel_owner(&self, id: &str) -> Option<String> {
        self.read().channels.get(id).map(|c| c.plugin_id.clone())
    }

    /// All channels in registration order
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<dyn ChannelPlugin>> {
        self.read()
            .channels
            .values()
            .map(|c| Arc::clone(&c.value))
            .collect()
    }

    /// Channels owned by `plugin_id`
    #[must_use]
    pub fn channels_of(&self, plugin_id: &str) -> Vec<Arc<dyn ChannelPlugin>> {
        self.read()
            .channels
            .values()
            .filter(|c| c.plugin_id == plugin_id)
            .map(|c| Arc::clone(&c.value))
            .collect()
    }

    #[must_use]
    pub fn tool(&self, name: &str) -> Option<Arc<dyn ToolPlugin>> {
        self.read().tools.get(name).map(|t| Arc::clone(&t.value))
    }

    #[must_use]
    pub fn tools(&self) -> Vec<Arc<dyn ToolPlugin>> {
        self.read()
            .tools
            .values()
            .map(|t| Arc::clone(&t.value))
            .collect()
    }

    /// First route matching `method` and `path` exactly
    #[must_use]
    pub fn find_route(&self, method: &str, path: &str) -> Option<HttpHandler> {
        let method = method.to_ascii_uppercase();
        self.read()
            .http_routes
            .iter()
            .find(|r| r.method == method && r.path == path)
            .map(|r| Arc::clone(&r.handler))
    }

    #[must_use]
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.read()
            .http_routes
            .iter()
            .map(|r| RouteInfo {
                method: r.method.clone(),
                path: r.path.clone(),
                plugin_id: r.plugin_id.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn gateway_method(&self, name: &str) -> Option<GatewayMethodHandler> {
        self.read()
            .gateway_methods
            .get(name)
            .map(|m| Arc::clone(&m.value))
    }

    #[must_use]
    pub fn gateway_method_names(&self) -> Vec<String> {
        self.read().gateway_methods.keys().cloned().collect()
    }

    /// Command handler by name; the name is normalized first
    #[must_use]
    pub fn command(&self, name: &str) -> Option<CommandHandler> {
        self.read()
            .commands
            .get(&normalize_command(name))
            .map(|c| Arc::clone(&c.value))
    }

    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        self.read().commands.keys().cloned().collect()
    }

    #[must_use]
    pub fn services(&self) -> Vec<Arc<dyn BackgroundService>> {
        self.read()
            .services
            .iter()
            .map(|s| Arc::clone(&s.value))
            .collect()
    }

    /// Services owned by `plugin_id`
    #[must_use]
    pub fn services_of(&self, plugin_id: &str) -> Vec<Arc<dyn BackgroundService>> {
        self.read()
            .services
            .iter()
            .filter(|s| s.plugin_id == plugin_id)
            .map(|s| Arc::clone(&s.value))
            .collect()
    }

    /// Build a CLI program by running every registrar in registration order
    #[must_use]
    pub fn cli_program(&self) -> CliProgram {
        let registrars: Vec<(String, CliRegistrar)> = self
            .read()
            .cli_registrars
            .iter()
            .map(|r| (r.plugin_id.clone(), Arc::clone(&r.value)))
            .collect();

        let mut program = CliProgram::new();
        for (plugin_id, registrar) in registrars {
            tracing::trace!(plugin_id = %plugin_id, "running cli registrar");
            registrar(&mut program);
        }
        program
    }

    #[must_use]
    pub fn has_hooks(&self, event: HookEvent) -> bool {
        self.read().hooks.has_handlers(event)
    }

    /// `(event, plugin_id)` for every hook registration
    #[must_use]
    pub fn hook_registrations(&self) -> Vec<(HookEvent, String)> {
        self.read().hooks.registered()
    }

    /// Dispatch a hook payload to its subscribers
    ///
    /// The handler list is copied before the first handler runs, so a handler
    /// that reloads a plugin cannot disturb the iteration.
    pub async fn dispatch_hook(&self, payload: &HookPayload) {
        let snapshot = self.read().hooks.snapshot(payload.event());
        if snapshot.is_empty() {
            return;
        }
        tracing::debug!(event = %payload.event(), handlers = snapshot.len(), "dispatching hook");
        run_handlers(snapshot, payload).await;
    }

    /// Duplicate registrations recorded so far
    #[must_use]
    pub fn conflicts(&self) -> Vec<RegistrationConflict> {
        self.read().conflicts.clone()
    }

    /// Everything currently registered by `plugin_id`
    #[must_use]
    pub fn footprint(&self, plugin_id: &str) -> PluginFootprint {
        let state = self.read();

        PluginFootprint {
            channels: owned_keys(&state.channels, plugin_id),
            tools: owned_keys(&state.tools, plugin_id),
            hooks: state
                .hooks
                .registered()
                .into_iter()
                .filter(|(_, owner)| owner == plugin_id)
                .map(|(event, _)| event)
                .collect(),
            http_routes: state
                .http_routes
                .iter()
                .filter(|r| r.plugin_id == plugin_id)
                .map(|r| format!("{} {}", r.method, r.path))
                .collect(),
            gateway_methods: owned_keys(&state.gateway_methods, plugin_id),
            commands: owned_keys(&state.commands, plugin_id),
            services: state
                .services
                .iter()
                .filter(|s| s.plugin_id == plugin_id)
                .map(|s| s.value.name().to_string())
                .collect(),
            cli_registrars: state
                .cli_registrars
                .iter()
                .filter(|r| r.plugin_id == plugin_id)
                .count(),
        }
    }

    // ─── Writes ─────────────────────────────────────────────────────────

    /// Register a channel; returns `false` if the id is already taken
    pub(crate) fn add_channel(&self, plugin_id: &str, channel: Arc<dyn ChannelPlugin>) -> bool {
        let id = channel.id().to_string();
        let mut state = self.write();
        if let Some(existing) = state.channels.get(&id) {
            let existing = existing.plugin_id.clone();
            state.conflict(Facet::Channel, &id, plugin_id, &existing, Resolution::Skipped);
            return false;
        }
        state.channels.insert(
            id,
            Owned {
                plugin_id: plugin_id.to_string(),
                value: channel,
            },
        );
        true
    }

    pub(crate) fn add_tool(&self, plugin_id: &str, tool: Arc<dyn ToolPlugin>) {
        let name = tool.name().to_string();
        let mut state = self.write();
        let previous = state.tools.insert(
            name.clone(),
            Owned {
                plugin_id: plugin_id.to_string(),
                value: tool,
            },
        );
        if let Some(previous) = previous {
            state.conflict(
                Facet::Tool,
                &name,
                plugin_id,
                &previous.plugin_id,
                Resolution::Overwritten,
            );
        }
    }

    pub(crate) fn add_hook(&self, plugin_id: &str, events: &[HookEvent], handler: &HookHandler) {
        self.write().hooks.register(plugin_id, events, handler);
    }

    pub(crate) fn add_route(&self, plugin_id: &str, method: &str, path: &str, handler: HttpHandler) {
        let method = method.to_ascii_uppercase();
        let mut state = self.write();
        let existing = state
            .http_routes
            .iter()
            .find(|r| r.method == method && r.path == path)
            .map(|r| r.plugin_id.clone());
        if let Some(existing) = existing {
            state.conflict(
                Facet::HttpRoute,
                &format!("{method} {path}"),
                plugin_id,
                &existing,
                Resolution::Duplicate,
            );
        }
        state.http_routes.push(Route {
            method,
            path: path.to_string(),
            plugin_id: plugin_id.to_string(),
            handler,
        });
    }

    pub(crate) fn add_gateway_method(
        &self,
        plugin_id: &str,
        name: &str,
        handler: GatewayMethodHandler,
    ) {
        let mut state = self.write();
        let previous = state.gateway_methods.insert(
            name.to_string(),
            Owned {
                plugin_id: plugin_id.to_string(),
                value: handler,
            },
        );
        if let Some(previous) = previous {
            state.conflict(
                Facet::GatewayMethod,
                name,
                plugin_id,
                &previous.plugin_id,
                Resolution::Overwritten,
            );
        }
    }

    /// Register a command; empty names (after normalization) are ignored
    pub(crate) fn add_command(&self, plugin_id: &str, name: &str, handler: CommandHandler) -> bool {
        let name = normalize_command(name);
        if name.is_empty() {
            tracing::warn!(plugin_id = %plugin_id, "ignoring command with empty name");
            return false;
        }
        let mut state = self.write();
        let previous = state.commands.insert(
            name.clone(),
            Owned {
                plugin_id: plugin_id.to_string(),
                value: handler,
            },
        );
        if let Some(previous) = previous {
            state.conflict(
                Facet::Command,
                &name,
                plugin_id,
                &previous.plugin_id,
                Resolution::Overwritten,
            );
        }
        true
    }

    pub(crate) fn add_service(&self, plugin_id: &str, service: Arc<dyn BackgroundService>) {
        self.write().services.push(Owned {
            plugin_id: plugin_id.to_string(),
            value: service,
        });
    }

    pub(crate) fn add_cli(&self, plugin_id: &str, registrar: CliRegistrar) {
        self.write().cli_registrars.push(Owned {
            plugin_id: plugin_id.to_string(),
            value: registrar,
        });
    }

    /// Remove every entry owned by `plugin_id` across all facets
    ///
    /// Completes under a single write lock. Idempotent: tearing down a plugin
    /// with nothing registered is a no-op. Returns the channels and services
    /// that were removed so the caller can stop them.
    pub(crate) fn teardown(&self, plugin_id: &str) -> Removed {
        let mut state = self.write();
        let mut removed = Removed::default();

        let channels = std::mem::take(&mut state.channels);
        for (id, entry) in channels {
            if entry.plugin_id == plugin_id {
                removed.channels.push(entry.value);
            } else {
                state.channels.insert(id, entry);
            }
        }

        state.tools.retain(|_, t| t.plugin_id != plugin_id);
        let hooks = state.hooks.remove_by_plugin(plugin_id);
        state.http_routes.retain(|r| r.plugin_id != plugin_id);
        state.gateway_methods.retain(|_, m| m.plugin_id != plugin_id);
        state.commands.retain(|_, c| c.plugin_id != plugin_id);

        let services = std::mem::take(&mut state.services);
        for entry in services {
            if entry.plugin_id == plugin_id {
                removed.services.push(entry.value);
            } else {
                state.services.push(entry);
            }
        }

        state.cli_registrars.retain(|r| r.plugin_id != plugin_id);
        drop(state);

        tracing::debug!(
            plugin_id = %plugin_id,
            channels = removed.channels.len(),
            services = removed.services.len(),
            hooks,
            "plugin registrations removed"
        );

        removed
    }
}
