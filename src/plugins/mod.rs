//! Plugin runtime
//!
//! Plugins are discovered from `plugin.json` manifests in the configured
//! plugin directories and the global plugin directory, loaded into a shared
//! [`PluginRegistry`], and can be torn down and reloaded while the gateway
//! runs. External plugins run as subprocesses speaking line-delimited JSON
//! over stdio; builtins are compiled in.

pub mod api;
pub mod builtin;
pub mod discovery;
pub mod factory;
pub mod hooks;
pub mod loader;
pub mod manifest;
pub mod process;
pub mod registry;
pub mod reloader;
pub mod types;
pub mod watcher;

pub use api::{DetachedContext, DispatchOutcome, GatewayContext, MessageMode, PluginApi};
pub use builtin::{HotReloadHandle, default_builtins};
pub use discovery::{DiscoveryCandidate, PluginSource, discover, plugin_roots};
pub use factory::{BuiltinPlugin, Plugin, PluginFactory};
pub use hooks::{HookRegistration, HookRegistry};
pub use loader::{LoadFailure, LoadReport, LoadedPluginInfo, PluginLoader};
pub use manifest::{MANIFEST_FILE, PluginManifest};
pub use process::{PluginImporter, ProcessImporter};
pub use registry::{
    Facet, PluginFootprint, PluginRegistry, RegistrationConflict, Resolution, RouteInfo,
};
pub use reloader::{PluginReloader, Reload, ReloadError, ReloadResult};
pub use types::{
    BackgroundService, ChannelCapabilities, ChannelPlugin, CliProgram, CommandContext, HookEvent,
    HookPayload, HttpRequest, HttpResponse, InboundMessage, MethodContext, OutboundMessage,
    ToolContext, ToolDefinition, ToolPlugin, ToolResult,
};
pub use watcher::{ReloadWatcher, WatcherOptions};
