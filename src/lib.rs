//! Plexus Gateway - multi-channel agent gateway with a hot-reloadable plugin runtime
//!
//! Channels, tools, hooks, HTTP routes, gateway methods, commands, services
//! and CLI commands are all contributed by plugins. External plugins are
//! discovered on disk and run as subprocesses; builtins are compiled in.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        HTTP API  │  RPC  │  Commands  │  CLI         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                     Gateway                         │
//! │   Loader  │  Reloader  │  Watcher  │  Registry      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   Plugins (subprocess over stdio JSON, builtins)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod plugins;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayBuilder};
pub use plugins::{
    HookEvent, HookPayload, LoadReport, Plugin, PluginApi, PluginFactory, PluginLoader,
    PluginManifest, PluginRegistry, PluginReloader, ReloadResult, ReloadWatcher,
};
