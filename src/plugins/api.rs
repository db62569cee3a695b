//! Capability object handed to each plugin during registration
//!
//! A [`PluginApi`] is bound to exactly one plugin id. Everything a plugin
//! registers through it is tagged with that id, which is what makes a later
//! teardown complete. Operational calls (dispatch, session control) are
//! delegated to a [`GatewayContext`] supplied by the host.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::discovery::PluginSource;
use super::manifest::PluginManifest;
use super::registry::PluginRegistry;
use super::types::{
    BackgroundService, ChannelPlugin, CliProgram, CommandContext, HookEvent, HookPayload,
    HttpRequest, HttpResponse, InboundMessage, MethodContext, ToolPlugin, command_handler,
    hook_handler, http_handler, method_handler,
};
use crate::config::Config;
use crate::{Error, Result};

/// Per-session message concurrency mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageMode {
    /// New messages steer the running agent turn
    Steer,
    /// New messages queue behind the running turn
    FollowUp,
    /// New messages abort the running turn
    Interrupt,
}

/// What happened to a dispatched inbound message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Injected into a running agent turn
    #[serde(default)]
    pub injected: bool,
    /// Queued for a later turn
    #[serde(default)]
    pub enqueued: bool,
}

/// Operations provided by the surrounding gateway
///
/// The session router, RPC pool and agent pipeline live outside the plugin
/// runtime. Every method has a default that reports the collaborator as
/// unavailable, so hosts only implement what they actually provide.
#[async_trait]
pub trait GatewayContext: Send + Sync {
    /// Dispatch an inbound message to the agent pipeline
    async fn dispatch(&self, _message: InboundMessage) -> Result<DispatchOutcome> {
        Err(Error::Unavailable("agent dispatch"))
    }

    async fn get_session_state(&self, _session_key: &str) -> Result<Option<Value>> {
        Err(Error::Unavailable("session store"))
    }

    async fn reset_session(&self, _session_key: &str) -> Result<()> {
        Err(Error::Unavailable("session router"))
    }

    async fn set_thinking_level(&self, _session_key: &str, _level: &str) -> Result<()> {
        Err(Error::Unavailable("rpc pool"))
    }

    async fn set_model(&self, _session_key: &str, _provider: &str, _model_id: &str) -> Result<()> {
        Err(Error::Unavailable("rpc pool"))
    }

    async fn compact_session(&self, _session_key: &str, _instructions: Option<&str>) -> Result<()> {
        Err(Error::Unavailable("rpc pool"))
    }

    async fn abort_session(&self, _session_key: &str) -> Result<()> {
        Err(Error::Unavailable("rpc pool"))
    }

    /// Forward a slash command to the agent bound to the session
    async fn forward_command(&self, _session_key: &str, _command: &str, _args: &str) -> Result<()> {
        Err(Error::Unavailable("rpc pool"))
    }

    async fn get_available_models(&self, _session_key: &str) -> Result<Vec<Value>> {
        Err(Error::Unavailable("rpc pool"))
    }

    async fn get_session_message_mode(&self, _session_key: &str) -> Result<MessageMode> {
        Err(Error::Unavailable("session router"))
    }

    async fn set_session_message_mode(&self, _session_key: &str, _mode: MessageMode) -> Result<()> {
        Err(Error::Unavailable("session router"))
    }
}

/// Gateway context with no collaborators attached
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedContext;

impl GatewayContext for DetachedContext {}

/// Registration and runtime access for one plugin
#[derive(Clone)]
pub struct PluginApi {
    id: String,
    manifest: PluginManifest,
    source: PluginSource,
    config: Arc<Config>,
    registry: PluginRegistry,
    ctx: Arc<dyn GatewayContext>,
}

impl std::fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginApi")
            .field("id", &self.id)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl PluginApi {
    pub(crate) fn new(
        manifest: PluginManifest,
        source: PluginSource,
        config: Arc<Config>,
        registry: PluginRegistry,
        ctx: Arc<dyn GatewayContext>,
    ) -> Self {
        Self {
            id: manifest.id.clone(),
            manifest,
            source,
            config,
            registry,
            ctx,
        }
    }

    // ─── Metadata ───────────────────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    #[must_use]
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    #[must_use]
    pub const fn source(&self) -> PluginSource {
        self.source
    }

    /// Gateway configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// This plugin's configuration blob from `plugins.config.<id>`
    #[must_use]
    pub fn plugin_config(&self) -> Option<&Value> {
        self.config.plugins.config.get(&self.id)
    }

    /// Read-only view of the registry
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Register a messaging channel
    ///
    /// Returns `false` when another plugin already owns the channel id; the
    /// rest of this plugin's registrations are unaffected.
    pub fn register_channel(&self, channel: Arc<dyn ChannelPlugin>) -> bool {
        let channel_id = channel.id().to_string();
        let added = self.registry.add_channel(&self.id, channel);
        if added {
            tracing::info!(plugin_id = %self.id, channel = %channel_id, "registered channel");
        }
        added
    }

    pub fn register_tool(&self, tool: Arc<dyn ToolPlugin>) {
        tracing::info!(plugin_id = %self.id, tool = %tool.name(), "registered tool");
        self.registry.add_tool(&self.id, tool);
    }

    /// Subscribe one handler to several hook events
    pub fn register_hook<F, Fut>(&self, events: &[HookEvent], handler: F)
    where
        F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        tracing::debug!(plugin_id = %self.id, events = ?events, "registered hook");
        self.registry
            .add_hook(&self.id, events, &hook_handler(handler));
    }

    /// Shorthand for [`register_hook`](Self::register_hook) with one event
    pub fn on<F, Fut>(&self, event: HookEvent, handler: F)
    where
        F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_hook(&[event], handler);
    }

    pub fn register_http_route<F, Fut>(&self, method: &str, path: &str, handler: F)
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HttpResponse>> + Send + 'static,
    {
        tracing::info!(plugin_id = %self.id, method = %method, path = %path, "registered http route");
        self.registry
            .add_route(&self.id, method, path, http_handler(handler));
    }

    pub fn register_gateway_method<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value, MethodContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        tracing::info!(plugin_id = %self.id, method = %name, "registered gateway method");
        self.registry
            .add_gateway_method(&self.id, name, method_handler(handler));
    }

    /// Register a slash command; the name is normalized (`/Foo` becomes `foo`)
    pub fn register_command<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self
            .registry
            .add_command(&self.id, name, command_handler(handler))
        {
            tracing::info!(plugin_id = %self.id, command = %name, "registered command");
        }
    }

    pub fn register_service(&self, service: Arc<dyn BackgroundService>) {
        tracing::info!(plugin_id = %self.id, service = %service.name(), "registered service");
        self.registry.add_service(&self.id, service);
    }

    pub fn register_cli<F>(&self, registrar: F)
    where
        F: Fn(&mut CliProgram) + Send + Sync + 'static,
    {
        tracing::info!(plugin_id = %self.id, "registered cli commands");
        self.registry.add_cli(&self.id, Arc::new(registrar));
    }

    // ─── Runtime ────────────────────────────────────────────────────────

    /// Dispatch an inbound message to the agent pipeline
    ///
    /// # Errors
    ///
    /// Returns error if no dispatcher is attached or dispatch fails
    pub async fn dispatch(&self, message: InboundMessage) -> Result<DispatchOutcome> {
        self.ctx.dispatch(message).await
    }

    /// Send text through a registered channel
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not registered or the send fails
    pub async fn send_to_channel(&self, channel: &str, target: &str, text: &str) -> Result<()> {
        let ch = self
            .registry
            .channel(channel)
            .ok_or_else(|| Error::Channel(format!("channel not found: {channel}")))?;
        ch.send_text(target, text)
            .await
            .map_err(|e| Error::Channel(format!("{channel}: {e}")))
    }

    /// # Errors
    ///
    /// Returns error if no session store is attached
    pub async fn get_session_state(&self, session_key: &str) -> Result<Option<Value>> {
        self.ctx.get_session_state(session_key).await
    }

    /// # Errors
    ///
    /// Returns error if no session router is attached
    pub async fn reset_session(&self, session_key: &str) -> Result<()> {
        self.ctx.reset_session(session_key).await
    }

    /// # Errors
    ///
    /// Returns error if no RPC pool is attached
    pub async fn set_thinking_level(&self, session_key: &str, level: &str) -> Result<()> {
        self.ctx.set_thinking_level(session_key, level).await
    }

    /// # Errors
    ///
    /// Returns error if no RPC pool is attached
    pub async fn set_model(&self, session_key: &str, provider: &str, model_id: &str) -> Result<()> {
        self.ctx.set_model(session_key, provider, model_id).await
    }

    /// # Errors
    ///
    /// Returns error if no RPC pool is attached
    pub async fn compact_session(&self, session_key: &str, instructions: Option<&str>) -> Result<()> {
        self.ctx.compact_session(session_key, instructions).await
    }

    /// # Errors
    ///
    /// Returns error if no RPC pool is attached
    pub async fn abort_session(&self, session_key: &str) -> Result<()> {
        self.ctx.abort_session(session_key).await
    }

    /// # Errors
    ///
    /// Returns error if no RPC pool is attached
    pub async fn forward_command(&self, session_key: &str, command: &str, args: &str) -> Result<()> {
        tracing::info!(plugin_id = %self.id, session_key = %session_key, command = %command, "forwarding command");
        self.ctx.forward_command(session_key, command, args).await
    }

    /// # Errors
    ///
    /// Returns error if no RPC pool is attached
    pub async fn get_available_models(&self, session_key: &str) -> Result<Vec<Value>> {
        self.ctx.get_available_models(session_key).await
    }

    /// # Errors
    ///
    /// Returns error if no session router is attached
    pub async fn get_session_message_mode(&self, session_key: &str) -> Result<MessageMode> {
        self.ctx.get_session_message_mode(session_key).await
    }

    /// # Errors
    ///
    /// Returns error if no session router is attached
    pub async fn set_session_message_mode(&self, session_key: &str, mode: MessageMode) -> Result<()> {
        self.ctx.set_session_message_mode(session_key, mode).await
    }

    // ─── Logging ────────────────────────────────────────────────────────

    pub fn log_debug(&self, message: &str) {
        tracing::debug!(plugin_id = %self.id, "{message}");
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(plugin_id = %self.id, "{message}");
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(plugin_id = %self.id, "{message}");
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(plugin_id = %self.id, "{message}");
    }
}
