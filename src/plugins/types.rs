//! Types shared between the plugin runtime and plugin authors
//!
//! Handlers registered through [`PluginApi`](super::PluginApi) are stored as
//! reference-counted trait objects so that readers can clone a handler out of
//! the registry and call it without holding any registry lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

// ─── Hooks ──────────────────────────────────────────────────────────────────

/// Lifecycle events plugins can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeAgentStart,
    AgentEnd,
    MessageReceived,
    MessageSending,
    MessageSent,
    BeforeToolCall,
    AfterToolCall,
    ToolResultPersist,
    SessionStart,
    SessionEnd,
    SessionReset,
    BeforeCompaction,
    AfterCompaction,
    GatewayStart,
    GatewayStop,
}

impl HookEvent {
    /// Every event, in declaration order
    pub const ALL: [Self; 15] = [
        Self::BeforeAgentStart,
        Self::AgentEnd,
        Self::MessageReceived,
        Self::MessageSending,
        Self::MessageSent,
        Self::BeforeToolCall,
        Self::AfterToolCall,
        Self::ToolResultPersist,
        Self::SessionStart,
        Self::SessionEnd,
        Self::SessionReset,
        Self::BeforeCompaction,
        Self::AfterCompaction,
        Self::GatewayStart,
        Self::GatewayStop,
    ];

    /// Wire name, e.g. `gateway_stop`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeAgentStart => "before_agent_start",
            Self::AgentEnd => "agent_end",
            Self::MessageReceived => "message_received",
            Self::MessageSending => "message_sending",
            Self::MessageSent => "message_sent",
            Self::BeforeToolCall => "before_tool_call",
            Self::AfterToolCall => "after_tool_call",
            Self::ToolResultPersist => "tool_result_persist",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::SessionReset => "session_reset",
            Self::BeforeCompaction => "before_compaction",
            Self::AfterCompaction => "after_compaction",
            Self::GatewayStart => "gateway_start",
            Self::GatewayStop => "gateway_stop",
        }
    }

    /// Parse a wire name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == s)
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message arriving from a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Message leaving through a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub target: String,
    pub text: String,
}

/// Typed payload for each [`HookEvent`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookPayload {
    BeforeAgentStart {
        session_key: String,
        message: String,
    },
    AgentEnd {
        session_key: String,
        messages: Vec<Value>,
        stop_reason: String,
    },
    MessageReceived {
        message: InboundMessage,
    },
    MessageSending {
        message: OutboundMessage,
    },
    MessageSent {
        message: OutboundMessage,
    },
    BeforeToolCall {
        session_key: String,
        tool_name: String,
        args: Value,
    },
    AfterToolCall {
        session_key: String,
        tool_name: String,
        result: Value,
        is_error: bool,
    },
    ToolResultPersist {
        session_key: String,
        tool_name: String,
        result: Value,
    },
    SessionStart {
        session_key: String,
    },
    SessionEnd {
        session_key: String,
    },
    SessionReset {
        session_key: String,
    },
    BeforeCompaction {
        session_key: String,
    },
    AfterCompaction {
        session_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    GatewayStart,
    GatewayStop,
}

impl HookPayload {
    /// Event this payload is dispatched under
    #[must_use]
    pub const fn event(&self) -> HookEvent {
        match self {
            Self::BeforeAgentStart { .. } => HookEvent::BeforeAgentStart,
            Self::AgentEnd { .. } => HookEvent::AgentEnd,
            Self::MessageReceived { .. } => HookEvent::MessageReceived,
            Self::MessageSending { .. } => HookEvent::MessageSending,
            Self::MessageSent { .. } => HookEvent::MessageSent,
            Self::BeforeToolCall { .. } => HookEvent::BeforeToolCall,
            Self::AfterToolCall { .. } => HookEvent::AfterToolCall,
            Self::ToolResultPersist { .. } => HookEvent::ToolResultPersist,
            Self::SessionStart { .. } => HookEvent::SessionStart,
            Self::SessionEnd { .. } => HookEvent::SessionEnd,
            Self::SessionReset { .. } => HookEvent::SessionReset,
            Self::BeforeCompaction { .. } => HookEvent::BeforeCompaction,
            Self::AfterCompaction { .. } => HookEvent::AfterCompaction,
            Self::GatewayStart => HookEvent::GatewayStart,
            Self::GatewayStop => HookEvent::GatewayStop,
        }
    }
}

/// Hook handler
pub type HookHandler = Arc<dyn Fn(HookPayload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`HookHandler`]
pub fn hook_handler<F, Fut>(f: F) -> HookHandler
where
    F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

// ─── Channels ───────────────────────────────────────────────────────────────

/// Features a channel declares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ChannelCapabilities {
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub thread: bool,
    #[serde(default)]
    pub media: bool,
}

/// Messaging channel contributed by a plugin
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Unique channel identifier, e.g. "telegram"
    fn id(&self) -> &str;

    /// Human-readable label
    fn label(&self) -> &str;

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::default()
    }

    /// Start receiving messages
    async fn start(&self) -> anyhow::Result<()>;

    /// Graceful shutdown
    async fn stop(&self) -> anyhow::Result<()>;

    /// Send text to a channel-specific target
    async fn send_text(&self, target: &str, text: &str) -> anyhow::Result<()>;
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// A single tool exposed to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Context passed to tool execution
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_key: String,
}

/// Tool output block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Result of running a tool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Single text block result
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text".to_string(),
                text: Some(text.into()),
            }],
            is_error: false,
        }
    }
}

/// Tool provider contributed by a plugin
#[async_trait]
pub trait ToolPlugin: Send + Sync {
    /// Registry key for this tool provider
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Tools this provider exposes
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(
        &self,
        tool_name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolResult>;
}

// ─── Services ───────────────────────────────────────────────────────────────

/// Background service contributed by a plugin
#[async_trait]
pub trait BackgroundService: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Invocation context for a slash command
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub session_key: String,
    pub sender_id: String,
    pub channel: String,
    /// Everything after the command name, trimmed
    pub args: String,
    replies: mpsc::UnboundedSender<String>,
}

impl CommandContext {
    /// Create a context; replies are delivered on the returned receiver
    #[must_use]
    pub fn new(
        session_key: impl Into<String>,
        sender_id: impl Into<String>,
        channel: impl Into<String>,
        args: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            session_key: session_key.into(),
            sender_id: sender_id.into(),
            channel: channel.into(),
            args: args.into(),
            replies: tx,
        };
        (ctx, rx)
    }

    /// Send a reply to whoever issued the command
    pub fn respond(&self, text: impl Into<String>) {
        // Receiver dropped means the caller stopped listening
        let _ = self.replies.send(text.into());
    }
}

/// Slash command handler
pub type CommandHandler =
    Arc<dyn Fn(CommandContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`CommandHandler`]
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Normalize a command name: strip a leading `/`, trim, lowercase
#[must_use]
pub fn normalize_command(name: &str) -> String {
    name.trim().trim_start_matches('/').trim().to_lowercase()
}

// ─── HTTP ───────────────────────────────────────────────────────────────────

/// HTTP request handed to a plugin route
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// Uppercase method
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Lowercase header names
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Bearer token from the `Authorization` header
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    /// Parse the body as JSON
    ///
    /// # Errors
    ///
    /// Returns error if the body is not valid JSON for `T`
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// HTTP response produced by a plugin route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// JSON response with the given status
    #[must_use]
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: value.to_string().into_bytes(),
        }
    }

    /// Plain text response
    #[must_use]
    pub fn text(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "text/plain; charset=utf-8".to_string())],
            body: text.into().into_bytes(),
        }
    }
}

/// HTTP route handler
pub type HttpHandler =
    Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, anyhow::Result<HttpResponse>> + Send + Sync>;

/// Wrap an async closure as an [`HttpHandler`]
pub fn http_handler<F, Fut>(f: F) -> HttpHandler
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HttpResponse>> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

// ─── Gateway methods ────────────────────────────────────────────────────────

/// Caller information for an RPC-style gateway method
#[derive(Debug, Clone, Default)]
pub struct MethodContext {
    pub client_id: String,
    pub session_key: Option<String>,
}

/// RPC-style gateway method handler
pub type GatewayMethodHandler =
    Arc<dyn Fn(Value, MethodContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`GatewayMethodHandler`]
pub fn method_handler<F, Fut>(f: F) -> GatewayMethodHandler
where
    F: Fn(Value, MethodContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |params, ctx| f(params, ctx).boxed())
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// CLI command handler, receives the arguments after the command name
pub type CliCommandHandler =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A command contributed to the `plexus run` subcommand
#[derive(Clone)]
pub struct CliCommand {
    pub name: String,
    pub description: String,
    pub handler: CliCommandHandler,
}

impl fmt::Debug for CliCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliCommand")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Collects CLI commands from plugin registrars
#[derive(Debug, Default)]
pub struct CliProgram {
    commands: Vec<CliCommand>,
}

impl CliProgram {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command
    pub fn command<F, Fut>(&mut self, name: &str, description: &str, handler: F)
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.commands.push(CliCommand {
            name: name.to_string(),
            description: description.to_string(),
            handler: Arc::new(move |args| handler(args).boxed()),
        });
    }

    /// Look up a command by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&CliCommand> {
        self.commands.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn commands(&self) -> &[CliCommand] {
        &self.commands
    }
}

/// Registers commands on a [`CliProgram`]
pub type CliRegistrar = Arc<dyn Fn(&mut CliProgram) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_event_names_round_trip() {
        for event in HookEvent::ALL {
            assert_eq!(HookEvent::parse(event.as_str()), Some(event));
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event.as_str()));
        }
        assert_eq!(HookEvent::parse("gateway_reboot"), None);
    }

    #[test]
    fn payload_reports_its_event() {
        let payload = HookPayload::AfterCompaction {
            session_key: "s1".to_string(),
            summary: None,
        };
        assert_eq!(payload.event(), HookEvent::AfterCompaction);
        assert_eq!(HookPayload::GatewayStop.event(), HookEvent::GatewayStop);
    }

    #[test]
    fn payload_serializes_with_event_tag() {
        let payload = HookPayload::SessionStart {
            session_key: "agent:main".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["event"], "session_start");
        assert_eq!(value["session_key"], "agent:main");
    }

    #[test]
    fn normalize_command_names() {
        assert_eq!(normalize_command("/Reload-Plugin "), "reload-plugin");
        assert_eq!(normalize_command("status"), "status");
        assert_eq!(normalize_command(" / "), "");
    }

    #[test]
    fn bearer_token_extraction() {
        let mut req = HttpRequest::default();
        assert_eq!(req.bearer_token(), None);
        req.headers
            .insert("authorization".to_string(), "Bearer secret".to_string());
        assert_eq!(req.bearer_token(), Some("secret"));
        assert_eq!(req.header("Authorization"), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn command_context_collects_replies() {
        let (ctx, mut rx) = CommandContext::new("s", "u", "cli", "arg");
        ctx.respond("one");
        ctx.respond("two");
        drop(ctx);

        let mut replies = Vec::new();
        while let Some(reply) = rx.recv().await {
            replies.push(reply);
        }
        assert_eq!(replies, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn cli_program_finds_commands() {
        let mut program = CliProgram::new();
        program.command("greet", "Say hi", |args| async move {
            anyhow::ensure!(args.len() == 1, "expected one arg");
            Ok(())
        });

        let cmd = program.find("greet").unwrap();
        assert_eq!(cmd.description, "Say hi");
        assert!((cmd.handler)(vec!["bob".into()]).await.is_ok());
        assert!((cmd.handler)(vec![]).await.is_err());
        assert!(program.find("missing").is_none());
    }
}
