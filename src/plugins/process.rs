//! External plugins run as child processes
//!
//! The host and the plugin exchange line-delimited JSON over the child's
//! stdin and stdout. The host opens with `init`; the plugin answers with any
//! number of `register_*` messages followed by `ready` (or `error`). After
//! that the host sends `invoke` requests and the plugin answers each with a
//! `result` carrying the same id. The plugin may also send `log`,
//! `send_to_channel` and `dispatch` at any time. Stderr is forwarded to the
//! gateway log.
//!
//! Every registration becomes a proxy in the registry that forwards calls to
//! the process. Reloading a plugin means killing its process and spawning a
//! fresh one.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::api::PluginApi;
use super::factory::{Plugin, PluginFactory};
use super::manifest::PluginManifest;
use super::types::{
    BackgroundService, ChannelCapabilities, ChannelPlugin, CommandContext, HookEvent,
    HttpRequest, HttpResponse, InboundMessage, ToolContext, ToolDefinition, ToolPlugin,
    ToolResult,
};
use crate::{Error, Result};

/// Environment variable carrying the load generation of a plugin process
pub const GENERATION_ENV: &str = "PLEXUS_PLUGIN_GENERATION";

/// Environment variable carrying the plugin id
pub const PLUGIN_ID_ENV: &str = "PLEXUS_PLUGIN_ID";

/// Turns a plugin entry point into a factory
///
/// `generation` increases on every import, so no two imports of the same
/// plugin share one.
#[async_trait]
pub trait PluginImporter: Send + Sync {
    async fn import(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
        entry: &Path,
        generation: u64,
    ) -> Result<PluginFactory>;
}

/// Default importer: spawn the entry point as a child process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessImporter;

#[async_trait]
impl PluginImporter for ProcessImporter {
    async fn import(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
        entry: &Path,
        generation: u64,
    ) -> Result<PluginFactory> {
        let (program, args) = determine_executor(entry)?;

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(dir)
            .env(GENERATION_ENV, generation.to_string())
            .env(PLUGIN_ID_ENV, &manifest.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Plugin {
                id: manifest.id.clone(),
                reason: format!("failed to spawn {program}: {e}"),
            })?;

        tracing::debug!(
            plugin_id = %manifest.id,
            program = %program,
            generation,
            pid = ?child.id(),
            "spawned plugin process"
        );

        let process = PluginProcess::new(&manifest.id, &mut child);
        *lock(&process.child) = Some(child);

        Ok(PluginFactory::Object(Arc::new(ProcessPlugin {
            process: Arc::new(process),
            generation,
        })))
    }
}

/// Determine how to run an entry point based on its extension
fn determine_executor(entry: &Path) -> Result<(String, Vec<String>)> {
    let extension = entry.extension().and_then(|e| e.to_str()).unwrap_or("");

    let path_str = entry
        .to_str()
        .ok_or_else(|| Error::Process(format!("invalid entry path: {}", entry.display())))?
        .to_string();

    match extension {
        "py" => Ok(("python3".to_string(), vec![path_str])),
        "js" | "mjs" => Ok(("node".to_string(), vec![path_str])),
        "ts" => Ok(("bun".to_string(), vec!["run".to_string(), path_str])),
        "rb" => Ok(("ruby".to_string(), vec![path_str])),
        "sh" => Ok(("bash".to_string(), vec![path_str])),
        // No extension, assume executable binary or script with shebang
        "" => Ok((path_str, vec![])),
        _ => Err(Error::Process(format!(
            "unsupported entry extension: .{extension}"
        ))),
    }
}

// ─── Wire protocol ──────────────────────────────────────────────────────────

/// Kind of registration an invoke is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Target {
    Channel,
    Tool,
    Hook,
    HttpRoute,
    GatewayMethod,
    Command,
    Service,
    Cli,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Init {
        plugin_id: &'a str,
        name: &'a str,
        config: Option<&'a Value>,
        generation: u64,
    },
    Invoke {
        id: u64,
        target: Target,
        name: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<&'a str>,
        payload: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct CliCommandSpec {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PluginMessage {
    RegisterChannel {
        id: String,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        capabilities: ChannelCapabilities,
    },
    RegisterTool {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        tools: Vec<ToolDefinition>,
    },
    RegisterHook {
        events: Vec<HookEvent>,
    },
    RegisterHttpRoute {
        method: String,
        path: String,
    },
    RegisterGatewayMethod {
        name: String,
    },
    RegisterCommand {
        name: String,
    },
    RegisterService {
        name: String,
    },
    RegisterCli {
        commands: Vec<CliCommandSpec>,
    },
    Ready,
    Error {
        message: String,
    },
    Result {
        id: u64,
        ok: bool,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    SendToChannel {
        channel: String,
        target: String,
        text: String,
    },
    Dispatch {
        message: InboundMessage,
    },
}

/// HTTP response as sent by a plugin process
#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Value,
}

const fn default_status() -> u16 {
    200
}

impl From<WireResponse> for HttpResponse {
    fn from(wire: WireResponse) -> Self {
        let mut headers: Vec<(String, String)> = wire.headers.into_iter().collect();
        let body = match wire.body {
            Value::Null => Vec::new(),
            Value::String(s) => s.into_bytes(),
            other => {
                if !headers
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                {
                    headers.push(("content-type".to_string(), "application/json".to_string()));
                }
                other.to_string().into_bytes()
            }
        };
        Self {
            status: wire.status,
            headers,
            body,
        }
    }
}

// ─── Process handle ─────────────────────────────────────────────────────────

type Pending = HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PluginProcess {
    plugin_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: StdMutex<Option<ChildStdout>>,
    child: StdMutex<Option<Child>>,
    pending: StdMutex<Pending>,
    next_id: AtomicU64,
    alive: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PluginProcess {
    fn new(plugin_id: &str, child: &mut Child) -> Self {
        let process = Self {
            plugin_id: plugin_id.to_string(),
            stdin: Mutex::new(child.stdin.take()),
            stdout: StdMutex::new(child.stdout.take()),
            child: StdMutex::new(None),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            tasks: StdMutex::new(Vec::new()),
        };
        if let Some(stderr) = child.stderr.take() {
            let handle = tokio::spawn(forward_stderr(process.plugin_id.clone(), stderr));
            lock(&process.tasks).push(handle);
        }
        process
    }

    async fn send(&self, message: &HostMessage<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Process(format!("plugin {} stdin is closed", self.plugin_id)))?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Send an invoke and wait for the matching result
    async fn call(
        &self,
        target: Target,
        name: &str,
        action: Option<&str>,
        payload: Value,
    ) -> anyhow::Result<Value> {
        anyhow::ensure!(
            self.alive.load(Ordering::SeqCst),
            "plugin {} is not running",
            self.plugin_id
        );

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let message = HostMessage::Invoke {
            id,
            target,
            name,
            action,
            payload,
        };
        if let Err(e) = self.send(&message).await {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(anyhow::anyhow!(message)),
            Err(_) => Err(anyhow::anyhow!(
                "plugin {} exited before replying",
                self.plugin_id
            )),
        }
    }

    fn complete(&self, id: u64, result: std::result::Result<Value, String>) {
        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                tracing::warn!(plugin_id = %self.plugin_id, id, "result for unknown request");
            }
        }
    }

    /// Fail every in-flight call
    fn fail_pending(&self) {
        lock(&self.pending).clear();
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        drop(self.stdin.lock().await.take());

        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(plugin_id = %self.plugin_id, error = %e, "plugin process already gone");
            }
            let _ = child.wait().await;
        }

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.fail_pending();
        tracing::debug!(plugin_id = %self.plugin_id, "plugin process stopped");
    }
}

async fn forward_stderr(plugin_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(plugin_id = %plugin_id, line = %line, "plugin stderr");
    }
}

/// Read plugin stdout until EOF, routing each message
async fn read_loop(
    process: Arc<PluginProcess>,
    stdout: ChildStdout,
    control: mpsc::UnboundedSender<PluginMessage>,
    api: PluginApi,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(plugin_id = %process.plugin_id, error = %e, "failed to read plugin output");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: PluginMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(plugin_id = %process.plugin_id, error = %e, "ignoring malformed plugin message");
                continue;
            }
        };

        match message {
            PluginMessage::Result {
                id,
                ok,
                value,
                error,
            } => {
                let result = if ok {
                    Ok(value)
                } else {
                    Err(error.unwrap_or_else(|| "plugin call failed".to_string()))
                };
                process.complete(id, result);
            }
            PluginMessage::Log { level, message } => match level.as_deref() {
                Some("error") => api.log_error(&message),
                Some("warn") => api.log_warn(&message),
                Some("debug") => api.log_debug(&message),
                _ => api.log_info(&message),
            },
            // Sends may target a channel served by this same process, so they
            // must not block the reader
            PluginMessage::SendToChannel {
                channel,
                target,
                text,
            } => {
                let api = api.clone();
                tokio::spawn(async move {
                    if let Err(e) = api.send_to_channel(&channel, &target, &text).await {
                        api.log_warn(&format!("send_to_channel failed: {e}"));
                    }
                });
            }
            PluginMessage::Dispatch { message } => {
                let api = api.clone();
                tokio::spawn(async move {
                    if let Err(e) = api.dispatch(message).await {
                        api.log_warn(&format!("dispatch failed: {e}"));
                    }
                });
            }
            other => {
                if control.send(other).is_err() {
                    tracing::warn!(
                        plugin_id = %process.plugin_id,
                        "ignoring registration sent after ready"
                    );
                }
            }
        }
    }

    process.alive.store(false, Ordering::SeqCst);
    process.fail_pending();
    tracing::debug!(plugin_id = %process.plugin_id, "plugin process output closed");
}

// ─── Plugin ─────────────────────────────────────────────────────────────────

/// A plugin backed by a child process
pub struct ProcessPlugin {
    process: Arc<PluginProcess>,
    generation: u64,
}

impl std::fmt::Debug for ProcessPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPlugin")
            .field("plugin_id", &self.process.plugin_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    async fn register(&self, api: PluginApi) -> anyhow::Result<()> {
        let stdout = lock(&self.process.stdout)
            .take()
            .ok_or_else(|| anyhow::anyhow!("plugin process was already registered"))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.process),
            stdout,
            tx,
            api.clone(),
        ));
        lock(&self.process.tasks).push(reader);

        self.process
            .send(&HostMessage::Init {
                plugin_id: api.id(),
                name: api.name(),
                config: api.plugin_config(),
                generation: self.generation,
            })
            .await?;

        while let Some(message) = rx.recv().await {
            match message {
                PluginMessage::Ready => {
                    tracing::debug!(plugin_id = %api.id(), "plugin process ready");
                    return Ok(());
                }
                PluginMessage::Error { message } => {
                    anyhow::bail!("plugin reported error: {message}");
                }
                registration => self.apply(&api, registration),
            }
        }

        anyhow::bail!("plugin process exited before signalling ready")
    }

    async fn unload(&self) {
        self.process.shutdown().await;
    }
}

impl ProcessPlugin {
    /// Turn one registration message into a proxy in the registry
    fn apply(&self, api: &PluginApi, message: PluginMessage) {
        let process = &self.process;

        match message {
            PluginMessage::RegisterChannel {
                id,
                label,
                capabilities,
            } => {
                api.register_channel(Arc::new(ProcessChannel {
                    label: label.unwrap_or_else(|| id.clone()),
                    id,
                    capabilities,
                    process: Arc::clone(process),
                }));
            }
            PluginMessage::RegisterTool {
                name,
                description,
                tools,
            } => {
                api.register_tool(Arc::new(ProcessTool {
                    name,
                    description,
                    tools,
                    process: Arc::clone(process),
                }));
            }
            PluginMessage::RegisterHook { events } => {
                let process = Arc::clone(process);
                api.register_hook(&events, move |payload| {
                    let process = Arc::clone(&process);
                    async move {
                        let event = payload.event();
                        let payload = serde_json::to_value(&payload)?;
                        process
                            .call(Target::Hook, event.as_str(), None, payload)
                            .await?;
                        Ok(())
                    }
                });
            }
            PluginMessage::RegisterHttpRoute { method, path } => {
                let process = Arc::clone(process);
                let key = format!("{} {path}", method.to_ascii_uppercase());
                api.register_http_route(&method, &path, move |req: HttpRequest| {
                    let process = Arc::clone(&process);
                    let key = key.clone();
                    async move {
                        let payload = json!({
                            "method": req.method,
                            "path": req.path,
                            "query": req.query,
                            "headers": req.headers,
                            "body": String::from_utf8_lossy(&req.body),
                        });
                        let value = process
                            .call(Target::HttpRoute, &key, None, payload)
                            .await?;
                        let wire: WireResponse = serde_json::from_value(value)?;
                        Ok(HttpResponse::from(wire))
                    }
                });
            }
            PluginMessage::RegisterGatewayMethod { name } => {
                let process = Arc::clone(process);
                let method = name.clone();
                api.register_gateway_method(&name, move |params, ctx| {
                    let process = Arc::clone(&process);
                    let method = method.clone();
                    async move {
                        let payload = json!({
                            "params": params,
                            "clientId": ctx.client_id,
                            "sessionKey": ctx.session_key,
                        });
                        process
                            .call(Target::GatewayMethod, &method, None, payload)
                            .await
                    }
                });
            }
            PluginMessage::RegisterCommand { name } => {
                let process = Arc::clone(process);
                let command = super::types::normalize_command(&name);
                api.register_command(&name, move |ctx: CommandContext| {
                    let process = Arc::clone(&process);
                    let command = command.clone();
                    async move {
                        let payload = json!({
                            "sessionKey": ctx.session_key,
                            "senderId": ctx.sender_id,
                            "channel": ctx.channel,
                            "args": ctx.args,
                        });
                        let value = process
                            .call(Target::Command, &command, None, payload)
                            .await?;
                        for reply in replies(value) {
                            ctx.respond(reply);
                        }
                        Ok(())
                    }
                });
            }
            PluginMessage::RegisterService { name } => {
                api.register_service(Arc::new(ProcessService {
                    name,
                    process: Arc::clone(process),
                }));
            }
            PluginMessage::RegisterCli { commands } => {
                let process = Arc::clone(process);
                api.register_cli(move |program| {
                    for spec in &commands {
                        let process = Arc::clone(&process);
                        let name = spec.name.clone();
                        program.command(&spec.name, &spec.description, move |args| {
                            let process = Arc::clone(&process);
                            let name = name.clone();
                            async move {
                                process
                                    .call(Target::Cli, &name, None, json!({ "args": args }))
                                    .await?;
                                Ok(())
                            }
                        });
                    }
                });
            }
            PluginMessage::Ready
            | PluginMessage::Error { .. }
            | PluginMessage::Result { .. }
            | PluginMessage::Log { .. }
            | PluginMessage::SendToChannel { .. }
            | PluginMessage::Dispatch { .. } => {}
        }
    }
}

/// Command replies: a string, an array of strings, or nothing
fn replies(value: Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ─── Proxies ────────────────────────────────────────────────────────────────

struct ProcessChannel {
    id: String,
    label: String,
    capabilities: ChannelCapabilities,
    process: Arc<PluginProcess>,
}

#[async_trait]
impl ChannelPlugin for ProcessChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn capabilities(&self) -> ChannelCapabilities {
        self.capabilities
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.process
            .call(Target::Channel, &self.id, Some("start"), Value::Null)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.process
            .call(Target::Channel, &self.id, Some("stop"), Value::Null)
            .await?;
        Ok(())
    }

    async fn send_text(&self, target: &str, text: &str) -> anyhow::Result<()> {
        self.process
            .call(
                Target::Channel,
                &self.id,
                Some("send_text"),
                json!({ "target": target, "text": text }),
            )
            .await?;
        Ok(())
    }
}

struct ProcessTool {
    name: String,
    description: String,
    tools: Vec<ToolDefinition>,
    process: Arc<PluginProcess>,
}

#[async_trait]
impl ToolPlugin for ProcessTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    async fn execute(
        &self,
        tool_name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolResult> {
        let value = self
            .process
            .call(
                Target::Tool,
                &self.name,
                Some(tool_name),
                json!({ "params": params, "sessionKey": ctx.session_key }),
            )
            .await?;

        Ok(match value {
            Value::String(text) => ToolResult::text(text),
            other => serde_json::from_value(other)?,
        })
    }
}

struct ProcessService {
    name: String,
    process: Arc<PluginProcess>,
}

#[async_trait]
impl BackgroundService for ProcessService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.process
            .call(Target::Service, &self.name, Some("start"), Value::Null)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.process
            .call(Target::Service, &self.name, Some("stop"), Value::Null)
            .await?;
        Ok(())
    }
}
