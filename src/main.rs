use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use plexus_gateway::api::ApiServer;
use plexus_gateway::plugins::{discover, plugin_roots};
use plexus_gateway::{Config, Gateway};

/// Plexus - multi-channel agent gateway with hot-reloadable plugins
#[derive(Parser)]
#[command(name = "plexus", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "PLEXUS_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// List plugin candidates in precedence order
    Plugins,
    /// Ask a running gateway to reload a plugin
    Reload {
        /// Plugin id
        plugin_id: String,
        /// Gateway base URL
        #[arg(long, default_value = "http://127.0.0.1:18790")]
        url: String,
    },
    /// Run a command contributed by a plugin
    Run {
        /// Command name
        name: String,
        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,plexus_gateway=info",
        1 => "info,plexus_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Some(port) = cli.port {
        config.api.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Plugins => {
            list_plugins(&config);
            Ok(())
        }
        Command::Reload { plugin_id, url } => reload(&config, &url, &plugin_id).await,
        Command::Run { name, args } => run_plugin_command(config, &name, args).await,
    }
}

/// Run the gateway until interrupted
async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(port = config.api.port, "starting plexus gateway");

    let gateway = Arc::new(Gateway::new(config));
    let report = gateway.start().await;
    for failure in &report.errors {
        tracing::warn!(plugin_id = %failure.id, error = %failure.error, "plugin not loaded");
    }

    let server = ApiServer::new(Arc::clone(&gateway));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    };

    let result = server.run(shutdown).await;
    gateway.stop().await;
    result?;
    Ok(())
}

/// Print discovery candidates in precedence order
fn list_plugins(config: &Config) {
    let candidates = discover(&plugin_roots(config));
    if candidates.is_empty() {
        println!("No plugins found");
        return;
    }

    for candidate in candidates {
        let disabled = if config.plugins.is_disabled(&candidate.manifest.id) {
            " (disabled)"
        } else {
            ""
        };
        println!(
            "{:<24} {:<8} {}{disabled}",
            candidate.manifest.id,
            candidate.source,
            candidate.dir.display()
        );
    }
}

/// POST to a running gateway's reload endpoint
async fn reload(config: &Config, url: &str, plugin_id: &str) -> anyhow::Result<()> {
    let endpoint = format!("{}/api/plugins/reload", url.trim_end_matches('/'));
    let mut request = reqwest::Client::new()
        .post(&endpoint)
        .json(&json!({ "pluginId": plugin_id }));
    if let Some(key) = &config.api.api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    let message = body
        .get("message")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("no response body");

    if status.is_success() {
        println!("{message}");
        Ok(())
    } else {
        anyhow::bail!("reload failed ({status}): {message}")
    }
}

/// Load plugins and run one of their CLI commands
async fn run_plugin_command(config: Config, name: &str, args: Vec<String>) -> anyhow::Result<()> {
    let gateway = Gateway::new(config);
    gateway.load_plugins().await;

    let program = gateway.cli_program();
    if program.find(name).is_none() {
        eprintln!("Unknown command: {name}");
        if !program.commands().is_empty() {
            eprintln!("Available commands:");
            for command in program.commands() {
                eprintln!("  {:<20} {}", command.name, command.description);
            }
        }
        gateway.stop().await;
        anyhow::bail!("unknown plugin command: {name}");
    }

    let result = gateway.run_cli(name, args).await;
    gateway.stop().await;
    result?;
    Ok(())
}
