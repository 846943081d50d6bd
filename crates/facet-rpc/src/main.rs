//! FACET RPC - tool server and command-line client.
//!
//! `facet-rpc serve` runs the built-in tools behind the FACET transport and
//! prints `RPC_PORT=<port>` on stdout once listening. `facet-rpc call` sends
//! one request to a running server and prints the result as JSON.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facet_core::{ClientConfig, FacetError, RpcClient, RpcServer, ServerConfig, ToolRegistry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "facet-rpc")]
#[command(about = "FACET tool server and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the built-in tools
    Serve(ServeArgs),
    /// Call one operation on a running server
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host to bind to (default: FACET_HOST or 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, 0 = auto-assign (default: FACET_PORT or 3000)
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Per-request handler timeout in milliseconds
    #[arg(long)]
    handler_timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Server address as host:port
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    addr: String,

    /// Operation name, e.g. `echo` or `tools/list`
    operation: String,

    /// Arguments as a JSON value
    #[arg(default_value = "{}")]
    arguments: String,

    /// Call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Call(args) => call(args).await,
    }
}

/// Logs go to stderr; stdout carries `RPC_PORT=` and call results.
fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = ServerConfig::from_env().context("invalid server configuration")?;
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(max) = args.max_connections {
        config = config.with_max_connections(max);
    }
    if let Some(ms) = args.handler_timeout_ms {
        config = config.with_handler_timeout(Duration::from_millis(ms));
    }

    info!("Starting FACET tool server");

    let registry = Arc::new(ToolRegistry::builtin());
    info!("Registered tools: {}", registry.names().join(", "));

    let mut handle = RpcServer::start(config, registry).await?;

    // Read by launchers and integration tests; keep the format stable.
    println!("RPC_PORT={}", handle.port());

    info!("Tool server running on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}

async fn call(args: CallArgs) -> Result<()> {
    let arguments: Value = serde_json::from_str(&args.arguments)
        .with_context(|| format!("arguments are not valid JSON: {}", args.arguments))?;

    let config = ClientConfig::from_env()
        .context("invalid client configuration")?
        .with_reconnect(facet_core::ReconnectPolicy::disabled());
    let client = RpcClient::connect_to(args.addr.clone(), config).await?;

    let timeout = args.timeout_ms.map(Duration::from_millis);
    let outcome = client
        .call_with_timeout(&args.operation, arguments, timeout)
        .await;
    client.disconnect().await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(FacetError::Fault { code, message }) => {
            bail!("{} failed ({}): {}", args.operation, code, message)
        }
        Err(e) => Err(e.into()),
    }
}
