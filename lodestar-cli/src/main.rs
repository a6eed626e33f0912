//! Lodestar CLI: starts the research MCP server on the configured transport.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::Figment;
use figment::providers::{Format, Serialized, Toml};
use lodestar_core::{EngineKind, LodestarConfig, ResearchService, TransportKind};
use lodestar_mcp::McpServer;
use lodestar_mcp::transport::StdioTransport;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Lodestar: deep web research exposed as MCP tools
#[derive(Parser, Debug)]
#[command(name = "lodestar", version, about, long_about = None)]
struct Cli {
    /// Transport: stdio, sse or streamable-http (also read from MCP_TRANSPORT)
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// Host to bind for the HTTP transports
    #[arg(long)]
    host: Option<String>,

    /// Port to bind for the HTTP transports
    #[arg(short, long)]
    port: Option<u16>,

    /// Research engine: http or stub
    #[arg(short, long)]
    engine: Option<String>,

    /// Workspace directory (searched for .lodestar/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .lodestar/config.toml in the workspace
    Init,
    /// Print the effective configuration
    Show,
}

/// Fold `--config` and the command-line flags into a figment that sits on
/// top of every other configuration layer.
fn cli_overrides(cli: &Cli, env_transport: Option<&str>) -> anyhow::Result<Figment> {
    let mut figment = Figment::new();
    if let Some(path) = &cli.config {
        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }
        figment = figment.merge(Toml::file(path));
    }

    let transport = match (cli.transport, env_transport) {
        (Some(kind), _) => Some(kind),
        (None, Some(raw)) => Some(
            raw.parse::<TransportKind>()
                .map_err(|e| anyhow::anyhow!("MCP_TRANSPORT: {e}"))?,
        ),
        (None, None) => None,
    };
    if let Some(kind) = transport {
        figment = figment.merge(Serialized::default("transport.kind", kind));
    }
    if let Some(host) = &cli.host {
        figment = figment.merge(Serialized::default("transport.host", host));
    }
    if let Some(port) = cli.port {
        figment = figment.merge(Serialized::default("transport.port", port));
    }
    if let Some(engine) = &cli.engine {
        let kind = match engine.as_str() {
            "http" => EngineKind::Http,
            "stub" => EngineKind::Stub,
            other => anyhow::bail!("Unknown engine '{other}' (expected http or stub)"),
        };
        figment = figment.merge(Serialized::default("engine.kind", kind));
    }
    Ok(figment)
}

/// Filter for the stderr log layer. A valid `RUST_LOG` directive wins over
/// `-v`/`-q`.
fn stderr_filter(verbose: u8, quiet: bool, rust_log: Option<&str>) -> EnvFilter {
    let level = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level))
}

/// Periodically drop expired research units and cached topics.
fn spawn_janitor(service: ResearchService, config: &LodestarConfig) {
    let shortest = [config.registry.ttl_secs, config.cache.ttl_secs]
        .into_iter()
        .flatten()
        .min();
    let Some(ttl) = shortest else {
        return;
    };
    let period = Duration::from_secs(ttl.clamp(1, 60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let (units, topics) = service.purge_expired();
            if units + topics > 0 {
                info!(units, topics, "Purged expired research state");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    // stdout belongs to the stdio transport, so human-readable logs go to stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter(cli.verbose, cli.quiet, rust_log.as_deref()));

    let log_dir = directories::ProjectDirs::from("dev", "lodestar", "lodestar")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "lodestar.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let env_transport = std::env::var("MCP_TRANSPORT").ok();
    let overrides = cli_overrides(&cli, env_transport.as_deref())?;
    let config = lodestar_core::load_config(Some(&workspace), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    if let Some(Commands::Config { action }) = cli.command {
        return commands::handle_config(action, &workspace, &config);
    }

    // A missing engine credential stops startup before any request is read.
    let service = ResearchService::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Startup error: {}", e))?;
    debug!(engine = service.engine().name(), "Research engine ready");
    spawn_janitor(service.clone(), &config);

    let server = McpServer::new(service);
    let transport = config.transport.resolve();
    info!(transport = %transport, "Starting Lodestar MCP server");
    match transport {
        TransportKind::Stdio => {
            let mut stdio = StdioTransport::new();
            server.run(&mut stdio).await?;
        }
        kind => {
            lodestar_mcp::http::serve(&server, kind, &config.transport.host, config.transport.port)
                .await?;
        }
    }
    Ok(())
}
