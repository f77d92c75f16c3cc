// src/main.rs
// contextd - Context management daemon for AI coding assistants

use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use contextd::config::Config;
use contextd::registry::ServiceRegistry;

#[derive(Parser)]
#[command(name = "contextd", version, about = "Context management daemon for AI coding assistants")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Use the in-memory vector store instead of Qdrant
    #[arg(long, global = true)]
    memory: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server over stdio (default)
    Serve,
    /// Run the localhost HTTP API for host hooks
    Http {
        /// Listen address override
        #[arg(long, env = "CONTEXTD_HTTP_ADDR")]
        addr: Option<String>,
    },
    /// Scrub secrets from text (pass `-` to read stdin)
    Scrub {
        /// Text to scrub, or `-` for stdin
        text: String,
    },
    /// Print per-service availability and collection counts
    Status,
    /// Run the collection metadata integrity check
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.contextd/.env only (never from CWD — a malicious
    // repo could override API keys)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".contextd/.env"))
    {
        tracing::debug!("No global .env file loaded: {}", e);
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        // Quiet for MCP stdio: stdout belongs to the protocol.
        None | Some(Commands::Serve) => Level::WARN,
        Some(Commands::Http { .. }) => Level::INFO,
        _ => Level::WARN,
    };
    let level = std::env::var("CONTEXTD_LOG")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(log_level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = Config::load()?;

    match cli.command {
        None | Some(Commands::Serve) => {
            let registry = build_registry(config, cli.memory)?;
            contextd::mcp::serve(registry).await?;
        }
        Some(Commands::Http { addr }) => {
            let mut config = config;
            if let Some(addr) = addr {
                config.http_addr = addr;
            }
            let registry = build_registry(config, cli.memory)?;
            contextd::api::serve(registry).await?;
        }
        Some(Commands::Scrub { text }) => {
            let input = if text == "-" {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            } else {
                text
            };
            let scrubber = contextd::scrub::Scrubber::new();
            let result = scrubber.scrub(&input);
            println!("{}", result.scrubbed);
            eprintln!("{} finding(s) redacted", result.findings_count);
        }
        Some(Commands::Status) => {
            let registry = build_registry(config, cli.memory)?;
            let status = registry.status(&CancellationToken::new()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some(Commands::Health) => {
            let registry = build_registry(config, cli.memory)?;
            let report = registry.store.health_check(&CancellationToken::new()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn build_registry(config: Config, in_memory: bool) -> Result<Arc<ServiceRegistry>> {
    let registry = if in_memory {
        ServiceRegistry::in_memory(config)
    } else {
        ServiceRegistry::connect(config)?
    };
    Ok(Arc::new(registry))
}
