//! Whelk MCP Server
//!
//! This binary runs Whelk as an MCP server over stdio. It exposes a `repl`
//! tool that lets AI assistants evaluate scripts in a persistent sandboxed
//! interpreter with a private virtual filesystem.

use clap::Parser;
use rmcp::ServiceExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use whelk_mcp::WhelkServer;

#[derive(Debug, Parser)]
#[command(name = "whelk-mcp", about = "MCP server for sandboxed script evaluation")]
struct Args {
    /// Ceiling on caller-supplied timeouts, in seconds
    #[arg(long, default_value_t = whelk::DEFAULT_MAX_TIMEOUT_SECS)]
    max_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Log to stderr so it doesn't interfere with MCP stdio
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    tracing::info!("Starting Whelk MCP server");

    let server = WhelkServer::new(args.max_timeout_secs);

    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("Failed to start MCP service: {}", e);
        })?;

    tracing::info!("Whelk MCP server running");

    service.waiting().await?;

    tracing::info!("Whelk MCP server shutting down");

    Ok(())
}
