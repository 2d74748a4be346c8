/// Sandbox backend - in-memory inbox API for local development
use inbox_core::sandbox::{self, Backend};
use inbox_core::Config;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Listen address comes from the configured API URL
    let args: Vec<String> = env::args().skip(1).collect();
    let (config, _) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let addr: SocketAddr = config
        .api_url
        .trim_start_matches("http://")
        .parse()
        .map_err(|e| anyhow::anyhow!("API URL must be http://<ip>:<port>: {}", e))?;

    let backend = Arc::new(Backend::new(config.channel_prefix.clone()));
    backend.seed_demo().await;

    info!("Starting inbox sandbox");
    info!("   Participants: 1 (guest), 2 and 3 (hosts)");

    let listener = sandbox::bind(addr).await?;
    tokio::select! {
        result = sandbox::serve(backend, listener) => {
            result.map_err(|e| anyhow::anyhow!("Sandbox error: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, stopping sandbox");
        }
    }

    Ok(())
}
