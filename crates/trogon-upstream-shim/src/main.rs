use tracing::{error, info};
use trogon_upstream_shim::Config;
use trogon_upstream_shim::env::SystemEnv;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env(&SystemEnv).unwrap_or_else(|e| {
        error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    info!(command = %config.command(), "Starting upstream shim");

    if let Err(e) = trogon_upstream_shim::run(config).await {
        error!(error = %e, "Upstream shim stopped with error");
        std::process::exit(1);
    }

    info!("Upstream shim stopped");
}
