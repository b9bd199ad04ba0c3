use anyhow::Result;
use callchain::config::Cli;
use callchain::server::Server;
use callchain::telemetry;
use clap::Parser;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    cli.service
        .validate()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    telemetry::init(&cli.log_level, cli.log_dir.as_deref(), cli.service.name())
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    let addr = SocketAddr::new(cli.bind_ip, cli.service.port());
    tracing::info!(service = cli.service.name(), "Starting service");
    tracing::info!("Configuration: {:?}", cli.service);

    let server = Server::from_config(&cli.service, addr)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
