use anyhow::Result;
use std::sync::Arc;
use tiqs_autotrader::{auth, AppConfig, AutoTrader, SocketConfig, TiqsClient};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .init();

    info!("Starting tiqs-autotrader v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    config.validate()?;

    let access_token = match &config.session.access_token {
        Some(token) => token.clone(),
        None => {
            info!("no access token configured; running the login flow");
            auth::generate_access_token(&config.client_params()).await?
        }
    };

    let broker = Arc::new(TiqsClient::new(&config.credentials.app_id, &access_token)?);
    let mut socket_config = SocketConfig::new(&config.credentials.app_id, &access_token);
    socket_config.url = config.socket.url.clone();

    let trader = AutoTrader::new(broker, socket_config).await?;
    info!("dispatcher ready; deploy strategies with AutoTrader::add_strategy");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let report = trader.shutdown().await?;
    info!(report = %report.display(), "closed positions exported");

    Ok(())
}
