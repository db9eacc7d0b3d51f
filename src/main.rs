//! keyhive - HTTP server entry point.

use keyhive::{api, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("keyhive={},tower_http=info", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        host = %config.host,
        port = config.port,
        health_weight = config.health_weight,
        capacity_weight = config.capacity_weight,
        "starting gateway"
    );

    api::serve(config).await
}
