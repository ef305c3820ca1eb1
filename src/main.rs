mod api;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod marketplace;
mod processor;
mod server;
mod settlement;
#[cfg(test)]
mod testing;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("Starting marketplace settlement service");

    let config = Config::from_env()?;
    let state = bootstrap::initialize_app_state(&config).await?;

    let app = server::create_app(state);
    server::run_server(app, &config.bind_address).await?;

    Ok(())
}
