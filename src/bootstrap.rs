use std::sync::Arc;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    api::{
        accounts::ShopFields,
        handler::AppState,
        notifications::{AlertDispatcher, AlertHandler, HttpOperatorChannel},
        webhook::WebhookService,
    },
    config::Config,
    error::AppResult,
    ledger::{EntityStore, MemoryEntityStore, PgEntityStore},
    marketplace::MiraklClient,
    processor::StripeClient,
    settlement::{SettlementEngine, SettlementScheduler},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Entity store
    let (store, store_backend): (Arc<dyn EntityStore>, &'static str) = match &config.database_url {
        Some(database_url) => {
            let pool = initialize_database(database_url).await?;
            (Arc::new(PgEntityStore::new(pool)), "postgres")
        }
        None => {
            warn!("DATABASE_URL not set - using the in-memory store, state is lost on restart");
            (Arc::new(MemoryEntityStore::new()), "memory")
        }
    };

    // External services
    let marketplace = Arc::new(MiraklClient::new(config.mirakl.clone())?);
    info!("Mirakl client ready: {}", config.mirakl.base_url);
    let processor = Arc::new(StripeClient::new(config.stripe.clone())?);
    info!("Stripe client ready (platform account {})", config.stripe.platform_account);

    // Operator alerts
    let channel = Arc::new(HttpOperatorChannel::from_config(&config.alerts)?);
    let alert_handler = Arc::new(AlertHandler::new(
        channel,
        config.alerts.operator_webhook_retries,
        config.alerts.cooldown,
    ));
    let alerts = AlertDispatcher::spawn(alert_handler);
    if config.alerts.operator_webhook_url.is_none() {
        warn!("OPERATOR_WEBHOOK_URL not set - alerts fall back to email only");
    }

    let engine = Arc::new(SettlementEngine::new(
        store,
        marketplace,
        processor,
        alerts,
        ShopFields::from_config(&config.mirakl),
    ));

    let webhooks = Arc::new(WebhookService::new(
        config.stripe.webhook_secret.clone(),
        config.stripe.webhook_tolerance_seconds,
        engine.accounts().clone(),
        engine.payments().clone(),
    ));

    // Background jobs
    SettlementScheduler::new(config.scheduler.clone(), engine.clone()).start();
    info!(
        "Settlement scheduler started (every {:?})",
        config.scheduler.interval
    );

    info!("All components initialized");

    Ok(AppState {
        engine,
        webhooks,
        store_backend,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database connected and migrated");

    Ok(pool)
}
