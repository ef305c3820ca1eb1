use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::handler::*;

pub fn create_app(state: AppState) -> Router {
    info!("Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Processor events
                .route("/webhook/stripe", post(stripe_webhook))
                // Manual job triggers
                .route("/jobs/orders/:kind", post(run_order_transfers))
                .route("/jobs/orders/:kind/settle", post(settle_orders))
                .route("/jobs/invoices", post(run_invoices))
                .route("/jobs/refunds/:kind", post(run_refunds))
                .route("/jobs/debits", post(run_debits))
                .route("/jobs/shops", post(run_shop_sync))
                .route("/jobs/retries", post(run_retries))
                // Retry queues
                .route("/retriable/transfers", get(retriable_transfers))
                .route("/retriable/payouts", get(retriable_payouts))
                .route("/retriable/refunds", get(retriable_refunds))
                // Payment commands
                .route("/payments/:id/capture", post(capture_payment))
                .route("/payments/:id/cancel", post(cancel_payment))
                // Seller onboarding
                .route("/onboarding/:token", post(complete_onboarding))
                // Checkpoints
                .route("/checkpoints/:name", get(get_checkpoint).put(put_checkpoint)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
