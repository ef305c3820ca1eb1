use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use super::models::*;
use super::webhook::{WebhookReceipt, WebhookService};
use crate::error::AppResult;
use crate::ledger::models::{AccountMapping, Payout, Refund, Transfer};
use crate::settlement::jobs::ShopSyncReport;
use crate::settlement::payments::PaymentCommand;
use crate::settlement::{ItemOutcome, ReconcileReport, SettlementEngine};

const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub webhooks: Arc<WebhookService>,
    /// `postgres` or `memory`
    pub store_backend: &'static str,
}

async fn run_job<T, F>(job: &str, run: F) -> AppResult<Json<JobResponse<T>>>
where
    F: Future<Output = AppResult<T>>,
{
    info!("Manual run of job {}", job);
    let started_at = Utc::now();
    let result = run.await?;
    Ok(Json(JobResponse {
        job: job.to_string(),
        started_at,
        finished_at: Utc::now(),
        result,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        store: state.store_backend.to_string(),
        timestamp: Utc::now(),
    })
}

/// Processor events. The raw body is needed for signature verification.
/// POST /webhook/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookReceipt>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let receipt = state.webhooks.handle(&body, signature).await?;
    Ok(Json(receipt))
}

// ========== JOBS ==========

/// POST /jobs/orders/:kind
pub async fn run_order_transfers(
    State(state): State<AppState>,
    Path(kind): Path<OrderKindParam>,
) -> AppResult<Json<JobResponse<ReconcileReport>>> {
    run_job("order transfers", state.engine.run_order_transfers(kind.into())).await
}

/// POST /jobs/orders/:kind/settle
pub async fn settle_orders(
    State(state): State<AppState>,
    Path(kind): Path<OrderKindParam>,
    Json(request): Json<SettleOrdersRequest>,
) -> AppResult<Json<JobResponse<ReconcileReport>>> {
    run_job(
        "settle orders",
        state.engine.settle_orders(kind.into(), request.order_ids),
    )
    .await
}

/// POST /jobs/invoices
pub async fn run_invoices(
    State(state): State<AppState>,
) -> AppResult<Json<JobResponse<Vec<ReconcileReport>>>> {
    run_job("invoices", state.engine.run_invoices(true, true)).await
}

/// POST /jobs/refunds/:kind
pub async fn run_refunds(
    State(state): State<AppState>,
    Path(kind): Path<OrderKindParam>,
) -> AppResult<Json<JobResponse<ReconcileReport>>> {
    run_job("refunds", state.engine.run_refunds(kind.into())).await
}

/// POST /jobs/debits
pub async fn run_debits(
    State(state): State<AppState>,
) -> AppResult<Json<JobResponse<ReconcileReport>>> {
    run_job("debits", state.engine.run_debits()).await
}

/// POST /jobs/shops
pub async fn run_shop_sync(
    State(state): State<AppState>,
) -> AppResult<Json<JobResponse<ShopSyncReport>>> {
    run_job("shop sync", state.engine.run_shop_sync()).await
}

/// POST /jobs/retries
pub async fn run_retries(
    State(state): State<AppState>,
) -> AppResult<Json<JobResponse<Vec<ReconcileReport>>>> {
    let engine = state.engine.clone();
    run_job("retries", async move {
        Ok(vec![
            engine.retry_transfers().await?,
            engine.retry_payouts().await?,
            engine.retry_refunds().await?,
        ])
    })
    .await
}

// ========== RETRIABLE ENTITIES ==========

/// GET /retriable/transfers
pub async fn retriable_transfers(State(state): State<AppState>) -> AppResult<Json<Vec<Transfer>>> {
    Ok(Json(state.engine.retriable_transfers().await?))
}

/// GET /retriable/payouts
pub async fn retriable_payouts(State(state): State<AppState>) -> AppResult<Json<Vec<Payout>>> {
    Ok(Json(state.engine.retriable_payouts().await?))
}

/// GET /retriable/refunds
pub async fn retriable_refunds(State(state): State<AppState>) -> AppResult<Json<Vec<Refund>>> {
    Ok(Json(state.engine.retriable_refunds().await?))
}

// ========== PAYMENTS ==========

/// POST /payments/:id/capture
pub async fn capture_payment(
    State(state): State<AppState>,
    Path(stripe_payment_id): Path<String>,
    Json(request): Json<CaptureRequest>,
) -> AppResult<Json<ItemOutcome>> {
    let command = PaymentCommand::Capture {
        stripe_payment_id,
        amount: request.amount,
    };
    Ok(Json(state.engine.payments().handle(command).await?))
}

/// POST /payments/:id/cancel
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(stripe_payment_id): Path<String>,
) -> AppResult<Json<ItemOutcome>> {
    let command = PaymentCommand::Cancel { stripe_payment_id };
    Ok(Json(state.engine.payments().handle(command).await?))
}

// ========== ONBOARDING ==========

/// POST /onboarding/:token
pub async fn complete_onboarding(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(request): Json<OnboardingRequest>,
) -> AppResult<Json<AccountMapping>> {
    let mapping = state
        .engine
        .complete_onboarding(&token, &request.stripe_account_id)
        .await?;
    Ok(Json(mapping))
}

// ========== CHECKPOINTS ==========

/// GET /checkpoints/:name
pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<CheckpointBody>> {
    let key = checkpoint_key(&name)?;
    Ok(Json(CheckpointBody {
        value: state.engine.checkpoint(key).await?,
    }))
}

/// Overwrite a checkpoint, e.g. to replay a window
/// PUT /checkpoints/:name
pub async fn put_checkpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<CheckpointBody>,
) -> AppResult<Json<CheckpointBody>> {
    let key = checkpoint_key(&name)?;
    let value = body
        .value
        .ok_or_else(|| crate::error::AppError::BadRequest("value is required".into()))?;
    state.engine.set_checkpoint(key, value).await?;
    info!("Checkpoint {} set to {}", key, value);
    Ok(Json(CheckpointBody { value: Some(value) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{checkpoints, Payment};
    use crate::ledger::EntityStore;
    use crate::testing::{Harness, ProcessorCall};

    fn state(harness: &Harness) -> AppState {
        let webhooks = WebhookService::new(
            "whsec_test",
            300,
            harness.engine.accounts().clone(),
            harness.engine.payments().clone(),
        );
        AppState {
            engine: harness.engine.clone(),
            webhooks: Arc::new(webhooks),
            store_backend: "memory",
        }
    }

    #[tokio::test]
    async fn test_webhook_without_signature_is_rejected() {
        let harness = Harness::new().await;
        let result = stripe_webhook(
            State(state(&harness)),
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip_through_handlers() {
        let harness = Harness::new().await;
        let value = "2024-03-01T00:00:00Z".parse().unwrap();

        put_checkpoint(
            State(state(&harness)),
            Path("shops".to_string()),
            Json(CheckpointBody { value: Some(value) }),
        )
        .await
        .unwrap();

        assert_eq!(
            harness.engine.checkpoint(checkpoints::SHOPS).await.unwrap(),
            Some(value)
        );
        let Json(body) = get_checkpoint(State(state(&harness)), Path("shops".to_string()))
            .await
            .unwrap();
        assert_eq!(body.value, Some(value));
    }

    #[tokio::test]
    async fn test_capture_command_uses_authorized_amount() {
        let harness = Harness::new().await;
        harness
            .store
            .insert_payment(&Payment::new("C1", "pi_1", 2400, "eur"))
            .await
            .unwrap();

        let Json(outcome) = capture_payment(
            State(state(&harness)),
            Path("pi_1".to_string()),
            Json(CaptureRequest::default()),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ItemOutcome::Succeeded);
        assert_eq!(
            harness.processor.calls(),
            vec![ProcessorCall::Capture {
                payment_id: "pi_1".into(),
                amount: 2400
            }]
        );
    }

    #[tokio::test]
    async fn test_onboarding_with_unknown_token_not_found() {
        let harness = Harness::new().await;
        harness.processor.add_account(crate::processor::models::Account {
            id: "acct_new".into(),
            charges_enabled: true,
            payouts_enabled: true,
            requirements: Default::default(),
            metadata: Default::default(),
        });

        let result = complete_onboarding(
            State(state(&harness)),
            Path("0badc0de".to_string()),
            Json(OnboardingRequest {
                stripe_account_id: "acct_new".into(),
            }),
        )
        .await;

        assert!(matches!(result, Err(crate::error::AppError::NotFound(_))));
        assert!(harness
            .store
            .find_account_mapping_by_stripe_id("acct_new")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_payment_not_found() {
        let harness = Harness::new().await;
        let result = cancel_payment(State(state(&harness)), Path("pi_missing".to_string())).await;
        assert!(matches!(result, Err(crate::error::AppError::NotFound(_))));
    }
}
