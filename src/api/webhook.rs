// Processor webhook intake: authenticate, decode, dispatch by event type

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::accounts::AccountSync;
use crate::error::{AppResult, SignatureError};
use crate::processor::models::{Account, Event};
use crate::processor::signature::verify_webhook_signature;
use crate::settlement::payments::{PaymentService, AMOUNT_CAPTURABLE_UPDATED, CHARGE_SUCCEEDED};

pub const ACCOUNT_UPDATED: &str = "account.updated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Ignored,
}

/// Handled event, echoed back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookReceipt {
    pub event_id: String,
    pub event_type: String,
    pub outcome: WebhookOutcome,
}

pub struct WebhookService {
    secret: String,
    tolerance_seconds: i64,
    accounts: Arc<AccountSync>,
    payments: Arc<PaymentService>,
}

impl WebhookService {
    pub fn new(
        secret: impl Into<String>,
        tolerance_seconds: i64,
        accounts: Arc<AccountSync>,
        payments: Arc<PaymentService>,
    ) -> Self {
        Self {
            secret: secret.into(),
            tolerance_seconds,
            accounts,
            payments,
        }
    }

    /// Verify the raw body against the `Stripe-Signature` header, then dispatch it
    pub async fn handle(&self, payload: &[u8], signature: Option<&str>) -> AppResult<WebhookReceipt> {
        let signature = signature.ok_or(SignatureError::SignatureInvalid)?;
        let event = verify_webhook_signature(
            payload,
            signature,
            &self.secret,
            self.tolerance_seconds,
            chrono::Utc::now().timestamp(),
        )?;

        let outcome = self.dispatch(&event).await?;
        info!(
            "Webhook {} ({}): {:?}",
            event.id, event.event_type, outcome
        );

        Ok(WebhookReceipt {
            event_id: event.id,
            event_type: event.event_type,
            outcome,
        })
    }

    async fn dispatch(&self, event: &Event) -> AppResult<WebhookOutcome> {
        match event.event_type.as_str() {
            ACCOUNT_UPDATED => {
                let account: Account = serde_json::from_value(event.data.object.clone())
                    .map_err(|e| SignatureError::PayloadInvalid(e.to_string()))?;
                Ok(match self.accounts.handle_account_updated(&account).await? {
                    Some(_) => WebhookOutcome::Processed,
                    None => WebhookOutcome::Ignored,
                })
            }
            AMOUNT_CAPTURABLE_UPDATED | CHARGE_SUCCEEDED => {
                Ok(match self.payments.record_authorization(event).await? {
                    Some(_) => WebhookOutcome::Processed,
                    None => WebhookOutcome::Ignored,
                })
            }
            other => {
                debug!("Ignoring webhook event type {}", other);
                Ok(WebhookOutcome::Ignored)
            }
        }
    }
}
