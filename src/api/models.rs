use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::ledger::models::checkpoints;
use crate::marketplace::models::OrderKind;

// ========== REQUEST MODELS ==========

/// `product` or `service` path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKindParam {
    Product,
    Service,
}

impl From<OrderKindParam> for OrderKind {
    fn from(param: OrderKindParam) -> Self {
        match param {
            OrderKindParam::Product => OrderKind::Product,
            OrderKindParam::Service => OrderKind::Service,
        }
    }
}

/// Settle specific orders regardless of the checkpoint
#[derive(Debug, Deserialize)]
pub struct SettleOrdersRequest {
    pub order_ids: Vec<String>,
}

/// Capture a stored authorization. Captures the authorized amount when absent.
#[derive(Debug, Default, Deserialize)]
pub struct CaptureRequest {
    #[serde(default)]
    pub amount: Option<i64>,
}

/// Connected account opened from an onboarding link
#[derive(Debug, Deserialize)]
pub struct OnboardingRequest {
    pub stripe_account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBody {
    pub value: Option<DateTime<Utc>>,
}

/// Public name of a checkpoint, as used in `/checkpoints/:name`
pub fn checkpoint_key(name: &str) -> AppResult<&'static str> {
    match name {
        "product_order_transfers" => Ok(checkpoints::PRODUCT_ORDER_TRANSFERS),
        "service_order_transfers" => Ok(checkpoints::SERVICE_ORDER_TRANSFERS),
        "invoices" => Ok(checkpoints::INVOICES),
        "shops" => Ok(checkpoints::SHOPS),
        other => Err(AppError::BadRequest(format!("Unknown checkpoint {}", other))),
    }
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of a manually triggered job
#[derive(Debug, Serialize)]
pub struct JobResponse<T> {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: T,
}
