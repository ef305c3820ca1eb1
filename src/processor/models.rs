use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Metadata = BTreeMap<String, String>;

/// Metadata keys attached to processor objects
pub mod metadata_keys {
    pub const INTEGRATION_NAME: &str = "integration_name";
    pub const INTEGRATION_VERSION: &str = "integration_version";
    pub const MIRAKL_ID: &str = "mirakl_id";
    pub const MIRAKL_TYPE: &str = "mirakl_type";
    pub const MIRAKL_SHOP_ID: &str = "mirakl_shop_id";
    pub const MIRAKL_COMMERCIAL_ORDER_ID: &str = "mirakl_commercial_order_id";
    pub const MIRAKL_REFUND_ID: &str = "mirakl_refund_id";
    pub const MIRAKL_INVOICE_ID: &str = "mirakl_invoice_id";
}

/// Which charge a refund, capture or cancellation applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentTarget {
    PaymentIntent(String),
    Charge(String),
}

impl PaymentTarget {
    pub fn id(&self) -> &str {
        match self {
            PaymentTarget::PaymentIntent(id) | PaymentTarget::Charge(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTransfer {
    pub amount: i64,
    pub currency: String,
    /// Connected account on the seller side of the transfer
    pub account: String,
    pub source_transaction: Option<String>,
    /// Pull funds from `account` into the platform instead of pushing to it
    pub from_connected_account: bool,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayout {
    pub amount: i64,
    pub currency: String,
    pub account: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRefund {
    pub target: PaymentTarget,
    /// Full refund when absent
    pub amount: Option<i64>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeTransfer {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripePayout {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeRefund {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReversal {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub transfer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub captured: bool,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_capturable: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRequirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub pending_verification: Vec<String>,
    #[serde(default)]
    pub disabled_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub requirements: AccountRequirements,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Authenticated webhook event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}
