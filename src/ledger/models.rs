use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Stored failure reasons never exceed this many characters
pub const MAX_REASON_LENGTH: usize = 1024;

/// A PENDING row untouched for this long belongs to a pass that never finished
pub const PENDING_LEASE_MINUTES: i64 = 30;

/// Rows still PENDING and last updated before this instant are retried
pub fn pending_lease_cutoff() -> DateTime<Utc> {
    Utc::now() - Duration::minutes(PENDING_LEASE_MINUTES)
}

/// Truncate a failure reason to [`MAX_REASON_LENGTH`] characters
pub fn truncate_reason(reason: &str) -> String {
    match reason.char_indices().nth(MAX_REASON_LENGTH) {
        Some((byte_index, _)) => reason[..byte_index].to_string(),
        None => reason.to_string(),
    }
}

/// What a transfer is paying for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transfer_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferType {
    ProductOrder,
    ServiceOrder,
    /// Reversal of a seller transfer after a buyer refund
    Refund,
    Subscription,
    ExtraCredits,
    ExtraInvoices,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::ProductOrder => "PRODUCT_ORDER",
            TransferType::ServiceOrder => "SERVICE_ORDER",
            TransferType::Refund => "REFUND",
            TransferType::Subscription => "SUBSCRIPTION",
            TransferType::ExtraCredits => "EXTRA_CREDITS",
            TransferType::ExtraInvoices => "EXTRA_INVOICES",
        }
    }

    /// Fees charged to the seller by the operator
    pub fn is_fee(&self) -> bool {
        matches!(self, TransferType::Subscription | TransferType::ExtraInvoices)
    }

    /// Fees are pulled from the connected account into the platform balance
    pub fn from_connected_account(&self) -> bool {
        self.is_fee()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transfer_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Created,
    Failed,
    OnHold,
    Aborted,
}

/// Why a transfer was put ON_HOLD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "hold_cause", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldCause {
    /// Fee computed below zero; released by a feed that recomputes it positive
    NegativeAmount,
    /// Processor refused the amount; left for the operator
    ProcessorRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payout_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Created,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "refund_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Created,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "refund_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundType {
    ProductOrder,
    ServiceOrder,
}

impl RefundType {
    /// Transfer type that paid the seller for the refunded order
    pub fn order_transfer_type(&self) -> TransferType {
        match self {
            RefundType::ProductOrder => TransferType::ProductOrder,
            RefundType::ServiceOrder => TransferType::ServiceOrder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    ToCapture,
    Captured,
    Cancelled,
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        })*
    };
}

display_as_debug!(TransferStatus, HoldCause, PayoutStatus, RefundStatus, RefundType, PaymentStatus);

/// Binding between a Mirakl shop and a Stripe connected account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AccountMapping {
    pub id: Uuid,
    pub mirakl_shop_id: i64,
    pub stripe_account_id: String,
    pub payin_enabled: bool,
    pub payout_enabled: bool,
    pub disabled_reason: Option<String>,
    pub onboarding_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountMapping {
    pub fn new(mirakl_shop_id: i64, stripe_account_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mirakl_shop_id,
            stripe_account_id: stripe_account_id.into(),
            payin_enabled: false,
            payout_enabled: false,
            disabled_reason: None,
            onboarding_token: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Funds moved between the platform balance and a connected account
///
/// INVARIANT: (transfer_type, mirakl_id) is unique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub mirakl_id: String,
    pub transfer_type: TransferType,
    pub amount: i64,
    pub currency: String,
    /// Charge the transfer is funded from, when known
    pub transaction_id: Option<String>,
    pub transfer_id: Option<String>,
    pub status: TransferStatus,
    pub failed_reason: Option<String>,
    /// Set while ON_HOLD
    pub hold_cause: Option<HoldCause>,
    pub account_mapping: Option<AccountMapping>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn new(
        transfer_type: TransferType,
        mirakl_id: impl Into<String>,
        amount: i64,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mirakl_id: mirakl_id.into(),
            transfer_type,
            amount,
            currency: currency.into(),
            transaction_id: None,
            transfer_id: None,
            status: TransferStatus::Pending,
            failed_reason: None,
            hold_cause: None,
            account_mapping: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> String {
        transfer_key(self.transfer_type, &self.mirakl_id)
    }
}

/// Lookup key for a transfer: one per kind per external item
pub fn transfer_key(transfer_type: TransferType, mirakl_id: &str) -> String {
    format!("{}:{}", transfer_type.as_str(), mirakl_id)
}

/// Funds moved from a connected account balance to the seller's bank account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub mirakl_invoice_id: i64,
    pub amount: i64,
    pub currency: String,
    pub stripe_payout_id: Option<String>,
    pub status: PayoutStatus,
    pub failed_reason: Option<String>,
    pub account_mapping: Option<AccountMapping>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payout {
    pub fn new(mirakl_invoice_id: i64, amount: i64, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mirakl_invoice_id,
            amount,
            currency: currency.into(),
            stripe_payout_id: None,
            status: PayoutStatus::Pending,
            failed_reason: None,
            account_mapping: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Buyer refund plus the reversal of the matching seller transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Refund {
    pub id: Uuid,
    pub mirakl_refund_id: String,
    pub mirakl_order_id: String,
    pub mirakl_commercial_order_id: String,
    pub refund_type: RefundType,
    pub amount: i64,
    pub currency: String,
    pub transaction_id: Option<String>,
    pub stripe_refund_id: Option<String>,
    pub stripe_reversal_id: Option<String>,
    pub status: RefundStatus,
    pub status_reason: Option<String>,
    pub mirakl_validation_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    pub fn new(
        refund_type: RefundType,
        mirakl_refund_id: impl Into<String>,
        mirakl_order_id: impl Into<String>,
        mirakl_commercial_order_id: impl Into<String>,
        amount: i64,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mirakl_refund_id: mirakl_refund_id.into(),
            mirakl_order_id: mirakl_order_id.into(),
            mirakl_commercial_order_id: mirakl_commercial_order_id.into(),
            refund_type,
            amount,
            currency: currency.into(),
            transaction_id: None,
            stripe_refund_id: None,
            stripe_reversal_id: None,
            status: RefundStatus::Pending,
            status_reason: None,
            mirakl_validation_time: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Authorized buyer payment for one commercial order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub mirakl_commercial_order_id: String,
    /// Payment intent (`pi_`) or legacy charge (`ch_`, `py_`) id
    pub stripe_payment_id: String,
    /// Amount authorized on the processor side
    pub stripe_amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub status_reason: Option<String>,
    /// When the pending debits were validated back to Mirakl
    pub mirakl_validation_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        mirakl_commercial_order_id: impl Into<String>,
        stripe_payment_id: impl Into<String>,
        stripe_amount: i64,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mirakl_commercial_order_id: mirakl_commercial_order_id.into(),
            stripe_payment_id: stripe_payment_id.into(),
            stripe_amount,
            currency: currency.into(),
            status: PaymentStatus::ToCapture,
            status_reason: None,
            mirakl_validation_time: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Key/value checkpoint row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint keys written by the settlement jobs
pub mod checkpoints {
    pub const PRODUCT_ORDER_TRANSFERS: &str = "product_order_transfers_checkpoint";
    pub const SERVICE_ORDER_TRANSFERS: &str = "service_order_transfers_checkpoint";
    pub const INVOICES: &str = "invoices_checkpoint";
    pub const SHOPS: &str = "shops_checkpoint";
}
