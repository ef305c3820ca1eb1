use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::MarketplaceError;

/// Convert a marketplace decimal amount into integer minor units (cents)
pub fn to_minor_units(amount: Decimal) -> Result<i64, MarketplaceError> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| MarketplaceError::Decode(format!("amount {amount} out of range")))
}

/// Convert integer minor units back to the decimal amount the marketplace expects
pub fn from_minor_units(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

/// Marketplace order families. Product and service orders live behind different endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Product,
    Service,
}

/// States in which the buyer has not been debited (or never will be)
const UNPAID_ORDER_STATES: &[&str] = &[
    "STAGING",
    "WAITING_ACCEPTANCE",
    "WAITING_DEBIT",
    "WAITING_DEBIT_PAYMENT",
    "REFUSED",
    "CANCELED",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tax {
    pub amount: Decimal,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLineRefund {
    pub id: String,
    #[serde(default)]
    pub amount: Decimal,
    #[serde(default)]
    pub shipping_amount: Decimal,
    #[serde(default)]
    pub taxes: Vec<Tax>,
    #[serde(default)]
    pub shipping_taxes: Vec<Tax>,
}

impl OrderLineRefund {
    pub fn total(&self) -> Decimal {
        self.amount
            + self.shipping_amount
            + sum_taxes(&self.taxes)
            + sum_taxes(&self.shipping_taxes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    #[serde(default)]
    pub order_line_id: Option<String>,
    #[serde(default)]
    pub taxes: Vec<Tax>,
    #[serde(default)]
    pub shipping_taxes: Vec<Tax>,
    #[serde(default)]
    pub refunds: Vec<OrderLineRefund>,
}

/// Product (`/api/orders`) or service (`/api/mms/orders`) order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(alias = "id")]
    pub order_id: String,
    #[serde(alias = "commercial_order_id")]
    pub commercial_id: String,
    pub shop_id: i64,
    #[serde(alias = "currency_code")]
    pub currency_iso_code: String,
    #[serde(alias = "state")]
    pub order_state: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub shipping_price: Decimal,
    #[serde(default)]
    pub total_commission: Decimal,
    #[serde(default)]
    pub order_lines: Vec<OrderLine>,
    #[serde(default)]
    pub customer_debited_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transaction_number: Option<String>,
    pub last_updated_date: DateTime<Utc>,
}

impl Order {
    pub fn is_paid(&self) -> bool {
        !UNPAID_ORDER_STATES.contains(&self.order_state.as_str())
    }

    pub fn taxes(&self) -> Decimal {
        self.order_lines
            .iter()
            .map(|line| sum_taxes(&line.taxes) + sum_taxes(&line.shipping_taxes))
            .sum()
    }

    pub fn refunded(&self) -> Decimal {
        self.order_lines
            .iter()
            .flat_map(|line| line.refunds.iter())
            .map(OrderLineRefund::total)
            .sum()
    }

    /// Amount owed to the seller: total paid by the buyer minus commission and refunds
    pub fn seller_amount(&self) -> Decimal {
        self.price + self.shipping_price + self.taxes() - self.total_commission - self.refunded()
    }
}

fn sum_taxes(taxes: &[Tax]) -> Decimal {
    taxes.iter().map(|tax| tax.amount).sum()
}

/// Order waiting for the operator to debit the buyer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDebit {
    pub order_id: String,
    #[serde(alias = "commercial_id")]
    pub order_commercial_id: String,
    pub shop_id: i64,
    pub amount: Decimal,
    pub currency_iso_code: String,
    #[serde(default)]
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentValidationStatus {
    Ok,
    Refused,
}

/// Body line for `PUT /api/payment/debit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebitValidation {
    pub order_id: String,
    pub amount: Decimal,
    pub currency_iso_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub payment_status: PaymentValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_number: Option<String>,
}

impl DebitValidation {
    pub fn for_debit(
        debit: &PendingDebit,
        status: PaymentValidationStatus,
        transaction_number: Option<String>,
    ) -> Self {
        Self {
            order_id: debit.order_id.clone(),
            amount: debit.amount,
            currency_iso_code: debit.currency_iso_code.clone(),
            customer_id: debit.customer_id.clone(),
            payment_status: status,
            transaction_number,
        }
    }
}

/// Buyer refund waiting for the operator, flattened from the order line structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRefund {
    pub id: String,
    pub order_id: String,
    pub commercial_order_id: String,
    pub shop_id: i64,
    pub amount: Decimal,
    pub currency_iso_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PendingRefundLineItem {
    pub id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PendingRefundLine {
    #[serde(default)]
    pub refunds: Vec<PendingRefundLineItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PendingRefundOrder {
    pub order_id: String,
    pub order_commercial_id: String,
    pub shop_id: i64,
    pub currency_iso_code: String,
    #[serde(default)]
    pub order_lines: Vec<PendingRefundLine>,
}

impl PendingRefundOrder {
    pub fn into_refunds(self) -> Vec<PendingRefund> {
        let PendingRefundOrder {
            order_id,
            order_commercial_id,
            shop_id,
            currency_iso_code,
            order_lines,
        } = self;

        order_lines
            .into_iter()
            .flat_map(|line| line.refunds)
            .map(|refund| PendingRefund {
                id: refund.id,
                order_id: order_id.clone(),
                commercial_order_id: order_commercial_id.clone(),
                shop_id,
                amount: refund.amount,
                currency_iso_code: currency_iso_code.clone(),
            })
            .collect()
    }
}

/// Body line for `PUT /api/payment/refund`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundValidation {
    pub refund_id: String,
    pub amount: Decimal,
    pub currency_iso_code: String,
    pub payment_status: PaymentValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSummary {
    #[serde(default)]
    pub amount_transferred: Decimal,
    #[serde(default)]
    pub total_subscription_incl_tax: Decimal,
    #[serde(default)]
    pub total_other_credits_incl_tax: Decimal,
    #[serde(default)]
    pub total_other_invoices_incl_tax: Decimal,
}

/// Seller accounting document issued at the end of a billing cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: i64,
    pub shop_id: i64,
    pub currency_iso_code: String,
    pub date_created: DateTime<Utc>,
    #[serde(default)]
    pub summary: InvoiceSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalField {
    pub code: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub shop_id: i64,
    #[serde(default)]
    pub shop_name: Option<String>,
    #[serde(default)]
    pub last_updated_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shop_additional_fields: Vec<AdditionalField>,
}

/// Partial shop update for `PUT /api/shops`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShopPatch {
    pub shop_id: i64,
    pub shop_additional_fields: Vec<AdditionalField>,
}

impl ShopPatch {
    pub fn field(shop_id: i64, code: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            shop_id,
            shop_additional_fields: vec![AdditionalField {
                code: code.into(),
                value: value.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub updated_since: Option<DateTime<Utc>>,
    pub order_ids: Vec<String>,
    pub commercial_ids: Vec<String>,
}

impl OrderFilter {
    pub fn by_date(updated_since: DateTime<Utc>) -> Self {
        Self {
            updated_since: Some(updated_since),
            ..Default::default()
        }
    }

    pub fn by_ids(order_ids: Vec<String>) -> Self {
        Self {
            order_ids,
            ..Default::default()
        }
    }

    pub fn by_commercial_ids(commercial_ids: Vec<String>) -> Self {
        Self {
            commercial_ids,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub created_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopFilter {
    pub shop_ids: Vec<i64>,
    pub updated_since: Option<DateTime<Utc>>,
    pub paginate: bool,
}

impl Default for ShopFilter {
    fn default() -> Self {
        Self {
            shop_ids: Vec::new(),
            updated_since: None,
            paginate: true,
        }
    }
}

// Response envelopes

#[derive(Debug, Deserialize)]
pub(crate) struct OrdersPage {
    #[serde(default)]
    pub orders: Vec<Order>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenPage<T> {
    #[serde(default = "Vec::new", alias = "invoices")]
    pub data: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PendingDebitsPage {
    #[serde(default)]
    pub orders: Vec<PendingDebit>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PendingRefundsPage {
    #[serde(default)]
    pub orders: Vec<PendingRefundOrder>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ShopsPage {
    #[serde(default)]
    pub shops: Vec<Shop>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ShopReturn {
    #[serde(default)]
    pub shop_updated: Option<Shop>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ShopReturns {
    #[serde(default)]
    pub shop_returns: Vec<ShopReturn>,
}
