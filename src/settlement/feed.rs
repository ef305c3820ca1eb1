//! Marketplace records turned into reconciliation feed items.
//!
//! Amounts are converted to minor units here. Items whose amount cannot be represented are
//! logged and dropped; everything else is kept in marketplace order.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use crate::error::AppResult;
use crate::ledger::models::{AccountMapping, PaymentStatus, RefundType, TransferType};
use crate::ledger::EntityStore;
use crate::marketplace::models::{
    to_minor_units, Invoice, Order, OrderKind, PendingDebit, PendingRefund,
};
use crate::processor::ids::{classify_payment_id, PaymentIdKind};

#[derive(Debug, Clone, PartialEq)]
pub struct TransferItem {
    pub transfer_type: TransferType,
    pub mirakl_id: String,
    pub shop_id: i64,
    pub amount: i64,
    pub currency: String,
    pub transaction_id: Option<String>,
    pub account_mapping: Option<AccountMapping>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutItem {
    pub invoice_id: i64,
    pub shop_id: i64,
    pub amount: i64,
    pub currency: String,
    pub account_mapping: Option<AccountMapping>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundItem {
    pub refund_type: RefundType,
    pub refund_id: String,
    pub order_id: String,
    pub commercial_order_id: String,
    pub amount: i64,
    pub currency: String,
    /// Captured payment the refund is drawn from
    pub transaction_id: Option<String>,
}

/// Pending debits of one commercial order
#[derive(Debug, Clone, PartialEq)]
pub struct DebitItem {
    pub commercial_order_id: String,
    pub total: i64,
    pub currency: String,
    pub debits: Vec<PendingDebit>,
}

fn transfer_type_for(kind: OrderKind) -> TransferType {
    match kind {
        OrderKind::Product => TransferType::ProductOrder,
        OrderKind::Service => TransferType::ServiceOrder,
    }
}

pub fn refund_type_for(kind: OrderKind) -> RefundType {
    match kind {
        OrderKind::Product => RefundType::ProductOrder,
        OrderKind::Service => RefundType::ServiceOrder,
    }
}

fn minor_units(what: &str, id: &str, amount: Decimal) -> Option<i64> {
    match to_minor_units(amount) {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Dropping {} {} from feed: {}", what, id, e);
            None
        }
    }
}

/// Builds feed items, resolving shops and commercial orders against the store in batches
pub struct FeedBuilder {
    store: Arc<dyn EntityStore>,
}

impl FeedBuilder {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    async fn mappings_by_shop(&self, shop_ids: Vec<i64>) -> AppResult<HashMap<i64, AccountMapping>> {
        let mut shop_ids = shop_ids;
        shop_ids.sort_unstable();
        shop_ids.dedup();
        Ok(self
            .store
            .find_account_mappings_by_shop_ids(&shop_ids)
            .await?
            .into_iter()
            .map(|mapping| (mapping.mirakl_shop_id, mapping))
            .collect())
    }

    /// Captured payment id per commercial order
    async fn captured_payments(&self, commercial_ids: Vec<String>) -> AppResult<HashMap<String, String>> {
        let mut commercial_ids = commercial_ids;
        commercial_ids.sort();
        commercial_ids.dedup();
        Ok(self
            .store
            .find_payments_by_commercial_ids(&commercial_ids)
            .await?
            .into_iter()
            .filter(|payment| payment.status == PaymentStatus::Captured)
            .map(|payment| (payment.mirakl_commercial_order_id, payment.stripe_payment_id))
            .collect())
    }

    /// Seller transfers for paid orders
    pub async fn transfers_from_orders(
        &self,
        kind: OrderKind,
        orders: &[Order],
    ) -> AppResult<Vec<TransferItem>> {
        let paid: Vec<&Order> = orders.iter().filter(|order| order.is_paid()).collect();
        let mappings = self
            .mappings_by_shop(paid.iter().map(|order| order.shop_id).collect())
            .await?;
        let payments = self
            .captured_payments(paid.iter().map(|order| order.commercial_id.clone()).collect())
            .await?;

        Ok(paid
            .into_iter()
            .filter_map(|order| {
                let amount = minor_units("order", &order.order_id, order.seller_amount())?;
                // Transfers can only be funded from a charge, not from an intent id
                let transaction_id = payments
                    .get(&order.commercial_id)
                    .filter(|id| classify_payment_id(id) == Some(PaymentIdKind::Charge))
                    .cloned();

                Some(TransferItem {
                    transfer_type: transfer_type_for(kind),
                    mirakl_id: order.order_id.clone(),
                    shop_id: order.shop_id,
                    amount,
                    currency: order.currency_iso_code.to_lowercase(),
                    transaction_id,
                    account_mapping: mappings.get(&order.shop_id).cloned(),
                })
            })
            .collect())
    }

    /// Subscription, extra credit and extra invoice transfers, one of each per invoice
    pub async fn transfers_from_invoices(&self, invoices: &[Invoice]) -> AppResult<Vec<TransferItem>> {
        let mappings = self
            .mappings_by_shop(invoices.iter().map(|invoice| invoice.shop_id).collect())
            .await?;

        let mut items = Vec::new();
        for invoice in invoices {
            let invoice_id = invoice.invoice_id.to_string();
            let amounts = [
                (TransferType::Subscription, invoice.summary.total_subscription_incl_tax),
                (TransferType::ExtraCredits, invoice.summary.total_other_credits_incl_tax),
                (TransferType::ExtraInvoices, invoice.summary.total_other_invoices_incl_tax),
            ];

            for (transfer_type, amount) in amounts {
                let Some(amount) = minor_units("invoice", &invoice_id, amount) else {
                    continue;
                };
                items.push(TransferItem {
                    transfer_type,
                    mirakl_id: invoice_id.clone(),
                    shop_id: invoice.shop_id,
                    amount,
                    currency: invoice.currency_iso_code.to_lowercase(),
                    transaction_id: None,
                    account_mapping: mappings.get(&invoice.shop_id).cloned(),
                });
            }
        }
        Ok(items)
    }

    pub async fn payouts_from_invoices(&self, invoices: &[Invoice]) -> AppResult<Vec<PayoutItem>> {
        let mappings = self
            .mappings_by_shop(invoices.iter().map(|invoice| invoice.shop_id).collect())
            .await?;

        Ok(invoices
            .iter()
            .filter_map(|invoice| {
                let amount = minor_units(
                    "invoice",
                    &invoice.invoice_id.to_string(),
                    invoice.summary.amount_transferred,
                )?;
                Some(PayoutItem {
                    invoice_id: invoice.invoice_id,
                    shop_id: invoice.shop_id,
                    amount,
                    currency: invoice.currency_iso_code.to_lowercase(),
                    account_mapping: mappings.get(&invoice.shop_id).cloned(),
                })
            })
            .collect())
    }

    pub async fn refunds_from_pending(
        &self,
        kind: OrderKind,
        refunds: &[PendingRefund],
    ) -> AppResult<Vec<RefundItem>> {
        let payments = self
            .captured_payments(refunds.iter().map(|r| r.commercial_order_id.clone()).collect())
            .await?;

        Ok(refunds
            .iter()
            .filter_map(|refund| {
                Some(RefundItem {
                    refund_type: refund_type_for(kind),
                    refund_id: refund.id.clone(),
                    order_id: refund.order_id.clone(),
                    commercial_order_id: refund.commercial_order_id.clone(),
                    amount: minor_units("refund", &refund.id, refund.amount)?,
                    currency: refund.currency_iso_code.to_lowercase(),
                    transaction_id: payments.get(&refund.commercial_order_id).cloned(),
                })
            })
            .collect())
    }
}

/// Group pending debits by commercial order, keeping first-seen order
pub fn debits_by_commercial_order(debits: Vec<PendingDebit>) -> Vec<DebitItem> {
    let mut items: Vec<DebitItem> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for debit in debits {
        let Some(amount) = minor_units("debit", &debit.order_id, debit.amount) else {
            continue;
        };
        match positions.get(&debit.order_commercial_id) {
            Some(&index) => {
                items[index].total += amount;
                items[index].debits.push(debit);
            }
            None => {
                positions.insert(debit.order_commercial_id.clone(), items.len());
                items.push(DebitItem {
                    commercial_order_id: debit.order_commercial_id.clone(),
                    total: amount,
                    currency: debit.currency_iso_code.to_lowercase(),
                    debits: vec![debit],
                });
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::ledger::models::Payment;
    use crate::ledger::MemoryEntityStore;
    use crate::marketplace::models::InvoiceSummary;

    fn order(id: &str, commercial: &str, shop_id: i64, state: &str, price: Decimal) -> Order {
        Order {
            order_id: id.into(),
            commercial_id: commercial.into(),
            shop_id,
            currency_iso_code: "EUR".into(),
            order_state: state.into(),
            price,
            shipping_price: Decimal::ZERO,
            total_commission: Decimal::ZERO,
            order_lines: Vec::new(),
            customer_debited_date: None,
            transaction_number: None,
            last_updated_date: Utc::now(),
        }
    }

    fn debit(order_id: &str, commercial: &str, amount: Decimal) -> PendingDebit {
        PendingDebit {
            order_id: order_id.into(),
            order_commercial_id: commercial.into(),
            shop_id: 1,
            amount,
            currency_iso_code: "EUR".into(),
            customer_id: None,
        }
    }

    #[tokio::test]
    async fn test_order_transfers_resolve_mapping_and_charge() {
        let store = Arc::new(MemoryEntityStore::new());
        store
            .save_account_mapping(&AccountMapping::new(2000, "acct_1"))
            .await
            .unwrap();
        let mut captured = Payment::new("C1", "ch_1", 2400, "eur");
        captured.status = PaymentStatus::Captured;
        store.insert_payment(&captured).await.unwrap();

        let feed = FeedBuilder::new(store.clone());
        let orders = vec![
            order("O1", "C1", 2000, "SHIPPING", dec!(24.00)),
            order("O2", "C2", 9999, "SHIPPED", dec!(10.00)),
            order("O3", "C3", 2000, "WAITING_DEBIT_PAYMENT", dec!(5.00)),
        ];

        let items = feed
            .transfers_from_orders(OrderKind::Product, &orders)
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].mirakl_id, "O1");
        assert_eq!(items[0].amount, 2400);
        assert_eq!(items[0].currency, "eur");
        assert_eq!(items[0].transaction_id.as_deref(), Some("ch_1"));
        assert_eq!(
            items[0].account_mapping.as_ref().map(|m| m.stripe_account_id.as_str()),
            Some("acct_1")
        );
        assert!(items[1].account_mapping.is_none());
        assert!(items[1].transaction_id.is_none());
    }

    #[tokio::test]
    async fn test_invoice_yields_three_fee_kinds() {
        let feed = FeedBuilder::new(Arc::new(MemoryEntityStore::new()));
        let invoice = Invoice {
            invoice_id: 42,
            shop_id: 2000,
            currency_iso_code: "EUR".into(),
            date_created: Utc::now(),
            summary: InvoiceSummary {
                amount_transferred: dec!(100),
                total_subscription_incl_tax: dec!(-1.50),
                total_other_credits_incl_tax: dec!(3),
                total_other_invoices_incl_tax: dec!(0),
            },
        };

        let transfers = feed.transfers_from_invoices(&[invoice.clone()]).await.unwrap();
        let amounts: Vec<(TransferType, i64)> = transfers
            .iter()
            .map(|t| (t.transfer_type, t.amount))
            .collect();
        assert_eq!(
            amounts,
            vec![
                (TransferType::Subscription, -150),
                (TransferType::ExtraCredits, 300),
                (TransferType::ExtraInvoices, 0),
            ]
        );

        let payouts = feed.payouts_from_invoices(&[invoice]).await.unwrap();
        assert_eq!(payouts[0].amount, 10000);
        assert_eq!(payouts[0].invoice_id, 42);
    }

    #[test]
    fn test_debits_grouped_by_commercial_order() {
        let items = debits_by_commercial_order(vec![
            debit("O1-A", "C1", dec!(10)),
            debit("O2-A", "C2", dec!(5)),
            debit("O1-B", "C1", dec!(4.50)),
        ]);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].commercial_order_id, "C1");
        assert_eq!(items[0].total, 1450);
        assert_eq!(items[0].debits.len(), 2);
        assert_eq!(items[1].total, 500);
    }
}
