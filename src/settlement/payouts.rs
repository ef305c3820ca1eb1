use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::engine::{ItemOutcome, SettlementKind};
use super::feed::PayoutItem;
use crate::error::AppResult;
use crate::ledger::models::{Payout, PayoutStatus};
use crate::ledger::EntityStore;
use crate::processor::models::{metadata_keys, CreatePayout, Metadata};
use crate::processor::PaymentProcessor;

pub struct PayoutKind {
    store: Arc<dyn EntityStore>,
    processor: Arc<dyn PaymentProcessor>,
}

impl PayoutKind {
    pub fn new(store: Arc<dyn EntityStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }
}

#[async_trait]
impl SettlementKind for PayoutKind {
    type Item = PayoutItem;
    type Entity = Payout;

    fn name(&self) -> &'static str {
        "payout"
    }

    fn item_key(&self, item: &PayoutItem) -> String {
        item.invoice_id.to_string()
    }

    fn entity_key(&self, payout: &Payout) -> String {
        payout.mirakl_invoice_id.to_string()
    }

    async fn find_existing(&self, items: &[&PayoutItem]) -> AppResult<Vec<Payout>> {
        let ids: Vec<i64> = items.iter().map(|item| item.invoice_id).collect();
        self.store.find_payouts(&ids).await
    }

    /// Invoices with nothing transferred never produce a payout
    fn build(&self, item: &PayoutItem) -> Option<Payout> {
        if item.amount == 0 {
            return None;
        }
        let mut payout = Payout::new(item.invoice_id, item.amount, item.currency.clone());
        payout.account_mapping = item.account_mapping.clone();
        Some(payout)
    }

    fn refresh(&self, payout: &mut Payout, item: &PayoutItem) {
        payout.amount = item.amount;
        payout.currency = item.currency.clone();
        if item.account_mapping.is_some() {
            payout.account_mapping = item.account_mapping.clone();
        }
    }

    fn is_retriable(&self, payout: &Payout) -> bool {
        payout.is_retriable()
    }

    async fn claim(&self, payouts: Vec<Payout>) -> AppResult<Vec<Payout>> {
        self.store.insert_payouts(&payouts).await
    }

    async fn apply(&self, payout: &mut Payout, _item: Option<&PayoutItem>) -> AppResult<ItemOutcome> {
        let Some(mapping) = payout.account_mapping.clone() else {
            let reason = format!(
                "No account mapping found for invoice {}",
                payout.mirakl_invoice_id
            );
            payout.mark_failed(&reason)?;
            return Ok(ItemOutcome::Failed(reason));
        };

        if !mapping.payout_enabled {
            let reason = format!(
                "Payouts are disabled for account {}",
                mapping.stripe_account_id
            );
            warn!("Invoice {}: {}", payout.mirakl_invoice_id, reason);
            payout.mark_failed(&reason)?;
            return Ok(ItemOutcome::Failed(reason));
        }

        if payout.amount < 0 {
            let reason = format!("Payout amount must be positive, got {}", payout.amount);
            payout.mark_failed(&reason)?;
            return Ok(ItemOutcome::Failed(reason));
        }

        let request = CreatePayout {
            amount: payout.amount,
            currency: payout.currency.clone(),
            account: mapping.stripe_account_id.clone(),
            metadata: Metadata::from([
                (
                    metadata_keys::MIRAKL_INVOICE_ID.to_string(),
                    payout.mirakl_invoice_id.to_string(),
                ),
                (
                    metadata_keys::MIRAKL_SHOP_ID.to_string(),
                    mapping.mirakl_shop_id.to_string(),
                ),
            ]),
        };

        match self.processor.create_payout(&request).await {
            Ok(created) => {
                info!(
                    "Payout for invoice {} created: {}",
                    payout.mirakl_invoice_id, created.id
                );
                payout.mark_created(created.id)?;
                Ok(ItemOutcome::Succeeded)
            }
            Err(e) => {
                warn!(
                    "Payout for invoice {} failed: amount={} account={}: {}",
                    payout.mirakl_invoice_id, payout.amount, mapping.stripe_account_id, e
                );
                let reason = e.reason();
                payout.mark_failed(&reason)?;
                Ok(ItemOutcome::Failed(reason))
            }
        }
    }

    fn release(&self, payout: &mut Payout, reason: &str) -> bool {
        payout.status == PayoutStatus::Pending && payout.mark_failed(reason).is_ok()
    }

    async fn flush(&self, payouts: &[Payout]) -> AppResult<()> {
        self.store.save_payouts(payouts).await
    }
}
