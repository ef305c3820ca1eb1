use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::engine::{ItemOutcome, SettlementKind};
use super::feed::TransferItem;
use crate::error::AppResult;
use crate::ledger::models::{transfer_key, HoldCause, Transfer, TransferStatus};
use crate::ledger::EntityStore;
use crate::processor::models::{metadata_keys, CreateTransfer, Metadata};
use crate::processor::PaymentProcessor;

pub struct TransferKind {
    store: Arc<dyn EntityStore>,
    processor: Arc<dyn PaymentProcessor>,
}

impl TransferKind {
    pub fn new(store: Arc<dyn EntityStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { store, processor }
    }
}

fn transfer_metadata(transfer: &Transfer, shop_id: i64) -> Metadata {
    Metadata::from([
        (metadata_keys::MIRAKL_ID.to_string(), transfer.mirakl_id.clone()),
        (
            metadata_keys::MIRAKL_TYPE.to_string(),
            transfer.transfer_type.as_str().to_string(),
        ),
        (metadata_keys::MIRAKL_SHOP_ID.to_string(), shop_id.to_string()),
    ])
}

#[async_trait]
impl SettlementKind for TransferKind {
    type Item = TransferItem;
    type Entity = Transfer;

    fn name(&self) -> &'static str {
        "transfer"
    }

    fn item_key(&self, item: &TransferItem) -> String {
        transfer_key(item.transfer_type, &item.mirakl_id)
    }

    fn entity_key(&self, entity: &Transfer) -> String {
        entity.key()
    }

    async fn find_existing(&self, items: &[&TransferItem]) -> AppResult<Vec<Transfer>> {
        let keys: Vec<_> = items
            .iter()
            .map(|item| (item.transfer_type, item.mirakl_id.clone()))
            .collect();
        self.store.find_transfers(&keys).await
    }

    fn build(&self, item: &TransferItem) -> Option<Transfer> {
        let mut transfer = Transfer::new(
            item.transfer_type,
            item.mirakl_id.clone(),
            item.amount,
            item.currency.clone(),
        );
        transfer.transaction_id = item.transaction_id.clone();
        transfer.account_mapping = item.account_mapping.clone();
        Some(transfer)
    }

    fn refresh(&self, transfer: &mut Transfer, item: &TransferItem) {
        transfer.amount = item.amount;
        transfer.currency = item.currency.clone();
        if item.transaction_id.is_some() {
            transfer.transaction_id = item.transaction_id.clone();
        }
        if item.account_mapping.is_some() {
            transfer.account_mapping = item.account_mapping.clone();
        }
    }

    fn is_retriable(&self, transfer: &Transfer) -> bool {
        transfer.is_retriable()
    }

    async fn claim(&self, transfers: Vec<Transfer>) -> AppResult<Vec<Transfer>> {
        self.store.insert_transfers(&transfers).await
    }

    async fn apply(&self, transfer: &mut Transfer, _item: Option<&TransferItem>) -> AppResult<ItemOutcome> {
        let Some(mapping) = transfer.account_mapping.clone() else {
            let reason = format!("No account mapping found for {}", transfer.key());
            warn!("{}", reason);
            transfer.mark_failed(&reason)?;
            return Ok(ItemOutcome::Failed(reason));
        };

        if transfer.amount == 0 {
            transfer.mark_aborted("Nothing to transfer")?;
            return Ok(ItemOutcome::Aborted("Nothing to transfer".into()));
        }

        if transfer.amount < 0 {
            let reason = format!("Transfer amount must be positive, got {}", transfer.amount);
            return Ok(if transfer.transfer_type.is_fee() {
                transfer.mark_on_hold(HoldCause::NegativeAmount, &reason)?;
                ItemOutcome::Held(reason)
            } else {
                transfer.mark_failed(&reason)?;
                ItemOutcome::Failed(reason)
            });
        }

        let request = CreateTransfer {
            amount: transfer.amount,
            currency: transfer.currency.clone(),
            account: mapping.stripe_account_id.clone(),
            source_transaction: transfer.transaction_id.clone(),
            from_connected_account: transfer.transfer_type.from_connected_account(),
            metadata: transfer_metadata(transfer, mapping.mirakl_shop_id),
        };

        match self.processor.create_transfer(&request).await {
            Ok(created) => {
                info!(
                    "Transfer {} created: {} ({} {})",
                    transfer.key(),
                    created.id,
                    transfer.amount,
                    transfer.currency
                );
                transfer.mark_created(created.id)?;
                Ok(ItemOutcome::Succeeded)
            }
            Err(e) if transfer.transfer_type.is_fee() && e.is_amount_precondition() => {
                warn!("Transfer {} on hold: {}", transfer.key(), e);
                let reason = e.reason();
                transfer.mark_on_hold(HoldCause::ProcessorRejected, &reason)?;
                Ok(ItemOutcome::Held(reason))
            }
            Err(e) => {
                warn!(
                    "Transfer {} failed: amount={} account={} code={:?}: {}",
                    transfer.key(),
                    transfer.amount,
                    mapping.stripe_account_id,
                    e.code(),
                    e
                );
                let reason = e.reason();
                transfer.mark_failed(&reason)?;
                Ok(ItemOutcome::Failed(reason))
            }
        }
    }

    fn release(&self, transfer: &mut Transfer, reason: &str) -> bool {
        transfer.status == TransferStatus::Pending && transfer.mark_failed(reason).is_ok()
    }

    async fn flush(&self, transfers: &[Transfer]) -> AppResult<()> {
        self.store.save_transfers(transfers).await
    }
}
