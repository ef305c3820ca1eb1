// Buyer refunds. Sub-steps, each skipped once its id is stored:
//   1. processor refund against the captured payment
//   2. reversal of the seller transfer for the refunded order (only when it was CREATED)
//   3. validation of the refund back to Mirakl
// A refund is CREATED only after step 3.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::engine::{ItemOutcome, SettlementKind};
use super::feed::RefundItem;
use crate::error::AppResult;
use crate::ledger::models::{Refund, RefundStatus, RefundType, Transfer, TransferStatus, TransferType};
use crate::ledger::EntityStore;
use crate::marketplace::models::{
    from_minor_units, OrderKind, PaymentValidationStatus, RefundValidation,
};
use crate::marketplace::MarketplaceApi;
use crate::processor::ids::resolve_payment_target;
use crate::processor::models::{metadata_keys, CreateRefund, Metadata};
use crate::processor::PaymentProcessor;

pub struct RefundKind {
    store: Arc<dyn EntityStore>,
    processor: Arc<dyn PaymentProcessor>,
    marketplace: Arc<dyn MarketplaceApi>,
}

fn order_kind(refund_type: RefundType) -> OrderKind {
    match refund_type {
        RefundType::ProductOrder => OrderKind::Product,
        RefundType::ServiceOrder => OrderKind::Service,
    }
}

fn refund_metadata(refund: &Refund) -> Metadata {
    Metadata::from([
        (
            metadata_keys::MIRAKL_REFUND_ID.to_string(),
            refund.mirakl_refund_id.clone(),
        ),
        (
            metadata_keys::MIRAKL_COMMERCIAL_ORDER_ID.to_string(),
            refund.mirakl_commercial_order_id.clone(),
        ),
    ])
}

impl RefundKind {
    pub fn new(
        store: Arc<dyn EntityStore>,
        processor: Arc<dyn PaymentProcessor>,
        marketplace: Arc<dyn MarketplaceApi>,
    ) -> Self {
        Self {
            store,
            processor,
            marketplace,
        }
    }

    /// Step 1. `Some(reason)` when the refund could not be created.
    async fn create_processor_refund(&self, refund: &mut Refund) -> AppResult<Option<String>> {
        let Some(transaction_id) = refund.transaction_id.clone() else {
            return Ok(Some(format!(
                "No captured payment found for commercial order {}",
                refund.mirakl_commercial_order_id
            )));
        };

        let created = match resolve_payment_target(self.processor.as_ref(), &transaction_id).await {
            Ok(target) => {
                let request = CreateRefund {
                    target,
                    amount: Some(refund.amount),
                    metadata: refund_metadata(refund),
                };
                self.processor.create_refund(&request).await
            }
            Err(e) => Err(e),
        };

        match created {
            Ok(created) => {
                info!(
                    "Refund {} created on processor: {}",
                    refund.mirakl_refund_id, created.id
                );
                refund.record_stripe_refund(created.id)?;
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "Refund {} failed: amount={} transaction={} code={:?}: {}",
                    refund.mirakl_refund_id,
                    refund.amount,
                    transaction_id,
                    e.code(),
                    e
                );
                Ok(Some(e.reason()))
            }
        }
    }

    /// Step 2. Nothing to reverse when the seller was never paid for the order.
    async fn reverse_seller_transfer(&self, refund: &mut Refund) -> AppResult<Option<String>> {
        let transfer_type = refund.refund_type.order_transfer_type();
        let order_transfer = self
            .store
            .find_transfers(&[(transfer_type, refund.mirakl_order_id.clone())])
            .await?
            .into_iter()
            .find(|transfer| transfer.status == TransferStatus::Created);

        let Some(order_transfer) = order_transfer else {
            info!(
                "Refund {}: no created {} transfer for order {}, nothing to reverse",
                refund.mirakl_refund_id, transfer_type, refund.mirakl_order_id
            );
            return Ok(None);
        };
        let Some(transfer_id) = order_transfer.transfer_id.as_deref() else {
            return Ok(None);
        };

        let amount = refund.amount.min(order_transfer.amount);
        let reversal = match self
            .processor
            .reverse_transfer(transfer_id, amount, &refund_metadata(refund))
            .await
        {
            Ok(reversal) => reversal,
            Err(e) => {
                warn!(
                    "Reversal of {} for refund {} failed: amount={} code={:?}: {}",
                    transfer_id,
                    refund.mirakl_refund_id,
                    amount,
                    e.code(),
                    e
                );
                return Ok(Some(e.reason()));
            }
        };

        refund.record_reversal(reversal.id.clone())?;

        let mut audit = Transfer::new(
            TransferType::Refund,
            refund.mirakl_refund_id.clone(),
            amount,
            refund.currency.clone(),
        );
        audit.account_mapping = order_transfer.account_mapping.clone();
        audit.transaction_id = Some(transfer_id.to_string());
        audit.mark_created(reversal.id)?;
        if self.store.insert_transfers(&[audit]).await?.is_empty() {
            warn!(
                "Refund {}: reversal transfer already recorded",
                refund.mirakl_refund_id
            );
        }
        Ok(None)
    }

    /// Step 3
    async fn validate_on_marketplace(&self, refund: &mut Refund) -> AppResult<Option<String>> {
        let validation = RefundValidation {
            refund_id: refund.mirakl_refund_id.clone(),
            amount: from_minor_units(refund.amount),
            currency_iso_code: refund.currency.to_uppercase(),
            payment_status: PaymentValidationStatus::Ok,
            transaction_number: refund.stripe_refund_id.clone(),
        };

        match self
            .marketplace
            .validate_pending_refunds(order_kind(refund.refund_type), &[validation])
            .await
        {
            Ok(()) => {
                refund.record_validation()?;
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "Validation of refund {} failed, processor refund {:?} kept: {}",
                    refund.mirakl_refund_id, refund.stripe_refund_id, e
                );
                Ok(Some(e.body()))
            }
        }
    }
}

#[async_trait]
impl SettlementKind for RefundKind {
    type Item = RefundItem;
    type Entity = Refund;

    fn name(&self) -> &'static str {
        "refund"
    }

    fn item_key(&self, item: &RefundItem) -> String {
        item.refund_id.clone()
    }

    fn entity_key(&self, refund: &Refund) -> String {
        refund.mirakl_refund_id.clone()
    }

    async fn find_existing(&self, items: &[&RefundItem]) -> AppResult<Vec<Refund>> {
        let ids: Vec<String> = items.iter().map(|item| item.refund_id.clone()).collect();
        self.store.find_refunds(&ids).await
    }

    fn build(&self, item: &RefundItem) -> Option<Refund> {
        let mut refund = Refund::new(
            item.refund_type,
            item.refund_id.clone(),
            item.order_id.clone(),
            item.commercial_order_id.clone(),
            item.amount,
            item.currency.clone(),
        );
        refund.transaction_id = item.transaction_id.clone();
        Some(refund)
    }

    fn refresh(&self, refund: &mut Refund, item: &RefundItem) {
        // The amount is frozen once the processor refund exists
        if refund.stripe_refund_id.is_none() {
            refund.amount = item.amount;
            refund.currency = item.currency.clone();
        }
        if item.transaction_id.is_some() {
            refund.transaction_id = item.transaction_id.clone();
        }
    }

    fn is_retriable(&self, refund: &Refund) -> bool {
        refund.is_retriable()
    }

    async fn claim(&self, refunds: Vec<Refund>) -> AppResult<Vec<Refund>> {
        self.store.insert_refunds(&refunds).await
    }

    async fn apply(&self, refund: &mut Refund, _item: Option<&RefundItem>) -> AppResult<ItemOutcome> {
        if refund.stripe_refund_id.is_none() {
            if let Some(reason) = self.create_processor_refund(refund).await? {
                refund.mark_failed(&reason)?;
                return Ok(ItemOutcome::Failed(reason));
            }
        }

        if refund.stripe_reversal_id.is_none() {
            if let Some(reason) = self.reverse_seller_transfer(refund).await? {
                refund.mark_failed(&reason)?;
                return Ok(ItemOutcome::Failed(reason));
            }
        }

        if refund.mirakl_validation_time.is_none() {
            if let Some(reason) = self.validate_on_marketplace(refund).await? {
                refund.mark_failed(&reason)?;
                return Ok(ItemOutcome::Failed(reason));
            }
        }

        refund.mark_created()?;
        Ok(ItemOutcome::Succeeded)
    }

    /// Completed sub-steps stay recorded; a retry only runs what is missing
    fn release(&self, refund: &mut Refund, reason: &str) -> bool {
        refund.status == RefundStatus::Pending && refund.mark_failed(reason).is_ok()
    }

    async fn flush(&self, refunds: &[Refund]) -> AppResult<()> {
        self.store.save_refunds(refunds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MarketplaceError;
    use crate::ledger::models::RefundStatus;
    use crate::processor::models::Charge;
    use crate::testing::{Harness, ProcessorCall};

    fn item(refund_id: &str, amount: i64, transaction_id: Option<&str>) -> RefundItem {
        RefundItem {
            refund_type: RefundType::ProductOrder,
            refund_id: refund_id.into(),
            order_id: "O1-A".into(),
            commercial_order_id: "O1".into(),
            amount,
            currency: "eur".into(),
            transaction_id: transaction_id.map(str::to_string),
        }
    }

    async fn stored(harness: &Harness, refund_id: &str) -> Refund {
        harness
            .store
            .find_refunds(&[refund_id.to_string()])
            .await
            .unwrap()
            .remove(0)
    }

    async fn seed_order_transfer(harness: &Harness, amount: i64) {
        let mut transfer = Transfer::new(TransferType::ProductOrder, "O1-A", amount, "eur");
        transfer.account_mapping = Some(harness.map_shop(2000, "acct_1", true).await);
        transfer.mark_created("tr_seller").unwrap();
        harness.store.insert_transfers(&[transfer]).await.unwrap();
    }

    #[tokio::test]
    async fn test_refund_reverses_seller_transfer_and_validates() {
        let harness = Harness::new().await;
        seed_order_transfer(&harness, 300).await;

        let report = harness
            .engine
            .reconcile_refunds(vec![item("R1", 500, Some("pi_1"))])
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);

        let refund = stored(&harness, "R1").await;
        assert_eq!(refund.status, RefundStatus::Created);
        assert!(refund.stripe_refund_id.is_some());
        assert!(refund.stripe_reversal_id.is_some());
        assert!(refund.mirakl_validation_time.is_some());

        let reversal = harness
            .processor
            .calls()
            .into_iter()
            .find_map(|call| match call {
                ProcessorCall::Reversal { transfer_id, amount } => Some((transfer_id, amount)),
                _ => None,
            })
            .unwrap();
        assert_eq!(reversal, ("tr_seller".to_string(), 300));

        let audit = harness
            .store
            .find_transfers(&[(TransferType::Refund, "R1".into())])
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, TransferStatus::Created);
        assert_eq!(audit[0].amount, 300);

        let validations = harness.marketplace.refund_validations();
        assert_eq!(validations.len(), 1);
        assert_eq!(validations[0].refund_id, "R1");
        assert_eq!(validations[0].transaction_number, refund.stripe_refund_id);
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_refund_and_retries_validation_only() {
        let harness = Harness::new().await;
        harness.marketplace.fail_validations(MarketplaceError::Api {
            status: 400,
            body: "{\"message\":\"refund locked\"}".into(),
        });

        harness
            .engine
            .reconcile_refunds(vec![item("R2", 500, Some("pi_1"))])
            .await
            .unwrap();

        let failed = stored(&harness, "R2").await;
        assert_eq!(failed.status, RefundStatus::Failed);
        assert_eq!(failed.status_reason.as_deref(), Some("{\"message\":\"refund locked\"}"));
        let refund_id = failed.stripe_refund_id.clone().unwrap();

        harness.marketplace.clear_failures();
        let report = harness.engine.retry_refunds().await.unwrap();
        assert_eq!(report.succeeded, 1);

        let created = stored(&harness, "R2").await;
        assert_eq!(created.status, RefundStatus::Created);
        assert_eq!(created.stripe_refund_id, Some(refund_id));

        let refunds_created = harness
            .processor
            .calls()
            .iter()
            .filter(|call| matches!(call, ProcessorCall::Refund(_)))
            .count();
        assert_eq!(refunds_created, 1);
    }

    #[tokio::test]
    async fn test_refund_without_payment_fails_without_call() {
        let harness = Harness::new().await;
        let report = harness
            .engine
            .reconcile_refunds(vec![item("R3", 500, None)])
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert!(harness.processor.calls().is_empty());
        assert!(harness.marketplace.refund_validations().is_empty());
    }

    #[tokio::test]
    async fn test_charge_with_intent_is_refunded_through_intent() {
        let harness = Harness::new().await;
        harness.processor.add_charge(Charge {
            id: "ch_1".into(),
            amount: 500,
            currency: "eur".into(),
            captured: true,
            payment_intent: Some("pi_9".into()),
            metadata: Metadata::new(),
        });

        harness
            .engine
            .reconcile_refunds(vec![item("R4", 500, Some("ch_1"))])
            .await
            .unwrap();

        let request = harness
            .processor
            .calls()
            .into_iter()
            .find_map(|call| match call {
                ProcessorCall::Refund(request) => Some(request),
                _ => None,
            })
            .unwrap();
        assert_eq!(request.target.id(), "pi_9");
        assert_eq!(request.amount, Some(500));
    }

    #[tokio::test]
    async fn test_created_refund_not_replayed() {
        let harness = Harness::new().await;
        let feed = vec![item("R5", 500, Some("pi_1"))];
        harness.engine.reconcile_refunds(feed.clone()).await.unwrap();
        let calls = harness.processor.calls().len();

        let again = harness.engine.reconcile_refunds(feed).await.unwrap();
        assert_eq!(again.skipped, 1);
        assert_eq!(harness.processor.calls().len(), calls);
    }
}
