// Settlement jobs: fetch a marketplace feed, derive items, reconcile, advance the checkpoint.
//
// Checkpoints are RFC 3339 timestamps in the config table. A checkpoint only moves once
// the pass has been flushed; an infrastructure error leaves it in place so the next run
// replays the same window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::engine::{ReconcileReport, Reconciler};
use super::feed::{debits_by_commercial_order, DebitItem, FeedBuilder, PayoutItem, RefundItem, TransferItem};
use super::payments::{DebitKind, PaymentService};
use super::payouts::PayoutKind;
use super::refunds::RefundKind;
use super::transfers::TransferKind;
use crate::api::accounts::{AccountSync, ShopFields};
use crate::api::notifications::AlertDispatcher;
use crate::error::{AppError, AppResult};
use crate::ledger::models::{checkpoints, AccountMapping, Payout, Refund, Transfer};
use crate::ledger::EntityStore;
use crate::marketplace::models::{InvoiceFilter, OrderFilter, OrderKind, ShopFilter};
use crate::marketplace::MarketplaceApi;
use crate::processor::models::{metadata_keys, Account, Metadata};
use crate::processor::PaymentProcessor;

/// Outcome of a shop sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShopSyncReport {
    pub fetched: usize,
    pub synced: usize,
    pub unmapped: usize,
    /// Onboarding links published on unmapped shops
    pub links_pushed: usize,
    /// Accounts whose KYC state could not be derived (alerted)
    pub ambiguous: usize,
    pub failed: usize,
}

fn order_checkpoint(kind: OrderKind) -> &'static str {
    match kind {
        OrderKind::Product => checkpoints::PRODUCT_ORDER_TRANSFERS,
        OrderKind::Service => checkpoints::SERVICE_ORDER_TRANSFERS,
    }
}

/// Entry point for every settlement operation
pub struct SettlementEngine {
    store: Arc<dyn EntityStore>,
    marketplace: Arc<dyn MarketplaceApi>,
    processor: Arc<dyn PaymentProcessor>,
    reconciler: Reconciler,
    feed: FeedBuilder,
    transfers: TransferKind,
    payouts: PayoutKind,
    refunds: RefundKind,
    debits: DebitKind,
    payments: Arc<PaymentService>,
    accounts: Arc<AccountSync>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn EntityStore>,
        marketplace: Arc<dyn MarketplaceApi>,
        processor: Arc<dyn PaymentProcessor>,
        alerts: AlertDispatcher,
        shop_fields: ShopFields,
    ) -> Self {
        let payments = Arc::new(PaymentService::new(
            store.clone(),
            processor.clone(),
            alerts.clone(),
        ));
        let accounts = Arc::new(AccountSync::new(
            store.clone(),
            marketplace.clone(),
            alerts.clone(),
            shop_fields,
        ));

        Self {
            reconciler: Reconciler::new(alerts),
            feed: FeedBuilder::new(store.clone()),
            transfers: TransferKind::new(store.clone(), processor.clone()),
            payouts: PayoutKind::new(store.clone(), processor.clone()),
            refunds: RefundKind::new(store.clone(), processor.clone(), marketplace.clone()),
            debits: DebitKind::new(store.clone(), marketplace.clone(), payments.clone()),
            payments,
            accounts,
            store,
            marketplace,
            processor,
        }
    }

    pub fn payments(&self) -> &Arc<PaymentService> {
        &self.payments
    }

    pub fn accounts(&self) -> &Arc<AccountSync> {
        &self.accounts
    }

    // ========== RECONCILE ==========

    pub async fn reconcile_transfers(&self, items: Vec<TransferItem>) -> AppResult<ReconcileReport> {
        self.reconciler.reconcile(&self.transfers, items).await
    }

    pub async fn reconcile_payouts(&self, items: Vec<PayoutItem>) -> AppResult<ReconcileReport> {
        self.reconciler.reconcile(&self.payouts, items).await
    }

    pub async fn reconcile_refunds(&self, items: Vec<RefundItem>) -> AppResult<ReconcileReport> {
        self.reconciler.reconcile(&self.refunds, items).await
    }

    pub async fn reconcile_debits(&self, items: Vec<DebitItem>) -> AppResult<ReconcileReport> {
        self.reconciler.reconcile(&self.debits, items).await
    }

    // ========== RETRY ==========

    pub async fn retriable_transfers(&self) -> AppResult<Vec<Transfer>> {
        self.store.retriable_transfers().await
    }

    pub async fn retriable_payouts(&self) -> AppResult<Vec<Payout>> {
        self.store.retriable_payouts().await
    }

    pub async fn retriable_refunds(&self) -> AppResult<Vec<Refund>> {
        self.store.retriable_refunds().await
    }

    pub async fn retry_transfers(&self) -> AppResult<ReconcileReport> {
        let transfers = self.store.retriable_transfers().await?;
        self.reconciler.drive(&self.transfers, transfers).await
    }

    pub async fn retry_payouts(&self) -> AppResult<ReconcileReport> {
        let payouts = self.store.retriable_payouts().await?;
        self.reconciler.drive(&self.payouts, payouts).await
    }

    pub async fn retry_refunds(&self) -> AppResult<ReconcileReport> {
        let refunds = self.store.retriable_refunds().await?;
        self.reconciler.drive(&self.refunds, refunds).await
    }

    // ========== CHECKPOINTS ==========

    pub async fn checkpoint(&self, key: &str) -> AppResult<Option<DateTime<Utc>>> {
        match self.store.get_config(key).await? {
            Some(value) => DateTime::parse_from_rfc3339(&value)
                .map(|date| Some(date.with_timezone(&Utc)))
                .map_err(|e| AppError::Internal(format!("Invalid checkpoint {key}={value}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn set_checkpoint(&self, key: &str, value: DateTime<Utc>) -> AppResult<()> {
        self.store.set_config(key, &value.to_rfc3339()).await?;
        info!("Checkpoint {} moved to {}", key, value);
        Ok(())
    }

    async fn advance_checkpoint(&self, key: &str, latest: Option<DateTime<Utc>>) -> AppResult<()> {
        match latest {
            Some(latest) => self.set_checkpoint(key, latest).await,
            None => Ok(()),
        }
    }

    // ========== JOBS ==========

    /// Seller transfers for orders updated since the checkpoint
    #[instrument(skip(self))]
    pub async fn run_order_transfers(&self, kind: OrderKind) -> AppResult<ReconcileReport> {
        let key = order_checkpoint(kind);
        let orders = match self.checkpoint(key).await? {
            Some(since) => self.marketplace.list_orders_by_date(kind, since).await?,
            None => self.marketplace.list_orders(kind, &OrderFilter::default()).await?,
        };

        let items = self.feed.transfers_from_orders(kind, &orders).await?;
        let report = self.reconcile_transfers(items).await?;

        let latest = orders.iter().map(|order| order.last_updated_date).max();
        self.advance_checkpoint(key, latest).await?;
        Ok(report)
    }

    /// Seller transfers for specific orders, regardless of the checkpoint
    #[instrument(skip(self))]
    pub async fn settle_orders(&self, kind: OrderKind, order_ids: Vec<String>) -> AppResult<ReconcileReport> {
        let orders = self.marketplace.list_orders_by_id(kind, order_ids).await?;
        let items = self.feed.transfers_from_orders(kind, &orders).await?;
        self.reconcile_transfers(items).await
    }

    /// Fee transfers and payouts for invoices created since the checkpoint
    #[instrument(skip(self))]
    pub async fn run_invoices(&self, transfers: bool, payouts: bool) -> AppResult<Vec<ReconcileReport>> {
        let filter = InvoiceFilter {
            created_since: self.checkpoint(checkpoints::INVOICES).await?,
        };
        let invoices = self.marketplace.list_invoices(&filter).await?;

        let mut reports = Vec::new();
        if transfers {
            let items = self.feed.transfers_from_invoices(&invoices).await?;
            reports.push(self.reconcile_transfers(items).await?);
        }
        if payouts {
            let items = self.feed.payouts_from_invoices(&invoices).await?;
            reports.push(self.reconcile_payouts(items).await?);
        }

        // Both halves share the checkpoint; it only moves when both ran
        if transfers && payouts {
            let latest = invoices.iter().map(|invoice| invoice.date_created).max();
            self.advance_checkpoint(checkpoints::INVOICES, latest).await?;
        }
        Ok(reports)
    }

    /// Pending refunds awaiting the operator
    #[instrument(skip(self))]
    pub async fn run_refunds(&self, kind: OrderKind) -> AppResult<ReconcileReport> {
        let pending = self.marketplace.list_pending_refunds(kind).await?;
        let items = self.feed.refunds_from_pending(kind, &pending).await?;
        self.reconcile_refunds(items).await
    }

    /// Pending debits matched against authorized payments
    #[instrument(skip(self))]
    pub async fn run_debits(&self) -> AppResult<ReconcileReport> {
        let debits = self.marketplace.list_pending_debits().await?;
        self.reconcile_debits(debits_by_commercial_order(debits)).await
    }

    /// Refresh mapped accounts for shops updated since the checkpoint
    #[instrument(skip(self))]
    pub async fn run_shop_sync(&self) -> AppResult<ShopSyncReport> {
        let filter = ShopFilter {
            updated_since: self.checkpoint(checkpoints::SHOPS).await?,
            ..Default::default()
        };
        let shops = self.marketplace.fetch_shops(&filter).await?;
        let shop_ids: Vec<i64> = shops.iter().map(|shop| shop.shop_id).collect();
        let mappings = self
            .store
            .find_account_mappings_by_shop_ids(&shop_ids)
            .await?;

        let unmapped: Vec<i64> = shop_ids
            .iter()
            .copied()
            .filter(|shop_id| !mappings.iter().any(|m| m.mirakl_shop_id == *shop_id))
            .collect();

        let mut report = ShopSyncReport {
            fetched: shops.len(),
            unmapped: unmapped.len(),
            ..Default::default()
        };

        if !unmapped.is_empty() {
            match self.accounts.push_onboarding_links(&unmapped).await {
                Ok(pushed) => report.links_pushed = pushed,
                Err(AppError::Marketplace(e)) => {
                    warn!("Onboarding links not pushed to {} shops: {}", unmapped.len(), e);
                    report.failed += unmapped.len();
                }
                Err(e) => return Err(e),
            }
        }

        for mapping in &mappings {
            let account = match self
                .processor
                .retrieve_account(&mapping.stripe_account_id)
                .await
            {
                Ok(account) => account,
                Err(e) => {
                    warn!(
                        "Shop {}: account {} not retrieved: {}",
                        mapping.mirakl_shop_id, mapping.stripe_account_id, e
                    );
                    report.failed += 1;
                    continue;
                }
            };

            match self.accounts.handle_account_updated(&account).await {
                Ok(_) => {}
                Err(AppError::Kyc(_)) => report.ambiguous += 1,
                Err(e) => return Err(e),
            }

            if let Err(e) = self.stamp_shop_id(&account, mapping).await {
                warn!("Account {} metadata not updated: {}", account.id, e);
                report.failed += 1;
                continue;
            }
            report.synced += 1;
        }

        // A failed shop keeps the window open so the next pass retries it
        if report.failed == 0 {
            let latest = shops.iter().filter_map(|shop| shop.last_updated_date).max();
            self.advance_checkpoint(checkpoints::SHOPS, latest).await?;
        } else {
            error!("{} shops failed to sync, checkpoint not advanced", report.failed);
        }

        info!(
            "shop sync: {} fetched, {} synced, {} unmapped, {} links pushed, {} ambiguous, {} failed",
            report.fetched,
            report.synced,
            report.unmapped,
            report.links_pushed,
            report.ambiguous,
            report.failed
        );
        Ok(report)
    }

    /// Bind the account opened from an onboarding link to the link's shop
    #[instrument(skip(self, token))]
    pub async fn complete_onboarding(&self, token: &str, stripe_account_id: &str) -> AppResult<AccountMapping> {
        let account = self.processor.retrieve_account(stripe_account_id).await?;
        let mapping = self.accounts.complete_onboarding(token, &account).await?;
        if let Err(e) = self.stamp_shop_id(&account, &mapping).await {
            warn!("Account {} metadata not updated: {}", account.id, e);
        }
        Ok(mapping)
    }

    /// Record the shop id on the connected account when it is missing
    async fn stamp_shop_id(&self, account: &Account, mapping: &AccountMapping) -> AppResult<()> {
        if account.metadata.contains_key(metadata_keys::MIRAKL_SHOP_ID) {
            return Ok(());
        }
        let metadata = Metadata::from([(
            metadata_keys::MIRAKL_SHOP_ID.to_string(),
            mapping.mirakl_shop_id.to_string(),
        )]);
        self.processor.update_account(&account.id, &metadata).await?;
        Ok(())
    }
}
