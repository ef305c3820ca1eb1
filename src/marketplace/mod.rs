pub mod client;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MarketplaceError;
use models::*;

pub use client::MiraklClient;

/// Operations consumed from the marketplace. Every list call drains pagination before returning.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn list_orders(
        &self,
        kind: OrderKind,
        filter: &OrderFilter,
    ) -> Result<Vec<Order>, MarketplaceError>;

    async fn list_orders_by_date(
        &self,
        kind: OrderKind,
        updated_since: DateTime<Utc>,
    ) -> Result<Vec<Order>, MarketplaceError> {
        self.list_orders(kind, &OrderFilter::by_date(updated_since))
            .await
    }

    async fn list_orders_by_id(
        &self,
        kind: OrderKind,
        order_ids: Vec<String>,
    ) -> Result<Vec<Order>, MarketplaceError> {
        self.list_orders(kind, &OrderFilter::by_ids(order_ids)).await
    }

    async fn list_orders_by_commercial_id(
        &self,
        kind: OrderKind,
        commercial_ids: Vec<String>,
    ) -> Result<Vec<Order>, MarketplaceError> {
        self.list_orders(kind, &OrderFilter::by_commercial_ids(commercial_ids))
            .await
    }

    async fn list_pending_debits(&self) -> Result<Vec<PendingDebit>, MarketplaceError>;

    async fn list_pending_refunds(&self, kind: OrderKind) -> Result<Vec<PendingRefund>, MarketplaceError>;

    async fn validate_pending_debits(&self, debits: &[DebitValidation]) -> Result<(), MarketplaceError>;

    async fn validate_pending_refunds(
        &self,
        kind: OrderKind,
        refunds: &[RefundValidation],
    ) -> Result<(), MarketplaceError>;

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, MarketplaceError>;

    async fn fetch_shops(&self, filter: &ShopFilter) -> Result<Vec<Shop>, MarketplaceError>;

    async fn patch_shops(&self, patches: &[ShopPatch]) -> Result<Vec<Shop>, MarketplaceError>;
}
