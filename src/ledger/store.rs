use async_trait::async_trait;

use super::models::*;
use crate::error::AppResult;

/// Persistence boundary for settlement entities.
///
/// `insert_*` calls claim rows: entities that collide with an existing unique key are
/// dropped and only the rows actually inserted are returned. Callers treat a dropped row as
/// "already exists, skip".
#[async_trait]
pub trait EntityStore: Send + Sync {
    // ========== TRANSFERS ==========

    async fn find_transfers(&self, keys: &[(TransferType, String)]) -> AppResult<Vec<Transfer>>;

    async fn insert_transfers(&self, transfers: &[Transfer]) -> AppResult<Vec<Transfer>>;

    async fn save_transfers(&self, transfers: &[Transfer]) -> AppResult<()>;

    /// Failed transfers and PENDING rows older than the claim lease. Held transfers are
    /// excluded; only a feed that recomputes a negative amount as positive releases them.
    async fn retriable_transfers(&self) -> AppResult<Vec<Transfer>>;

    // ========== PAYOUTS ==========

    async fn find_payouts(&self, invoice_ids: &[i64]) -> AppResult<Vec<Payout>>;

    async fn insert_payouts(&self, payouts: &[Payout]) -> AppResult<Vec<Payout>>;

    async fn save_payouts(&self, payouts: &[Payout]) -> AppResult<()>;

    /// Failed payouts and PENDING rows older than the claim lease
    async fn retriable_payouts(&self) -> AppResult<Vec<Payout>>;

    // ========== REFUNDS ==========

    async fn find_refunds(&self, refund_ids: &[String]) -> AppResult<Vec<Refund>>;

    async fn insert_refunds(&self, refunds: &[Refund]) -> AppResult<Vec<Refund>>;

    async fn save_refunds(&self, refunds: &[Refund]) -> AppResult<()>;

    /// Failed refunds and PENDING rows older than the claim lease
    async fn retriable_refunds(&self) -> AppResult<Vec<Refund>>;

    // ========== PAYMENTS ==========

    async fn find_payments_by_commercial_ids(&self, commercial_ids: &[String]) -> AppResult<Vec<Payment>>;

    async fn find_payment_by_stripe_id(&self, stripe_payment_id: &str) -> AppResult<Option<Payment>>;

    /// Returns false when a payment with the same processor id already exists
    async fn insert_payment(&self, payment: &Payment) -> AppResult<bool>;

    async fn save_payments(&self, payments: &[Payment]) -> AppResult<()>;

    // ========== ACCOUNT MAPPINGS ==========

    async fn find_account_mappings_by_shop_ids(&self, shop_ids: &[i64]) -> AppResult<Vec<AccountMapping>>;

    async fn find_account_mapping_by_stripe_id(&self, stripe_account_id: &str) -> AppResult<Option<AccountMapping>>;

    /// Insert or overwrite by id
    async fn save_account_mapping(&self, mapping: &AccountMapping) -> AppResult<()>;

    // ========== ONBOARDING ==========

    /// Store `token` for the shop unless it already has one; returns the shop's token
    async fn issue_onboarding_token(&self, shop_id: i64, token: &str) -> AppResult<String>;

    async fn find_onboarding_shop(&self, token: &str) -> AppResult<Option<i64>>;

    // ========== CONFIG ==========

    async fn get_config(&self, key: &str) -> AppResult<Option<String>>;

    async fn set_config(&self, key: &str, value: &str) -> AppResult<()>;
}
