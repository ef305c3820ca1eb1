use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::EntityStore;
use crate::error::{AppError, AppResult};

/// In-process store with the same unique constraints as the Postgres schema.
/// Used when no DATABASE_URL is configured.
pub struct MemoryEntityStore {
    transfers: RwLock<HashMap<String, Transfer>>,
    payouts: RwLock<HashMap<i64, Payout>>,
    refunds: RwLock<HashMap<String, Refund>>,
    payments: RwLock<HashMap<String, Payment>>,
    mappings: RwLock<HashMap<Uuid, AccountMapping>>,
    /// shop id -> onboarding token
    onboarding: RwLock<HashMap<i64, String>>,
    config: RwLock<HashMap<String, String>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
            payouts: RwLock::new(HashMap::new()),
            refunds: RwLock::new(HashMap::new()),
            payments: RwLock::new(HashMap::new()),
            mappings: RwLock::new(HashMap::new()),
            onboarding: RwLock::new(HashMap::new()),
            config: RwLock::new(HashMap::new()),
        }
    }

    /// Relations are re-read on every load, like a join would
    async fn attach_mapping(&self, mapping: Option<AccountMapping>) -> Option<AccountMapping> {
        let mapping = mapping?;
        self.mappings.read().await.get(&mapping.id).cloned()
    }

    async fn load_transfer(&self, mut transfer: Transfer) -> Transfer {
        transfer.account_mapping = self.attach_mapping(transfer.account_mapping).await;
        transfer
    }

    async fn load_payout(&self, mut payout: Payout) -> Payout {
        payout.account_mapping = self.attach_mapping(payout.account_mapping).await;
        payout
    }
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_transfers(&self, keys: &[(TransferType, String)]) -> AppResult<Vec<Transfer>> {
        let found: Vec<Transfer> = {
            let transfers = self.transfers.read().await;
            keys.iter()
                .filter_map(|(transfer_type, mirakl_id)| {
                    transfers.get(&transfer_key(*transfer_type, mirakl_id)).cloned()
                })
                .collect()
        };

        let mut result = Vec::with_capacity(found.len());
        for transfer in found {
            result.push(self.load_transfer(transfer).await);
        }
        Ok(result)
    }

    async fn insert_transfers(&self, transfers: &[Transfer]) -> AppResult<Vec<Transfer>> {
        let mut stored = self.transfers.write().await;
        let mut claimed = Vec::new();
        for transfer in transfers {
            let key = transfer.key();
            if stored.contains_key(&key) {
                continue;
            }
            stored.insert(key, transfer.clone());
            claimed.push(transfer.clone());
        }
        Ok(claimed)
    }

    async fn save_transfers(&self, transfers: &[Transfer]) -> AppResult<()> {
        let mut stored = self.transfers.write().await;
        for transfer in transfers {
            stored.insert(transfer.key(), transfer.clone());
        }
        Ok(())
    }

    async fn retriable_transfers(&self) -> AppResult<Vec<Transfer>> {
        let retriable: Vec<Transfer> = self
            .transfers
            .read()
            .await
            .values()
            .filter(|t| t.is_retriable())
            .cloned()
            .collect();

        let mut result = Vec::with_capacity(retriable.len());
        for transfer in retriable {
            result.push(self.load_transfer(transfer).await);
        }
        result.sort_by_key(|t| t.created_at);
        Ok(result)
    }

    async fn find_payouts(&self, invoice_ids: &[i64]) -> AppResult<Vec<Payout>> {
        let found: Vec<Payout> = {
            let payouts = self.payouts.read().await;
            invoice_ids.iter().filter_map(|id| payouts.get(id).cloned()).collect()
        };

        let mut result = Vec::with_capacity(found.len());
        for payout in found {
            result.push(self.load_payout(payout).await);
        }
        Ok(result)
    }

    async fn insert_payouts(&self, payouts: &[Payout]) -> AppResult<Vec<Payout>> {
        let mut stored = self.payouts.write().await;
        let mut claimed = Vec::new();
        for payout in payouts {
            if stored.contains_key(&payout.mirakl_invoice_id) {
                continue;
            }
            stored.insert(payout.mirakl_invoice_id, payout.clone());
            claimed.push(payout.clone());
        }
        Ok(claimed)
    }

    async fn save_payouts(&self, payouts: &[Payout]) -> AppResult<()> {
        let mut stored = self.payouts.write().await;
        for payout in payouts {
            stored.insert(payout.mirakl_invoice_id, payout.clone());
        }
        Ok(())
    }

    async fn retriable_payouts(&self) -> AppResult<Vec<Payout>> {
        let retriable: Vec<Payout> = self
            .payouts
            .read()
            .await
            .values()
            .filter(|p| p.is_retriable())
            .cloned()
            .collect();

        let mut result = Vec::with_capacity(retriable.len());
        for payout in retriable {
            result.push(self.load_payout(payout).await);
        }
        result.sort_by_key(|p| p.created_at);
        Ok(result)
    }

    async fn find_refunds(&self, refund_ids: &[String]) -> AppResult<Vec<Refund>> {
        let refunds = self.refunds.read().await;
        Ok(refund_ids
            .iter()
            .filter_map(|id| refunds.get(id).cloned())
            .collect())
    }

    async fn insert_refunds(&self, refunds: &[Refund]) -> AppResult<Vec<Refund>> {
        let mut stored = self.refunds.write().await;
        let mut claimed = Vec::new();
        for refund in refunds {
            if stored.contains_key(&refund.mirakl_refund_id) {
                continue;
            }
            stored.insert(refund.mirakl_refund_id.clone(), refund.clone());
            claimed.push(refund.clone());
        }
        Ok(claimed)
    }

    async fn save_refunds(&self, refunds: &[Refund]) -> AppResult<()> {
        let mut stored = self.refunds.write().await;
        for refund in refunds {
            stored.insert(refund.mirakl_refund_id.clone(), refund.clone());
        }
        Ok(())
    }

    async fn retriable_refunds(&self) -> AppResult<Vec<Refund>> {
        let mut retriable: Vec<Refund> = self
            .refunds
            .read()
            .await
            .values()
            .filter(|r| r.is_retriable())
            .cloned()
            .collect();
        retriable.sort_by_key(|r| r.created_at);
        Ok(retriable)
    }

    async fn find_payments_by_commercial_ids(&self, commercial_ids: &[String]) -> AppResult<Vec<Payment>> {
        let wanted: HashSet<&String> = commercial_ids.iter().collect();
        let mut found: Vec<Payment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| wanted.contains(&p.mirakl_commercial_order_id))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn find_payment_by_stripe_id(&self, stripe_payment_id: &str) -> AppResult<Option<Payment>> {
        Ok(self.payments.read().await.get(stripe_payment_id).cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> AppResult<bool> {
        let mut stored = self.payments.write().await;
        if stored.contains_key(&payment.stripe_payment_id) {
            return Ok(false);
        }
        stored.insert(payment.stripe_payment_id.clone(), payment.clone());
        Ok(true)
    }

    async fn save_payments(&self, payments: &[Payment]) -> AppResult<()> {
        let mut stored = self.payments.write().await;
        for payment in payments {
            stored.insert(payment.stripe_payment_id.clone(), payment.clone());
        }
        Ok(())
    }

    async fn find_account_mappings_by_shop_ids(&self, shop_ids: &[i64]) -> AppResult<Vec<AccountMapping>> {
        let wanted: HashSet<i64> = shop_ids.iter().copied().collect();
        Ok(self
            .mappings
            .read()
            .await
            .values()
            .filter(|m| wanted.contains(&m.mirakl_shop_id))
            .cloned()
            .collect())
    }

    async fn find_account_mapping_by_stripe_id(&self, stripe_account_id: &str) -> AppResult<Option<AccountMapping>> {
        Ok(self
            .mappings
            .read()
            .await
            .values()
            .find(|m| m.stripe_account_id == stripe_account_id)
            .cloned())
    }

    async fn save_account_mapping(&self, mapping: &AccountMapping) -> AppResult<()> {
        let mut mappings = self.mappings.write().await;
        let conflict = mappings.values().any(|m| {
            m.id != mapping.id
                && (m.mirakl_shop_id == mapping.mirakl_shop_id
                    || m.stripe_account_id == mapping.stripe_account_id
                    || (mapping.onboarding_token.is_some()
                        && m.onboarding_token == mapping.onboarding_token))
        });
        if conflict {
            return Err(AppError::BadRequest(format!(
                "Account mapping for shop {} conflicts with an existing mapping",
                mapping.mirakl_shop_id
            )));
        }
        mappings.insert(mapping.id, mapping.clone());
        Ok(())
    }

    async fn issue_onboarding_token(&self, shop_id: i64, token: &str) -> AppResult<String> {
        let mut onboarding = self.onboarding.write().await;
        Ok(onboarding
            .entry(shop_id)
            .or_insert_with(|| token.to_string())
            .clone())
    }

    async fn find_onboarding_shop(&self, token: &str) -> AppResult<Option<i64>> {
        Ok(self
            .onboarding
            .read()
            .await
            .iter()
            .find(|(_, stored)| stored.as_str() == token)
            .map(|(shop_id, _)| *shop_id))
    }

    async fn get_config(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.config.read().await.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> AppResult<()> {
        self.config
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
impl MemoryEntityStore {
    /// Number of stored transfers, all statuses
    pub async fn transfer_count(&self) -> usize {
        self.transfers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_transfers_claims_unique_keys_once() {
        let store = MemoryEntityStore::new();
        let first = Transfer::new(TransferType::ProductOrder, "O1", 100, "eur");
        let duplicate = Transfer::new(TransferType::ProductOrder, "O1", 999, "eur");
        let other_type = Transfer::new(TransferType::ServiceOrder, "O1", 100, "eur");

        let claimed = store.insert_transfers(&[first.clone()]).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let claimed = store
            .insert_transfers(&[duplicate, other_type.clone()])
            .await
            .unwrap();
        assert_eq!(claimed, vec![other_type]);
        assert_eq!(store.transfer_count().await, 2);

        let found = store
            .find_transfers(&[(TransferType::ProductOrder, "O1".into())])
            .await
            .unwrap();
        assert_eq!(found[0].amount, 100);
    }

    #[tokio::test]
    async fn test_loaded_transfer_sees_current_mapping() {
        let store = MemoryEntityStore::new();
        let mut mapping = AccountMapping::new(2000, "acct_1");
        store.save_account_mapping(&mapping).await.unwrap();

        let mut transfer = Transfer::new(TransferType::ProductOrder, "O1", 100, "eur");
        transfer.account_mapping = Some(mapping.clone());
        store.insert_transfers(&[transfer]).await.unwrap();

        mapping.payout_enabled = true;
        store.save_account_mapping(&mapping).await.unwrap();

        let found = store
            .find_transfers(&[(TransferType::ProductOrder, "O1".into())])
            .await
            .unwrap();
        assert!(found[0].account_mapping.as_ref().unwrap().payout_enabled);
    }

    #[tokio::test]
    async fn test_account_mapping_uniqueness() {
        let store = MemoryEntityStore::new();
        store
            .save_account_mapping(&AccountMapping::new(1, "acct_1"))
            .await
            .unwrap();
        assert!(store
            .save_account_mapping(&AccountMapping::new(2, "acct_1"))
            .await
            .is_err());
        assert!(store
            .save_account_mapping(&AccountMapping::new(1, "acct_2"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_onboarding_token_issued_once_per_shop() {
        let store = MemoryEntityStore::new();
        assert_eq!(store.issue_onboarding_token(2000, "tok_a").await.unwrap(), "tok_a");
        assert_eq!(store.issue_onboarding_token(2000, "tok_b").await.unwrap(), "tok_a");

        assert_eq!(store.find_onboarding_shop("tok_a").await.unwrap(), Some(2000));
        assert_eq!(store.find_onboarding_shop("tok_b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let store = MemoryEntityStore::new();
        assert_eq!(store.get_config(checkpoints::INVOICES).await.unwrap(), None);
        store
            .set_config(checkpoints::INVOICES, "2024-01-01T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(
            store.get_config(checkpoints::INVOICES).await.unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }
}
