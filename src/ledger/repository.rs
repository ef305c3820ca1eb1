use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{prelude::FromRow, PgPool, Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::EntityStore;
use crate::error::AppResult;

const MAPPING_COLUMNS: &str = "id, mirakl_shop_id, stripe_account_id, payin_enabled, payout_enabled, \
     disabled_reason, onboarding_token, created_at, updated_at";

const TRANSFER_COLUMNS: &str = "id, mirakl_id, transfer_type, amount, currency, transaction_id, \
     transfer_id, status, failed_reason, hold_cause, account_mapping_id, created_at, updated_at";

const PAYOUT_COLUMNS: &str = "id, mirakl_invoice_id, amount, currency, stripe_payout_id, status, \
     failed_reason, account_mapping_id, created_at, updated_at";

const REFUND_COLUMNS: &str = "id, mirakl_refund_id, mirakl_order_id, mirakl_commercial_order_id, \
     refund_type, amount, currency, transaction_id, stripe_refund_id, stripe_reversal_id, status, \
     status_reason, mirakl_validation_time, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, mirakl_commercial_order_id, stripe_payment_id, stripe_amount, \
     currency, status, status_reason, mirakl_validation_time, created_at, updated_at";

#[derive(Debug, FromRow)]
struct TransferRow {
    id: Uuid,
    mirakl_id: String,
    transfer_type: TransferType,
    amount: i64,
    currency: String,
    transaction_id: Option<String>,
    transfer_id: Option<String>,
    status: TransferStatus,
    failed_reason: Option<String>,
    hold_cause: Option<HoldCause>,
    account_mapping_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransferRow {
    fn into_transfer(self, mappings: &HashMap<Uuid, AccountMapping>) -> Transfer {
        Transfer {
            id: self.id,
            mirakl_id: self.mirakl_id,
            transfer_type: self.transfer_type,
            amount: self.amount,
            currency: self.currency,
            transaction_id: self.transaction_id,
            transfer_id: self.transfer_id,
            status: self.status,
            failed_reason: self.failed_reason,
            hold_cause: self.hold_cause,
            account_mapping: self
                .account_mapping_id
                .and_then(|id| mappings.get(&id).cloned()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct PayoutRow {
    id: Uuid,
    mirakl_invoice_id: i64,
    amount: i64,
    currency: String,
    stripe_payout_id: Option<String>,
    status: PayoutStatus,
    failed_reason: Option<String>,
    account_mapping_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PayoutRow {
    fn into_payout(self, mappings: &HashMap<Uuid, AccountMapping>) -> Payout {
        Payout {
            id: self.id,
            mirakl_invoice_id: self.mirakl_invoice_id,
            amount: self.amount,
            currency: self.currency,
            stripe_payout_id: self.stripe_payout_id,
            status: self.status,
            failed_reason: self.failed_reason,
            account_mapping: self
                .account_mapping_id
                .and_then(|id| mappings.get(&id).cloned()),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Postgres-backed entity store - THE source of truth for settlement state
pub struct PgEntityStore {
    pub pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn load_mappings(&self, ids: Vec<Uuid>) -> AppResult<HashMap<Uuid, AccountMapping>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mappings = sqlx::query_as::<_, AccountMapping>(&format!(
            "SELECT {MAPPING_COLUMNS} FROM account_mappings WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(mappings.into_iter().map(|m| (m.id, m)).collect())
    }

    async fn hydrate_transfers(&self, rows: Vec<TransferRow>) -> AppResult<Vec<Transfer>> {
        let ids: HashSet<Uuid> = rows.iter().filter_map(|r| r.account_mapping_id).collect();
        let mappings = self.load_mappings(ids.into_iter().collect()).await?;
        Ok(rows.into_iter().map(|r| r.into_transfer(&mappings)).collect())
    }

    async fn hydrate_payouts(&self, rows: Vec<PayoutRow>) -> AppResult<Vec<Payout>> {
        let ids: HashSet<Uuid> = rows.iter().filter_map(|r| r.account_mapping_id).collect();
        let mappings = self.load_mappings(ids.into_iter().collect()).await?;
        Ok(rows.into_iter().map(|r| r.into_payout(&mappings)).collect())
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    // ========== TRANSFERS ==========

    async fn find_transfers(&self, keys: &[(TransferType, String)]) -> AppResult<Vec<Transfer>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mirakl_ids: Vec<String> = keys.iter().map(|(_, id)| id.clone()).collect();
        let wanted: HashSet<String> = keys
            .iter()
            .map(|(transfer_type, id)| transfer_key(*transfer_type, id))
            .collect();

        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE mirakl_id = ANY($1)"
        ))
        .bind(mirakl_ids)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .filter(|row| wanted.contains(&transfer_key(row.transfer_type, &row.mirakl_id)))
        .collect();

        self.hydrate_transfers(rows).await
    }

    async fn insert_transfers(&self, transfers: &[Transfer]) -> AppResult<Vec<Transfer>> {
        let mut tx = self.begin_tx().await?;
        let mut claimed = Vec::new();

        for transfer in transfers {
            let inserted = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO transfers (
                    id, mirakl_id, transfer_type, amount, currency, transaction_id, transfer_id,
                    status, failed_reason, hold_cause, account_mapping_id, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (transfer_type, mirakl_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(transfer.id)
            .bind(&transfer.mirakl_id)
            .bind(transfer.transfer_type)
            .bind(transfer.amount)
            .bind(&transfer.currency)
            .bind(&transfer.transaction_id)
            .bind(&transfer.transfer_id)
            .bind(transfer.status)
            .bind(&transfer.failed_reason)
            .bind(transfer.hold_cause)
            .bind(transfer.account_mapping.as_ref().map(|m| m.id))
            .bind(transfer.created_at)
            .bind(transfer.updated_at)
            .fetch_optional(&mut *tx)
            .await?;

            match inserted {
                Some(_) => claimed.push(transfer.clone()),
                None => debug!("Transfer {} already exists, not claimed", transfer.key()),
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn save_transfers(&self, transfers: &[Transfer]) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        for transfer in transfers {
            sqlx::query(
                r#"
                UPDATE transfers
                SET amount = $2, currency = $3, transaction_id = $4, transfer_id = $5,
                    status = $6, failed_reason = $7, hold_cause = $8, account_mapping_id = $9,
                    updated_at = $10
                WHERE id = $1
                "#,
            )
            .bind(transfer.id)
            .bind(transfer.amount)
            .bind(&transfer.currency)
            .bind(&transfer.transaction_id)
            .bind(&transfer.transfer_id)
            .bind(transfer.status)
            .bind(&transfer.failed_reason)
            .bind(transfer.hold_cause)
            .bind(transfer.account_mapping.as_ref().map(|m| m.id))
            .bind(transfer.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn retriable_transfers(&self) -> AppResult<Vec<Transfer>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE status = $1 \
                OR (status = $2 AND updated_at < $3) \
                OR (status = $4 AND hold_cause = $5 AND amount > 0) \
             ORDER BY created_at"
        ))
        .bind(TransferStatus::Failed)
        .bind(TransferStatus::Pending)
        .bind(pending_lease_cutoff())
        .bind(TransferStatus::OnHold)
        .bind(HoldCause::NegativeAmount)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_transfers(rows).await
    }

    // ========== PAYOUTS ==========

    async fn find_payouts(&self, invoice_ids: &[i64]) -> AppResult<Vec<Payout>> {
        if invoice_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE mirakl_invoice_id = ANY($1)"
        ))
        .bind(invoice_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_payouts(rows).await
    }

    async fn insert_payouts(&self, payouts: &[Payout]) -> AppResult<Vec<Payout>> {
        let mut tx = self.begin_tx().await?;
        let mut claimed = Vec::new();

        for payout in payouts {
            let inserted = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO payouts (
                    id, mirakl_invoice_id, amount, currency, stripe_payout_id, status,
                    failed_reason, account_mapping_id, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (mirakl_invoice_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(payout.id)
            .bind(payout.mirakl_invoice_id)
            .bind(payout.amount)
            .bind(&payout.currency)
            .bind(&payout.stripe_payout_id)
            .bind(payout.status)
            .bind(&payout.failed_reason)
            .bind(payout.account_mapping.as_ref().map(|m| m.id))
            .bind(payout.created_at)
            .bind(payout.updated_at)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_some() {
                claimed.push(payout.clone());
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn save_payouts(&self, payouts: &[Payout]) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        for payout in payouts {
            sqlx::query(
                r#"
                UPDATE payouts
                SET amount = $2, currency = $3, stripe_payout_id = $4, status = $5,
                    failed_reason = $6, account_mapping_id = $7, updated_at = $8
                WHERE id = $1
                "#,
            )
            .bind(payout.id)
            .bind(payout.amount)
            .bind(&payout.currency)
            .bind(&payout.stripe_payout_id)
            .bind(payout.status)
            .bind(&payout.failed_reason)
            .bind(payout.account_mapping.as_ref().map(|m| m.id))
            .bind(payout.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn retriable_payouts(&self) -> AppResult<Vec<Payout>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts \
             WHERE status = $1 OR (status = $2 AND updated_at < $3) ORDER BY created_at"
        ))
        .bind(PayoutStatus::Failed)
        .bind(PayoutStatus::Pending)
        .bind(pending_lease_cutoff())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_payouts(rows).await
    }

    // ========== REFUNDS ==========

    async fn find_refunds(&self, refund_ids: &[String]) -> AppResult<Vec<Refund>> {
        if refund_ids.is_empty() {
            return Ok(Vec::new());
        }

        let refunds = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds WHERE mirakl_refund_id = ANY($1)"
        ))
        .bind(refund_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(refunds)
    }

    async fn insert_refunds(&self, refunds: &[Refund]) -> AppResult<Vec<Refund>> {
        let mut tx = self.begin_tx().await?;
        let mut claimed = Vec::new();

        for refund in refunds {
            let inserted = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO refunds (
                    id, mirakl_refund_id, mirakl_order_id, mirakl_commercial_order_id,
                    refund_type, amount, currency, transaction_id, stripe_refund_id,
                    stripe_reversal_id, status, status_reason, mirakl_validation_time,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (mirakl_refund_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(refund.id)
            .bind(&refund.mirakl_refund_id)
            .bind(&refund.mirakl_order_id)
            .bind(&refund.mirakl_commercial_order_id)
            .bind(refund.refund_type)
            .bind(refund.amount)
            .bind(&refund.currency)
            .bind(&refund.transaction_id)
            .bind(&refund.stripe_refund_id)
            .bind(&refund.stripe_reversal_id)
            .bind(refund.status)
            .bind(&refund.status_reason)
            .bind(refund.mirakl_validation_time)
            .bind(refund.created_at)
            .bind(refund.updated_at)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_some() {
                claimed.push(refund.clone());
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn save_refunds(&self, refunds: &[Refund]) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        for refund in refunds {
            sqlx::query(
                r#"
                UPDATE refunds
                SET amount = $2, currency = $3, transaction_id = $4, stripe_refund_id = $5,
                    stripe_reversal_id = $6, status = $7, status_reason = $8,
                    mirakl_validation_time = $9, updated_at = $10
                WHERE id = $1
                "#,
            )
            .bind(refund.id)
            .bind(refund.amount)
            .bind(&refund.currency)
            .bind(&refund.transaction_id)
            .bind(&refund.stripe_refund_id)
            .bind(&refund.stripe_reversal_id)
            .bind(refund.status)
            .bind(&refund.status_reason)
            .bind(refund.mirakl_validation_time)
            .bind(refund.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn retriable_refunds(&self) -> AppResult<Vec<Refund>> {
        let refunds = sqlx::query_as::<_, Refund>(&format!(
            "SELECT {REFUND_COLUMNS} FROM refunds \
             WHERE status = $1 OR (status = $2 AND updated_at < $3) ORDER BY created_at"
        ))
        .bind(RefundStatus::Failed)
        .bind(RefundStatus::Pending)
        .bind(pending_lease_cutoff())
        .fetch_all(&self.pool)
        .await?;

        Ok(refunds)
    }

    // ========== PAYMENTS ==========

    async fn find_payments_by_commercial_ids(&self, commercial_ids: &[String]) -> AppResult<Vec<Payment>> {
        if commercial_ids.is_empty() {
            return Ok(Vec::new());
        }

        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE mirakl_commercial_order_id = ANY($1) ORDER BY created_at"
        ))
        .bind(commercial_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    async fn find_payment_by_stripe_id(&self, stripe_payment_id: &str) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE stripe_payment_id = $1"
        ))
        .bind(stripe_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn insert_payment(&self, payment: &Payment) -> AppResult<bool> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO payments (
                id, mirakl_commercial_order_id, stripe_payment_id, stripe_amount, currency,
                status, status_reason, mirakl_validation_time, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stripe_payment_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(payment.id)
        .bind(&payment.mirakl_commercial_order_id)
        .bind(&payment.stripe_payment_id)
        .bind(payment.stripe_amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.status_reason)
        .bind(payment.mirakl_validation_time)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    async fn save_payments(&self, payments: &[Payment]) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        for payment in payments {
            sqlx::query(
                r#"
                UPDATE payments
                SET stripe_amount = $2, currency = $3, status = $4, status_reason = $5,
                    mirakl_validation_time = $6, updated_at = $7
                WHERE id = $1
                "#,
            )
            .bind(payment.id)
            .bind(payment.stripe_amount)
            .bind(&payment.currency)
            .bind(payment.status)
            .bind(&payment.status_reason)
            .bind(payment.mirakl_validation_time)
            .bind(payment.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ========== ACCOUNT MAPPINGS ==========

    async fn find_account_mappings_by_shop_ids(&self, shop_ids: &[i64]) -> AppResult<Vec<AccountMapping>> {
        if shop_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mappings = sqlx::query_as::<_, AccountMapping>(&format!(
            "SELECT {MAPPING_COLUMNS} FROM account_mappings WHERE mirakl_shop_id = ANY($1)"
        ))
        .bind(shop_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(mappings)
    }

    async fn find_account_mapping_by_stripe_id(&self, stripe_account_id: &str) -> AppResult<Option<AccountMapping>> {
        let mapping = sqlx::query_as::<_, AccountMapping>(&format!(
            "SELECT {MAPPING_COLUMNS} FROM account_mappings WHERE stripe_account_id = $1"
        ))
        .bind(stripe_account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(mapping)
    }

    async fn save_account_mapping(&self, mapping: &AccountMapping) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO account_mappings (
                id, mirakl_shop_id, stripe_account_id, payin_enabled, payout_enabled,
                disabled_reason, onboarding_token, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET payin_enabled = EXCLUDED.payin_enabled,
                payout_enabled = EXCLUDED.payout_enabled,
                disabled_reason = EXCLUDED.disabled_reason,
                onboarding_token = EXCLUDED.onboarding_token,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(mapping.id)
        .bind(mapping.mirakl_shop_id)
        .bind(&mapping.stripe_account_id)
        .bind(mapping.payin_enabled)
        .bind(mapping.payout_enabled)
        .bind(&mapping.disabled_reason)
        .bind(&mapping.onboarding_token)
        .bind(mapping.created_at)
        .bind(mapping.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== ONBOARDING ==========

    async fn issue_onboarding_token(&self, shop_id: i64, token: &str) -> AppResult<String> {
        sqlx::query(
            r#"
            INSERT INTO onboarding_tokens (token, mirakl_shop_id, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (mirakl_shop_id) DO NOTHING
            "#,
        )
        .bind(token)
        .bind(shop_id)
        .execute(&self.pool)
        .await?;

        let issued = sqlx::query_scalar::<_, String>(
            "SELECT token FROM onboarding_tokens WHERE mirakl_shop_id = $1",
        )
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(issued)
    }

    async fn find_onboarding_shop(&self, token: &str) -> AppResult<Option<i64>> {
        let shop_id = sqlx::query_scalar::<_, i64>(
            "SELECT mirakl_shop_id FROM onboarding_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(shop_id)
    }

    // ========== CONFIG ==========

    async fn get_config(&self, key: &str) -> AppResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    async fn set_config(&self, key: &str, value: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
