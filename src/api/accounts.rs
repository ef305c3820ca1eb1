// Connected account updates: flag overwrite, KYC derivation, KYC push to the shop.
// Unmapped shops get an onboarding link; the link's token binds the account created
// through it back to the shop.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::api::notifications::{AlertDispatcher, AlertKind, OperatorAlert};
use crate::error::{AppError, AppResult, KycError};
use crate::ledger::models::AccountMapping;
use crate::ledger::EntityStore;
use crate::marketplace::models::ShopPatch;
use crate::marketplace::MarketplaceApi;
use crate::processor::models::Account;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KycStatus {
    PendingSubmission,
    PendingApproval,
    Refused,
    Approved,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KycStatus::PendingSubmission => "PENDING_SUBMISSION",
            KycStatus::PendingApproval => "PENDING_APPROVAL",
            KycStatus::Refused => "REFUSED",
            KycStatus::Approved => "APPROVED",
        }
    }
}

/// First match wins
pub fn derive_kyc_status(account: &Account) -> Result<KycStatus, KycError> {
    let requirements = &account.requirements;

    if !requirements.currently_due.is_empty() {
        return Ok(KycStatus::PendingSubmission);
    }
    if !requirements.pending_verification.is_empty() {
        return Ok(KycStatus::PendingApproval);
    }
    if let Some(reason) = &requirements.disabled_reason {
        return Ok(if reason.starts_with("rejected") {
            KycStatus::Refused
        } else {
            KycStatus::PendingApproval
        });
    }
    if account.payouts_enabled && account.charges_enabled {
        return Ok(KycStatus::Approved);
    }

    Err(KycError::AmbiguousState {
        account_id: account.id.clone(),
    })
}

/// Where onboarding links are published and what they point to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnboardingLinks {
    pub field: String,
    pub base_url: String,
}

impl OnboardingLinks {
    pub fn link(&self, token: &str) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.base_url, separator, token)
    }
}

/// Shop additional fields this service writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShopFields {
    pub kyc: Option<String>,
    pub onboarding: Option<OnboardingLinks>,
}

impl ShopFields {
    pub fn from_config(config: &crate::config::MiraklConfig) -> Self {
        let onboarding = match (&config.onboarding_field, &config.onboarding_url) {
            (Some(field), Some(base_url)) => Some(OnboardingLinks {
                field: field.clone(),
                base_url: base_url.clone(),
            }),
            _ => None,
        };
        Self {
            kyc: config.kyc_field.clone(),
            onboarding,
        }
    }
}

fn new_onboarding_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

pub struct AccountSync {
    store: Arc<dyn EntityStore>,
    marketplace: Arc<dyn MarketplaceApi>,
    alerts: AlertDispatcher,
    fields: ShopFields,
}

impl AccountSync {
    pub fn new(
        store: Arc<dyn EntityStore>,
        marketplace: Arc<dyn MarketplaceApi>,
        alerts: AlertDispatcher,
        fields: ShopFields,
    ) -> Self {
        Self {
            store,
            marketplace,
            alerts,
            fields,
        }
    }

    /// Publish an onboarding link on each shop. A shop keeps the same token across calls.
    /// Returns the number of links pushed; zero when onboarding links are not configured.
    #[instrument(skip(self, shop_ids), fields(shops = shop_ids.len()))]
    pub async fn push_onboarding_links(&self, shop_ids: &[i64]) -> AppResult<usize> {
        let Some(onboarding) = &self.fields.onboarding else {
            return Ok(0);
        };

        let mut patches = Vec::with_capacity(shop_ids.len());
        for &shop_id in shop_ids {
            let token = self
                .store
                .issue_onboarding_token(shop_id, &new_onboarding_token())
                .await?;
            patches.push(ShopPatch::field(
                shop_id,
                onboarding.field.clone(),
                onboarding.link(&token),
            ));
        }
        if patches.is_empty() {
            return Ok(0);
        }

        self.marketplace.patch_shops(&patches).await?;
        info!("Onboarding links pushed to {} shops", patches.len());
        Ok(patches.len())
    }

    /// Bind the account opened through an onboarding link to the link's shop, then apply
    /// the account state like any account update.
    #[instrument(skip(self, token, account), fields(account_id = %account.id))]
    pub async fn complete_onboarding(&self, token: &str, account: &Account) -> AppResult<AccountMapping> {
        let shop_id = self
            .store
            .find_onboarding_shop(token)
            .await?
            .ok_or_else(|| AppError::NotFound("Unknown onboarding token".into()))?;

        let existing = self
            .store
            .find_account_mappings_by_shop_ids(&[shop_id])
            .await?
            .into_iter()
            .next();
        let mapping = match existing {
            Some(mapping) if mapping.stripe_account_id == account.id => mapping,
            Some(mapping) => {
                return Err(AppError::BadRequest(format!(
                    "Shop {} is already mapped to account {}",
                    shop_id, mapping.stripe_account_id
                )))
            }
            None => {
                let mut mapping = AccountMapping::new(shop_id, account.id.clone());
                mapping.onboarding_token = Some(token.to_string());
                self.store.save_account_mapping(&mapping).await?;
                info!("Shop {} mapped to account {}", shop_id, account.id);
                mapping
            }
        };

        match self.handle_account_updated(account).await {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => Ok(mapping),
            // Already alerted; the mapping stands
            Err(AppError::Kyc(_)) => Ok(self
                .store
                .find_account_mapping_by_stripe_id(&account.id)
                .await?
                .unwrap_or(mapping)),
            Err(e) => Err(e),
        }
    }

    /// Overwrite the mapping flags from the account, then push the derived KYC status.
    ///
    /// Returns `None` for accounts no shop is mapped to. An ambiguous KYC state is alerted
    /// and returned as an error once the flags are saved.
    #[instrument(skip(self, account), fields(account_id = %account.id))]
    pub async fn handle_account_updated(&self, account: &Account) -> AppResult<Option<AccountMapping>> {
        let Some(mut mapping) = self
            .store
            .find_account_mapping_by_stripe_id(&account.id)
            .await?
        else {
            warn!("Account {} is not mapped to any shop, ignoring update", account.id);
            return Ok(None);
        };

        mapping.payin_enabled = account.charges_enabled;
        mapping.payout_enabled = account.payouts_enabled;
        mapping.disabled_reason = account.requirements.disabled_reason.clone();
        mapping.updated_at = chrono::Utc::now();
        self.store.save_account_mapping(&mapping).await?;

        let status = match derive_kyc_status(account) {
            Ok(status) => status,
            Err(e) => {
                warn!("Shop {}: {}", mapping.mirakl_shop_id, e);
                self.alerts.notify(OperatorAlert::new(
                    AlertKind::AmbiguousKyc,
                    "account",
                    account.id.clone(),
                    e.to_string(),
                    serde_json::to_value(account)?,
                ));
                return Err(e.into());
            }
        };

        info!(
            "Shop {} account {}: payin={} payout={} kyc={}",
            mapping.mirakl_shop_id,
            account.id,
            mapping.payin_enabled,
            mapping.payout_enabled,
            status.as_str()
        );

        if let Some(field) = &self.fields.kyc {
            let patch = ShopPatch::field(mapping.mirakl_shop_id, field.clone(), status.as_str());
            if let Err(e) = self.marketplace.patch_shops(&[patch]).await {
                warn!(
                    "KYC status of shop {} not pushed: {}",
                    mapping.mirakl_shop_id, e
                );
            }
        }

        Ok(Some(mapping))
    }
}
