pub mod client;
pub mod ids;
pub mod models;
pub mod signature;

use async_trait::async_trait;

use crate::error::ProcessorError;
use models::*;

pub use client::StripeClient;

/// Metadata block identifying this integration on every object it creates
pub fn integration_metadata() -> Metadata {
    Metadata::from([
        (
            metadata_keys::INTEGRATION_NAME.to_string(),
            env!("CARGO_PKG_NAME").to_string(),
        ),
        (
            metadata_keys::INTEGRATION_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}

/// Operations consumed from the payment processor
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_transfer(&self, request: &CreateTransfer) -> Result<StripeTransfer, ProcessorError>;

    async fn create_payout(&self, request: &CreatePayout) -> Result<StripePayout, ProcessorError>;

    async fn create_refund(&self, request: &CreateRefund) -> Result<StripeRefund, ProcessorError>;

    async fn reverse_transfer(
        &self,
        transfer_id: &str,
        amount: i64,
        metadata: &Metadata,
    ) -> Result<TransferReversal, ProcessorError>;

    async fn capture_payment(&self, target: &PaymentTarget, amount: i64) -> Result<(), ProcessorError>;

    async fn cancel_payment(&self, target: &PaymentTarget) -> Result<(), ProcessorError>;

    async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge, ProcessorError>;

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError>;

    async fn update_account(&self, account_id: &str, metadata: &Metadata) -> Result<Account, ProcessorError>;
}
