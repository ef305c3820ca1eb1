//! Buyer payments: authorization intake, capture / cancel commands and pending debit
//! validation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::engine::{ItemOutcome, SettlementKind};
use super::feed::DebitItem;
use crate::api::notifications::{AlertDispatcher, AlertKind, OperatorAlert};
use crate::error::{AppError, AppResult, SignatureError};
use crate::ledger::models::{Payment, PaymentStatus};
use crate::ledger::EntityStore;
use crate::marketplace::models::{DebitValidation, PaymentValidationStatus};
use crate::marketplace::MarketplaceApi;
use crate::processor::ids::resolve_payment_target;
use crate::processor::models::{metadata_keys, Charge, Event, Metadata, PaymentIntent};
use crate::processor::PaymentProcessor;

pub const AMOUNT_CAPTURABLE_UPDATED: &str = "payment_intent.amount_capturable_updated";
pub const CHARGE_SUCCEEDED: &str = "charge.succeeded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PaymentCommand {
    /// Capture the authorization, in full when no amount is given
    Capture {
        stripe_payment_id: String,
        amount: Option<i64>,
    },
    Cancel {
        stripe_payment_id: String,
    },
}

impl PaymentCommand {
    fn stripe_payment_id(&self) -> &str {
        match self {
            PaymentCommand::Capture {
                stripe_payment_id, ..
            }
            | PaymentCommand::Cancel { stripe_payment_id } => stripe_payment_id,
        }
    }
}

/// Authorization the processor reported, before it is matched to a stored payment
struct Authorization {
    stripe_payment_id: String,
    amount: i64,
    currency: String,
    metadata: Metadata,
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &Event) -> AppResult<T> {
    serde_json::from_value(event.data.object.clone())
        .map_err(|e| SignatureError::PayloadInvalid(format!("{}: {}", event.event_type, e)).into())
}

pub struct PaymentService {
    store: Arc<dyn EntityStore>,
    processor: Arc<dyn PaymentProcessor>,
    alerts: AlertDispatcher,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        processor: Arc<dyn PaymentProcessor>,
        alerts: AlertDispatcher,
    ) -> Self {
        Self {
            store,
            processor,
            alerts,
        }
    }

    /// Capture `amount` on the processor. A failure is recorded on the payment, which stays
    /// TO_CAPTURE.
    pub async fn capture(&self, payment: &mut Payment, amount: i64) -> AppResult<ItemOutcome> {
        let result = match resolve_payment_target(self.processor.as_ref(), &payment.stripe_payment_id).await {
            Ok(target) => self.processor.capture_payment(&target, amount).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    "Payment {} captured for {} (order {})",
                    payment.stripe_payment_id, amount, payment.mirakl_commercial_order_id
                );
                payment.mark_captured()?;
                Ok(ItemOutcome::Succeeded)
            }
            Err(e) => {
                warn!(
                    "Capture of {} failed: amount={} code={:?}: {}",
                    payment.stripe_payment_id,
                    amount,
                    e.code(),
                    e
                );
                let reason = e.reason();
                payment.record_failure(&reason)?;
                Ok(ItemOutcome::Failed(reason))
            }
        }
    }

    pub async fn cancel(&self, payment: &mut Payment) -> AppResult<ItemOutcome> {
        let result = match resolve_payment_target(self.processor.as_ref(), &payment.stripe_payment_id).await {
            Ok(target) => self.processor.cancel_payment(&target).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Payment {} cancelled", payment.stripe_payment_id);
                payment.mark_cancelled()?;
                Ok(ItemOutcome::Succeeded)
            }
            Err(e) => {
                warn!(
                    "Cancel of {} failed: code={:?}: {}",
                    payment.stripe_payment_id,
                    e.code(),
                    e
                );
                let reason = e.reason();
                payment.record_failure(&reason)?;
                Ok(ItemOutcome::Failed(reason))
            }
        }
    }

    /// Run a capture or cancel command against a stored payment
    #[instrument(skip(self))]
    pub async fn handle(&self, command: PaymentCommand) -> AppResult<ItemOutcome> {
        let mut payment = self
            .store
            .find_payment_by_stripe_id(command.stripe_payment_id())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment {}", command.stripe_payment_id())))?;

        if payment.is_terminal() {
            return Ok(ItemOutcome::skipped(format!("payment is {}", payment.status)));
        }

        let outcome = match &command {
            PaymentCommand::Capture { amount, .. } => {
                let amount = amount.unwrap_or(payment.stripe_amount);
                self.capture(&mut payment, amount).await?
            }
            PaymentCommand::Cancel { .. } => self.cancel(&mut payment).await?,
        };

        self.store.save_payments(std::slice::from_ref(&payment)).await?;

        if let ItemOutcome::Failed(reason) = &outcome {
            self.alerts.notify(OperatorAlert::new(
                AlertKind::SettlementFailure,
                "payment",
                payment.stripe_payment_id.clone(),
                reason.clone(),
                serde_json::to_value(&payment)?,
            ));
        }
        Ok(outcome)
    }

    /// Record an authorization reported by the processor as a TO_CAPTURE payment.
    ///
    /// Returns `None` for events that carry no capturable authorization for a marketplace
    /// order.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn record_authorization(&self, event: &Event) -> AppResult<Option<Payment>> {
        let authorization = match event.event_type.as_str() {
            AMOUNT_CAPTURABLE_UPDATED => {
                let intent: PaymentIntent = parse_object(event)?;
                Authorization {
                    stripe_payment_id: intent.id,
                    amount: intent.amount_capturable,
                    currency: intent.currency,
                    metadata: intent.metadata,
                }
            }
            CHARGE_SUCCEEDED => {
                let charge: Charge = parse_object(event)?;
                // Intent-backed charges arrive through the intent event
                if charge.captured || charge.payment_intent.is_some() {
                    return Ok(None);
                }
                Authorization {
                    stripe_payment_id: charge.id,
                    amount: charge.amount,
                    currency: charge.currency,
                    metadata: charge.metadata,
                }
            }
            _ => return Ok(None),
        };

        let Some(commercial_id) = authorization
            .metadata
            .get(metadata_keys::MIRAKL_COMMERCIAL_ORDER_ID)
            .cloned()
        else {
            warn!(
                "Authorization {} has no {} metadata, ignoring",
                authorization.stripe_payment_id,
                metadata_keys::MIRAKL_COMMERCIAL_ORDER_ID
            );
            return Ok(None);
        };

        if let Some(mut existing) = self
            .store
            .find_payment_by_stripe_id(&authorization.stripe_payment_id)
            .await?
        {
            if existing.status == PaymentStatus::ToCapture
                && existing.stripe_amount != authorization.amount
            {
                existing.stripe_amount = authorization.amount;
                existing.updated_at = chrono::Utc::now();
                self.store.save_payments(std::slice::from_ref(&existing)).await?;
            }
            return Ok(Some(existing));
        }

        let payment = Payment::new(
            commercial_id,
            authorization.stripe_payment_id,
            authorization.amount,
            authorization.currency,
        );
        if self.store.insert_payment(&payment).await? {
            info!(
                "Payment {} authorized for {} (order {})",
                payment.stripe_payment_id, payment.stripe_amount, payment.mirakl_commercial_order_id
            );
            Ok(Some(payment))
        } else {
            // Concurrent delivery of the same event
            self.store
                .find_payment_by_stripe_id(&payment.stripe_payment_id)
                .await
        }
    }
}

/// Pending debits matched against authorized payments
pub struct DebitKind {
    store: Arc<dyn EntityStore>,
    marketplace: Arc<dyn MarketplaceApi>,
    payments: Arc<PaymentService>,
}

impl DebitKind {
    pub fn new(
        store: Arc<dyn EntityStore>,
        marketplace: Arc<dyn MarketplaceApi>,
        payments: Arc<PaymentService>,
    ) -> Self {
        Self {
            store,
            marketplace,
            payments,
        }
    }

    async fn validate(
        &self,
        item: &DebitItem,
        status: PaymentValidationStatus,
        transaction_number: Option<String>,
    ) -> Option<String> {
        let validations: Vec<DebitValidation> = item
            .debits
            .iter()
            .map(|debit| DebitValidation::for_debit(debit, status, transaction_number.clone()))
            .collect();

        match self.marketplace.validate_pending_debits(&validations).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "Debit validation for order {} failed: {}",
                    item.commercial_order_id, e
                );
                Some(e.body())
            }
        }
    }
}

#[async_trait]
impl SettlementKind for DebitKind {
    type Item = DebitItem;
    type Entity = Payment;

    fn name(&self) -> &'static str {
        "debit"
    }

    fn item_key(&self, item: &DebitItem) -> String {
        item.commercial_order_id.clone()
    }

    fn entity_key(&self, payment: &Payment) -> String {
        payment.mirakl_commercial_order_id.clone()
    }

    /// One payment per commercial order, an uncaptured one first
    async fn find_existing(&self, items: &[&DebitItem]) -> AppResult<Vec<Payment>> {
        let ids: Vec<String> = items
            .iter()
            .map(|item| item.commercial_order_id.clone())
            .collect();

        let mut chosen: HashMap<String, Payment> = HashMap::new();
        for payment in self.store.find_payments_by_commercial_ids(&ids).await? {
            if payment.status == PaymentStatus::Cancelled {
                continue;
            }
            let replace = match chosen.get(&payment.mirakl_commercial_order_id) {
                Some(current) => {
                    current.status != PaymentStatus::ToCapture
                        && payment.status == PaymentStatus::ToCapture
                }
                None => true,
            };
            if replace {
                chosen.insert(payment.mirakl_commercial_order_id.clone(), payment);
            }
        }
        Ok(chosen.into_values().collect())
    }

    /// Orders without an authorized payment are left for a later pass
    fn build(&self, _item: &DebitItem) -> Option<Payment> {
        None
    }

    fn refresh(&self, _payment: &mut Payment, _item: &DebitItem) {}

    /// Awaiting capture, or captured with the debit validation still owed to Mirakl
    fn is_retriable(&self, payment: &Payment) -> bool {
        match payment.status {
            PaymentStatus::ToCapture => true,
            PaymentStatus::Captured => payment.mirakl_validation_time.is_none(),
            PaymentStatus::Cancelled => false,
        }
    }

    async fn claim(&self, payments: Vec<Payment>) -> AppResult<Vec<Payment>> {
        Ok(payments)
    }

    async fn apply(&self, payment: &mut Payment, item: Option<&DebitItem>) -> AppResult<ItemOutcome> {
        let Some(item) = item else {
            return Ok(ItemOutcome::skipped("no pending debit"));
        };

        if payment.status == PaymentStatus::ToCapture {
            if payment.stripe_amount < item.total {
                let reason = format!(
                    "Authorized amount {} does not cover debit total {}",
                    payment.stripe_amount, item.total
                );
                warn!("Order {}: {}", item.commercial_order_id, reason);
                payment.record_failure(&reason)?;
                if let Some(error) = self
                    .validate(item, PaymentValidationStatus::Refused, None)
                    .await
                {
                    return Ok(ItemOutcome::Failed(format!("{reason}; {error}")));
                }
                return Ok(ItemOutcome::Failed(reason));
            }

            if let ItemOutcome::Failed(reason) = self.payments.capture(payment, item.total).await? {
                return Ok(ItemOutcome::Failed(reason));
            }
        }

        // Captured: the validation is the only step left
        match self
            .validate(
                item,
                PaymentValidationStatus::Ok,
                Some(payment.stripe_payment_id.clone()),
            )
            .await
        {
            None => {
                payment.record_validation()?;
                Ok(ItemOutcome::Succeeded)
            }
            Some(error) => Ok(ItemOutcome::Failed(error)),
        }
    }

    /// A payment stays TO_CAPTURE across stopped passes
    fn release(&self, _payment: &mut Payment, _reason: &str) -> bool {
        false
    }

    async fn flush(&self, payments: &[Payment]) -> AppResult<()> {
        self.store.save_payments(payments).await
    }
}
