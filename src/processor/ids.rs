//! Payment id dispatch.
//!
//! Stripe ids carry their object type as a prefix:
//! - `pi_` payment intent
//! - `ch_` charge
//! - `py_` legacy payment (charge created through a non-card source)
//!
//! This is the only place that inspects id prefixes. Swap it out if ids ever become opaque.

use super::models::PaymentTarget;
use super::PaymentProcessor;
use crate::error::ProcessorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentIdKind {
    PaymentIntent,
    Charge,
}

pub fn classify_payment_id(id: &str) -> Option<PaymentIdKind> {
    if id.starts_with("pi_") {
        Some(PaymentIdKind::PaymentIntent)
    } else if id.starts_with("ch_") || id.starts_with("py_") {
        Some(PaymentIdKind::Charge)
    } else {
        None
    }
}

/// Resolve the object a capture/cancel/refund must act on.
///
/// A charge that belongs to a payment intent is operated on through the intent.
pub async fn resolve_payment_target(
    processor: &dyn PaymentProcessor,
    id: &str,
) -> Result<PaymentTarget, ProcessorError> {
    match classify_payment_id(id) {
        Some(PaymentIdKind::PaymentIntent) => Ok(PaymentTarget::PaymentIntent(id.to_string())),
        Some(PaymentIdKind::Charge) => {
            let charge = processor.retrieve_charge(id).await?;
            Ok(match charge.payment_intent {
                Some(intent) => PaymentTarget::PaymentIntent(intent),
                None => PaymentTarget::Charge(charge.id),
            })
        }
        None => Err(ProcessorError::UnknownPaymentId(id.to_string())),
    }
}
