// Status transitions for the money-movement entities.
//
// Transfer: {Pending} -> Created | Failed | OnHold | Aborted   (Created, Aborted terminal)
// Payout:   {Pending} -> Created | Failed                      (Created terminal)
// Refund:   {Pending} -> Created | Failed                      (Created terminal)
// Payment:  ToCapture -> Captured | Cancelled                  (both terminal)
//
// A row still Pending past the claim lease was abandoned by its pass and is retriable.

use chrono::Utc;

use crate::error::TransitionError;
use crate::ledger::models::{
    pending_lease_cutoff, truncate_reason, HoldCause, Payment, PaymentStatus, Payout, PayoutStatus,
    Refund, RefundStatus, Transfer, TransferStatus,
};

type TransitionResult = Result<(), TransitionError>;

fn transition_error(
    entity: &'static str,
    id: impl ToString,
    from: impl ToString,
    to: impl ToString,
) -> TransitionError {
    TransitionError {
        entity,
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

impl Transfer {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TransferStatus::Created | TransferStatus::Aborted)
    }

    /// Failed transfers are always retried. Held ones only when the hold came from a
    /// negative amount that has since turned positive.
    pub fn is_retriable(&self) -> bool {
        match self.status {
            TransferStatus::Failed => true,
            TransferStatus::Pending => self.updated_at < pending_lease_cutoff(),
            TransferStatus::OnHold => {
                self.hold_cause == Some(HoldCause::NegativeAmount) && self.amount > 0
            }
            _ => false,
        }
    }

    fn ensure_mutable(&self, to: TransferStatus) -> TransitionResult {
        if self.is_terminal() {
            return Err(transition_error("transfer", self.key(), self.status, to));
        }
        Ok(())
    }

    pub fn mark_created(&mut self, transfer_id: impl Into<String>) -> TransitionResult {
        self.ensure_mutable(TransferStatus::Created)?;
        self.transfer_id = Some(transfer_id.into());
        self.status = TransferStatus::Created;
        self.failed_reason = None;
        self.hold_cause = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: &str) -> TransitionResult {
        self.ensure_mutable(TransferStatus::Failed)?;
        self.status = TransferStatus::Failed;
        self.failed_reason = Some(truncate_reason(reason));
        self.hold_cause = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_on_hold(&mut self, cause: HoldCause, reason: &str) -> TransitionResult {
        self.ensure_mutable(TransferStatus::OnHold)?;
        self.status = TransferStatus::OnHold;
        self.hold_cause = Some(cause);
        self.failed_reason = Some(truncate_reason(reason));
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_aborted(&mut self, reason: &str) -> TransitionResult {
        self.ensure_mutable(TransferStatus::Aborted)?;
        self.status = TransferStatus::Aborted;
        self.failed_reason = Some(truncate_reason(reason));
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Payout {
    pub fn is_terminal(&self) -> bool {
        self.status == PayoutStatus::Created
    }

    pub fn is_retriable(&self) -> bool {
        match self.status {
            PayoutStatus::Failed => true,
            PayoutStatus::Pending => self.updated_at < pending_lease_cutoff(),
            PayoutStatus::Created => false,
        }
    }

    pub fn mark_created(&mut self, payout_id: impl Into<String>) -> TransitionResult {
        if self.is_terminal() {
            return Err(transition_error(
                "payout",
                self.mirakl_invoice_id,
                self.status,
                PayoutStatus::Created,
            ));
        }
        self.stripe_payout_id = Some(payout_id.into());
        self.status = PayoutStatus::Created;
        self.failed_reason = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: &str) -> TransitionResult {
        if self.is_terminal() {
            return Err(transition_error(
                "payout",
                self.mirakl_invoice_id,
                self.status,
                PayoutStatus::Failed,
            ));
        }
        self.status = PayoutStatus::Failed;
        self.failed_reason = Some(truncate_reason(reason));
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Refund {
    pub fn is_terminal(&self) -> bool {
        self.status == RefundStatus::Created
    }

    pub fn is_retriable(&self) -> bool {
        match self.status {
            RefundStatus::Failed => true,
            RefundStatus::Pending => self.updated_at < pending_lease_cutoff(),
            RefundStatus::Created => false,
        }
    }

    fn ensure_mutable(&self, to: RefundStatus) -> TransitionResult {
        if self.is_terminal() {
            return Err(transition_error(
                "refund",
                &self.mirakl_refund_id,
                self.status,
                to,
            ));
        }
        Ok(())
    }

    /// Sub-step (a): processor refund created. Kept across retries.
    pub fn record_stripe_refund(&mut self, refund_id: impl Into<String>) -> TransitionResult {
        self.ensure_mutable(RefundStatus::Pending)?;
        self.stripe_refund_id = Some(refund_id.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_reversal(&mut self, reversal_id: impl Into<String>) -> TransitionResult {
        self.ensure_mutable(RefundStatus::Pending)?;
        self.stripe_reversal_id = Some(reversal_id.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Sub-step (b): refund validated back to Mirakl
    pub fn record_validation(&mut self) -> TransitionResult {
        self.ensure_mutable(RefundStatus::Pending)?;
        self.mirakl_validation_time = Some(Utc::now());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Requires both the processor refund and the marketplace validation
    pub fn mark_created(&mut self) -> TransitionResult {
        self.ensure_mutable(RefundStatus::Created)?;
        if self.stripe_refund_id.is_none() || self.mirakl_validation_time.is_none() {
            return Err(transition_error(
                "refund",
                &self.mirakl_refund_id,
                self.status,
                "CREATED without refund and validation",
            ));
        }
        self.status = RefundStatus::Created;
        self.status_reason = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: &str) -> TransitionResult {
        self.ensure_mutable(RefundStatus::Failed)?;
        self.status = RefundStatus::Failed;
        self.status_reason = Some(truncate_reason(reason));
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl Payment {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            PaymentStatus::Captured | PaymentStatus::Cancelled
        )
    }

    fn ensure_to_capture(&self, to: PaymentStatus) -> TransitionResult {
        if self.is_terminal() {
            return Err(transition_error(
                "payment",
                &self.stripe_payment_id,
                self.status,
                to,
            ));
        }
        Ok(())
    }

    pub fn mark_captured(&mut self) -> TransitionResult {
        self.ensure_to_capture(PaymentStatus::Captured)?;
        self.status = PaymentStatus::Captured;
        self.status_reason = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> TransitionResult {
        self.ensure_to_capture(PaymentStatus::Cancelled)?;
        self.status = PaymentStatus::Cancelled;
        self.status_reason = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Debits validated back to Mirakl. The only write a captured payment still takes.
    pub fn record_validation(&mut self) -> TransitionResult {
        if self.status != PaymentStatus::Captured || self.mirakl_validation_time.is_some() {
            return Err(transition_error(
                "payment",
                &self.stripe_payment_id,
                self.status,
                "VALIDATED",
            ));
        }
        self.mirakl_validation_time = Some(Utc::now());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// A failed capture or cancel leaves the payment awaiting capture
    pub fn record_failure(&mut self, reason: &str) -> TransitionResult {
        self.ensure_to_capture(PaymentStatus::ToCapture)?;
        self.status_reason = Some(truncate_reason(reason));
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ledger::models::{RefundType, TransferType, MAX_REASON_LENGTH, PENDING_LEASE_MINUTES};
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_transfer_created_is_immutable() {
        let mut transfer = Transfer::new(TransferType::ProductOrder, "O1", 2400, "eur");
        transfer.mark_created("tr_1").unwrap();

        assert!(transfer.mark_failed("late failure").is_err());
        assert!(transfer.mark_created("tr_2").is_err());
        assert_eq!(transfer.transfer_id.as_deref(), Some("tr_1"));
        assert_eq!(transfer.status, TransferStatus::Created);
    }

    #[test]
    fn test_transfer_retry_clears_reason() {
        let mut transfer = Transfer::new(TransferType::ProductOrder, "O2", 1000, "eur");
        transfer.mark_failed("network down").unwrap();
        assert!(transfer.is_retriable());

        transfer.mark_created("tr_3").unwrap();
        assert_eq!(transfer.failed_reason, None);
        assert!(!transfer.is_retriable());
    }

    #[test]
    fn test_on_hold_retriable_only_when_amount_positive() {
        let mut transfer = Transfer::new(TransferType::Subscription, "42", -150, "eur");
        transfer
            .mark_on_hold(HoldCause::NegativeAmount, "amount must be positive")
            .unwrap();
        assert!(!transfer.is_retriable());

        transfer.amount = 300;
        assert!(transfer.is_retriable());
    }

    #[test]
    fn test_processor_hold_is_not_retriable() {
        let mut transfer = Transfer::new(TransferType::Subscription, "43", 40, "eur");
        transfer
            .mark_on_hold(HoldCause::ProcessorRejected, "amount too small")
            .unwrap();
        assert!(!transfer.is_retriable());

        transfer.amount = 400;
        assert!(!transfer.is_retriable());
    }

    #[test]
    fn test_pending_retriable_after_lease() {
        let mut transfer = Transfer::new(TransferType::ProductOrder, "O9", 100, "eur");
        assert!(!transfer.is_retriable());
        transfer.updated_at = Utc::now() - Duration::minutes(PENDING_LEASE_MINUTES + 1);
        assert!(transfer.is_retriable());

        let mut payout = Payout::new(9, 100, "eur");
        assert!(!payout.is_retriable());
        payout.updated_at = transfer.updated_at;
        assert!(payout.is_retriable());

        let mut refund = Refund::new(RefundType::ProductOrder, "R9", "O9", "C9", 100, "eur");
        assert!(!refund.is_retriable());
        refund.updated_at = transfer.updated_at;
        assert!(refund.is_retriable());
    }

    #[test]
    fn test_aborted_is_terminal() {
        let mut transfer = Transfer::new(TransferType::ProductOrder, "O3", 0, "eur");
        transfer.mark_aborted("nothing to transfer").unwrap();
        assert!(transfer.is_terminal());
        assert!(!transfer.is_retriable());
        assert!(transfer.mark_on_hold(HoldCause::NegativeAmount, "x").is_err());
    }

    #[test]
    fn test_failed_reason_is_truncated() {
        let mut payout = Payout::new(7, 100, "eur");
        payout.mark_failed(&"e".repeat(4096)).unwrap();
        assert_eq!(
            payout.failed_reason.unwrap().chars().count(),
            MAX_REASON_LENGTH
        );
    }

    #[test]
    fn test_refund_requires_both_steps() {
        let mut refund = Refund::new(RefundType::ProductOrder, "R1", "O1", "C1", 500, "eur");
        assert!(refund.mark_created().is_err());

        refund.record_stripe_refund("re_1").unwrap();
        assert!(refund.mark_created().is_err());

        refund.record_validation().unwrap();
        refund.mark_created().unwrap();
        assert_eq!(refund.status, RefundStatus::Created);
        assert!(refund.record_validation().is_err());
    }

    #[test]
    fn test_payment_transitions_are_one_way() {
        let mut payment = Payment::new("C1", "pi_1", 2400, "eur");
        payment.mark_captured().unwrap();
        assert!(payment.mark_cancelled().is_err());
        assert!(payment.mark_captured().is_err());

        let mut other = Payment::new("C2", "pi_2", 2400, "eur");
        other.record_failure("card expired").unwrap();
        assert_eq!(other.status, PaymentStatus::ToCapture);
        other.mark_cancelled().unwrap();
        assert!(other.record_failure("again").is_err());
        assert!(other.record_validation().is_err());
    }

    #[test]
    fn test_payment_validated_once_after_capture() {
        let mut payment = Payment::new("C3", "pi_3", 2400, "eur");
        assert!(payment.record_validation().is_err());

        payment.mark_captured().unwrap();
        payment.record_validation().unwrap();
        assert!(payment.mirakl_validation_time.is_some());
        assert!(payment.record_validation().is_err());
    }
}
