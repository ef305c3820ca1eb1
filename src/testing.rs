// In-memory fakes of the external services, shared by the unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::api::accounts::ShopFields;
use crate::api::notifications::{AlertDispatcher, OperatorAlert, OperatorChannel};
use crate::error::{AppError, AppResult, MarketplaceError, ProcessorError};
use crate::ledger::models::AccountMapping;
use crate::ledger::{EntityStore, MemoryEntityStore};
use crate::marketplace::models::*;
use crate::marketplace::MarketplaceApi;
use crate::processor::models::*;
use crate::processor::PaymentProcessor;
use crate::settlement::SettlementEngine;

// ============ PROCESSOR ============

/// Mutating call received by [`FakeProcessor`]
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorCall {
    Transfer(CreateTransfer),
    Payout(CreatePayout),
    Refund(CreateRefund),
    Reversal { transfer_id: String, amount: i64 },
    Capture { payment_id: String, amount: i64 },
    Cancel { payment_id: String },
    UpdateAccount { account_id: String, metadata: Metadata },
}

#[derive(Default)]
struct ProcessorState {
    calls: Vec<ProcessorCall>,
    charges: HashMap<String, Charge>,
    accounts: HashMap<String, Account>,
    /// Keyed by a metadata value of the request
    failures: HashMap<String, ProcessorError>,
    /// Keyed by operation name
    op_failures: HashMap<&'static str, ProcessorError>,
    next_id: u64,
}

impl ProcessorState {
    fn check(&self, op: &'static str, metadata: Option<&Metadata>) -> Result<(), ProcessorError> {
        if let Some(err) = self.op_failures.get(op) {
            return Err(err.clone());
        }
        let matched = metadata
            .into_iter()
            .flat_map(|metadata| metadata.values())
            .find_map(|value| self.failures.get(value));
        match matched {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }
}

fn not_found(id: &str) -> ProcessorError {
    ProcessorError::Api {
        status: 404,
        code: Some("resource_missing".into()),
        param: Some("id".into()),
        message: format!("No such object: '{}'", id),
    }
}

#[derive(Default)]
pub struct FakeProcessor {
    state: Mutex<ProcessorState>,
}

impl FakeProcessor {
    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.state.lock().calls.clone()
    }

    /// Fail every request whose metadata carries `key` as a value
    pub fn fail(&self, key: &str, err: ProcessorError) {
        self.state.lock().failures.insert(key.to_string(), err);
    }

    pub fn fail_op(&self, op: &'static str, err: ProcessorError) {
        self.state.lock().op_failures.insert(op, err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.op_failures.clear();
    }

    pub fn add_charge(&self, charge: Charge) {
        self.state.lock().charges.insert(charge.id.clone(), charge);
    }

    pub fn add_account(&self, account: Account) {
        self.state.lock().accounts.insert(account.id.clone(), account);
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_transfer(&self, request: &CreateTransfer) -> Result<StripeTransfer, ProcessorError> {
        let mut state = self.state.lock();
        state.check("create_transfer", Some(&request.metadata))?;
        state.calls.push(ProcessorCall::Transfer(request.clone()));
        Ok(StripeTransfer {
            id: state.next_id("tr"),
            amount: request.amount,
            currency: request.currency.clone(),
            destination: Some(request.account.clone()),
        })
    }

    async fn create_payout(&self, request: &CreatePayout) -> Result<StripePayout, ProcessorError> {
        let mut state = self.state.lock();
        state.check("create_payout", Some(&request.metadata))?;
        state.calls.push(ProcessorCall::Payout(request.clone()));
        Ok(StripePayout {
            id: state.next_id("po"),
            amount: request.amount,
            currency: request.currency.clone(),
            status: Some("pending".into()),
        })
    }

    async fn create_refund(&self, request: &CreateRefund) -> Result<StripeRefund, ProcessorError> {
        let mut state = self.state.lock();
        state.check("create_refund", Some(&request.metadata))?;
        state.calls.push(ProcessorCall::Refund(request.clone()));
        Ok(StripeRefund {
            id: state.next_id("re"),
            amount: request.amount.unwrap_or_default(),
            status: Some("succeeded".into()),
        })
    }

    async fn reverse_transfer(
        &self,
        transfer_id: &str,
        amount: i64,
        metadata: &Metadata,
    ) -> Result<TransferReversal, ProcessorError> {
        let mut state = self.state.lock();
        state.check("reverse_transfer", Some(metadata))?;
        state.calls.push(ProcessorCall::Reversal {
            transfer_id: transfer_id.to_string(),
            amount,
        });
        Ok(TransferReversal {
            id: state.next_id("trr"),
            amount,
            transfer: Some(transfer_id.to_string()),
        })
    }

    async fn capture_payment(&self, target: &PaymentTarget, amount: i64) -> Result<(), ProcessorError> {
        let mut state = self.state.lock();
        state.check("capture_payment", None)?;
        state.calls.push(ProcessorCall::Capture {
            payment_id: target.id().to_string(),
            amount,
        });
        Ok(())
    }

    async fn cancel_payment(&self, target: &PaymentTarget) -> Result<(), ProcessorError> {
        let mut state = self.state.lock();
        state.check("cancel_payment", None)?;
        state.calls.push(ProcessorCall::Cancel {
            payment_id: target.id().to_string(),
        });
        Ok(())
    }

    async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge, ProcessorError> {
        let state = self.state.lock();
        state.check("retrieve_charge", None)?;
        state
            .charges
            .get(charge_id)
            .cloned()
            .ok_or_else(|| not_found(charge_id))
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError> {
        let state = self.state.lock();
        state.check("retrieve_account", None)?;
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| not_found(account_id))
    }

    async fn update_account(&self, account_id: &str, metadata: &Metadata) -> Result<Account, ProcessorError> {
        let mut state = self.state.lock();
        state.check("update_account", None)?;
        state.calls.push(ProcessorCall::UpdateAccount {
            account_id: account_id.to_string(),
            metadata: metadata.clone(),
        });
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| not_found(account_id))?;
        account.metadata.extend(metadata.clone());
        Ok(account.clone())
    }
}

// ============ MARKETPLACE ============

#[derive(Default)]
struct MarketplaceState {
    product_orders: Vec<Order>,
    service_orders: Vec<Order>,
    order_filters: Vec<OrderFilter>,
    invoices: Vec<Invoice>,
    product_refunds: Vec<PendingRefund>,
    service_refunds: Vec<PendingRefund>,
    debits: Vec<PendingDebit>,
    shops: Vec<Shop>,
    refund_validations: Vec<RefundValidation>,
    debit_validations: Vec<DebitValidation>,
    shop_patches: Vec<ShopPatch>,
    listing_failure: Option<MarketplaceError>,
    validation_failure: Option<MarketplaceError>,
    patch_failure: Option<MarketplaceError>,
}

impl MarketplaceState {
    fn listing(&self) -> Result<(), MarketplaceError> {
        match &self.listing_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct FakeMarketplace {
    state: Mutex<MarketplaceState>,
}

impl FakeMarketplace {
    pub fn set_orders(&self, kind: OrderKind, orders: Vec<Order>) {
        let mut state = self.state.lock();
        match kind {
            OrderKind::Product => state.product_orders = orders,
            OrderKind::Service => state.service_orders = orders,
        }
    }

    pub fn order_filters(&self) -> Vec<OrderFilter> {
        self.state.lock().order_filters.clone()
    }

    pub fn set_invoices(&self, invoices: Vec<Invoice>) {
        self.state.lock().invoices = invoices;
    }

    pub fn set_pending_refunds(&self, kind: OrderKind, refunds: Vec<PendingRefund>) {
        let mut state = self.state.lock();
        match kind {
            OrderKind::Product => state.product_refunds = refunds,
            OrderKind::Service => state.service_refunds = refunds,
        }
    }

    pub fn set_pending_debits(&self, debits: Vec<PendingDebit>) {
        self.state.lock().debits = debits;
    }

    pub fn set_shops(&self, shops: Vec<Shop>) {
        self.state.lock().shops = shops;
    }

    pub fn refund_validations(&self) -> Vec<RefundValidation> {
        self.state.lock().refund_validations.clone()
    }

    pub fn debit_validations(&self) -> Vec<DebitValidation> {
        self.state.lock().debit_validations.clone()
    }

    pub fn shop_patches(&self) -> Vec<ShopPatch> {
        self.state.lock().shop_patches.clone()
    }

    /// Fail every list and fetch call
    pub fn fail_listing(&self, err: MarketplaceError) {
        self.state.lock().listing_failure = Some(err);
    }

    pub fn fail_validations(&self, err: MarketplaceError) {
        self.state.lock().validation_failure = Some(err);
    }

    pub fn fail_shop_patches(&self, err: MarketplaceError) {
        self.state.lock().patch_failure = Some(err);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.listing_failure = None;
        state.validation_failure = None;
        state.patch_failure = None;
    }
}

#[async_trait]
impl MarketplaceApi for FakeMarketplace {
    async fn list_orders(
        &self,
        kind: OrderKind,
        filter: &OrderFilter,
    ) -> Result<Vec<Order>, MarketplaceError> {
        let mut state = self.state.lock();
        state.order_filters.push(filter.clone());
        state.listing()?;

        let orders = match kind {
            OrderKind::Product => &state.product_orders,
            OrderKind::Service => &state.service_orders,
        };
        Ok(orders
            .iter()
            .filter(|order| filter.order_ids.is_empty() || filter.order_ids.contains(&order.order_id))
            .filter(|order| {
                filter.commercial_ids.is_empty() || filter.commercial_ids.contains(&order.commercial_id)
            })
            .filter(|order| {
                filter
                    .updated_since
                    .map_or(true, |since| order.last_updated_date >= since)
            })
            .cloned()
            .collect())
    }

    async fn list_pending_debits(&self) -> Result<Vec<PendingDebit>, MarketplaceError> {
        let state = self.state.lock();
        state.listing()?;
        Ok(state.debits.clone())
    }

    async fn list_pending_refunds(&self, kind: OrderKind) -> Result<Vec<PendingRefund>, MarketplaceError> {
        let state = self.state.lock();
        state.listing()?;
        Ok(match kind {
            OrderKind::Product => state.product_refunds.clone(),
            OrderKind::Service => state.service_refunds.clone(),
        })
    }

    async fn validate_pending_debits(&self, debits: &[DebitValidation]) -> Result<(), MarketplaceError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.validation_failure {
            return Err(err.clone());
        }
        state.debit_validations.extend_from_slice(debits);
        Ok(())
    }

    async fn validate_pending_refunds(
        &self,
        _kind: OrderKind,
        refunds: &[RefundValidation],
    ) -> Result<(), MarketplaceError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.validation_failure {
            return Err(err.clone());
        }
        state.refund_validations.extend_from_slice(refunds);
        Ok(())
    }

    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, MarketplaceError> {
        let state = self.state.lock();
        state.listing()?;
        Ok(state
            .invoices
            .iter()
            .filter(|invoice| {
                filter
                    .created_since
                    .map_or(true, |since| invoice.date_created >= since)
            })
            .cloned()
            .collect())
    }

    async fn fetch_shops(&self, filter: &ShopFilter) -> Result<Vec<Shop>, MarketplaceError> {
        let state = self.state.lock();
        state.listing()?;
        Ok(state
            .shops
            .iter()
            .filter(|shop| filter.shop_ids.is_empty() || filter.shop_ids.contains(&shop.shop_id))
            .cloned()
            .collect())
    }

    async fn patch_shops(&self, patches: &[ShopPatch]) -> Result<Vec<Shop>, MarketplaceError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.patch_failure {
            return Err(err.clone());
        }
        state.shop_patches.extend_from_slice(patches);
        let patched: Vec<i64> = patches.iter().map(|patch| patch.shop_id).collect();
        Ok(state
            .shops
            .iter()
            .filter(|shop| patched.contains(&shop.shop_id))
            .cloned()
            .collect())
    }
}

// ============ OPERATOR CHANNEL ============

#[derive(Default)]
pub struct FakeChannel {
    webhook_fails: bool,
    webhook_attempts: Mutex<usize>,
    emails: Mutex<Vec<String>>,
    emails_fail: Mutex<bool>,
}

impl FakeChannel {
    pub fn failing_webhook() -> Self {
        Self {
            webhook_fails: true,
            ..Default::default()
        }
    }

    pub fn webhook_attempts(&self) -> usize {
        *self.webhook_attempts.lock()
    }

    pub fn fail_emails(&self, fail: bool) {
        *self.emails_fail.lock() = fail;
    }

    /// Sent emails, subject and body joined
    pub fn emails(&self) -> Vec<String> {
        self.emails.lock().clone()
    }
}

#[async_trait]
impl OperatorChannel for FakeChannel {
    async fn post_webhook(&self, _alert: &OperatorAlert) -> AppResult<()> {
        *self.webhook_attempts.lock() += 1;
        if self.webhook_fails {
            return Err(AppError::External("operator webhook returned 503".into()));
        }
        Ok(())
    }

    async fn send_email(&self, subject: &str, html_body: &str) -> AppResult<()> {
        if *self.emails_fail.lock() {
            return Err(AppError::External("Resend returned 500".into()));
        }
        self.emails.lock().push(format!("{}\n{}", subject, html_body));
        Ok(())
    }
}

// ============ HARNESS ============

/// Engine wired to an in-memory store and fake services
pub struct Harness {
    pub store: Arc<MemoryEntityStore>,
    pub processor: Arc<FakeProcessor>,
    pub marketplace: Arc<FakeMarketplace>,
    pub engine: Arc<SettlementEngine>,
    pub alerts: UnboundedReceiver<OperatorAlert>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_shop_fields(ShopFields::default()).await
    }

    /// Harness whose account sync publishes the given shop fields
    pub async fn with_shop_fields(shop_fields: ShopFields) -> Self {
        let store = Arc::new(MemoryEntityStore::new());
        let processor = Arc::new(FakeProcessor::default());
        let marketplace = Arc::new(FakeMarketplace::default());
        let (dispatcher, alerts) = AlertDispatcher::new();
        let engine = Arc::new(SettlementEngine::new(
            store.clone(),
            marketplace.clone(),
            processor.clone(),
            dispatcher,
            shop_fields,
        ));

        Self {
            store,
            processor,
            marketplace,
            engine,
            alerts,
        }
    }

    /// Save a mapping between a shop and a connected account
    pub async fn map_shop(&self, shop_id: i64, account_id: &str, payout_enabled: bool) -> AccountMapping {
        let mut mapping = AccountMapping::new(shop_id, account_id);
        mapping.payout_enabled = payout_enabled;
        self.store
            .save_account_mapping(&mapping)
            .await
            .expect("mapping saved");
        mapping
    }
}
