// Diff-and-reconcile over one money-movement kind.
//
// Pass layout:
//   1. batch-load stored entities for the feed's keys
//   2. stage each item: new / retry / skip
//   3. claim new rows (unique insert); rows someone else inserted are skipped
//   4. apply the external action item by item, in feed order
//   5. flush every touched entity once
//   6. alert on FAILED / ON_HOLD outcomes
//
// An infrastructure error stops the pass. Entities it claimed but never drove are
// released to their retriable failure state in the same flush.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, instrument, warn};

use crate::api::notifications::{AlertDispatcher, AlertKind, OperatorAlert};
use crate::error::{AppError, AppResult};

/// Result of one item within a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
    Held(String),
    Aborted(String),
    Skipped(String),
}

impl ItemOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        ItemOutcome::Skipped(reason.into())
    }

    fn alert_reason(&self) -> Option<&str> {
        match self {
            ItemOutcome::Failed(reason) | ItemOutcome::Held(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub key: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Per-pass summary returned to jobs and HTTP callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub kind: String,
    pub succeeded: usize,
    pub failed: usize,
    pub held: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub items: Vec<ItemResult>,
}

impl ReconcileReport {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, key: String, outcome: ItemOutcome) {
        match &outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
            ItemOutcome::Held(_) => self.held += 1,
            ItemOutcome::Aborted(_) => self.aborted += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
        }
        self.items.push(ItemResult { key, outcome });
    }

    pub fn outcome(&self, key: &str) -> Option<&ItemOutcome> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| &item.outcome)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Capabilities one entity kind plugs into the engine
#[async_trait]
pub trait SettlementKind: Send + Sync {
    type Item: Send + Sync;
    type Entity: Clone + Send + Sync + Serialize;

    fn name(&self) -> &'static str;

    fn item_key(&self, item: &Self::Item) -> String;

    fn entity_key(&self, entity: &Self::Entity) -> String;

    /// Stored entities for the given items, in one lookup
    async fn find_existing(&self, items: &[&Self::Item]) -> AppResult<Vec<Self::Entity>>;

    /// `None` when the item never warrants an entity
    fn build(&self, item: &Self::Item) -> Option<Self::Entity>;

    /// Re-derive feed-owned fields; the marketplace is authoritative
    fn refresh(&self, entity: &mut Self::Entity, item: &Self::Item);

    fn is_retriable(&self, entity: &Self::Entity) -> bool;

    /// Insert new entities, returning only those this pass managed to claim
    async fn claim(&self, entities: Vec<Self::Entity>) -> AppResult<Vec<Self::Entity>>;

    /// Drive the external calls and move the entity to its next status.
    ///
    /// Per-item failures are folded into the returned outcome; an `Err` is an
    /// infrastructure failure (or a state machine violation).
    async fn apply(&self, entity: &mut Self::Entity, item: Option<&Self::Item>) -> AppResult<ItemOutcome>;

    /// Move an entity left PENDING by a stopped pass to a state later passes retry.
    /// Returns false when nothing changed.
    fn release(&self, entity: &mut Self::Entity, reason: &str) -> bool;

    async fn flush(&self, entities: &[Self::Entity]) -> AppResult<()>;
}

const PASS_ABORTED: &str = "pass aborted";

enum Stage<E> {
    Apply(E),
    Claim(E),
    Done(ItemOutcome),
}

pub struct Reconciler {
    alerts: AlertDispatcher,
}

impl Reconciler {
    pub fn new(alerts: AlertDispatcher) -> Self {
        Self { alerts }
    }

    /// Reconcile a feed page against stored entities
    #[instrument(skip_all, fields(kind = kind.name(), items = items.len()))]
    pub async fn reconcile<K: SettlementKind>(
        &self,
        kind: &K,
        items: Vec<K::Item>,
    ) -> AppResult<ReconcileReport> {
        // First occurrence of a key wins
        let mut seen = HashSet::new();
        let items: Vec<K::Item> = items
            .into_iter()
            .filter(|item| seen.insert(kind.item_key(item)))
            .collect();

        let refs: Vec<&K::Item> = items.iter().collect();
        let mut existing: HashMap<String, K::Entity> = kind
            .find_existing(&refs)
            .await?
            .into_iter()
            .map(|entity| (kind.entity_key(&entity), entity))
            .collect();

        let mut stages: Vec<(String, Stage<K::Entity>)> = Vec::with_capacity(items.len());
        for item in &items {
            let key = kind.item_key(item);
            let stage = match existing.remove(&key) {
                Some(stored) => {
                    let mut refreshed = stored.clone();
                    kind.refresh(&mut refreshed, item);
                    if kind.is_retriable(&refreshed) {
                        Stage::Apply(refreshed)
                    } else {
                        Stage::Done(ItemOutcome::skipped("not retriable"))
                    }
                }
                None => match kind.build(item) {
                    Some(entity) => Stage::Claim(entity),
                    None => Stage::Done(ItemOutcome::skipped("nothing to settle")),
                },
            };
            stages.push((key, stage));
        }

        let new_entities: Vec<K::Entity> = stages
            .iter()
            .filter_map(|(_, stage)| match stage {
                Stage::Claim(entity) => Some(entity.clone()),
                _ => None,
            })
            .collect();
        let claimed: HashSet<String> = if new_entities.is_empty() {
            HashSet::new()
        } else {
            kind.claim(new_entities)
                .await?
                .iter()
                .map(|entity| kind.entity_key(entity))
                .collect()
        };

        let work = items.iter().zip(stages).map(|(item, (key, stage))| {
            let stage = match stage {
                Stage::Claim(entity) if claimed.contains(&key) => Stage::Apply(entity),
                Stage::Claim(_) => {
                    warn!("{} {} claimed by a concurrent pass, skipping", kind.name(), key);
                    Stage::Done(ItemOutcome::skipped("already exists"))
                }
                other => other,
            };
            (key, stage, Some(item))
        });

        self.process(kind, work.collect()).await
    }

    /// Re-drive stored entities without a feed (retry jobs)
    #[instrument(skip_all, fields(kind = kind.name(), entities = entities.len()))]
    pub async fn drive<K: SettlementKind>(
        &self,
        kind: &K,
        entities: Vec<K::Entity>,
    ) -> AppResult<ReconcileReport> {
        let work = entities
            .into_iter()
            .map(|entity| {
                let key = kind.entity_key(&entity);
                let stage = if kind.is_retriable(&entity) {
                    Stage::Apply(entity)
                } else {
                    Stage::Done(ItemOutcome::skipped("not retriable"))
                };
                (key, stage, None)
            })
            .collect();

        self.process(kind, work).await
    }

    async fn process<K: SettlementKind>(
        &self,
        kind: &K,
        work: Vec<(String, Stage<K::Entity>, Option<&K::Item>)>,
    ) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::new(kind.name());
        let mut touched: Vec<K::Entity> = Vec::new();
        let mut infra_error: Option<AppError> = None;

        for (key, stage, item) in work {
            let mut entity = match stage {
                Stage::Apply(entity) if infra_error.is_none() => entity,
                Stage::Apply(mut entity) => {
                    if kind.release(&mut entity, PASS_ABORTED) {
                        touched.push(entity);
                    }
                    report.record(key, ItemOutcome::skipped(PASS_ABORTED));
                    continue;
                }
                Stage::Claim(_) => {
                    report.record(key, ItemOutcome::skipped("not claimed"));
                    continue;
                }
                Stage::Done(outcome) => {
                    report.record(key, outcome);
                    continue;
                }
            };

            let outcome = match kind.apply(&mut entity, item).await {
                Ok(outcome) => outcome,
                Err(AppError::Transition(e)) => {
                    error!("{} {}: {}", kind.name(), key, e);
                    ItemOutcome::skipped(e.to_string())
                }
                Err(e) => {
                    error!("{} {}: infrastructure failure, stopping pass: {}", kind.name(), key, e);
                    kind.release(&mut entity, &format!("{PASS_ABORTED}: {e}"));
                    touched.push(entity);
                    report.record(key, ItemOutcome::skipped(PASS_ABORTED));
                    infra_error = Some(e);
                    continue;
                }
            };

            if let Some(reason) = outcome.alert_reason() {
                self.alerts.notify(OperatorAlert::new(
                    AlertKind::SettlementFailure,
                    kind.name(),
                    key.clone(),
                    reason,
                    serde_json::to_value(&entity).unwrap_or(serde_json::Value::Null),
                ));
            }

            touched.push(entity);
            report.record(key, outcome);
        }

        if !touched.is_empty() {
            kind.flush(&touched).await?;
        }

        if let Some(e) = infra_error {
            return Err(e);
        }

        info!(
            "{} pass: {} succeeded, {} failed, {} held, {} aborted, {} skipped",
            kind.name(),
            report.succeeded,
            report.failed,
            report.held,
            report.aborted,
            report.skipped
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{transfer_key, Transfer, TransferStatus, TransferType, PENDING_LEASE_MINUTES};
    use crate::ledger::EntityStore;
    use crate::settlement::feed::TransferItem;
    use crate::settlement::transfers::TransferKind;
    use crate::testing::Harness;
    use chrono::{Duration, Utc};

    /// Transfer kind whose store goes away while applying one key
    struct StoreOutage {
        inner: TransferKind,
        broken_key: Option<String>,
    }

    #[async_trait]
    impl SettlementKind for StoreOutage {
        type Item = TransferItem;
        type Entity = Transfer;

        fn name(&self) -> &'static str {
            self.inner.name()
        }

        fn item_key(&self, item: &TransferItem) -> String {
            self.inner.item_key(item)
        }

        fn entity_key(&self, entity: &Transfer) -> String {
            self.inner.entity_key(entity)
        }

        async fn find_existing(&self, items: &[&TransferItem]) -> AppResult<Vec<Transfer>> {
            self.inner.find_existing(items).await
        }

        fn build(&self, item: &TransferItem) -> Option<Transfer> {
            self.inner.build(item)
        }

        fn refresh(&self, entity: &mut Transfer, item: &TransferItem) {
            self.inner.refresh(entity, item)
        }

        fn is_retriable(&self, entity: &Transfer) -> bool {
            self.inner.is_retriable(entity)
        }

        async fn claim(&self, entities: Vec<Transfer>) -> AppResult<Vec<Transfer>> {
            self.inner.claim(entities).await
        }

        async fn apply(&self, entity: &mut Transfer, item: Option<&TransferItem>) -> AppResult<ItemOutcome> {
            if self.broken_key.as_deref() == Some(entity.key().as_str()) {
                return Err(AppError::Internal("store unavailable".into()));
            }
            self.inner.apply(entity, item).await
        }

        fn release(&self, entity: &mut Transfer, reason: &str) -> bool {
            self.inner.release(entity, reason)
        }

        async fn flush(&self, entities: &[Transfer]) -> AppResult<()> {
            self.inner.flush(entities).await
        }
    }

    fn item(id: &str, mapping: &crate::ledger::models::AccountMapping) -> TransferItem {
        TransferItem {
            transfer_type: TransferType::ProductOrder,
            mirakl_id: id.into(),
            shop_id: mapping.mirakl_shop_id,
            amount: 100,
            currency: "eur".into(),
            transaction_id: None,
            account_mapping: Some(mapping.clone()),
        }
    }

    async fn status(harness: &Harness, id: &str) -> TransferStatus {
        harness
            .store
            .find_transfers(&[(TransferType::ProductOrder, id.to_string())])
            .await
            .unwrap()
            .remove(0)
            .status
    }

    fn kind(harness: &Harness, broken_key: Option<&str>) -> StoreOutage {
        StoreOutage {
            inner: TransferKind::new(harness.store.clone(), harness.processor.clone()),
            broken_key: broken_key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_stopped_pass_releases_claimed_rows() {
        let harness = Harness::new().await;
        let mapping = harness.map_shop(2000, "acct_1", true).await;
        let (alerts, _receiver) = crate::api::notifications::AlertDispatcher::new();
        let reconciler = Reconciler::new(alerts);
        let feed = || vec![item("B1", &mapping), item("B2", &mapping), item("B3", &mapping)];

        let broken_key = transfer_key(TransferType::ProductOrder, "B2");
        let first = reconciler
            .reconcile(&kind(&harness, Some(&broken_key)), feed())
            .await;
        assert!(matches!(first, Err(AppError::Internal(_))));

        assert_eq!(status(&harness, "B1").await, TransferStatus::Created);
        assert_eq!(status(&harness, "B2").await, TransferStatus::Failed);
        assert_eq!(status(&harness, "B3").await, TransferStatus::Failed);
        assert_eq!(harness.engine.retriable_transfers().await.unwrap().len(), 2);

        let second = reconciler.reconcile(&kind(&harness, None), feed()).await.unwrap();
        assert_eq!(second.succeeded, 2);
        assert_eq!(second.outcome("PRODUCT_ORDER:B1"), Some(&ItemOutcome::skipped("not retriable")));
        assert_eq!(status(&harness, "B3").await, TransferStatus::Created);
        assert_eq!(harness.processor.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_pending_row_is_recovered() {
        let harness = Harness::new().await;
        let mapping = harness.map_shop(2000, "acct_1", true).await;

        // Claimed by a pass that died before applying
        let mut stale = Transfer::new(TransferType::ProductOrder, "S1", 100, "eur");
        stale.account_mapping = Some(mapping.clone());
        stale.updated_at = Utc::now() - Duration::minutes(PENDING_LEASE_MINUTES + 5);
        let fresh = Transfer::new(TransferType::ProductOrder, "S2", 100, "eur");
        harness.store.insert_transfers(&[stale, fresh]).await.unwrap();

        let retriable = harness.engine.retriable_transfers().await.unwrap();
        assert_eq!(retriable.len(), 1);
        assert_eq!(retriable[0].mirakl_id, "S1");

        let report = harness.engine.retry_transfers().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(status(&harness, "S1").await, TransferStatus::Created);
        assert_eq!(status(&harness, "S2").await, TransferStatus::Pending);

        // A fresh claim still belongs to its pass
        let report = harness
            .engine
            .reconcile_transfers(vec![item("S2", &mapping)])
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
    }
}
