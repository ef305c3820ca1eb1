// Settlement Scheduler - runs the enabled settlement jobs on a fixed interval
//
// Cycle:
// - order transfers (product, service) and invoice fees / payouts
// - pending refunds (product, service)
// - pending debits
// - shop account sync
// - retry of FAILED transfers, payouts and refunds
//
// Independent jobs of a cycle run concurrently; each job is sequential per item.

use futures::future::join_all;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use super::engine::ReconcileReport;
use super::jobs::SettlementEngine;
use crate::config::SchedulerConfig;
use crate::error::AppResult;
use crate::marketplace::models::OrderKind;

type JobOutput = (&'static str, AppResult<Vec<ReconcileReport>>);
type JobFuture<'a> = Pin<Box<dyn Future<Output = JobOutput> + Send + 'a>>;

fn job<'a, F>(name: &'static str, run: F) -> JobFuture<'a>
where
    F: Future<Output = AppResult<Vec<ReconcileReport>>> + Send + 'a,
{
    run.map(move |result| (name, result)).boxed()
}

/// Settlement scheduler - drives the engine in the background
pub struct SettlementScheduler {
    config: SchedulerConfig,
    engine: Arc<SettlementEngine>,
}

impl SettlementScheduler {
    pub fn new(config: SchedulerConfig, engine: Arc<SettlementEngine>) -> Self {
        Self { config, engine }
    }

    /// Start the scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let engine = self.engine.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                info!("Starting settlement cycle");
                Self::run_cycle(&config, &engine).await;
                info!("Settlement cycle completed");
            }
        })
    }

    /// Jobs enabled by the configuration, in cycle order
    fn jobs<'a>(config: &SchedulerConfig, engine: &'a SettlementEngine) -> Vec<JobFuture<'a>> {
        let mut jobs = Vec::new();

        if config.transfers_enabled {
            jobs.push(job("product order transfers", async move {
                Ok(vec![engine.run_order_transfers(OrderKind::Product).await?])
            }));
            jobs.push(job("service order transfers", async move {
                Ok(vec![engine.run_order_transfers(OrderKind::Service).await?])
            }));
        }
        if config.transfers_enabled || config.payouts_enabled {
            jobs.push(job(
                "invoices",
                engine.run_invoices(config.transfers_enabled, config.payouts_enabled),
            ));
        }
        if config.refunds_enabled {
            jobs.push(job("refunds", async move {
                Ok(vec![
                    engine.run_refunds(OrderKind::Product).await?,
                    engine.run_refunds(OrderKind::Service).await?,
                ])
            }));
        }
        if config.debits_enabled {
            jobs.push(job("debits", async move {
                Ok(vec![engine.run_debits().await?])
            }));
        }
        if config.shops_enabled {
            jobs.push(job("shop sync", async move {
                engine.run_shop_sync().await?;
                Ok(Vec::new())
            }));
        }

        let (transfers, payouts, refunds) = (
            config.transfers_enabled,
            config.payouts_enabled,
            config.refunds_enabled,
        );
        if transfers || payouts || refunds {
            jobs.push(job("retries", async move {
                let mut reports = Vec::new();
                if transfers {
                    reports.push(engine.retry_transfers().await?);
                }
                if payouts {
                    reports.push(engine.retry_payouts().await?);
                }
                if refunds {
                    reports.push(engine.retry_refunds().await?);
                }
                Ok(reports)
            }));
        }

        jobs
    }

    async fn run_cycle(config: &SchedulerConfig, engine: &SettlementEngine) -> Vec<&'static str> {
        let mut completed = Vec::new();
        for (name, result) in join_all(Self::jobs(config, engine)).await {
            match result {
                Ok(reports) => {
                    for report in reports.iter().filter(|report| !report.is_empty()) {
                        info!(
                            "{} ({}): {} succeeded, {} failed, {} held",
                            name, report.kind, report.succeeded, report.failed, report.held
                        );
                    }
                    completed.push(name);
                }
                Err(e) => error!("Settlement job {} failed: {:?}", name, e),
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::MarketplaceError;
    use crate::testing::Harness;

    fn config(enabled: bool) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(60),
            transfers_enabled: enabled,
            payouts_enabled: enabled,
            refunds_enabled: enabled,
            debits_enabled: enabled,
            shops_enabled: enabled,
        }
    }

    #[tokio::test]
    async fn test_cycle_runs_every_enabled_job() {
        let harness = Harness::new().await;
        let completed = SettlementScheduler::run_cycle(&config(true), &harness.engine).await;
        assert_eq!(
            completed,
            vec![
                "product order transfers",
                "service order transfers",
                "invoices",
                "refunds",
                "debits",
                "shop sync",
                "retries",
            ]
        );
    }

    #[tokio::test]
    async fn test_disabled_jobs_are_skipped() {
        let harness = Harness::new().await;
        let mut only_debits = config(false);
        only_debits.debits_enabled = true;

        let completed = SettlementScheduler::run_cycle(&only_debits, &harness.engine).await;
        assert_eq!(completed, vec!["debits"]);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_cycle() {
        let harness = Harness::new().await;
        harness
            .marketplace
            .fail_listing(MarketplaceError::Transport("down".into()));

        let completed = SettlementScheduler::run_cycle(&config(true), &harness.engine).await;
        assert_eq!(completed, vec!["retries"]);
    }
}
