use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_STRIPE_API_VERSION: &str = "2024-06-20";

/// Stripe client settings, fixed at construction
#[derive(Debug, Deserialize, Clone)]
pub struct StripeConfig {
    pub api_key: String,
    pub api_base: String,
    pub api_version: String,
    /// Platform account receiving transfers made from connected accounts
    pub platform_account: String,
    pub webhook_secret: String,
    /// Accepted clock drift between the signed timestamp and now
    pub webhook_tolerance_seconds: i64,
    pub timeout: Duration,
}

/// Mirakl client settings, fixed at construction
#[derive(Debug, Deserialize, Clone)]
pub struct MiraklConfig {
    pub base_url: String,
    pub api_key: String,
    pub requests_per_second: u32,
    pub timeout: Duration,
    /// Shop additional field receiving the derived KYC status
    pub kyc_field: Option<String>,
    /// Shop additional field receiving the onboarding link of unmapped shops
    pub onboarding_field: Option<String>,
    /// Page the onboarding link points to; the token is appended as `?token=`
    pub onboarding_url: Option<String>,
}

/// Operator alerting settings
#[derive(Debug, Deserialize, Clone)]
pub struct AlertConfig {
    pub operator_webhook_url: Option<String>,
    pub operator_webhook_retries: u32,
    pub operator_email: Option<String>,
    pub resend_api_key: Option<String>,
    pub resend_from_email: String,
    pub cooldown: Duration,
    pub timeout: Duration,
}

/// Settlement job schedule
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub transfers_enabled: bool,
    pub payouts_enabled: bool,
    pub refunds_enabled: bool,
    pub debits_enabled: bool,
    pub shops_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Absent means the in-memory store is used
    pub database_url: Option<String>,
    pub bind_address: String,
    pub stripe: StripeConfig,
    pub mirakl: MiraklConfig,
    pub alerts: AlertConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("stripe_api_key", "")?
            .set_default("stripe_api_base", DEFAULT_STRIPE_API_BASE)?
            .set_default("stripe_api_version", DEFAULT_STRIPE_API_VERSION)?
            .set_default("stripe_platform_account", "")?
            .set_default("stripe_webhook_secret", "")?
            .set_default("stripe_webhook_tolerance_seconds", 300)?
            .set_default("mirakl_base_url", "http://localhost:8081")?
            .set_default("mirakl_api_key", "")?
            .set_default("mirakl_rate_limit_per_second", 5)?
            .set_default("http_timeout_seconds", 30)?
            .set_default("operator_webhook_retries", 3)?
            .set_default("resend_from_email", "noreply@example.com")?
            .set_default("alert_cooldown_minutes", 10)?
            .set_default("job_interval_seconds", 300)?
            .set_default("jobs_transfers_enabled", true)?
            .set_default("jobs_payouts_enabled", true)?
            .set_default("jobs_refunds_enabled", true)?
            .set_default("jobs_debits_enabled", true)?
            .set_default("jobs_shops_enabled", true)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let timeout = Duration::from_secs(settings.get_int("http_timeout_seconds")?.max(1) as u64);
        let optional = |key: &str| {
            settings
                .get_string(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
        };

        Ok(Self {
            database_url: optional("database_url"),
            bind_address: settings.get_string("bind_address")?,
            stripe: StripeConfig {
                api_key: settings.get_string("stripe_api_key")?,
                api_base: settings.get_string("stripe_api_base")?,
                api_version: settings.get_string("stripe_api_version")?,
                platform_account: settings.get_string("stripe_platform_account")?,
                webhook_secret: settings.get_string("stripe_webhook_secret")?,
                webhook_tolerance_seconds: settings.get_int("stripe_webhook_tolerance_seconds")?,
                timeout,
            },
            mirakl: MiraklConfig {
                base_url: settings.get_string("mirakl_base_url")?,
                api_key: settings.get_string("mirakl_api_key")?,
                requests_per_second: settings.get_int("mirakl_rate_limit_per_second")?.max(1) as u32,
                timeout,
                kyc_field: optional("mirakl_kyc_field"),
                onboarding_field: optional("mirakl_onboarding_field"),
                onboarding_url: optional("onboarding_url"),
            },
            alerts: AlertConfig {
                operator_webhook_url: optional("operator_webhook_url"),
                operator_webhook_retries: settings.get_int("operator_webhook_retries")?.max(0) as u32,
                operator_email: optional("operator_email"),
                resend_api_key: optional("resend_api_key"),
                resend_from_email: settings.get_string("resend_from_email")?,
                cooldown: Duration::from_secs(
                    settings.get_int("alert_cooldown_minutes")?.max(0) as u64 * 60,
                ),
                timeout,
            },
            scheduler: SchedulerConfig {
                interval: Duration::from_secs(settings.get_int("job_interval_seconds")?.max(1) as u64),
                transfers_enabled: settings.get_bool("jobs_transfers_enabled")?,
                payouts_enabled: settings.get_bool("jobs_payouts_enabled")?,
                refunds_enabled: settings.get_bool("jobs_refunds_enabled")?,
                debits_enabled: settings.get_bool("jobs_debits_enabled")?,
                shops_enabled: settings.get_bool("jobs_shops_enabled")?,
            },
        })
    }
}
