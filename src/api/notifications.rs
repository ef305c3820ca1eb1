// Operator alerting
//
// Webhook: operator-configured URL receiving the alert as JSON
// Email: Resend, used only when the webhook post keeps failing, throttled per cooldown window

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::error::{AppError, AppResult};

// ============ ALERTS ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A money movement ended FAILED or ON_HOLD
    SettlementFailure,
    /// An account update could not be mapped to a KYC status
    AmbiguousKyc,
}

/// Event posted to the operator, carrying a snapshot of the entity involved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub entity: String,
    pub entity_key: String,
    pub reason: String,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OperatorAlert {
    pub fn new(
        kind: AlertKind,
        entity: impl Into<String>,
        entity_key: impl Into<String>,
        reason: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity: entity.into(),
            entity_key: entity_key.into(),
            reason: reason.into(),
            snapshot,
            created_at: Utc::now(),
        }
    }

    pub fn subject(&self) -> String {
        match self.kind {
            AlertKind::SettlementFailure => {
                format!("[settlement] {} {} failed", self.entity, self.entity_key)
            }
            AlertKind::AmbiguousKyc => {
                format!("[settlement] ambiguous KYC state for {}", self.entity_key)
            }
        }
    }

    fn email_body(&self) -> String {
        let snapshot = serde_json::to_string_pretty(&self.snapshot).unwrap_or_default();
        format!(
            "<p>{}</p><p>Reason: {}</p><pre>{}</pre>",
            self.subject(),
            self.reason,
            snapshot
        )
    }
}

// ============ CHANNELS ============

/// Delivery transport towards the operator
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn post_webhook(&self, alert: &OperatorAlert) -> AppResult<()>;

    async fn send_email(&self, subject: &str, html_body: &str) -> AppResult<()>;
}

/// Resend email client
pub struct ResendEmailClient {
    api_key: String,
    from_email: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest {
    to: String,
    from: String,
    subject: String,
    html: String,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

impl ResendEmailClient {
    pub fn new(api_key: String, from_email: String, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            api_key,
            from_email,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Send email via Resend
    pub async fn send_email(&self, to: &str, subject: &str, html_body: &str) -> AppResult<String> {
        let request = ResendEmailRequest {
            to: to.to_string(),
            from: self.from_email.clone(),
            subject: subject.to_string(),
            html: html_body.to_string(),
        };

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::External(format!("Resend API error: {}", error_text)));
        }

        let result: ResendEmailResponse = response.json().await?;
        info!("Alert email sent via Resend: {}", result.id);
        Ok(result.id)
    }
}

/// Webhook + Resend channel built from [`AlertConfig`]
pub struct HttpOperatorChannel {
    client: reqwest::Client,
    webhook_url: Option<String>,
    email: Option<(ResendEmailClient, String)>,
}

impl HttpOperatorChannel {
    pub fn from_config(config: &AlertConfig) -> AppResult<Self> {
        let email = match (&config.resend_api_key, &config.operator_email) {
            (Some(api_key), Some(to)) => Some((
                ResendEmailClient::new(
                    api_key.clone(),
                    config.resend_from_email.clone(),
                    config.timeout,
                )?,
                to.clone(),
            )),
            _ => None,
        };

        Ok(Self {
            client: reqwest::Client::builder().timeout(config.timeout).build()?,
            webhook_url: config.operator_webhook_url.clone(),
            email,
        })
    }
}

#[async_trait]
impl OperatorChannel for HttpOperatorChannel {
    async fn post_webhook(&self, alert: &OperatorAlert) -> AppResult<()> {
        let url = self
            .webhook_url
            .as_deref()
            .ok_or_else(|| AppError::Config("OPERATOR_WEBHOOK_URL not set".into()))?;

        let response = self.client.post(url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(AppError::External(format!(
                "Operator webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_email(&self, subject: &str, html_body: &str) -> AppResult<()> {
        let (client, to) = self
            .email
            .as_ref()
            .ok_or_else(|| AppError::Config("Operator email not configured".into()))?;
        client.send_email(to, subject, html_body).await?;
        Ok(())
    }
}

// ============ HANDLER ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertDelivery {
    Webhook,
    Email,
    /// Webhook failed and an email was already sent within the cooldown window
    Throttled,
    Dropped(String),
}

/// Posts alerts to the operator webhook, falling back to throttled email
pub struct AlertHandler {
    channel: Arc<dyn OperatorChannel>,
    retries: u32,
    backoff: Duration,
    cooldown: Duration,
    last_email: Mutex<Option<Instant>>,
}

impl AlertHandler {
    pub fn new(channel: Arc<dyn OperatorChannel>, retries: u32, cooldown: Duration) -> Self {
        Self {
            channel,
            retries,
            backoff: Duration::from_millis(500),
            cooldown,
            last_email: Mutex::new(None),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn handle(&self, alert: &OperatorAlert) -> AlertDelivery {
        let mut attempt = 0;
        let webhook_error = loop {
            match self.channel.post_webhook(alert).await {
                Ok(()) => {
                    info!("Alert {} posted to operator webhook", alert.id);
                    return AlertDelivery::Webhook;
                }
                // Nothing to retry when the webhook is not configured
                Err(AppError::Config(reason)) => break reason,
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Operator webhook failed for alert {} (attempt {}/{}): {}",
                        alert.id, attempt, self.retries, e
                    );
                    tokio::time::sleep(self.retry_delay(attempt)).await;
                }
                Err(e) => break e.to_string(),
            }
        };

        if self.in_cooldown() {
            warn!(
                "Alert {} not emailed, cooldown active (webhook: {})",
                alert.id, webhook_error
            );
            return AlertDelivery::Throttled;
        }

        match self
            .channel
            .send_email(&alert.subject(), &alert.email_body())
            .await
        {
            Ok(()) => {
                *self.last_email.lock() = Some(Instant::now());
                AlertDelivery::Email
            }
            Err(e) => {
                error!("Alert {} could not be delivered: {}", alert.id, e);
                AlertDelivery::Dropped(e.to_string())
            }
        }
    }

    /// Linear backoff with up to 25% jitter
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff * attempt;
        let jitter_ms = rand::random_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    /// At most one email per cooldown window, counted from the last email that went out.
    /// Alerts are handled one at a time by the dispatcher task.
    fn in_cooldown(&self) -> bool {
        match *self.last_email.lock() {
            Some(sent) => sent.elapsed() < self.cooldown,
            None => false,
        }
    }
}

// ============ DISPATCH ============

/// Non-blocking alert sink handed to the settlement engine
#[derive(Clone)]
pub struct AlertDispatcher {
    sender: mpsc::UnboundedSender<OperatorAlert>,
}

impl AlertDispatcher {
    /// Dispatcher plus the receiving end, for callers that drain alerts themselves
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperatorAlert>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Dispatcher whose alerts are delivered by `handler` on a background task
    pub fn spawn(handler: Arc<AlertHandler>) -> Self {
        let (dispatcher, mut receiver) = Self::new();
        tokio::spawn(async move {
            while let Some(alert) = receiver.recv().await {
                handler.handle(&alert).await;
            }
        });
        dispatcher
    }

    pub fn notify(&self, alert: OperatorAlert) {
        if let Err(e) = self.sender.send(alert) {
            error!("Alert dispatcher closed, dropping alert {}", e.0.id);
        }
    }
}

// ============ TESTS ============

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChannel;

    fn alert() -> OperatorAlert {
        OperatorAlert::new(
            AlertKind::SettlementFailure,
            "transfer",
            "PRODUCT_ORDER:O1",
            "card_declined",
            serde_json::json!({"mirakl_id": "O1"}),
        )
    }

    #[tokio::test]
    async fn test_webhook_success_skips_email() {
        let channel = Arc::new(FakeChannel::default());
        let handler = AlertHandler::new(channel.clone(), 2, Duration::from_secs(600));

        assert_eq!(handler.handle(&alert()).await, AlertDelivery::Webhook);
        assert_eq!(channel.webhook_attempts(), 1);
        assert!(channel.emails().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_retried_then_emailed() {
        let channel = Arc::new(FakeChannel::failing_webhook());
        let handler = AlertHandler::new(channel.clone(), 2, Duration::from_secs(600))
            .with_backoff(Duration::ZERO);

        assert_eq!(handler.handle(&alert()).await, AlertDelivery::Email);
        assert_eq!(channel.webhook_attempts(), 3);
        assert_eq!(channel.emails().len(), 1);
        assert!(channel.emails()[0].contains("PRODUCT_ORDER:O1"));
    }

    #[tokio::test]
    async fn test_emails_throttled_within_cooldown() {
        let channel = Arc::new(FakeChannel::failing_webhook());
        let handler = AlertHandler::new(channel.clone(), 0, Duration::from_secs(600))
            .with_backoff(Duration::ZERO);

        assert_eq!(handler.handle(&alert()).await, AlertDelivery::Email);
        assert_eq!(handler.handle(&alert()).await, AlertDelivery::Throttled);
        assert_eq!(handler.handle(&alert()).await, AlertDelivery::Throttled);
        assert_eq!(channel.emails().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_email_does_not_start_cooldown() {
        let channel = Arc::new(FakeChannel::failing_webhook());
        let handler = AlertHandler::new(channel.clone(), 0, Duration::from_secs(600))
            .with_backoff(Duration::ZERO);

        channel.fail_emails(true);
        assert!(matches!(
            handler.handle(&alert()).await,
            AlertDelivery::Dropped(_)
        ));

        channel.fail_emails(false);
        assert_eq!(handler.handle(&alert()).await, AlertDelivery::Email);
        assert_eq!(handler.handle(&alert()).await, AlertDelivery::Throttled);
        assert_eq!(channel.emails().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_cooldown_emails_every_failure() {
        let channel = Arc::new(FakeChannel::failing_webhook());
        let handler = AlertHandler::new(channel.clone(), 0, Duration::ZERO)
            .with_backoff(Duration::ZERO);

        handler.handle(&alert()).await;
        handler.handle(&alert()).await;
        assert_eq!(channel.emails().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatcher_forwards_alerts() {
        let (dispatcher, mut receiver) = AlertDispatcher::new();
        dispatcher.notify(alert());
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.entity_key, "PRODUCT_ORDER:O1");
    }
}
