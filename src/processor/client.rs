use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::integration_metadata;
use super::models::*;
use super::PaymentProcessor;
use crate::config::StripeConfig;
use crate::error::ProcessorError;

type FormParams = Vec<(String, String)>;

/// Stripe REST client. Configuration is fixed at construction; nothing is global.
pub struct StripeClient {
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Result<Self, ProcessorError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str, account: Option<&str>) -> RequestBuilder {
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.api_key)
            .header("Stripe-Version", &self.config.api_version);
        if let Some(account) = account {
            builder = builder.header("Stripe-Account", account);
        }
        builder
    }

    async fn execute<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ProcessorError> {
        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = api_error(status.as_u16(), &body);
            warn!(
                "Stripe call failed: status={} code={:?}",
                status.as_u16(),
                error.code()
            );
            return Err(error);
        }

        Ok(response.json::<T>().await?)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: FormParams,
        account: Option<&str>,
    ) -> Result<T, ProcessorError> {
        debug!("POST {}", path);
        self.execute(self.request(Method::POST, path, account).form(&params))
            .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProcessorError> {
        self.execute(self.request(Method::GET, path, None)).await
    }
}

/// Parse a Stripe error body, falling back to the raw text
fn api_error(status: u16, body: &str) -> ProcessorError {
    match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(envelope) => ProcessorError::Api {
            status,
            code: envelope.error.code,
            param: envelope.error.param,
            message: envelope.error.message.unwrap_or_else(|| body.to_string()),
        },
        Err(_) => ProcessorError::Api {
            status,
            code: None,
            param: None,
            message: body.to_string(),
        },
    }
}

/// Append `metadata[key]=value` pairs, integration block included
fn push_metadata(params: &mut FormParams, metadata: &Metadata) {
    let mut merged = integration_metadata();
    merged.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (key, value) in merged {
        params.push((format!("metadata[{key}]"), value));
    }
}

fn transfer_params(request: &CreateTransfer, platform_account: &str) -> FormParams {
    let destination = if request.from_connected_account {
        platform_account
    } else {
        request.account.as_str()
    };

    let mut params = vec![
        ("amount".to_string(), request.amount.to_string()),
        ("currency".to_string(), request.currency.clone()),
        ("destination".to_string(), destination.to_string()),
    ];
    if let Some(source) = &request.source_transaction {
        params.push(("source_transaction".to_string(), source.clone()));
    }
    push_metadata(&mut params, &request.metadata);
    params
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    #[instrument(skip(self, request), fields(amount = request.amount, account = %request.account))]
    async fn create_transfer(&self, request: &CreateTransfer) -> Result<StripeTransfer, ProcessorError> {
        let params = transfer_params(request, &self.config.platform_account);
        // Pulling fees means acting as the connected account
        let on_behalf = request
            .from_connected_account
            .then_some(request.account.as_str());
        self.post("/v1/transfers", params, on_behalf).await
    }

    #[instrument(skip(self, request), fields(amount = request.amount, account = %request.account))]
    async fn create_payout(&self, request: &CreatePayout) -> Result<StripePayout, ProcessorError> {
        let mut params = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
        ];
        push_metadata(&mut params, &request.metadata);
        self.post("/v1/payouts", params, Some(request.account.as_str()))
            .await
    }

    #[instrument(skip(self, request), fields(target = request.target.id()))]
    async fn create_refund(&self, request: &CreateRefund) -> Result<StripeRefund, ProcessorError> {
        let mut params = match &request.target {
            PaymentTarget::PaymentIntent(id) => vec![("payment_intent".to_string(), id.clone())],
            PaymentTarget::Charge(id) => vec![("charge".to_string(), id.clone())],
        };
        if let Some(amount) = request.amount {
            params.push(("amount".to_string(), amount.to_string()));
        }
        push_metadata(&mut params, &request.metadata);
        self.post("/v1/refunds", params, None).await
    }

    #[instrument(skip(self, metadata))]
    async fn reverse_transfer(
        &self,
        transfer_id: &str,
        amount: i64,
        metadata: &Metadata,
    ) -> Result<TransferReversal, ProcessorError> {
        let mut params = vec![("amount".to_string(), amount.to_string())];
        push_metadata(&mut params, metadata);
        self.post(&format!("/v1/transfers/{transfer_id}/reversals"), params, None)
            .await
    }

    #[instrument(skip(self))]
    async fn capture_payment(&self, target: &PaymentTarget, amount: i64) -> Result<(), ProcessorError> {
        match target {
            PaymentTarget::PaymentIntent(id) => {
                let mut params = vec![("amount_to_capture".to_string(), amount.to_string())];
                push_metadata(&mut params, &Metadata::new());
                self.post::<PaymentIntent>(&format!("/v1/payment_intents/{id}/capture"), params, None)
                    .await?;
            }
            PaymentTarget::Charge(id) => {
                let params = vec![("amount".to_string(), amount.to_string())];
                self.post::<Charge>(&format!("/v1/charges/{id}/capture"), params, None)
                    .await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_payment(&self, target: &PaymentTarget) -> Result<(), ProcessorError> {
        match target {
            PaymentTarget::PaymentIntent(id) => {
                self.post::<PaymentIntent>(&format!("/v1/payment_intents/{id}/cancel"), Vec::new(), None)
                    .await?;
            }
            PaymentTarget::Charge(id) => {
                // An uncaptured charge is released by refunding it in full
                let mut params = vec![("charge".to_string(), id.clone())];
                push_metadata(&mut params, &Metadata::new());
                self.post::<StripeRefund>("/v1/refunds", params, None).await?;
            }
        }
        Ok(())
    }

    async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge, ProcessorError> {
        self.get(&format!("/v1/charges/{charge_id}")).await
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, ProcessorError> {
        self.get(&format!("/v1/accounts/{account_id}")).await
    }

    #[instrument(skip(self, metadata))]
    async fn update_account(&self, account_id: &str, metadata: &Metadata) -> Result<Account, ProcessorError> {
        let mut params = FormParams::new();
        push_metadata(&mut params, metadata);
        self.post(&format!("/v1/accounts/{account_id}"), params, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(from_connected_account: bool) -> CreateTransfer {
        CreateTransfer {
            amount: 2400,
            currency: "eur".into(),
            account: "acct_seller".into(),
            source_transaction: Some("ch_1".into()),
            from_connected_account,
            metadata: Metadata::from([("mirakl_id".to_string(), "O1".to_string())]),
        }
    }

    fn param<'a>(params: &'a FormParams, key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_transfer_to_seller_targets_connected_account() {
        let params = transfer_params(&request(false), "acct_platform");
        assert_eq!(param(&params, "destination"), Some("acct_seller"));
        assert_eq!(param(&params, "source_transaction"), Some("ch_1"));
        assert_eq!(param(&params, "metadata[mirakl_id]"), Some("O1"));
        assert_eq!(param(&params, "metadata[integration_name]"), Some("settlement"));
    }

    #[test]
    fn test_fee_transfer_targets_platform() {
        let params = transfer_params(&request(true), "acct_platform");
        assert_eq!(param(&params, "destination"), Some("acct_platform"));
    }

    #[test]
    fn test_api_error_parses_structured_body() {
        let body = r#"{"error":{"code":"amount_too_small","param":"amount","message":"Amount must be at least 1"}}"#;
        let error = api_error(400, body);
        assert_eq!(error.code(), Some("amount_too_small"));
        assert!(error.is_amount_precondition());
    }

    #[test]
    fn test_api_error_keeps_unstructured_body() {
        let error = api_error(502, "<html>bad gateway</html>");
        assert_eq!(error.status(), Some(502));
        assert_eq!(error.reason(), "<html>bad gateway</html>");
        assert!(!error.is_amount_precondition());
    }
}
