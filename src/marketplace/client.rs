use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{header::HeaderMap, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::models::*;
use super::MarketplaceApi;
use crate::config::MiraklConfig;
use crate::error::MarketplaceError;

const PAGE_SIZE: usize = 100;

/// Mirakl front API client. Every request waits on a shared rate limiter.
pub struct MiraklClient {
    http: reqwest::Client,
    config: MiraklConfig,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl MiraklClient {
    pub fn new(config: MiraklConfig) -> Result<Self, MarketplaceError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http,
            config,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", &self.config.api_key)
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, MarketplaceError> {
        self.limiter.until_ready().await;

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketplaceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<(T, HeaderMap), MarketplaceError> {
        let response = self.send(self.request(Method::GET, url).query(query)).await?;
        let headers = response.headers().clone();
        let body = response.json::<T>().await?;
        Ok((body, headers))
    }

    async fn put_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, MarketplaceError> {
        self.send(self.request(Method::PUT, &self.url(path)).json(body))
            .await
    }

    /// Drain an offset-paginated endpoint by following `Link: <...>; rel="next"`
    async fn get_all_by_link<P, T>(
        &self,
        path: &str,
        query: Vec<(String, String)>,
        extract: impl Fn(P) -> Vec<T> + Send,
    ) -> Result<Vec<T>, MarketplaceError>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut query = query;
        query.push(("max".into(), PAGE_SIZE.to_string()));
        let mut url = self.url(path);

        loop {
            let (page, headers) = self.get_json::<P>(&url, &query).await?;
            items.extend(extract(page));

            match next_link(&headers) {
                Some(next) => {
                    // The next link already carries the full query string
                    url = next;
                    query.clear();
                }
                None => break,
            }
        }

        debug!("Fetched {} items from {}", items.len(), path);
        Ok(items)
    }

    /// Drain a token-paginated endpoint by following `next_page_token` in the body
    async fn get_all_by_token<T>(
        &self,
        path: &str,
        query: Vec<(String, String)>,
    ) -> Result<Vec<T>, MarketplaceError>
    where
        T: DeserializeOwned,
    {
        let mut items = Vec::new();
        let url = self.url(path);
        let mut page_token: Option<String> = None;

        loop {
            let mut page_query = query.clone();
            page_query.push(("limit".into(), PAGE_SIZE.to_string()));
            if let Some(token) = &page_token {
                page_query.push(("page_token".into(), token.clone()));
            }

            let (page, _) = self.get_json::<TokenPage<T>>(&url, &page_query).await?;
            items.extend(page.data);

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!("Fetched {} items from {}", items.len(), path);
        Ok(items)
    }
}

/// Extract the `rel="next"` target from a Link header
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get("link")?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|param| param.trim() == "rel=\"next\"") {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn order_query(kind: OrderKind, filter: &OrderFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    let (ids_key, commercial_key, date_key) = match kind {
        OrderKind::Product => ("order_ids", "commercial_ids", "start_update_date"),
        OrderKind::Service => ("order_id", "commercial_order_id", "date_updated_from"),
    };

    if let Some(since) = &filter.updated_since {
        query.push((date_key.to_string(), format_date(since)));
    }
    if !filter.order_ids.is_empty() {
        query.push((ids_key.to_string(), filter.order_ids.join(",")));
    }
    if !filter.commercial_ids.is_empty() {
        query.push((commercial_key.to_string(), filter.commercial_ids.join(",")));
    }
    if kind == OrderKind::Product {
        query.push(("sort".into(), "dateUpdated".into()));
        query.push(("order".into(), "asc".into()));
    }
    query
}

#[async_trait]
impl MarketplaceApi for MiraklClient {
    #[instrument(skip(self, filter))]
    async fn list_orders(
        &self,
        kind: OrderKind,
        filter: &OrderFilter,
    ) -> Result<Vec<Order>, MarketplaceError> {
        let query = order_query(kind, filter);
        match kind {
            OrderKind::Product => {
                self.get_all_by_link("/api/orders", query, |page: OrdersPage| page.orders)
                    .await
            }
            OrderKind::Service => self.get_all_by_token("/api/mms/orders", query).await,
        }
    }

    #[instrument(skip(self))]
    async fn list_pending_debits(&self) -> Result<Vec<PendingDebit>, MarketplaceError> {
        self.get_all_by_link("/api/payment/debit", Vec::new(), |page: PendingDebitsPage| {
            page.orders
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_pending_refunds(
        &self,
        kind: OrderKind,
    ) -> Result<Vec<PendingRefund>, MarketplaceError> {
        match kind {
            OrderKind::Product => {
                self.get_all_by_link("/api/payment/refund", Vec::new(), |page: PendingRefundsPage| {
                    page.orders
                        .into_iter()
                        .flat_map(PendingRefundOrder::into_refunds)
                        .collect()
                })
                .await
            }
            OrderKind::Service => {
                let query = vec![("state".to_string(), "WAITING_REFUND".to_string())];
                self.get_all_by_token("/api/mms/refunds", query).await
            }
        }
    }

    #[instrument(skip(self, debits), fields(count = debits.len()))]
    async fn validate_pending_debits(
        &self,
        debits: &[DebitValidation],
    ) -> Result<(), MarketplaceError> {
        if debits.is_empty() {
            return Ok(());
        }
        self.put_json("/api/payment/debit", &serde_json::json!({ "orders": debits }))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, refunds), fields(count = refunds.len()))]
    async fn validate_pending_refunds(
        &self,
        kind: OrderKind,
        refunds: &[RefundValidation],
    ) -> Result<(), MarketplaceError> {
        if refunds.is_empty() {
            return Ok(());
        }
        match kind {
            OrderKind::Product => {
                self.put_json("/api/payment/refund", &serde_json::json!({ "refunds": refunds }))
                    .await?
            }
            OrderKind::Service => self.put_json("/api/mms/refunds", refunds).await?,
        };
        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn list_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, MarketplaceError> {
        let mut query = Vec::new();
        if let Some(since) = &filter.created_since {
            query.push(("start_date".to_string(), format_date(since)));
        }
        self.get_all_by_token("/api/invoices", query).await
    }

    #[instrument(skip(self, filter))]
    async fn fetch_shops(&self, filter: &ShopFilter) -> Result<Vec<Shop>, MarketplaceError> {
        let mut query = vec![("paginate".to_string(), filter.paginate.to_string())];
        if !filter.shop_ids.is_empty() {
            let ids: Vec<String> = filter.shop_ids.iter().map(i64::to_string).collect();
            query.push(("shop_ids".to_string(), ids.join(",")));
        }
        if let Some(since) = &filter.updated_since {
            query.push(("updated_since".to_string(), format_date(since)));
        }

        if filter.paginate {
            self.get_all_by_link("/api/shops", query, |page: ShopsPage| page.shops)
                .await
        } else {
            let (page, _) = self
                .get_json::<ShopsPage>(&self.url("/api/shops"), &query)
                .await?;
            Ok(page.shops)
        }
    }

    #[instrument(skip(self, patches), fields(count = patches.len()))]
    async fn patch_shops(&self, patches: &[ShopPatch]) -> Result<Vec<Shop>, MarketplaceError> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .put_json("/api/shops", &serde_json::json!({ "shops": patches }))
            .await?;
        let returns = response.json::<ShopReturns>().await?;
        Ok(returns
            .shop_returns
            .into_iter()
            .filter_map(|r| r.shop_updated)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::{Query, State};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::TcpListener;

    use super::*;

    type SeenQueries = Arc<Mutex<Vec<HashMap<String, String>>>>;

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    fn spawn(listener: TcpListener, router: Router) {
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
    }

    fn client(base_url: &str) -> MiraklClient {
        MiraklClient::new(MiraklConfig {
            base_url: base_url.to_string(),
            api_key: "test-key".into(),
            requests_per_second: 100,
            timeout: Duration::from_secs(5),
            kyc_field: None,
            onboarding_field: None,
            onboarding_url: None,
        })
        .unwrap()
    }

    async fn debit_pages(
        State((base, seen)): State<(String, SeenQueries)>,
        Query(query): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        seen.lock().push(query.clone());
        let offset: usize = query
            .get("offset")
            .and_then(|offset| offset.parse().ok())
            .unwrap_or(0);
        let body = json!({
            "orders": [{
                "order_id": format!("D{}", offset + 1),
                "order_commercial_id": "C1",
                "shop_id": 2000,
                "amount": 12.5,
                "currency_iso_code": "EUR",
            }]
        });
        let mut response = Json(body).into_response();
        if offset < 2 {
            let link = format!(
                "<{base}/api/payment/debit?offset={}&max=100>; rel=\"next\"",
                offset + 1
            );
            response
                .headers_mut()
                .insert("link", axum::http::HeaderValue::from_str(&link).unwrap());
        }
        response
    }

    async fn invoice_pages(
        State(seen): State<SeenQueries>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        seen.lock().push(query.clone());
        let (invoice_id, next_page_token) = match query.get("page_token").map(String::as_str) {
            None => (1, "p2"),
            Some("p2") => (2, "p3"),
            _ => (3, ""),
        };
        Json(json!({
            "invoices": [{
                "invoice_id": invoice_id,
                "shop_id": 2000,
                "currency_iso_code": "EUR",
                "date_created": "2024-03-01T00:00:00Z",
                "summary": { "amount_transferred": 10.0 },
            }],
            "next_page_token": next_page_token,
        }))
    }

    #[tokio::test]
    async fn test_link_pagination_drains_every_page() {
        let (listener, base) = bind().await;
        let seen = SeenQueries::default();
        let router = Router::new()
            .route("/api/payment/debit", get(debit_pages))
            .with_state((base.clone(), seen.clone()));
        spawn(listener, router);

        let debits = client(&base).list_pending_debits().await.unwrap();

        let ids: Vec<&str> = debits.iter().map(|d| d.order_id.as_str()).collect();
        assert_eq!(ids, vec!["D1", "D2", "D3"]);
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].get("max").map(String::as_str), Some("100"));
        assert_eq!(seen[2].get("offset").map(String::as_str), Some("2"));
    }

    async fn broken_second_page(
        State(base): State<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        if query.contains_key("offset") {
            return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
        }
        let link = format!("<{base}/api/payment/debit?offset=1&max=100>; rel=\"next\"");
        let mut response = Json(json!({ "orders": [] })).into_response();
        response
            .headers_mut()
            .insert("link", axum::http::HeaderValue::from_str(&link).unwrap());
        response
    }

    #[tokio::test]
    async fn test_failed_page_fails_whole_listing() {
        let (listener, base) = bind().await;
        let router = Router::new()
            .route("/api/payment/debit", get(broken_second_page))
            .with_state(base.clone());
        spawn(listener, router);

        let result = client(&base).list_pending_debits().await;
        assert!(matches!(
            result,
            Err(MarketplaceError::Api { status: 500, ref body }) if body == "boom"
        ));
    }

    #[tokio::test]
    async fn test_token_pagination_drains_until_empty_token() {
        let (listener, base) = bind().await;
        let seen = SeenQueries::default();
        let router = Router::new()
            .route("/api/invoices", get(invoice_pages))
            .with_state(seen.clone());
        spawn(listener, router);

        let since = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let invoices = client(&base)
            .list_invoices(&InvoiceFilter {
                created_since: Some(since),
            })
            .await
            .unwrap();

        let ids: Vec<i64> = invoices.iter().map(|i| i.invoice_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen
            .iter()
            .all(|query| query.get("start_date").map(String::as_str) == Some("2024-02-01T00:00:00Z")));
        assert_eq!(seen[0].get("page_token"), None);
        assert_eq!(seen[2].get("page_token").map(String::as_str), Some("p3"));
    }

    fn link_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("link", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_next_link_found_among_relations() {
        let headers = link_headers(
            "<https://m.example/api/orders?offset=0&max=100>; rel=\"previous\", \
             <https://m.example/api/orders?offset=200&max=100>; rel=\"next\"",
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://m.example/api/orders?offset=200&max=100")
        );
    }

    #[test]
    fn test_next_link_absent_on_last_page() {
        let headers = link_headers("<https://m.example/api/orders?offset=0>; rel=\"previous\"");
        assert_eq!(next_link(&headers), None);
        assert_eq!(next_link(&HeaderMap::new()), None);
    }

    #[test]
    fn test_order_query_uses_kind_specific_keys() {
        let filter = OrderFilter::by_commercial_ids(vec!["C1".into(), "C2".into()]);
        let product = order_query(OrderKind::Product, &filter);
        let service = order_query(OrderKind::Service, &filter);

        assert!(product.contains(&("commercial_ids".into(), "C1,C2".into())));
        assert!(service.contains(&("commercial_order_id".into(), "C1,C2".into())));
    }

    #[test]
    fn test_order_query_formats_dates() {
        let since = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let query = order_query(OrderKind::Product, &OrderFilter::by_date(since));
        assert!(query.contains(&("start_update_date".into(), "2024-03-01T10:00:00Z".into())));
    }
}
