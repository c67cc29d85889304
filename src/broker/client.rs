//! Live REST client for the Tiqs backend.

use super::types::*;
use super::BrokerApi;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

const BASE_URL: &str = "https://api.tiqs.trading";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated REST client. Every request carries the `appId` and `token`
/// headers; responses are unwrapped from the `{data, status}` envelope.
pub struct TiqsClient {
    http: Client,
    app_id: String,
    access_token: String,
    base_url: String,
}

impl TiqsClient {
    pub fn new(app_id: impl Into<String>, access_token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            app_id: app_id.into(),
            access_token: access_token.into(),
            base_url: BASE_URL.to_string(),
        })
    }

    /// Point the client at a different backend, e.g. a local stub.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("appId", &self.app_id)
            .header("token", &self.access_token)
    }

    /// Send, unwrap the envelope and enforce `status == "success"`.
    async fn unwrap_envelope<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to fetch {what}"))?;

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {what} response"))?;

        if envelope.status != "success" {
            return Err(anyhow!(
                "{what} request failed: status={}, message={}",
                envelope.status,
                envelope.message.unwrap_or_default()
            ));
        }

        envelope
            .data
            .ok_or_else(|| anyhow!("{what} response carried no data"))
    }
}

#[async_trait]
impl BrokerApi for TiqsClient {
    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder> {
        let request = self
            .request(reqwest::Method::POST, "/order/regular")
            .json(order);
        Self::unwrap_envelope(request, "order placement").await
    }

    async fn cancel_order(&self, order_no: &str) -> Result<CancelAck> {
        let request = self.request(
            reqwest::Method::DELETE,
            &format!("/order/regular/{order_no}"),
        );
        Self::unwrap_envelope(request, "order cancel").await
    }

    async fn order_status(&self, order_no: &str) -> Result<String> {
        let request = self.request(reqwest::Method::GET, &format!("/order/{order_no}"));
        let transitions: Vec<OrderStatusEntry> =
            Self::unwrap_envelope(request, "order status").await?;

        // The backend returns transitions newest-first.
        transitions
            .first()
            .map(|entry| entry.order_status.clone())
            .ok_or_else(|| anyhow!("order status response was empty for {order_no}"))
    }

    async fn order_book(&self) -> Result<Vec<OrderBookEntry>> {
        let request = self.request(reqwest::Method::GET, "/user/orders");
        Self::unwrap_envelope(request, "order book").await
    }

    async fn trade_book(&self) -> Result<Vec<TradeBookEntry>> {
        let request = self.request(reqwest::Method::GET, "/user/trades");
        Self::unwrap_envelope(request, "trade book").await
    }

    async fn position_book(&self) -> Result<Vec<PositionBookEntry>> {
        let request = self.request(reqwest::Method::GET, "/user/positions");
        Self::unwrap_envelope(request, "position book").await
    }

    async fn ltp_paise(&self, token: i32) -> Result<i32> {
        let request = self
            .request(reqwest::Method::POST, "/info/quote/ltp")
            .json(&json!({ "token": token }));
        let quote: Quote = Self::unwrap_envelope(request, "ltp quote").await?;
        Ok(quote.ltp)
    }

    async fn option_chain(&self, chain_request: &OptionChainRequest) -> Result<Vec<OptionData>> {
        let request = self
            .request(reqwest::Method::POST, "/info/option-chain")
            .json(chain_request);
        Self::unwrap_envelope(request, "option chain").await
    }

    async fn expiry_dates(&self) -> Result<OptionExpiryDates> {
        let request = self.request(reqwest::Method::GET, "/info/option-chain-symbols");
        Self::unwrap_envelope(request, "expiry dates").await
    }

    async fn order_margin(&self, margin_request: &MarginRequest) -> Result<MarginDetail> {
        let request = self
            .request(reqwest::Method::POST, "/margin/order")
            .json(margin_request);
        Self::unwrap_envelope(request, "order margin").await
    }

    async fn basket_margin(&self, requests: &[MarginRequest]) -> Result<BasketMargin> {
        let request = self
            .request(reqwest::Method::POST, "/margin/basket")
            .json(&requests);
        Self::unwrap_envelope(request, "basket margin").await
    }
}
