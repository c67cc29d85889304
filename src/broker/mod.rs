//! Broker REST surface.
//!
//! [`BrokerApi`] is the contract the runtime consumes: the live
//! [`TiqsClient`] talks to the backend over authenticated HTTPS, while
//! [`MockBroker`] answers from memory for tests and dry runs.

mod client;
mod mock;
mod types;

pub use client::TiqsClient;
pub use mock::MockBroker;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// Operations the trading runtime needs from a broker backend.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Place a regular order; returns the broker order number.
    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder>;

    /// Cancel a live order by its broker order number.
    async fn cancel_order(&self, order_no: &str) -> Result<CancelAck>;

    /// Latest status string of an order (the newest transition).
    async fn order_status(&self, order_no: &str) -> Result<String>;

    /// The user's order book.
    async fn order_book(&self) -> Result<Vec<OrderBookEntry>>;

    /// The user's trade book.
    async fn trade_book(&self) -> Result<Vec<TradeBookEntry>>;

    /// The user's position book.
    async fn position_book(&self) -> Result<Vec<PositionBookEntry>>;

    /// Last traded price for an instrument token, in paise.
    async fn ltp_paise(&self, token: i32) -> Result<i32>;

    /// Option chain rows for one underlying and expiry.
    async fn option_chain(&self, request: &OptionChainRequest) -> Result<Vec<OptionData>>;

    /// Expiry dates per index underlying, nearest first.
    async fn expiry_dates(&self) -> Result<OptionExpiryDates>;

    /// Margin requirement for a single order.
    async fn order_margin(&self, request: &MarginRequest) -> Result<MarginDetail>;

    /// Margin requirement for a basket of orders.
    async fn basket_margin(&self, requests: &[MarginRequest]) -> Result<BasketMargin>;
}
