//! Wire shapes for the broker REST surface.
//!
//! The backend wraps every response in a `{data, status}` envelope and quotes
//! most numeric fields as strings; the types mirror that and conversion to
//! typed values happens at the call sites that need it.

use serde::{Deserialize, Serialize};

/// Standard response envelope. `status` is `"success"` on the happy path.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Regular order placement request. All numeric fields are sent as strings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub exchange: String,
    pub token: String,
    pub quantity: String,
    pub disclosed_qty: String,
    pub product: String,
    pub symbol: String,
    pub transaction_type: String,
    pub order: String,
    pub price: String,
    pub validity: String,
    pub tags: String,
    pub amo: bool,
    pub trigger_price: String,
}

/// Payload of a successful order placement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_no: String,
    #[serde(default)]
    pub request_time: String,
}

/// Payload of a successful cancel request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CancelAck {
    pub message: String,
}

/// One row of the user's order book.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderBookEntry {
    pub id: String,
    pub exchange: String,
    pub symbol: String,
    pub token: String,
    pub quantity: String,
    pub price: String,
    pub product: String,
    pub order_status: String,
    pub transaction_type: String,
    pub order: String,
    pub fill_shares: String,
    pub average_price: String,
    pub reject_reason: String,
    #[serde(rename = "exchangeOrderID")]
    pub exchange_order_id: String,
    pub retention: String,
    pub order_time: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

/// One row of the user's trade book.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TradeBookEntry {
    pub id: String,
    pub exchange: String,
    pub symbol: String,
    pub token: String,
    pub quantity: String,
    pub product: String,
    pub transaction_type: String,
    pub order: String,
    pub fill_id: String,
    pub fill_time: String,
    pub fill_price: String,
    pub fill_quantity: String,
    pub average_price: String,
    #[serde(rename = "exchangeOrderID")]
    pub exchange_order_id: String,
}

/// One row of the user's position book.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PositionBookEntry {
    pub exchange: String,
    pub symbol: String,
    pub token: String,
    pub product: String,
    pub qty: String,
    pub avg_price: String,
    pub ltp: String,
    #[serde(rename = "realisedPnL")]
    pub realised_pnl: String,
    pub unrealised_mark_to_market: String,
    pub day_buy_qty: String,
    pub day_buy_avg_price: String,
    pub day_sell_qty: String,
    pub day_sell_avg_price: String,
    pub lot_size: String,
}

/// One row of an order-status query; index 0 is the latest transition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderStatusEntry {
    pub id: String,
    pub symbol: String,
    pub order_status: String,
    pub report_type: String,
    pub average_price: String,
    pub fill_shares: String,
    pub reject_reason: String,
    pub order_time: String,
}

/// Option chain request. `count` strikes either side of the money.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionChainRequest {
    pub token: String,
    pub exchange: String,
    pub count: String,
    pub expiry: String,
}

/// One contract row of an option chain.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptionData {
    pub exchange: String,
    pub symbol: String,
    pub token: String,
    /// `CE` or `PE`.
    pub option_type: String,
    pub strike_price: String,
    pub lot_size: String,
    pub tick_size: String,
}

/// Expiry dates per index underlying, nearest first.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OptionExpiryDates {
    #[serde(rename = "BANKNIFTY")]
    pub banknifty: Vec<String>,
    #[serde(rename = "FINNIFTY")]
    pub finnifty: Vec<String>,
    #[serde(rename = "MIDCPNIFTY")]
    pub midcpnifty: Vec<String>,
    #[serde(rename = "NIFTY")]
    pub nifty: Vec<String>,
    #[serde(rename = "NIFTYNXT50")]
    pub nifty_next_50: Vec<String>,
}

/// LTP quote payload; prices in paise.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Quote {
    pub close: i32,
    pub ltp: i32,
    pub token: i32,
}

/// Margin requirement request for a single order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginRequest {
    pub exchange: String,
    pub token: String,
    pub quantity: String,
    pub price: String,
    pub trigger_price: String,
    pub product: String,
    pub transaction_type: String,
    pub order: String,
}

/// Charge breakdown attached to a margin quote.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarginCharges {
    pub brokerage: f64,
    pub sebi_charges: f64,
    pub exchange_txn_fee: f64,
    pub stamp_duty: f64,
    pub transaction_tax: f64,
    pub total: f64,
}

/// Margin requirement for a single order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarginDetail {
    pub cash: String,
    pub margin: String,
    pub margin_used: String,
    pub charge: MarginCharges,
}

/// Margin requirement for a basket of orders.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BasketMargin {
    pub margin_used: String,
    pub margin_used_after_trade: String,
}
