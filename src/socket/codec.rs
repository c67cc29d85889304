//! Wire codecs for the market-data socket.
//!
//! Ticks arrive as fixed 197-byte big-endian frames, order updates as JSON
//! objects whose values are all strings. Everything numeric in a tick is a
//! signed 32-bit integer; prices are in paise.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Exact length of a full tick frame.
pub const FULL_TICK_LENGTH: usize = 197;

/// Fixed offset added to the tick `time` field; the feed counts seconds from
/// the broker's own epoch and this realigns it to Unix time. Interop depends
/// on the exact constant.
pub const TICK_TIME_OFFSET: i32 = 315_513_000;

const EXCHANGE_TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// One market-data update for a single instrument.
///
/// Prices (`ltp`, `avg_price`, `open`, `high`, `close`, `low`, circuit
/// limits) are in paise; divide by 100 for rupees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    pub token: i32,
    pub ltp: i32,
    pub net_change_indicator: i32,
    pub net_change: i32,
    pub ltq: i32,
    pub avg_price: i32,
    pub total_buy_quantity: i32,
    pub total_sell_quantity: i32,
    pub open: i32,
    pub high: i32,
    pub close: i32,
    pub low: i32,
    pub volume: i32,
    pub ltt: i32,
    pub time: i32,
    pub oi: i32,
    pub oi_day_high: i32,
    pub oi_day_low: i32,
    pub lower_limit: i32,
    pub upper_limit: i32,
}

impl Tick {
    /// Last traded price in rupees.
    pub fn ltp_rupees(&self) -> f64 {
        f64::from(self.ltp) / 100.0
    }
}

fn be_i32(data: &[u8]) -> i32 {
    match <[u8; 4]>::try_from(data) {
        Ok(bytes) => i32::from_be_bytes(bytes),
        Err(_) => 0,
    }
}

/// Decode a full tick frame. The caller has already checked the length.
pub fn decode_tick(data: &[u8]) -> Tick {
    Tick {
        token: be_i32(&data[0..4]),
        ltp: be_i32(&data[4..8]),
        net_change_indicator: i32::from(data[8]),
        net_change: be_i32(&data[9..13]),
        ltq: be_i32(&data[13..17]),
        avg_price: be_i32(&data[17..21]),
        total_buy_quantity: be_i32(&data[21..25]),
        total_sell_quantity: be_i32(&data[25..29]),
        open: be_i32(&data[29..33]),
        high: be_i32(&data[33..37]),
        close: be_i32(&data[37..41]),
        low: be_i32(&data[41..45]),
        volume: be_i32(&data[45..49]),
        ltt: be_i32(&data[49..53]),
        time: be_i32(&data[53..57]) + TICK_TIME_OFFSET,
        oi: be_i32(&data[57..61]),
        oi_day_high: be_i32(&data[61..65]),
        oi_day_low: be_i32(&data[65..69]),
        lower_limit: be_i32(&data[69..73]),
        upper_limit: be_i32(&data[73..77]),
    }
}

/// Asynchronous broker echo of an order transition.
///
/// All fields arrive as JSON strings; numeric and time fields are parsed
/// leniently and stay zero-valued when malformed.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub id: String,
    pub update_type: String,
    pub user_id: String,
    pub exchange: String,
    pub symbol: String,
    pub token: i32,
    pub qty: i32,
    pub price: f64,
    pub product: String,
    pub status: String,
    pub report_type: String,
    pub transaction_type: String,
    pub order: String,
    pub retention: String,
    pub avg_price: f64,
    pub reason: String,
    pub exchange_order_id: String,
    pub cancel_qty: String,
    pub tags: String,
    pub disclosed_qty: String,
    pub trigger_price: String,
    pub exchange_time: Option<NaiveDateTime>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An order-update payload is recognised by this keyword anywhere in the
/// frame, before any JSON parsing happens.
pub fn is_order_update(payload: &str) -> bool {
    payload.contains("orderUpdate")
}

/// Two-stage decode: string map first, then field-by-field conversion.
pub fn decode_order_update(message: &[u8]) -> anyhow::Result<OrderUpdate> {
    let raw: HashMap<String, String> = serde_json::from_slice(message)?;
    let field = |name: &str| raw.get(name).cloned().unwrap_or_default();

    let mut update = OrderUpdate {
        id: field("id"),
        update_type: field("type"),
        user_id: field("userId"),
        exchange: field("exchange"),
        symbol: field("symbol"),
        product: field("product"),
        status: field("status"),
        report_type: field("reportType"),
        transaction_type: field("transactionType"),
        order: field("order"),
        retention: field("retention"),
        reason: field("reason"),
        exchange_order_id: field("exchangeOrderId"),
        cancel_qty: field("cancelQty"),
        tags: field("tags"),
        disclosed_qty: field("disclosedQty"),
        trigger_price: field("triggerPrice"),
        ..Default::default()
    };

    if let Some(val) = raw.get("token") {
        update.token = val.parse().unwrap_or(0);
    }
    if let Some(val) = raw.get("qty") {
        update.qty = val.parse().unwrap_or(0);
    }
    if let Some(val) = raw.get("price") {
        update.price = val.parse().unwrap_or(0.0);
    }
    if let Some(val) = raw.get("avgPrice") {
        update.avg_price = val.parse().unwrap_or(0.0);
    }
    if let Some(val) = raw.get("timestamp") {
        update.timestamp = val
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    }
    if let Some(val) = raw.get("exchangeTime") {
        update.exchange_time = NaiveDateTime::parse_from_str(val, EXCHANGE_TIME_FORMAT).ok();
    }

    Ok(update)
}

/// Control frame sent to the socket for subscription changes.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SocketMessage {
    pub code: String,
    pub mode: String,
    pub full: Vec<i32>,
}

pub const CODE_SUB: &str = "sub";
pub const CODE_UNSUB: &str = "unsub";
pub const MODE_FULL: &str = "full";

impl SocketMessage {
    pub fn subscribe(token: i32) -> Self {
        Self {
            code: CODE_SUB.to_string(),
            mode: MODE_FULL.to_string(),
            full: vec![token],
        }
    }

    pub fn unsubscribe(token: i32) -> Self {
        Self {
            code: CODE_UNSUB.to_string(),
            mode: MODE_FULL.to_string(),
            full: vec![token],
        }
    }
}
