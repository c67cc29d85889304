//! In-memory broker for tests and dry runs.
//!
//! Hands out sequential order numbers, remembers every request, and can be
//! scripted to fail upcoming calls so retry paths are exercisable without a
//! backend.

use super::types::*;
use super::BrokerApi;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct MockBroker {
    order_counter: AtomicU64,
    fail_next_places: AtomicU32,
    fail_next_cancels: AtomicU32,
    placed: Mutex<Vec<OrderRequest>>,
    canceled: Mutex<Vec<String>>,
    ltps: Mutex<HashMap<i32, i32>>,
    /// Option chain rows keyed by the underlying's token string.
    chains: Mutex<HashMap<String, Vec<OptionData>>>,
    expiries: Mutex<OptionExpiryDates>,
}

impl Default for MockBroker {
    fn default() -> Self {
        let one_expiry = vec!["2024-10-17".to_string()];
        Self {
            order_counter: AtomicU64::new(0),
            fail_next_places: AtomicU32::new(0),
            fail_next_cancels: AtomicU32::new(0),
            placed: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            ltps: Mutex::new(HashMap::new()),
            chains: Mutex::new(HashMap::new()),
            expiries: Mutex::new(OptionExpiryDates {
                banknifty: one_expiry.clone(),
                finnifty: one_expiry.clone(),
                midcpnifty: one_expiry.clone(),
                nifty: one_expiry.clone(),
                nifty_next_50: one_expiry,
            }),
        }
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `count` order placements to fail.
    pub fn fail_next_places(&self, count: u32) {
        self.fail_next_places.store(count, Ordering::SeqCst);
    }

    /// Script the next `count` cancels to fail.
    pub fn fail_next_cancels(&self, count: u32) {
        self.fail_next_cancels.store(count, Ordering::SeqCst);
    }

    pub fn set_ltp(&self, token: i32, paise: i32) {
        self.ltps.lock().insert(token, paise);
    }

    /// Seed the option chain served for an underlying token.
    pub fn set_option_chain(&self, token: &str, rows: Vec<OptionData>) {
        self.chains.lock().insert(token.to_string(), rows);
    }

    /// Every order placed so far, oldest first.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.placed.lock().clone()
    }

    /// Every order number canceled so far, oldest first.
    pub fn canceled_orders(&self) -> Vec<String> {
        self.canceled.lock().clone()
    }

    fn take_scripted_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder> {
        if Self::take_scripted_failure(&self.fail_next_places) {
            return Err(anyhow!("scripted order placement failure"));
        }
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.placed.lock().push(order.clone());
        Ok(PlacedOrder {
            order_no: format!("MOCK{n:06}"),
            request_time: String::new(),
        })
    }

    async fn cancel_order(&self, order_no: &str) -> Result<CancelAck> {
        if Self::take_scripted_failure(&self.fail_next_cancels) {
            return Err(anyhow!("scripted cancel failure"));
        }
        self.canceled.lock().push(order_no.to_string());
        Ok(CancelAck {
            message: "order cancelled".into(),
        })
    }

    async fn order_status(&self, _order_no: &str) -> Result<String> {
        Ok("OPEN".into())
    }

    async fn order_book(&self) -> Result<Vec<OrderBookEntry>> {
        Ok(Vec::new())
    }

    async fn trade_book(&self) -> Result<Vec<TradeBookEntry>> {
        Ok(Vec::new())
    }

    async fn position_book(&self) -> Result<Vec<PositionBookEntry>> {
        Ok(Vec::new())
    }

    async fn ltp_paise(&self, token: i32) -> Result<i32> {
        self.ltps
            .lock()
            .get(&token)
            .copied()
            .ok_or_else(|| anyhow!("no ltp seeded for token {token}"))
    }

    async fn option_chain(&self, request: &OptionChainRequest) -> Result<Vec<OptionData>> {
        Ok(self
            .chains
            .lock()
            .get(&request.token)
            .cloned()
            .unwrap_or_default())
    }

    async fn expiry_dates(&self) -> Result<OptionExpiryDates> {
        Ok(self.expiries.lock().clone())
    }

    async fn order_margin(&self, _request: &MarginRequest) -> Result<MarginDetail> {
        Ok(MarginDetail::default())
    }

    async fn basket_margin(&self, _requests: &[MarginRequest]) -> Result<BasketMargin> {
        Ok(BasketMargin::default())
    }
}
