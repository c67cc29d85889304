//! Position state and declarative order intents.

use anyhow::Result;
use chrono::NaiveDateTime;
use std::fmt;

/// Close-price history is capped at this many bars per strategy.
pub const BARS_MAX_LEN: usize = 1500;

/// Market position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// Position lifecycle. The ordering is load-bearing: an exit order may only
/// be placed once the entry has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PositionStatus {
    EntryPending,
    EntryOpen,
    EntryComplete,
    ExitPending,
    ExitOpen,
    ExitPartial,
    ExitComplete,
}

/// One accepted entry and its life on the broker's books.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub entry_px: f64,
    pub exit_px: f64,
    pub entry_time: NaiveDateTime,
    pub exit_time: Option<NaiveDateTime>,
    pub qty: i32,
    pub direction: Direction,
    /// The strategy-local order id this position was entered under.
    pub ord_id: String,
    /// Broker order number of the entry leg.
    pub tiqs_entry_ord_id: String,
    /// Broker order number of the live exit leg; empty while no exit order
    /// is outstanding.
    pub tiqs_exit_ord_id: String,
    /// Broker-supplied close reason, if any.
    pub reason: String,
    pub status: PositionStatus,
    pub pnl: f64,
}

/// Declarative intent to enter a position.
#[derive(Debug, Clone)]
pub struct EntryOpts {
    pub direction: Direction,
    /// Contracts/lots to trade; must be positive.
    pub qty: i32,
    /// Limit price; a stop alone yields a stop-market order, a limit alone a
    /// limit order, both a stop-limit, neither a market order.
    pub limit: Option<f64>,
    pub stop: Option<f64>,
}

/// Declarative intent to exit a previously entered position.
#[derive(Debug, Clone)]
pub struct ExitOpts {
    /// Contracts/lots to exit; capped at the open quantity when placed.
    pub qty: i32,
    pub limit: Option<f64>,
    pub stop: Option<f64>,
}

fn validate_price(price: Option<f64>, name: &str) -> Result<()> {
    if let Some(value) = price {
        anyhow::ensure!(value > 0.0, "{name} must be positive when set");
    }
    Ok(())
}

impl EntryOpts {
    pub fn validate(&self, order_id: &str) -> Result<()> {
        anyhow::ensure!(!order_id.is_empty(), "order id is required");
        anyhow::ensure!(self.qty > 0, "qty must be positive");
        validate_price(self.limit, "limit")?;
        validate_price(self.stop, "stop")
    }
}

impl ExitOpts {
    pub fn validate(&self, order_id: &str) -> Result<()> {
        anyhow::ensure!(!order_id.is_empty(), "order id is required");
        anyhow::ensure!(self.qty > 0, "qty must be positive");
        validate_price(self.limit, "limit")?;
        validate_price(self.stop, "stop")
    }
}

/// Bounded close-price history, oldest bar first.
#[derive(Debug, Default)]
pub struct CloseSeries {
    values: Vec<f64>,
}

impl CloseSeries {
    pub fn push(&mut self, close: f64) {
        if self.values.len() == BARS_MAX_LEN {
            self.values.remove(0);
        }
        self.values.push(close);
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.last().copied()
    }
}
