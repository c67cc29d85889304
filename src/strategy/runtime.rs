//! Per-strategy event loops.
//!
//! Each strategy runs two serial loops: the tick loop feeds the user
//! callback and materialises declared intents into broker orders, the
//! order-update loop reconciles broker echoes into the position state
//! machine. The two race by design, so every map sits behind its own lock.

use crate::broker::PlacedOrder;
use crate::socket::{OrderUpdate, Tick};
use crate::strategy::types::{
    CloseSeries, Direction, EntryOpts, ExitOpts, Position, PositionStatus,
};
use crate::trader::{prepare_order, Action, AutoTrader, OrderArgs};
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Per-strategy mailbox depth for ticks and order updates.
const MAILBOX_CAPACITY: usize = 50;

/// How long shutdown waits for in-flight order echoes to settle.
const SHUTDOWN_SETTLE: Duration = Duration::from_secs(2);

/// User callback, invoked on every tick with the strategy handle, the tick
/// and the bounded close series (oldest first).
pub type OnTickFn = Arc<dyn Fn(&Strategy, &Tick, &[f64]) + Send + Sync>;

/// Broker order transition, converted from the wire string at the boundary.
enum OrderEvent {
    Open,
    Complete,
    Terminated,
    Other,
}

fn order_event(status: &str) -> OrderEvent {
    match status {
        "OPEN" => OrderEvent::Open,
        "COMPLETE" => OrderEvent::Complete,
        "REJECTED" | "CANCELED" => OrderEvent::Terminated,
        _ => OrderEvent::Other,
    }
}

/// A named callback-bearing unit bound to one symbol, with its own event
/// loops and position state. Obtained from
/// [`AutoTrader::add_strategy`](crate::trader::AutoTrader::add_strategy).
pub struct Strategy {
    trader: AutoTrader,
    name: String,
    symbol: String,
    token: i32,
    on_tick: OnTickFn,

    open_pos: RwLock<HashMap<String, Position>>,
    ord_entry: RwLock<HashMap<String, EntryOpts>>,
    ord_exit: RwLock<HashMap<String, ExitOpts>>,
    ord_cancel: RwLock<HashSet<String>>,
    closed_pos: RwLock<HashMap<String, Vec<Position>>>,
    /// Broker order number -> strategy-local order id.
    tiqs_to_local: RwLock<HashMap<String, String>>,

    ticks_tx: Mutex<Option<mpsc::Sender<Tick>>>,
    orders_tx: Mutex<Option<mpsc::Sender<OrderUpdate>>>,
    stop_ticks: watch::Sender<bool>,

    unplug: AtomicBool,
    shutting_down: AtomicBool,
    pnl: RwLock<f64>,
    last_ltp: RwLock<f64>,
}

impl Strategy {
    pub(crate) fn new(
        trader: AutoTrader,
        name: &str,
        symbol: &str,
        token: i32,
        on_tick: OnTickFn,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<Tick>,
        mpsc::Receiver<OrderUpdate>,
        watch::Receiver<bool>,
    ) {
        let (ticks_tx, ticks_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (orders_tx, orders_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let strategy = Arc::new(Self {
            trader,
            name: name.to_string(),
            symbol: symbol.to_string(),
            token,
            on_tick,
            open_pos: RwLock::new(HashMap::new()),
            ord_entry: RwLock::new(HashMap::new()),
            ord_exit: RwLock::new(HashMap::new()),
            ord_cancel: RwLock::new(HashSet::new()),
            closed_pos: RwLock::new(HashMap::new()),
            tiqs_to_local: RwLock::new(HashMap::new()),
            ticks_tx: Mutex::new(Some(ticks_tx)),
            orders_tx: Mutex::new(Some(orders_tx)),
            stop_ticks: stop_tx,
            unplug: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            pnl: RwLock::new(0.0),
            last_ltp: RwLock::new(0.0),
        });

        (strategy, ticks_rx, orders_rx, stop_rx)
    }

    // ==================== Public handle ====================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// The dispatcher this strategy is deployed on.
    pub fn trader(&self) -> AutoTrader {
        self.trader.clone()
    }

    /// Sum of the per-position PnL figures, refreshed on every tick.
    pub fn pnl(&self) -> f64 {
        *self.pnl.read()
    }

    /// Declare an entry intent. A position with the same local order id
    /// replaces any pending intent under that id; the order is placed on the
    /// next tick.
    pub fn entry(&self, order_id: &str, opts: EntryOpts) -> Result<()> {
        opts.validate(order_id)?;
        debug!(strategy = %self.name, order_id, "entry intent added");
        self.ord_entry.write().insert(order_id.to_string(), opts);
        Ok(())
    }

    /// Declare an exit intent against a previous entry. If the entry has not
    /// filled yet the intent waits until it does.
    pub fn exit(&self, order_id: &str, opts: ExitOpts) -> Result<()> {
        opts.validate(order_id)?;
        debug!(strategy = %self.name, order_id, "exit intent added");
        self.ord_exit.write().insert(order_id.to_string(), opts);
        Ok(())
    }

    /// Declare a cancel intent for the live leg of `order_id`. An intent
    /// whose position has not appeared yet is kept until it does.
    pub fn cancel(&self, order_id: &str) {
        debug!(strategy = %self.name, order_id, "cancel intent added");
        self.ord_cancel.write().insert(order_id.to_string());
    }

    /// Mark this strategy for removal; it shuts down after the current tick.
    pub fn unplug(&self) {
        debug!(strategy = %self.name, "strategy marked as unplugged");
        self.unplug.store(true, Ordering::SeqCst);
    }

    pub fn open_position(&self, order_id: &str) -> Option<Position> {
        self.open_pos.read().get(order_id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open_pos.read().values().cloned().collect()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.closed_pos
            .read()
            .values()
            .flat_map(|positions| positions.iter().cloned())
            .collect()
    }

    pub fn closed_positions_for(&self, order_id: &str) -> Vec<Position> {
        self.closed_pos
            .read()
            .get(order_id)
            .cloned()
            .unwrap_or_default()
    }

    // ==================== Mailboxes ====================

    pub(crate) async fn deliver_tick(&self, tick: Tick) {
        let sender = self.ticks_tx.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(tick).await;
        }
    }

    pub(crate) async fn deliver_order_update(&self, update: OrderUpdate) {
        let sender = self.orders_tx.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(update).await;
        }
    }

    // ==================== Event loops ====================

    pub(crate) async fn run_tick_loop(
        self: Arc<Self>,
        mut ticks: mpsc::Receiver<Tick>,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!(strategy = %self.name, "tick loop started");
        let mut bars = CloseSeries::default();
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    debug!(strategy = %self.name, "tick loop stopped");
                    return;
                }
                tick = ticks.recv() => {
                    let Some(tick) = tick else { return };
                    bars.push(tick.ltp_rupees());
                    *self.last_ltp.write() = tick.ltp_rupees();
                    let unplugged = self.execute(&bars, &tick).await;
                    if unplugged {
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    pub(crate) async fn run_order_loop(self: Arc<Self>, mut updates: mpsc::Receiver<OrderUpdate>) {
        debug!(strategy = %self.name, "order-update loop started");
        while let Some(update) = updates.recv().await {
            self.apply_order_update(&update);
        }
        debug!(strategy = %self.name, "order-update loop stopped");
    }

    /// Run the user callback and materialise intents. Returns true when the
    /// strategy asked to be unplugged.
    async fn execute(&self, bars: &CloseSeries, tick: &Tick) -> bool {
        let callback_result = catch_unwind(AssertUnwindSafe(|| {
            (self.on_tick)(self, tick, bars.as_slice());
        }));
        if let Err(panic) = callback_result {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(strategy = %self.name, panic = %message, "tick callback panicked");
        }

        if self.unplug.load(Ordering::SeqCst) {
            return true;
        }

        self.process_pnls(tick);
        self.process_entry_orders(tick).await;
        self.process_exit_orders(tick.ltp_rupees()).await;
        self.process_cancel_orders().await;
        false
    }

    // ==================== Order-update state machine ====================

    pub(crate) fn apply_order_update(&self, update: &OrderUpdate) {
        debug!(
            strategy = %self.name,
            id = %update.id,
            status = %update.status,
            reason = %update.reason,
            "order update received"
        );

        let local_id = match self.tiqs_to_local.read().get(&update.id).cloned() {
            Some(id) => id,
            None => {
                warn!(strategy = %self.name, id = %update.id, "no local order id for update");
                return;
            }
        };

        enum Followup {
            None,
            DropMappings,
            Archive(Position),
        }

        let followup = {
            let mut open = self.open_pos.write();
            let Some(pos) = open.get_mut(&local_id) else {
                warn!(strategy = %self.name, %local_id, "no open position for update");
                return;
            };
            let is_entry_leg = pos.tiqs_entry_ord_id == update.id;

            match order_event(&update.status) {
                OrderEvent::Complete => {
                    if is_entry_leg {
                        pos.qty = update.qty;
                        if let Some(ts) = update.exchange_time {
                            pos.entry_time = ts;
                        }
                        pos.entry_px = update.avg_price;
                        pos.status = PositionStatus::EntryComplete;
                        Followup::DropMappings
                    } else {
                        pos.qty -= update.qty;

                        let mut closed = pos.clone();
                        closed.exit_time = update.exchange_time;
                        closed.exit_px = update.avg_price;
                        closed.qty = update.qty;
                        closed.tiqs_exit_ord_id = update.id.clone();
                        closed.reason = update.reason.clone();

                        if pos.qty == 0 {
                            closed.status = PositionStatus::ExitComplete;
                            open.remove(&local_id);
                        } else {
                            // More quantity to unwind; free the exit slot so
                            // another exit order can be placed.
                            pos.tiqs_exit_ord_id.clear();
                            pos.status = PositionStatus::ExitPartial;
                        }
                        Followup::Archive(closed)
                    }
                }
                OrderEvent::Terminated => {
                    if is_entry_leg {
                        open.remove(&local_id);
                    } else {
                        pos.tiqs_exit_ord_id.clear();
                        pos.status = PositionStatus::EntryComplete;
                    }
                    Followup::DropMappings
                }
                OrderEvent::Open => {
                    pos.status = if is_entry_leg {
                        PositionStatus::EntryOpen
                    } else {
                        PositionStatus::ExitOpen
                    };
                    Followup::None
                }
                OrderEvent::Other => {
                    debug!(strategy = %self.name, status = %update.status, "ignoring order status");
                    Followup::None
                }
            }
        };

        match followup {
            Followup::Archive(closed) => {
                self.closed_pos
                    .write()
                    .entry(local_id)
                    .or_default()
                    .push(closed);
                self.remove_order_mapping(&update.id);
            }
            Followup::DropMappings => self.remove_order_mapping(&update.id),
            Followup::None => {}
        }
    }

    /// Record a live broker order in both lookup maps. The strategy map lock
    /// is taken before the dispatcher's, the only nested acquisition.
    fn record_order_mapping(&self, tiqs_id: &str, local_id: &str) {
        let mut local = self.tiqs_to_local.write();
        local.insert(tiqs_id.to_string(), local_id.to_string());
        self.trader
            .order_owner_map()
            .write()
            .insert(tiqs_id.to_string(), self.name.clone());
    }

    /// Drop a terminal broker order from both lookup maps, same lock order
    /// as [`Self::record_order_mapping`].
    fn remove_order_mapping(&self, tiqs_id: &str) {
        let mut local = self.tiqs_to_local.write();
        local.remove(tiqs_id);
        self.trader.order_owner_map().write().remove(tiqs_id);
    }

    // ==================== Intent processing ====================

    fn process_pnls(&self, tick: &Tick) {
        let ltp = tick.ltp_rupees();
        let mut total = 0.0;
        {
            let mut open = self.open_pos.write();
            for pos in open.values_mut() {
                pos.pnl = ltp - pos.entry_px;
                total += pos.pnl;
            }
        }
        *self.pnl.write() = total;
    }

    async fn process_entry_orders(&self, tick: &Tick) {
        let pending: Vec<(String, EntryOpts)> = self
            .ord_entry
            .read()
            .iter()
            .map(|(id, opts)| (id.clone(), opts.clone()))
            .collect();
        if pending.is_empty() {
            return;
        }

        let ltp = tick.ltp_rupees();
        let tick_ts = tick_timestamp(tick);
        let mut done = Vec::new();

        for (order_id, opts) in pending {
            if self.open_pos.read().contains_key(&order_id) {
                debug!(strategy = %self.name, order_id, "entry position already exists; dropping intent");
                done.push(order_id);
                continue;
            }

            let action = match opts.direction {
                Direction::Long => Action::Buy,
                Direction::Short => Action::Sell,
            };
            let order = prepare_order(OrderArgs {
                symbol: self.symbol.clone(),
                token: self.token,
                qty: opts.qty,
                limit: opts.limit.unwrap_or(0.0),
                stop: opts.stop.unwrap_or(0.0),
                ltp,
                action,
            });

            match self.trader.broker().place_order(&order).await {
                Ok(PlacedOrder { order_no, .. }) => {
                    info!(strategy = %self.name, order_id, %order_no, "entry order placed");
                    self.open_pos.write().insert(
                        order_id.clone(),
                        Position {
                            symbol: self.symbol.clone(),
                            entry_px: ltp,
                            exit_px: 0.0,
                            entry_time: tick_ts,
                            exit_time: None,
                            qty: opts.qty,
                            direction: opts.direction,
                            ord_id: order_id.clone(),
                            tiqs_entry_ord_id: order_no.clone(),
                            tiqs_exit_ord_id: String::new(),
                            reason: String::new(),
                            status: PositionStatus::EntryPending,
                            pnl: 0.0,
                        },
                    );
                    self.record_order_mapping(&order_no, &order_id);
                    done.push(order_id);
                }
                // Intent stays queued; the next tick retries.
                Err(err) => {
                    error!(strategy = %self.name, order_id, error = %err, "entry placement failed")
                }
            }
        }

        let mut entries = self.ord_entry.write();
        for id in done {
            entries.remove(&id);
        }
    }

    async fn process_exit_orders(&self, ltp: f64) {
        let pending: Vec<(String, ExitOpts)> = self
            .ord_exit
            .read()
            .iter()
            .map(|(id, opts)| (id.clone(), opts.clone()))
            .collect();
        if pending.is_empty() {
            return;
        }

        let mut done = Vec::new();

        for (order_id, opts) in pending {
            let position = self.open_pos.read().get(&order_id).cloned();
            let position = match position {
                None => {
                    debug!(strategy = %self.name, order_id, "no position for exit; dropping intent");
                    done.push(order_id);
                    continue;
                }
                Some(p) if !p.tiqs_exit_ord_id.is_empty() => {
                    debug!(strategy = %self.name, order_id, "exit already placed; dropping intent");
                    done.push(order_id);
                    continue;
                }
                Some(p) if p.status < PositionStatus::EntryComplete => {
                    debug!(strategy = %self.name, order_id, "waiting for entry to complete");
                    continue;
                }
                Some(p) => p,
            };

            let action = match position.direction {
                Direction::Long => Action::Sell,
                Direction::Short => Action::Buy,
            };
            let order = prepare_order(OrderArgs {
                symbol: self.symbol.clone(),
                token: self.token,
                qty: opts.qty.min(position.qty),
                limit: opts.limit.unwrap_or(0.0),
                stop: opts.stop.unwrap_or(0.0),
                ltp,
                action,
            });

            match self.trader.broker().place_order(&order).await {
                Ok(PlacedOrder { order_no, .. }) => {
                    info!(strategy = %self.name, order_id, %order_no, "exit order placed");
                    if let Some(pos) = self.open_pos.write().get_mut(&order_id) {
                        // Quantity and exit price update on the broker echo.
                        pos.status = PositionStatus::ExitPending;
                        pos.tiqs_exit_ord_id = order_no.clone();
                    }
                    self.record_order_mapping(&order_no, &order_id);
                    done.push(order_id);
                }
                Err(err) => {
                    error!(strategy = %self.name, order_id, error = %err, "exit placement failed")
                }
            }
        }

        let mut exits = self.ord_exit.write();
        for id in done {
            exits.remove(&id);
        }
    }

    async fn process_cancel_orders(&self) {
        let pending: Vec<String> = self.ord_cancel.read().iter().cloned().collect();
        if pending.is_empty() {
            return;
        }

        let mut done = Vec::new();

        for order_id in pending {
            // The order may not have been placed yet; keep the intent.
            let Some(position) = self.open_pos.read().get(&order_id).cloned() else {
                continue;
            };

            let tiqs_id = if position.status < PositionStatus::EntryComplete {
                position.tiqs_entry_ord_id.clone()
            } else if !position.tiqs_exit_ord_id.is_empty() {
                position.tiqs_exit_ord_id.clone()
            } else {
                warn!(strategy = %self.name, order_id, "no open or pending order to cancel");
                done.push(order_id);
                continue;
            };

            match self.trader.broker().cancel_order(&tiqs_id).await {
                Ok(_) => {
                    info!(strategy = %self.name, order_id, %tiqs_id, "cancel requested");
                    done.push(order_id);
                }
                Err(err) => {
                    error!(strategy = %self.name, order_id, error = %err, "cancel failed")
                }
            }
        }

        let mut cancels = self.ord_cancel.write();
        for id in done {
            cancels.remove(&id);
        }
    }

    // ==================== Shutdown ====================

    /// Graceful shutdown: stop the tick loop, flatten open positions at the
    /// last seen price, let order echoes settle, archive closed positions
    /// and detach from the dispatcher. Does not guarantee every open
    /// position actually closes.
    pub(crate) async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(strategy = %self.name, "shutting down");

        let _ = self.stop_ticks.send(true);
        self.ticks_tx.lock().take();

        let last_ltp = *self.last_ltp.read();
        let open: Vec<Position> = self.open_pos.read().values().cloned().collect();
        {
            let mut exits = self.ord_exit.write();
            for position in open {
                exits.insert(
                    position.ord_id.clone(),
                    ExitOpts {
                        qty: position.qty,
                        limit: None,
                        stop: None,
                    },
                );
            }
        }
        self.process_exit_orders(last_ltp).await;

        tokio::time::sleep(SHUTDOWN_SETTLE).await;

        self.trader.archive_closed_positions(self.closed_positions());
        self.trader.remove_strategy(self);
        self.orders_tx.lock().take();

        info!(strategy = %self.name, "shutdown complete");
    }

    // ==================== Test accessors ====================

    #[cfg(test)]
    pub(crate) fn order_id_mappings(&self) -> HashMap<String, String> {
        self.tiqs_to_local.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_entries(&self) -> Vec<String> {
        self.ord_entry.read().keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn pending_exits(&self) -> Vec<String> {
        self.ord_exit.read().keys().cloned().collect()
    }
}

fn tick_timestamp(tick: &Tick) -> NaiveDateTime {
    DateTime::from_timestamp(i64::from(tick.time), 0)
        .map(|ts| ts.naive_utc())
        .unwrap_or_default()
}
