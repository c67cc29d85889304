//! The dispatcher: owns the socket, fans ticks and order updates out to
//! strategies, and maintains the symbol/token and option-chain catalogs.

mod export;

pub use export::write_closed_positions;

use crate::broker::{BrokerApi, OptionChainRequest, OrderRequest};
use crate::socket::{OrderUpdate, SocketClient, SocketConfig, Tick};
use crate::strategy::{OnTickFn, Position, Strategy};
use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Index underlyings every dispatcher knows at startup; the option-chain
/// bootstrap extends the catalog from these.
const INDEX_UNDERLYINGS: [(&str, i32); 4] = [
    ("NIFTYBANK", 26009),
    ("NIFTY50", 26000),
    ("FINNIFTY", 26037),
    ("MIDCPNIFTY", 26074),
];

/// CE/PE symbols at one strike.
#[derive(Debug, Clone, Default)]
pub struct OptionSymbols {
    pub ce: String,
    pub pe: String,
}

struct TraderInner {
    broker: Arc<dyn BrokerApi>,
    socket: SocketClient,
    strategies: RwLock<HashMap<String, Arc<Strategy>>>,
    /// Broker order number -> owning strategy name.
    tiqs_order_ids_to_strategy: RwLock<HashMap<String, String>>,
    tick_listeners: RwLock<HashMap<i32, Vec<Arc<Strategy>>>>,
    /// Last traded price per token, in rupees.
    ltps: RwLock<HashMap<i32, f64>>,
    symbol_to_token: RwLock<HashMap<String, i32>>,
    token_to_symbol: RwLock<HashMap<i32, String>>,
    /// underlying -> strike -> CE/PE symbols.
    option_chain_symbols: RwLock<HashMap<String, HashMap<i64, OptionSymbols>>>,
    /// Closed positions handed over by strategies at shutdown.
    closed_positions: Mutex<Vec<Position>>,
}

/// High-level interface for deploying trading strategies. Cheap to clone;
/// all clones share the same dispatcher state.
#[derive(Clone)]
pub struct AutoTrader {
    inner: Arc<TraderInner>,
}

impl AutoTrader {
    /// Connect the market-data socket, bootstrap the option catalogs and
    /// start the fan-out pumps.
    pub async fn new(broker: Arc<dyn BrokerApi>, socket_config: SocketConfig) -> Result<Self> {
        let (socket, tick_rx, order_rx) = SocketClient::connect(socket_config);
        Self::with_parts(broker, socket, tick_rx, order_rx).await
    }

    /// Wire a dispatcher from pre-built parts. Useful when the tick and
    /// order streams come from somewhere other than the default socket.
    pub async fn with_parts(
        broker: Arc<dyn BrokerApi>,
        socket: SocketClient,
        tick_rx: mpsc::Receiver<Tick>,
        order_rx: mpsc::Receiver<OrderUpdate>,
    ) -> Result<Self> {
        let mut symbol_to_token = HashMap::new();
        let mut token_to_symbol = HashMap::new();
        for (symbol, token) in INDEX_UNDERLYINGS {
            symbol_to_token.insert(symbol.to_string(), token);
            token_to_symbol.insert(token, symbol.to_string());
        }

        let trader = Self {
            inner: Arc::new(TraderInner {
                broker,
                socket,
                strategies: RwLock::new(HashMap::new()),
                tiqs_order_ids_to_strategy: RwLock::new(HashMap::new()),
                tick_listeners: RwLock::new(HashMap::new()),
                ltps: RwLock::new(HashMap::new()),
                symbol_to_token: RwLock::new(symbol_to_token),
                token_to_symbol: RwLock::new(token_to_symbol),
                option_chain_symbols: RwLock::new(HashMap::new()),
                closed_positions: Mutex::new(Vec::new()),
            }),
        };

        trader.bootstrap_option_catalog().await?;

        tokio::spawn(trader.clone().run_tick_pump(tick_rx));
        tokio::spawn(trader.clone().run_order_pump(order_rx));

        Ok(trader)
    }

    /// Fetch the nearest expiry of every index underlying and extend the
    /// symbol catalogs with its option chain. A failing index is fatal.
    async fn bootstrap_option_catalog(&self) -> Result<()> {
        let expiries = self
            .inner
            .broker
            .expiry_dates()
            .await
            .context("fetching option expiry dates")?;

        let per_underlying = [
            ("NIFTYBANK", &expiries.banknifty),
            ("NIFTY50", &expiries.nifty),
            ("FINNIFTY", &expiries.finnifty),
            ("MIDCPNIFTY", &expiries.midcpnifty),
        ];
        for (underlying, dates) in per_underlying {
            let expiry = dates
                .first()
                .with_context(|| format!("no expiry dates for {underlying}"))?;
            self.load_option_chain(underlying, expiry)
                .await
                .with_context(|| format!("loading option chain for {underlying}"))?;
        }
        Ok(())
    }

    async fn load_option_chain(&self, underlying: &str, expiry: &str) -> Result<()> {
        let token = self.token_for_symbol(underlying)?;
        let rows = self
            .inner
            .broker
            .option_chain(&OptionChainRequest {
                token: token.to_string(),
                exchange: "INDEX".into(),
                count: "20".into(),
                expiry: expiry.into(),
            })
            .await?;

        let mut contracts = Vec::with_capacity(rows.len());
        for row in rows {
            let contract_token: i32 = row
                .token
                .parse()
                .with_context(|| format!("bad option token {:?}", row.token))?;
            let strike = row.strike_price.parse::<f64>().unwrap_or(0.0) as i64;
            contracts.push((row.symbol, contract_token, row.option_type, strike));
        }

        let strikes = {
            let mut chains = self.inner.option_chain_symbols.write();
            let chain = chains.entry(underlying.to_string()).or_default();
            for (symbol, _, option_type, strike) in &contracts {
                let entry = chain.entry(*strike).or_default();
                if option_type == "CE" {
                    entry.ce = symbol.clone();
                } else {
                    entry.pe = symbol.clone();
                }
            }
            chain.len()
        };
        {
            let mut symbols = self.inner.symbol_to_token.write();
            for (symbol, contract_token, _, _) in &contracts {
                symbols.insert(symbol.clone(), *contract_token);
            }
        }
        {
            let mut tokens = self.inner.token_to_symbol.write();
            for (symbol, contract_token, _, _) in contracts {
                tokens.insert(contract_token, symbol);
            }
        }

        debug!(underlying, expiry, strikes, "option chain loaded");
        Ok(())
    }

    // ==================== Fan-out pumps ====================

    async fn run_tick_pump(self, mut ticks: mpsc::Receiver<Tick>) {
        debug!("tick pump started");
        while let Some(tick) = ticks.recv().await {
            self.inner.ltps.write().insert(tick.token, tick.ltp_rupees());

            let listeners: Vec<Arc<Strategy>> = self
                .inner
                .tick_listeners
                .read()
                .get(&tick.token)
                .cloned()
                .unwrap_or_default();
            for strategy in listeners {
                strategy.deliver_tick(tick).await;
            }
        }
        debug!("tick pump stopped");
    }

    async fn run_order_pump(self, mut updates: mpsc::Receiver<OrderUpdate>) {
        debug!("order pump started");
        while let Some(update) = updates.recv().await {
            let owner = self
                .inner
                .tiqs_order_ids_to_strategy
                .read()
                .get(&update.id)
                .cloned();
            let Some(owner) = owner else {
                warn!(id = %update.id, status = %update.status, "order update for unknown order id");
                continue;
            };
            let strategy = self.inner.strategies.read().get(&owner).cloned();
            let Some(strategy) = strategy else {
                warn!(id = %update.id, %owner, "order update for unknown strategy");
                continue;
            };
            strategy.deliver_order_update(update).await;
        }
        debug!("order pump stopped");
    }

    // ==================== Strategy lifecycle ====================

    /// Deploy a strategy on `symbol`. Rejects duplicate names and unknown
    /// symbols, subscribes the symbol's token and starts both event loops.
    pub fn add_strategy(&self, name: &str, symbol: &str, on_tick: OnTickFn) -> Result<Arc<Strategy>> {
        let token = self.token_for_symbol(symbol)?;

        let (strategy, ticks_rx, orders_rx, stop_rx) = {
            let mut strategies = self.inner.strategies.write();
            if strategies.contains_key(name) {
                bail!("strategy {name} already exists");
            }
            let parts = Strategy::new(self.clone(), name, symbol, token, on_tick);
            strategies.insert(name.to_string(), Arc::clone(&parts.0));
            parts
        };

        self.inner.socket.add_subscription(token);
        self.inner
            .tick_listeners
            .write()
            .entry(token)
            .or_default()
            .push(Arc::clone(&strategy));

        tokio::spawn(Arc::clone(&strategy).run_tick_loop(ticks_rx, stop_rx));
        tokio::spawn(Arc::clone(&strategy).run_order_loop(orders_rx));

        info!(strategy = name, symbol, token, "strategy deployed");
        Ok(strategy)
    }

    /// Detach a strategy from the dispatcher: drop it from the registry and
    /// from every tick-listener list.
    pub(crate) fn remove_strategy(&self, strategy: &Strategy) {
        debug!(strategy = %strategy.name(), "removing strategy");
        self.inner.strategies.write().remove(strategy.name());
        let target = strategy as *const Strategy;
        let mut listeners = self.inner.tick_listeners.write();
        for list in listeners.values_mut() {
            list.retain(|candidate| Arc::as_ptr(candidate) != target);
        }
    }

    pub fn strategy(&self, name: &str) -> Option<Arc<Strategy>> {
        self.inner.strategies.read().get(name).cloned()
    }

    pub fn all_strategies(&self) -> Vec<Arc<Strategy>> {
        self.inner.strategies.read().values().cloned().collect()
    }

    // ==================== Catalog accessors ====================

    pub fn token_for_symbol(&self, symbol: &str) -> Result<i32> {
        self.inner
            .symbol_to_token
            .read()
            .get(symbol)
            .copied()
            .with_context(|| format!("token not found for symbol {symbol}"))
    }

    pub fn symbol_for_token(&self, token: i32) -> Result<String> {
        self.inner
            .token_to_symbol
            .read()
            .get(&token)
            .cloned()
            .with_context(|| format!("symbol not found for token {token}"))
    }

    /// Last traded price for a known symbol, in rupees.
    pub fn get_ltp(&self, symbol: &str) -> Result<f64> {
        let token = self.token_for_symbol(symbol)?;
        self.inner
            .ltps
            .read()
            .get(&token)
            .copied()
            .with_context(|| format!("ltp not found for symbol {symbol}"))
    }

    /// CE and PE symbols at `strike` for an index underlying.
    pub fn option_symbols_for_strike(&self, underlying: &str, strike: i64) -> Result<(String, String)> {
        let chains = self.inner.option_chain_symbols.read();
        let pair = chains
            .get(underlying)
            .and_then(|chain| chain.get(&strike))
            .with_context(|| format!("symbols not found for {underlying} strike {strike}"))?;
        Ok((pair.ce.clone(), pair.pe.clone()))
    }

    /// Subscribe the socket to every instrument in the catalog.
    pub fn subscribe_full_option_chain(&self) {
        for token in self.inner.token_to_symbol.read().keys() {
            self.inner.socket.add_subscription(*token);
        }
    }

    // ==================== Strategy-runtime plumbing ====================

    pub(crate) fn broker(&self) -> &Arc<dyn BrokerApi> {
        &self.inner.broker
    }

    pub(crate) fn order_owner_map(&self) -> &RwLock<HashMap<String, String>> {
        &self.inner.tiqs_order_ids_to_strategy
    }

    pub(crate) fn archive_closed_positions(&self, positions: Vec<Position>) {
        self.inner.closed_positions.lock().extend(positions);
    }

    // ==================== Shutdown ====================

    /// Shut every strategy down in parallel, then export the aggregated
    /// closed positions as CSV into the current directory.
    pub async fn shutdown(&self) -> Result<PathBuf> {
        let cwd = std::env::current_dir().context("resolving working directory")?;
        self.shutdown_into(&cwd).await
    }

    /// As [`Self::shutdown`], writing the CSV into `dir`.
    pub async fn shutdown_into(&self, dir: &Path) -> Result<PathBuf> {
        info!("shutting down autotrader");
        let strategies = self.all_strategies();
        join_all(strategies.iter().map(|strategy| strategy.shutdown())).await;

        let mut closed = std::mem::take(&mut *self.inner.closed_positions.lock());
        closed.sort_by_key(|position| position.entry_time);

        let path = write_closed_positions(dir, &closed)?;
        info!(positions = closed.len(), path = %path.display(), "autotrader shutdown complete");
        Ok(path)
    }
}

// ==================== Order translation ====================

/// Order side sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Buy,
    Sell,
}

pub(crate) struct OrderArgs {
    pub symbol: String,
    pub token: i32,
    pub qty: i32,
    /// 0 means no limit price.
    pub limit: f64,
    /// 0 means no stop price.
    pub stop: f64,
    pub ltp: f64,
    pub action: Action,
}

fn price_string(value: f64) -> String {
    format!("{value:.2}")
}

/// Translate a declarative intent into a broker order. The limit/stop
/// combination selects the order type: neither = market, stop only =
/// stop-market, limit only = limit, both = stop-limit.
pub(crate) fn prepare_order(args: OrderArgs) -> OrderRequest {
    let mut order = OrderRequest {
        exchange: "NFO".into(),
        token: args.token.to_string(),
        quantity: args.qty.to_string(),
        disclosed_qty: "0".into(),
        product: "M".into(),
        symbol: args.symbol,
        transaction_type: match args.action {
            Action::Buy => "B",
            Action::Sell => "S",
        }
        .into(),
        order: "MKT".into(),
        price: "0".into(),
        validity: "DAY".into(),
        tags: String::new(),
        amo: false,
        trigger_price: "0".into(),
    };

    if args.limit == 0.0 && args.stop != 0.0 {
        order.order = "SL-MKT".into();
        order.trigger_price = price_string(args.stop);
        order.price = price_string(args.ltp);
    } else if args.limit != 0.0 && args.stop == 0.0 {
        order.order = "LMT".into();
        order.price = price_string(args.limit);
    } else if args.limit != 0.0 && args.stop != 0.0 {
        order.order = "SL-LMT".into();
        order.trigger_price = price_string(args.stop);
        order.price = price_string(args.limit);
    } else {
        order.order = "MKT".into();
        order.price = price_string(args.ltp);
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBroker, OptionData};
    use crate::socket::SocketClient;
    use crate::strategy::{Direction, EntryOpts, ExitOpts, PositionStatus};
    use chrono::NaiveDateTime;
    use std::time::Duration;

    fn order_args(limit: f64, stop: f64, action: Action) -> OrderArgs {
        OrderArgs {
            symbol: "NIFTY50".into(),
            token: 26000,
            qty: 50,
            limit,
            stop,
            ltp: 100.0,
            action,
        }
    }

    #[test]
    fn order_translation_covers_all_four_cells() {
        let market = prepare_order(order_args(0.0, 0.0, Action::Buy));
        assert_eq!(market.order, "MKT");
        assert_eq!(market.price, "100.00");
        assert_eq!(market.trigger_price, "0");

        let stop_market = prepare_order(order_args(0.0, 99.0, Action::Buy));
        assert_eq!(stop_market.order, "SL-MKT");
        assert_eq!(stop_market.price, "100.00");
        assert_eq!(stop_market.trigger_price, "99.00");

        let limit = prepare_order(order_args(101.0, 0.0, Action::Buy));
        assert_eq!(limit.order, "LMT");
        assert_eq!(limit.price, "101.00");
        assert_eq!(limit.trigger_price, "0");

        let stop_limit = prepare_order(order_args(101.0, 99.0, Action::Buy));
        assert_eq!(stop_limit.order, "SL-LMT");
        assert_eq!(stop_limit.price, "101.00");
        assert_eq!(stop_limit.trigger_price, "99.00");
    }

    #[test]
    fn order_translation_constants_and_sides() {
        let buy = prepare_order(order_args(0.0, 0.0, Action::Buy));
        assert_eq!(buy.transaction_type, "B");
        assert_eq!(buy.exchange, "NFO");
        assert_eq!(buy.product, "M");
        assert_eq!(buy.validity, "DAY");
        assert_eq!(buy.disclosed_qty, "0");
        assert_eq!(buy.quantity, "50");
        assert_eq!(buy.token, "26000");
        assert!(!buy.amo);

        let sell = prepare_order(order_args(0.0, 0.0, Action::Sell));
        assert_eq!(sell.transaction_type, "S");
    }

    // ==================== Runtime scenarios ====================

    type Harness = (
        AutoTrader,
        Arc<MockBroker>,
        mpsc::Sender<Tick>,
        mpsc::Sender<OrderUpdate>,
    );

    async fn harness() -> Harness {
        let broker = Arc::new(MockBroker::new());
        let (socket, _cmd_rx) = SocketClient::detached();
        let (tick_tx, tick_rx) = mpsc::channel(64);
        let (order_tx, order_rx) = mpsc::channel(64);
        let trader = AutoTrader::with_parts(broker.clone(), socket, tick_rx, order_rx)
            .await
            .expect("dispatcher bootstraps");
        (trader, broker, tick_tx, order_tx)
    }

    fn noop() -> OnTickFn {
        Arc::new(|_: &Strategy, _: &Tick, _: &[f64]| {})
    }

    fn tick(token: i32, ltp_paise: i32) -> Tick {
        Tick {
            token,
            ltp: ltp_paise,
            time: 1_728_000_000,
            ..Default::default()
        }
    }

    fn echo(id: &str, status: &str, qty: i32, avg_price: f64) -> OrderUpdate {
        OrderUpdate {
            id: id.into(),
            status: status.into(),
            qty,
            avg_price,
            exchange_time: NaiveDateTime::parse_from_str("09-10-2024 13:45:12", "%d-%m-%Y %H:%M:%S")
                .ok(),
            ..Default::default()
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    #[tokio::test]
    async fn ticks_update_ltp_and_reach_the_strategy() {
        let (trader, _broker, tick_tx, _order_tx) = harness().await;
        let seen = Arc::new(Mutex::new(Vec::<i32>::new()));
        let sink = Arc::clone(&seen);
        let on_tick: OnTickFn = Arc::new(move |_, tick, bars| {
            assert!(!bars.is_empty());
            sink.lock().push(tick.ltp);
        });
        trader.add_strategy("ltp", "NIFTY50", on_tick).unwrap();

        tick_tx.send(tick(26000, 2_525_000)).await.unwrap();
        wait_for(|| !seen.lock().is_empty()).await;

        assert_eq!(seen.lock().as_slice(), &[2_525_000]);
        assert!((trader.get_ltp("NIFTY50").unwrap() - 25_250.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_strategies_are_rejected() {
        let (trader, _broker, _tick_tx, _order_tx) = harness().await;
        trader.add_strategy("dup", "NIFTY50", noop()).unwrap();
        assert!(trader.add_strategy("dup", "NIFTY50", noop()).is_err());
        assert!(trader.add_strategy("other", "NO-SUCH-SYMBOL", noop()).is_err());
    }

    #[tokio::test]
    async fn bootstrap_extends_the_catalog_from_option_chains() {
        let broker = Arc::new(MockBroker::new());
        broker.set_option_chain(
            "26000",
            vec![
                OptionData {
                    symbol: "NIFTY24O1725000CE".into(),
                    token: "49521".into(),
                    option_type: "CE".into(),
                    strike_price: "25000.00".into(),
                    ..Default::default()
                },
                OptionData {
                    symbol: "NIFTY24O1725000PE".into(),
                    token: "49522".into(),
                    option_type: "PE".into(),
                    strike_price: "25000.00".into(),
                    ..Default::default()
                },
            ],
        );

        let (socket, _cmd_rx) = SocketClient::detached();
        let (_tick_tx, tick_rx) = mpsc::channel(4);
        let (_order_tx, order_rx) = mpsc::channel(4);
        let trader = AutoTrader::with_parts(broker, socket, tick_rx, order_rx)
            .await
            .unwrap();

        let (ce, pe) = trader.option_symbols_for_strike("NIFTY50", 25000).unwrap();
        assert_eq!(ce, "NIFTY24O1725000CE");
        assert_eq!(pe, "NIFTY24O1725000PE");
        assert_eq!(trader.token_for_symbol("NIFTY24O1725000CE").unwrap(), 49521);
        assert_eq!(trader.symbol_for_token(49522).unwrap(), "NIFTY24O1725000PE");
        assert!(trader.option_symbols_for_strike("NIFTY50", 26000).is_err());
    }

    #[tokio::test]
    async fn deploying_a_strategy_subscribes_its_token() {
        let broker = Arc::new(MockBroker::new());
        let (socket, mut cmd_rx) = SocketClient::detached();
        let (_tick_tx, tick_rx) = mpsc::channel(4);
        let (_order_tx, order_rx) = mpsc::channel(4);
        let trader = AutoTrader::with_parts(broker, socket, tick_rx, order_rx)
            .await
            .unwrap();

        trader.add_strategy("sub", "NIFTYBANK", noop()).unwrap();
        assert!(matches!(
            cmd_rx.recv().await,
            Some(crate::socket::Command::Subscribe(26009))
        ));
    }

    #[tokio::test]
    async fn full_exit_archives_the_position() {
        let (trader, broker, tick_tx, order_tx) = harness().await;
        let strategy = trader.add_strategy("s2", "NIFTY50", noop()).unwrap();

        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();

        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;

        let pos = strategy.open_position("o1").unwrap();
        assert_eq!(pos.status, PositionStatus::EntryPending);
        assert!((pos.entry_px - 100.0).abs() < f64::EPSILON);
        assert_eq!(pos.tiqs_entry_ord_id, "MOCK000001");

        order_tx
            .send(echo("MOCK000001", "COMPLETE", 50, 100.0))
            .await
            .unwrap();
        wait_for(|| {
            strategy
                .open_position("o1")
                .is_some_and(|p| p.status == PositionStatus::EntryComplete)
        })
        .await;

        strategy
            .exit(
                "o1",
                ExitOpts {
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();
        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| {
            strategy
                .open_position("o1")
                .is_some_and(|p| p.status == PositionStatus::ExitPending)
        })
        .await;
        assert_eq!(broker.placed_orders().len(), 2);

        order_tx
            .send(echo("MOCK000002", "COMPLETE", 50, 101.0))
            .await
            .unwrap();
        wait_for(|| strategy.open_position("o1").is_none()).await;

        let closed = strategy.closed_positions();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, PositionStatus::ExitComplete);
        assert_eq!(closed[0].qty, 50);
        assert!((closed[0].exit_px - 101.0).abs() < f64::EPSILON);
        assert_eq!(closed[0].tiqs_exit_ord_id, "MOCK000002");

        // Both lookup maps dropped the terminal order ids.
        assert!(strategy.order_id_mappings().is_empty());
        assert!(trader.order_owner_map().read().is_empty());
    }

    #[tokio::test]
    async fn partial_exit_clones_the_closed_quantity() {
        let (trader, _broker, tick_tx, order_tx) = harness().await;
        let strategy = trader.add_strategy("s3", "NIFTY50", noop()).unwrap();

        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 100,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();
        tick_tx.send(tick(26000, 5_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;

        order_tx
            .send(echo("MOCK000001", "COMPLETE", 100, 50.0))
            .await
            .unwrap();
        wait_for(|| {
            strategy
                .open_position("o1")
                .is_some_and(|p| p.status == PositionStatus::EntryComplete)
        })
        .await;

        strategy
            .exit(
                "o1",
                ExitOpts {
                    qty: 40,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();
        tick_tx.send(tick(26000, 5_000)).await.unwrap();
        wait_for(|| {
            strategy
                .open_position("o1")
                .is_some_and(|p| p.status == PositionStatus::ExitPending)
        })
        .await;

        order_tx
            .send(echo("MOCK000002", "COMPLETE", 40, 55.0))
            .await
            .unwrap();
        wait_for(|| {
            strategy
                .open_position("o1")
                .is_some_and(|p| p.status == PositionStatus::ExitPartial)
        })
        .await;

        let remaining = strategy.open_position("o1").unwrap();
        assert_eq!(remaining.qty, 60);
        assert!(remaining.tiqs_exit_ord_id.is_empty());

        let closed = strategy.closed_positions_for("o1");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].qty, 40);
        assert!((closed[0].exit_px - 55.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rejected_entry_removes_the_position_and_mappings() {
        let (trader, _broker, tick_tx, order_tx) = harness().await;
        let strategy = trader.add_strategy("s4", "NIFTY50", noop()).unwrap();

        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();
        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;
        assert!(strategy.pending_entries().is_empty());

        order_tx
            .send(echo("MOCK000001", "REJECTED", 0, 0.0))
            .await
            .unwrap();
        wait_for(|| strategy.open_position("o1").is_none()).await;

        assert!(strategy.order_id_mappings().is_empty());
        assert!(trader.order_owner_map().read().is_empty());
        assert!(strategy.closed_positions().is_empty());
    }

    #[tokio::test]
    async fn failed_placement_retries_on_the_next_tick() {
        let (trader, broker, tick_tx, _order_tx) = harness().await;
        let strategy = trader.add_strategy("retry", "NIFTY50", noop()).unwrap();

        broker.fail_next_places(1);
        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();

        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| broker.placed_orders().is_empty() && !strategy.pending_entries().is_empty())
            .await;
        assert!(strategy.open_position("o1").is_none());

        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;
        assert!(strategy.pending_entries().is_empty());
    }

    #[tokio::test]
    async fn exit_intent_waits_for_the_entry_to_fill() {
        let (trader, broker, tick_tx, order_tx) = harness().await;
        let strategy = trader.add_strategy("wait", "NIFTY50", noop()).unwrap();

        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();
        strategy
            .exit(
                "o1",
                ExitOpts {
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();

        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;

        // Entry still pending, so the exit intent must be retained and no
        // second order placed.
        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;
        assert_eq!(broker.placed_orders().len(), 1);
        assert_eq!(strategy.pending_exits(), vec!["o1".to_string()]);

        order_tx
            .send(echo("MOCK000001", "COMPLETE", 50, 100.0))
            .await
            .unwrap();
        wait_for(|| {
            strategy
                .open_position("o1")
                .is_some_and(|p| p.status == PositionStatus::EntryComplete)
        })
        .await;

        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| broker.placed_orders().len() == 2).await;
        assert!(strategy.pending_exits().is_empty());
    }

    #[tokio::test]
    async fn cancel_targets_the_pending_entry_leg() {
        let (trader, broker, tick_tx, _order_tx) = harness().await;
        let strategy = trader.add_strategy("cancel", "NIFTY50", noop()).unwrap();

        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 50,
                    limit: Some(99.0),
                    stop: None,
                },
            )
            .unwrap();
        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;

        strategy.cancel("o1");
        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| !broker.canceled_orders().is_empty()).await;
        assert_eq!(broker.canceled_orders(), vec!["MOCK000001".to_string()]);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_kill_the_loop() {
        let (trader, _broker, tick_tx, _order_tx) = harness().await;
        let on_tick: OnTickFn = Arc::new(|_: &Strategy, _: &Tick, _: &[f64]| {
            panic!("strategy bug");
        });
        let strategy = trader.add_strategy("panics", "NIFTY50", on_tick).unwrap();

        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();
        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        // The intent is still materialised on the same tick that panicked.
        wait_for(|| strategy.open_position("o1").is_some()).await;
    }

    #[tokio::test]
    async fn shutdown_flattens_positions_and_exports_csv() {
        let (trader, broker, tick_tx, order_tx) = harness().await;
        let strategy = trader.add_strategy("flat", "NIFTY50", noop()).unwrap();

        strategy
            .entry(
                "o1",
                EntryOpts {
                    direction: Direction::Long,
                    qty: 50,
                    limit: None,
                    stop: None,
                },
            )
            .unwrap();
        tick_tx.send(tick(26000, 10_000)).await.unwrap();
        wait_for(|| strategy.open_position("o1").is_some()).await;
        order_tx
            .send(echo("MOCK000001", "COMPLETE", 50, 100.0))
            .await
            .unwrap();
        wait_for(|| {
            strategy
                .open_position("o1")
                .is_some_and(|p| p.status == PositionStatus::EntryComplete)
        })
        .await;

        let dir = std::env::temp_dir().join(format!("tiqs-autotrader-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let shutdown = tokio::spawn({
            let trader = trader.clone();
            let dir = dir.clone();
            async move { trader.shutdown_into(&dir).await }
        });

        // Shutdown synthesizes an exit at the last seen price; complete it
        // while the settle window is open.
        wait_for(|| broker.placed_orders().len() == 2).await;
        order_tx
            .send(echo("MOCK000002", "COMPLETE", 50, 101.0))
            .await
            .unwrap();

        let path = shutdown.await.unwrap().unwrap();
        assert!(trader.strategy("flat").is_none());

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Symbol,EntryPx,ExitPx,EntryTime,ExitTime,Qty,Direction,OrdID,TiqsEntryOrdID,TiqsExitOrdID,Reason"
        );
        let row = lines.next().unwrap();
        assert!(row.contains("NIFTY50"));
        assert!(row.contains("100.00"));
        assert!(row.contains("101.00"));
        assert!(row.contains("long"));
    }
}
